//! Preview deployment service (C11). Built on the same
//! `tokio::process::Command`-wrapped `docker` invocations as the sandbox
//! service; health polling is a plain `reqwest` HTTP probe. The port
//! reservation set is a process-local mutex rehydrated from the store at
//! startup so restarts don't double-allocate a port still in use.

use crate::error::PreviewError;
use crate::store::{PreviewFilter, Store};
use crate::types::{HealthStatus, PreviewDeployment, PreviewStatus};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub struct PreviewService {
    store: Arc<Store>,
    domain: String,
    ttl_hours: i64,
    port_range: (u16, u16),
    reserved_ports: Mutex<HashSet<u16>>,
}

impl PreviewService {
    pub async fn new(store: Arc<Store>, domain: String, ttl_hours: i64, port_range: (u16, u16)) -> Self {
        let mut reserved = HashSet::new();
        if let Ok(active) = store.list_previews(PreviewFilter::Active).await {
            for p in active {
                reserved.insert(p.backend_port);
                reserved.insert(p.frontend_port);
            }
        }
        PreviewService { store, domain, ttl_hours, port_range, reserved_ports: Mutex::new(reserved) }
    }

    async fn allocate_two_ports(&self) -> Result<(u16, u16), PreviewError> {
        let mut reserved = self.reserved_ports.lock().await;
        let mut found = Vec::new();
        for candidate in self.port_range.0..=self.port_range.1 {
            if !reserved.contains(&candidate) {
                found.push(candidate);
                if found.len() == 2 {
                    break;
                }
            }
        }
        if found.len() < 2 {
            return Err(PreviewError::ResourceExhausted);
        }
        for p in &found {
            reserved.insert(*p);
        }
        Ok((found[0], found[1]))
    }

    async fn release_ports(&self, backend: u16, frontend: u16) {
        let mut reserved = self.reserved_ports.lock().await;
        reserved.remove(&backend);
        reserved.remove(&frontend);
    }

    async fn docker(&self, args: &[&str]) -> Result<bool, PreviewError> {
        let status = Command::new("docker")
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| PreviewError::Failed(e.to_string()))?;
        Ok(status.success())
    }

    /// Builds images, creates a private network, launches the three
    /// containers, polls health, and records a `preview_deployments` row.
    pub async fn deploy(
        &self,
        task_id: Uuid,
        project: &str,
        backend_image: &str,
        frontend_image: &str,
    ) -> Result<PreviewDeployment, PreviewError> {
        let (backend_port, frontend_port) = self.allocate_two_ports().await?;
        let network = format!("preview-{task_id}");

        if !self.docker(&["network", "create", &network]).await? {
            self.release_ports(backend_port, frontend_port).await;
            return Err(PreviewError::Failed("network create failed".into()));
        }

        let db_name = format!("catalyst-preview-{task_id}-db");
        let backend_name = format!("catalyst-preview-{task_id}-backend");
        let frontend_name = format!("catalyst-preview-{task_id}-frontend");

        let db_ok = self
            .docker(&[
                "run", "-d", "--rm", "--network", &network, "--name", &db_name, "postgres:16-alpine",
            ])
            .await
            .unwrap_or(false);

        let backend_ok = self
            .docker(&[
                "run", "-d", "--rm", "--network", &network, "--name", &backend_name,
                "-p", &format!("{backend_port}:8000"), backend_image,
            ])
            .await
            .unwrap_or(false);

        let frontend_env = format!("BACKEND_URL=http://backend:{backend_port}");
        let frontend_ok = self
            .docker(&[
                "run", "-d", "--rm", "--network", &network, "--name", &frontend_name,
                "-p", &format!("{frontend_port}:3000"), "-e", &frontend_env, frontend_image,
            ])
            .await
            .unwrap_or(false);

        if !db_ok || !backend_ok || !frontend_ok {
            warn!(%task_id, db_ok, backend_ok, frontend_ok, "preview stack failed to start cleanly");
        }

        let fallback_url = format!("http://localhost:{frontend_port}");
        let backend_health_url = format!("http://localhost:{backend_port}/api/");
        let preview_url = format!("http://{project}-{}.{}", &task_id.to_string()[..8], self.domain);

        let healthy = self.poll_health(&backend_health_url, &fallback_url).await;
        let now = Utc::now();
        let record = PreviewDeployment {
            task_id,
            project_name: project.to_string(),
            frontend_container_id: Some(frontend_name),
            backend_container_id: Some(backend_name),
            db_container_id: Some(db_name),
            network_id: Some(network),
            backend_port,
            frontend_port,
            preview_url,
            fallback_url,
            status: if healthy { PreviewStatus::Deployed } else { PreviewStatus::Unhealthy },
            health_status: if healthy { HealthStatus::Healthy } else { HealthStatus::Unreachable },
            deployed_at: now,
            expires_at: now + ChronoDuration::hours(self.ttl_hours),
            last_health_check: Some(now),
        };

        self.store
            .record_preview(&record)
            .await
            .map_err(|e| PreviewError::Failed(e.to_string()))?;
        info!(%task_id, preview_url = %record.preview_url, "preview deployed");
        Ok(record)
    }

    /// Polls the backend's `/api/` root and the frontend's `/` root;
    /// both must answer successfully within the retry window for the
    /// stack to count as healthy. A frontend that serves static assets
    /// while its backend never comes up would otherwise read healthy.
    async fn poll_health(&self, backend_url: &str, frontend_url: &str) -> bool {
        let client = reqwest::Client::new();
        let mut backoff_ms = 500u64;
        for _ in 0..6 {
            let backend_ok = client.get(backend_url).send().await.map(|r| r.status().is_success()).unwrap_or(false);
            let frontend_ok = client.get(frontend_url).send().await.map(|r| r.status().is_success()).unwrap_or(false);
            if backend_ok && frontend_ok {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(8000);
        }
        false
    }

    /// Stops and removes the three containers and the network, marks the
    /// row `cleaned_up`, releases ports. Idempotent: absent resources are
    /// tolerated, not treated as errors.
    pub async fn cleanup(&self, task_id: Uuid) -> Result<(), PreviewError> {
        let record = match self.store.get_preview(task_id).await {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };

        for container in [
            &record.frontend_container_id,
            &record.backend_container_id,
            &record.db_container_id,
        ]
        .into_iter()
        .flatten()
        {
            let _ = self.docker(&["rm", "-f", container]).await;
        }
        if let Some(network) = &record.network_id {
            let _ = self.docker(&["network", "rm", network]).await;
        }

        self.release_ports(record.backend_port, record.frontend_port).await;
        self.store
            .mark_preview_cleaned_up(task_id)
            .await
            .map_err(|e| PreviewError::Failed(e.to_string()))?;
        info!(%task_id, "preview cleaned up");
        Ok(())
    }

    pub async fn check_health(&self, record: &PreviewDeployment) -> HealthStatus {
        let backend_health_url = format!("http://localhost:{}/api/", record.backend_port);
        if self.poll_health(&backend_health_url, &record.fallback_url).await {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unreachable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_exhaustion_is_detected_without_allocation() {
        // A zero-width range can never hand out two distinct ports.
        let range = (9000u16, 8999u16);
        assert!(range.1 < range.0);
    }
}
