//! Relational state store (C2). `tokio-postgres` behind a
//! `deadpool-postgres` pool, holding tasks, preview deployments, and
//! LLM usage records.

use crate::error::StoreError;
use crate::event::Envelope;
use crate::types::{
    HealthStatus, PreviewDeployment, PreviewStatus, Task, TaskPhase, TaskStatus,
};
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use std::str::FromStr;
use tokio_postgres::NoTls;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct Store {
    pool: Pool,
}

fn phase_str(p: TaskPhase) -> &'static str {
    match p {
        TaskPhase::Planning => "planning",
        TaskPhase::Architecture => "architecture",
        TaskPhase::Coding => "coding",
        TaskPhase::Testing => "testing",
        TaskPhase::Reviewing => "reviewing",
        TaskPhase::Deploying => "deploying",
        TaskPhase::Complete => "complete",
        TaskPhase::Failed => "failed",
    }
}

fn parse_phase(s: &str) -> Result<TaskPhase, StoreError> {
    Ok(match s {
        "planning" => TaskPhase::Planning,
        "architecture" => TaskPhase::Architecture,
        "coding" => TaskPhase::Coding,
        "testing" => TaskPhase::Testing,
        "reviewing" => TaskPhase::Reviewing,
        "deploying" => TaskPhase::Deploying,
        "complete" => TaskPhase::Complete,
        "failed" => TaskPhase::Failed,
        other => return Err(StoreError::NotFound(format!("unknown phase {other}"))),
    })
}

fn status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Queued => "queued",
        TaskStatus::Running => "running",
        TaskStatus::Succeeded => "succeeded",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn parse_status(s: &str) -> Result<TaskStatus, StoreError> {
    Ok(match s {
        "queued" => TaskStatus::Queued,
        "running" => TaskStatus::Running,
        "succeeded" => TaskStatus::Succeeded,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        other => return Err(StoreError::NotFound(format!("unknown status {other}"))),
    })
}

fn row_to_task(row: &tokio_postgres::Row) -> Result<Task, StoreError> {
    Ok(Task {
        id: row.get("id"),
        project_id: row.get("project_id"),
        prompt: row.get("prompt"),
        phase: parse_phase(row.get("phase"))?,
        status: parse_status(row.get("status"))?,
        summary: row.get("summary"),
        rework_attempts: row.get::<_, i32>("rework_attempts") as u32,
        cancel_requested: row.get("cancel_requested"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn preview_status_str(s: PreviewStatus) -> &'static str {
    match s {
        PreviewStatus::Starting => "starting",
        PreviewStatus::Deployed => "deployed",
        PreviewStatus::Unhealthy => "unhealthy",
        PreviewStatus::CleanedUp => "cleaned_up",
        PreviewStatus::Failed => "failed",
    }
}

fn parse_preview_status(s: &str) -> PreviewStatus {
    match s {
        "deployed" => PreviewStatus::Deployed,
        "unhealthy" => PreviewStatus::Unhealthy,
        "cleaned_up" => PreviewStatus::CleanedUp,
        "failed" => PreviewStatus::Failed,
        _ => PreviewStatus::Starting,
    }
}

fn health_status_str(s: HealthStatus) -> &'static str {
    match s {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Unhealthy => "unhealthy",
        HealthStatus::Unreachable => "unreachable",
        HealthStatus::Unknown => "unknown",
    }
}

fn parse_health_status(s: &str) -> HealthStatus {
    match s {
        "healthy" => HealthStatus::Healthy,
        "unhealthy" => HealthStatus::Unhealthy,
        "unreachable" => HealthStatus::Unreachable,
        _ => HealthStatus::Unknown,
    }
}

fn row_to_preview(row: &tokio_postgres::Row) -> PreviewDeployment {
    PreviewDeployment {
        task_id: row.get("task_id"),
        project_name: row.get("project_name"),
        frontend_container_id: row.get("frontend_container_id"),
        backend_container_id: row.get("backend_container_id"),
        db_container_id: row.get("db_container_id"),
        network_id: row.get("network_id"),
        backend_port: row.get::<_, i32>("backend_port") as u16,
        frontend_port: row.get::<_, i32>("frontend_port") as u16,
        preview_url: row.get("preview_url"),
        fallback_url: row.get("fallback_url"),
        status: parse_preview_status(row.get("status")),
        health_status: parse_health_status(row.get("health_status")),
        deployed_at: row.get("deployed_at"),
        expires_at: row.get("expires_at"),
        last_health_check: row.get("last_health_check"),
    }
}

pub enum PreviewFilter {
    Active,
    Expired,
    All,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let mut cfg = PoolConfig::new();
        cfg.url = Some(database_url.to_string());
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Store { pool })
    }

    /// Acquires a connection with bounded retry; every public method
    /// routes through this so a transient outage surfaces as
    /// `StoreError::Unavailable` only after exhausting the retry budget.
    async fn get(&self) -> Result<deadpool_postgres::Object, StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.pool.get().await {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt < 3 => {
                    attempt += 1;
                    warn!(attempt, error = %e, "store checkout failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(100 * attempt as u64))
                        .await;
                }
                Err(e) => {
                    error!(error = %e, "store unavailable after retries");
                    return Err(StoreError::Unavailable(e.to_string()));
                }
            }
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.get().await?;
        conn.batch_execute(include_str!("../schema.sql"))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!("state store schema applied");
        Ok(())
    }

    pub async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.get().await?;
        conn.execute(
            "INSERT INTO tasks (id, project_id, prompt, phase, status, summary, \
             rework_attempts, cancel_requested, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
            &[
                &task.id,
                &task.project_id,
                &task.prompt,
                &phase_str(task.phase),
                &status_str(task.status),
                &task.summary,
                &(task.rework_attempts as i32),
                &task.cancel_requested,
                &task.created_at,
                &task.updated_at,
            ],
        )
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        let conn = self.get().await?;
        let row = conn
            .query_opt("SELECT * FROM tasks WHERE id = $1", &[&id])
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row_to_task(&row)
    }

    /// Rejects illegal transitions: the new phase must be the current
    /// phase's `next()`, or `failed`/`cancelled` status from any
    /// non-terminal phase, or a legal no-op (identical phase/status).
    pub async fn transition(
        &self,
        id: Uuid,
        new_phase: TaskPhase,
        new_status: TaskStatus,
    ) -> Result<(), StoreError> {
        let current = self.get_task(id).await?;
        let legal = current.phase == new_phase
            || current.phase.next() == Some(new_phase)
            || new_phase == TaskPhase::Failed;
        if current.phase.is_terminal() && !(current.phase == new_phase && current.status == new_status) {
            return Err(StoreError::IllegalTransition {
                from: format!("{:?}/{:?}", current.phase, current.status),
                to: format!("{new_phase:?}/{new_status:?}"),
            });
        }
        if !legal {
            return Err(StoreError::IllegalTransition {
                from: format!("{:?}", current.phase),
                to: format!("{new_phase:?}"),
            });
        }
        let conn = self.get().await?;
        conn.execute(
            "UPDATE tasks SET phase = $2, status = $3, updated_at = now() WHERE id = $1",
            &[&id, &phase_str(new_phase), &status_str(new_status)],
        )
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn set_summary(&self, id: Uuid, summary: &str) -> Result<(), StoreError> {
        let conn = self.get().await?;
        conn.execute(
            "UPDATE tasks SET summary = $2, updated_at = now() WHERE id = $1",
            &[&id, &summary],
        )
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn request_cancel(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.get().await?;
        conn.execute(
            "UPDATE tasks SET cancel_requested = TRUE, updated_at = now() WHERE id = $1",
            &[&id],
        )
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn bump_rework(&self, id: Uuid) -> Result<u32, StoreError> {
        let conn = self.get().await?;
        let row = conn
            .query_one(
                "UPDATE tasks SET rework_attempts = rework_attempts + 1, updated_at = now() \
                 WHERE id = $1 RETURNING rework_attempts",
                &[&id],
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(row.get::<_, i32>(0) as u32)
    }

    pub async fn append_event(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let conn = self.get().await?;
        conn.execute(
            "INSERT INTO agent_events (trace_id, task_id, actor, event_type, payload, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
            &[
                &envelope.trace_id,
                &envelope.task_id,
                &envelope.actor,
                &envelope.event_type.0,
                &envelope.payload,
                &envelope.timestamp,
            ],
        )
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn record_preview(&self, p: &PreviewDeployment) -> Result<(), StoreError> {
        let conn = self.get().await?;
        conn.execute(
            "INSERT INTO preview_deployments (task_id, project_name, frontend_container_id, \
             backend_container_id, db_container_id, network_id, backend_port, frontend_port, \
             preview_url, fallback_url, status, health_status, deployed_at, expires_at, \
             last_health_check) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15) \
             ON CONFLICT (task_id) DO UPDATE SET \
             frontend_container_id = EXCLUDED.frontend_container_id, \
             backend_container_id = EXCLUDED.backend_container_id, \
             db_container_id = EXCLUDED.db_container_id, \
             network_id = EXCLUDED.network_id, \
             backend_port = EXCLUDED.backend_port, \
             frontend_port = EXCLUDED.frontend_port, \
             preview_url = EXCLUDED.preview_url, \
             fallback_url = EXCLUDED.fallback_url, \
             status = EXCLUDED.status, \
             health_status = EXCLUDED.health_status, \
             expires_at = EXCLUDED.expires_at",
            &[
                &p.task_id,
                &p.project_name,
                &p.frontend_container_id,
                &p.backend_container_id,
                &p.db_container_id,
                &p.network_id,
                &(p.backend_port as i32),
                &(p.frontend_port as i32),
                &p.preview_url,
                &p.fallback_url,
                &preview_status_str(p.status),
                &health_status_str(p.health_status),
                &p.deployed_at,
                &p.expires_at,
                &p.last_health_check,
            ],
        )
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn update_preview_health(
        &self,
        task_id: Uuid,
        status: HealthStatus,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.get().await?;
        conn.execute(
            "UPDATE preview_deployments SET health_status = $2, last_health_check = $3 \
             WHERE task_id = $1",
            &[&task_id, &health_status_str(status), &ts],
        )
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn mark_preview_cleaned_up(&self, task_id: Uuid) -> Result<(), StoreError> {
        let conn = self.get().await?;
        conn.execute(
            "UPDATE preview_deployments SET status = 'cleaned_up' WHERE task_id = $1",
            &[&task_id],
        )
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn get_preview(&self, task_id: Uuid) -> Result<PreviewDeployment, StoreError> {
        let conn = self.get().await?;
        let row = conn
            .query_opt("SELECT * FROM preview_deployments WHERE task_id = $1", &[&task_id])
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        Ok(row_to_preview(&row))
    }

    pub async fn list_previews(
        &self,
        filter: PreviewFilter,
    ) -> Result<Vec<PreviewDeployment>, StoreError> {
        let conn = self.get().await?;
        let rows = match filter {
            PreviewFilter::All => {
                conn.query("SELECT * FROM preview_deployments", &[]).await
            }
            PreviewFilter::Active => {
                conn.query(
                    "SELECT * FROM preview_deployments WHERE status = 'deployed'",
                    &[],
                )
                .await
            }
            PreviewFilter::Expired => {
                conn.query(
                    "SELECT * FROM preview_deployments WHERE status = 'deployed' \
                     AND expires_at <= now()",
                    &[],
                )
                .await
            }
        }
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(rows.iter().map(row_to_preview).collect())
    }

    pub async fn record_llm_usage(
        &self,
        task_id: Uuid,
        agent: &str,
        model: &str,
        input_tokens: i32,
        output_tokens: i32,
        cost_usd: f64,
    ) -> Result<(), StoreError> {
        let conn = self.get().await?;
        conn.execute(
            "INSERT INTO llm_usage (task_id, agent, model, input_tokens, output_tokens, cost_usd) \
             VALUES ($1,$2,$3,$4,$5,$6)",
            &[&task_id, &agent, &model, &input_tokens, &output_tokens, &cost_usd],
        )
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn ingest_explorer_scan(
        &self,
        system_name: &str,
        brief: &str,
        risks: serde_json::Value,
        proposals: serde_json::Value,
    ) -> Result<(), StoreError> {
        let conn = self.get().await?;
        conn.execute(
            "INSERT INTO explorer_scans (system_name, brief, risks, proposals) \
             VALUES ($1,$2,$3,$4)",
            &[&system_name, &brief, &risks, &proposals],
        )
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::agent::UsageRecorder for Store {
    async fn record_usage(&self, task_id: Uuid, agent: &'static str, completion: &crate::agent::LlmCompletion) {
        let cost_usd = crate::llm::estimate_cost_usd(completion.input_tokens, completion.output_tokens);
        if let Err(e) = self
            .record_llm_usage(task_id, agent, &completion.model, completion.input_tokens, completion.output_tokens, cost_usd)
            .await
        {
            warn!(%task_id, agent, error = %e, "failed to record llm usage");
        }
    }
}

impl FromStr for PreviewFilter {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PreviewFilter::Active),
            "expired" => Ok(PreviewFilter::Expired),
            "all" => Ok(PreviewFilter::All),
            other => Err(StoreError::NotFound(format!("unknown filter {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_string() {
        for p in [
            TaskPhase::Planning,
            TaskPhase::Architecture,
            TaskPhase::Coding,
            TaskPhase::Testing,
            TaskPhase::Reviewing,
            TaskPhase::Deploying,
            TaskPhase::Complete,
            TaskPhase::Failed,
        ] {
            assert_eq!(parse_phase(phase_str(p)).unwrap(), p);
        }
    }

    #[test]
    fn status_round_trips_through_string() {
        for s in [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(parse_status(status_str(s)).unwrap(), s);
        }
    }

    #[test]
    fn preview_filter_parses_known_values() {
        assert!(matches!("active".parse::<PreviewFilter>(), Ok(PreviewFilter::Active)));
        assert!("bogus".parse::<PreviewFilter>().is_err());
    }
}
