//! Scheduler (C12): two recurring jobs, expire and health, each on its
//! own `tokio::time::interval` loop. Each job is individually
//! `warn!`-guarded so one job's failure never stops the loop.

use crate::preview::PreviewService;
use crate::store::{PreviewFilter, Store};
use crate::types::HealthStatus;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Scheduler {
    store: Arc<Store>,
    preview: Arc<PreviewService>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, preview: Arc<PreviewService>) -> Self {
        Scheduler { store, preview }
    }

    pub fn spawn(self: Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let expire_self = self.clone();
        let expire_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60 * 60));
            loop {
                ticker.tick().await;
                expire_self.run_expire_once().await;
            }
        });

        let health_self = self;
        let health_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
            loop {
                ticker.tick().await;
                health_self.run_health_once().await;
            }
        });

        (expire_handle, health_handle)
    }

    pub async fn run_expire_once(&self) {
        let expired = match self.store.list_previews(PreviewFilter::Expired).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "scheduler: failed to list expired previews");
                return;
            }
        };
        for preview in expired {
            if let Err(e) = self.preview.cleanup(preview.task_id).await {
                warn!(task_id = %preview.task_id, error = %e, "scheduler: expire cleanup failed");
            } else {
                info!(task_id = %preview.task_id, "scheduler: expired preview cleaned up");
            }
        }
    }

    pub async fn run_health_once(&self) {
        let active = match self.store.list_previews(PreviewFilter::Active).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "scheduler: failed to list active previews");
                return;
            }
        };
        for preview in active {
            let status = self.preview.check_health(&preview).await;
            if let Err(e) = self
                .store
                .update_preview_health(preview.task_id, status, chrono::Utc::now())
                .await
            {
                warn!(task_id = %preview.task_id, error = %e, "scheduler: health update failed");
            }
            if status != HealthStatus::Healthy {
                warn!(task_id = %preview.task_id, ?status, "scheduler: preview unhealthy");
            }
        }
    }
}
