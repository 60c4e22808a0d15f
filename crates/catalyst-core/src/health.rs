//! Health aggregator (C13). Probes every dependency concurrently and
//! folds the results through a required/optional classification rule
//! into one overall status.

use crate::bus::Bus;
use crate::env_probe::Capabilities;
use crate::sandbox::Sandbox;
use crate::store::Store;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub name: String,
    pub required: bool,
    pub status: DependencyStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: OverallStatus,
    pub services: Vec<DependencyHealth>,
}

pub struct HealthAggregator {
    store: Arc<Store>,
    sandbox: Arc<Sandbox>,
    bus: Arc<dyn Bus>,
    capabilities: Capabilities,
}

impl HealthAggregator {
    pub fn new(store: Arc<Store>, sandbox: Arc<Sandbox>, bus: Arc<dyn Bus>, capabilities: Capabilities) -> Self {
        HealthAggregator { store, sandbox, bus, capabilities }
    }

    pub async fn check(&self) -> HealthReport {
        let (store_health, bus_health, container_health) =
            tokio::join!(self.probe_store(), self.probe_bus(), self.probe_container_host());

        let services = vec![store_health, bus_health, container_health];

        let any_required_unhealthy = services
            .iter()
            .any(|s| s.required && s.status == DependencyStatus::Unhealthy);
        let any_degraded = services.iter().any(|s| s.status != DependencyStatus::Healthy);

        let overall = if any_required_unhealthy {
            OverallStatus::Unhealthy
        } else if any_degraded {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        HealthReport { overall, services }
    }

    async fn probe_store(&self) -> DependencyHealth {
        match self.store.get_task(uuid::Uuid::nil()).await {
            Ok(_) => DependencyHealth {
                name: "state_store".into(),
                required: true,
                status: DependencyStatus::Healthy,
                message: "ok".into(),
            },
            Err(crate::error::StoreError::NotFound(_)) => DependencyHealth {
                name: "state_store".into(),
                required: true,
                status: DependencyStatus::Healthy,
                message: "reachable".into(),
            },
            Err(e) => DependencyHealth {
                name: "state_store".into(),
                required: true,
                status: DependencyStatus::Unhealthy,
                message: e.to_string(),
            },
        }
    }

    async fn probe_bus(&self) -> DependencyHealth {
        // The in-process exchange has no external connection to lose; it
        // is healthy whenever the process itself is running. `self.bus`
        // is kept on the aggregator for when a future out-of-process
        // `Bus` implementation needs an actual reachability probe here.
        let _ = &self.bus;
        DependencyHealth {
            name: "event_bus".into(),
            required: self.capabilities.event_streaming,
            status: DependencyStatus::Healthy,
            message: "in-process exchange".into(),
        }
    }

    async fn probe_container_host(&self) -> DependencyHealth {
        let required = self.capabilities.preview_deployments;
        let status = self.sandbox.status();
        DependencyHealth {
            name: "container_host".into(),
            required,
            status: if status.healthy { DependencyStatus::Healthy } else { DependencyStatus::Degraded },
            message: format!("network={}", status.network),
        }
    }
}
