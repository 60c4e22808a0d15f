//! Environment probe (C1). Generalizes the filesystem/socket-hint
//! detection style of `Sandbox::detect` from "is a sandbox runtime
//! present" to the four-feature capability record every downstream
//! component reads once at process start.

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    Kubernetes,
    DockerDesktop,
    Local,
}

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub mode: DeploymentMode,
    pub postgres: bool,
    pub event_streaming: bool,
    pub git_integration: bool,
    pub preview_deployments: bool,
}

pub struct Probe;

impl Probe {
    pub async fn detect(config: &Config) -> Capabilities {
        let mode = match config.mode_override.as_str() {
            "kubernetes" => DeploymentMode::Kubernetes,
            "docker_desktop" => DeploymentMode::DockerDesktop,
            "local" => DeploymentMode::Local,
            _ => Self::detect_mode().await,
        };

        Capabilities {
            mode,
            postgres: !config.state_store_url.is_empty(),
            event_streaming: config.mode_override != "local",
            git_integration: config.git_mode != "local" && !config.git_token.is_empty(),
            preview_deployments: matches!(mode, DeploymentMode::Kubernetes | DeploymentMode::DockerDesktop),
        }
    }

    async fn detect_mode() -> DeploymentMode {
        if std::path::Path::new("/var/run/secrets/kubernetes.io/serviceaccount").exists() {
            return DeploymentMode::Kubernetes;
        }
        if Self::docker_socket_reachable().await {
            return DeploymentMode::DockerDesktop;
        }
        DeploymentMode::Local
    }

    #[cfg(unix)]
    async fn docker_socket_reachable() -> bool {
        if let Ok(host) = std::env::var("DOCKER_HOST") {
            if !host.is_empty() {
                return true;
            }
        }
        tokio::net::UnixStream::connect("/var/run/docker.sock").await.is_ok()
    }

    #[cfg(not(unix))]
    async fn docker_socket_reachable() -> bool {
        std::env::var("DOCKER_HOST").map(|h| !h.is_empty()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mode_override_is_respected() {
        let mut cfg = Config::from_env().unwrap_or_else(|_| panic!("config"));
        cfg.mode_override = "local".into();
        let caps = Probe::detect(&cfg).await;
        assert_eq!(caps.mode, DeploymentMode::Local);
        assert!(!caps.event_streaming);
    }

    #[tokio::test]
    async fn postgres_capability_follows_state_store_url() {
        let mut cfg = Config::from_env().unwrap_or_else(|_| panic!("config"));
        cfg.state_store_url = "postgres://localhost/catalyst".into();
        let caps = Probe::detect(&cfg).await;
        assert!(caps.postgres);
    }
}
