//! Sandboxed execution service (C9). Backend-selection between a native
//! shell and a `docker` command-builder; the docker backend sets memory/CPU
//! caps and bridge (not host) networking on every container it runs.

use crate::error::SandboxError;
use crate::types::{FileTree, SandboxInvocation, SandboxResult};
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    Bwrap,
    Docker,
    Direct,
}

impl SandboxMode {
    pub fn from_str_or_auto(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bwrap" => Some(Self::Bwrap),
            "docker" => Some(Self::Docker),
            "none" | "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

pub struct SandboxStatus {
    pub healthy: bool,
    pub image_ready: bool,
    pub memory_limit_mb: u64,
    pub cpu_quota_millis: u32,
    pub timeout_secs: u64,
    pub network: &'static str,
}

pub struct Sandbox {
    mode: SandboxMode,
    image: String,
    memory_mb: u64,
    cpu_quota_millis: u32,
    concurrency: std::sync::Arc<Semaphore>,
}

/// Ensures a container (if one was started) is force-removed and its
/// scratch workspace deleted on every exit path, including early returns
/// on timeout. Scoped-acquisition for sandbox resources, per Design
/// Note §9.
struct Cleanup {
    container_name: Option<String>,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if let Some(name) = self.container_name.take() {
            let _ = std::process::Command::new("docker")
                .args(["rm", "-f", &name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
}

impl Sandbox {
    pub async fn detect(preferred: &str) -> SandboxMode {
        if let Some(forced) = SandboxMode::from_str_or_auto(preferred) {
            return forced;
        }
        if Self::bwrap_available().await {
            info!("sandbox: bwrap detected, using namespace sandbox");
            SandboxMode::Bwrap
        } else if Self::docker_available().await {
            info!("sandbox: bwrap not found, falling back to docker");
            SandboxMode::Docker
        } else {
            warn!("sandbox: neither bwrap nor docker available, running directly (no isolation)");
            SandboxMode::Direct
        }
    }

    pub async fn bwrap_available() -> bool {
        if cfg!(not(target_os = "linux")) {
            return false;
        }
        Command::new("bwrap")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub async fn docker_available() -> bool {
        Command::new("docker")
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn docker_image_present(image: &str) -> bool {
        Command::new("docker")
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub async fn new(preferred: &str, image: &str, memory_mb: u64, max_concurrency: u32) -> Self {
        Sandbox {
            mode: Self::detect(preferred).await,
            image: image.to_string(),
            memory_mb,
            cpu_quota_millis: 500,
            concurrency: std::sync::Arc::new(Semaphore::new(max_concurrency.max(1) as usize)),
        }
    }

    pub fn status(&self) -> SandboxStatus {
        SandboxStatus {
            healthy: self.mode != SandboxMode::Direct,
            image_ready: true,
            memory_limit_mb: self.memory_mb,
            cpu_quota_millis: self.cpu_quota_millis,
            timeout_secs: 300,
            network: "bridge",
        }
    }

    fn bwrap_args(writable_dirs: &[&str], working_dir: &str, command: &[String]) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        args.extend(["--ro-bind", "/", "/", "--dev", "/dev"].map(str::to_string));
        for dir in writable_dirs {
            if !Path::new(dir).exists() {
                warn!("sandbox: skipping non-existent writable dir: {dir}");
                continue;
            }
            args.extend(["--bind", dir, dir].map(str::to_string));
        }
        args.extend(["--bind", "/tmp", "/tmp"].map(str::to_string));
        args.extend(
            ["--unshare-pid", "--new-session", "--die-with-parent", "--proc", "/proc"]
                .map(str::to_string),
        );
        args.extend(["--chdir", working_dir].map(str::to_string));
        args.push("--".into());
        args.extend_from_slice(command);
        args
    }

    fn bwrap_command(&self, writable_dirs: &[&str], working_dir: &str, command: &[String]) -> Command {
        let args = Self::bwrap_args(writable_dirs, working_dir, command);
        let mut cmd = Command::new("bwrap");
        cmd.args(args);
        cmd
    }

    /// Bridge (not host) network, explicit memory and CPU caps, a
    /// per-invocation name so the caller can report and force-remove the
    /// container on every exit path.
    fn docker_command(&self, container_name: &str, working_dir: &str, command: &[String]) -> Command {
        let cpus = format!("{:.1}", self.cpu_quota_millis as f64 / 1000.0);
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "--pids-limit".to_string(),
            "256".to_string(),
            "--memory".to_string(),
            format!("{}m", self.memory_mb),
            "--cpus".to_string(),
            cpus,
            "--network".to_string(),
            "bridge".to_string(),
        ];
        if cfg!(target_os = "linux") {
            args.extend(
                ["--security-opt", "no-new-privileges:true", "--cap-drop", "ALL"]
                    .map(str::to_string),
            );
        }
        args.push("-v".to_string());
        args.push(format!("{working_dir}:{working_dir}"));
        args.push("-w".to_string());
        args.push(working_dir.to_string());
        args.push(self.image.clone());
        args.extend_from_slice(command);

        let mut cmd = Command::new("docker");
        cmd.args(args);
        cmd
    }

    async fn materialize(workdir: &Path, files: &FileTree) -> std::io::Result<()> {
        for (path, contents) in files {
            let full = workdir.join(path);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full, contents).await?;
        }
        Ok(())
    }

    pub async fn run_command(&self, invocation: SandboxInvocation) -> Result<SandboxResult, SandboxError> {
        if self.mode == SandboxMode::Docker && !Self::docker_image_present(&self.image).await {
            warn!(image = %self.image, "sandbox: runner image missing, refusing to start a container");
            return Err(SandboxError::ImageMissing);
        }

        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| SandboxError::Unavailable("semaphore closed".into()))?;

        let scratch = tempfile::tempdir().map_err(|e| SandboxError::Failed(e.to_string()))?;
        Self::materialize(scratch.path(), &invocation.files)
            .await
            .map_err(|e| SandboxError::Failed(e.to_string()))?;

        let workdir = scratch.path().to_string_lossy().to_string();
        let container_name = format!("catalyst-sbx-{}", Uuid::new_v4());

        let mut cleanup = Cleanup { container_name: None };
        let mut cmd = match self.mode {
            SandboxMode::Bwrap => self.bwrap_command(&[workdir.as_str()], &workdir, &invocation.command),
            SandboxMode::Docker => {
                cleanup.container_name = Some(container_name.clone());
                self.docker_command(&container_name, &workdir, &invocation.command)
            }
            SandboxMode::Direct => {
                let mut c = Command::new(&invocation.command[0]);
                c.args(&invocation.command[1..]).current_dir(&workdir);
                c
            }
        };

        for (k, v) in &invocation.env {
            cmd.env(k, v);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| SandboxError::Unavailable(e.to_string()))?;

        let timeout = std::time::Duration::from_secs(invocation.timeout_secs.max(1));
        let output = tokio::time::timeout(timeout, child.wait_with_output()).await;

        let result = match output {
            Ok(Ok(out)) => SandboxResult {
                exit_code: out.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
                duration_ms: start.elapsed().as_millis(),
                container_id: cleanup.container_name.clone(),
            },
            Ok(Err(e)) => return Err(SandboxError::Failed(e.to_string())),
            Err(_) => SandboxResult {
                exit_code: 124,
                stdout: String::new(),
                stderr: "sandbox invocation timed out".into(),
                duration_ms: start.elapsed().as_millis(),
                container_id: cleanup.container_name.clone(),
            },
        };

        // `cleanup` drops here regardless of which branch above was taken,
        // force-removing the container and the scratch dir.
        Ok(result)
    }

    pub async fn run_python_tests(
        &self,
        source_files: FileTree,
        test_files: FileTree,
        requirements: Vec<String>,
    ) -> Result<SandboxResult, SandboxError> {
        let mut files = source_files;
        files.extend(test_files);
        self.run_command(SandboxInvocation {
            command: vec!["pytest".into(), "-q".into()],
            files,
            env: Default::default(),
            requirements,
            timeout_secs: 300,
        })
        .await
    }

    pub async fn run_javascript_tests(
        &self,
        source_files: FileTree,
        test_files: FileTree,
        requirements: Vec<String>,
    ) -> Result<SandboxResult, SandboxError> {
        let mut files = source_files;
        files.extend(test_files);
        self.run_command(SandboxInvocation {
            command: vec!["npx".into(), "jest".into(), "--ci".into()],
            files,
            env: Default::default(),
            requirements,
            timeout_secs: 300,
        })
        .await
    }

    pub async fn run_linter(
        &self,
        files: FileTree,
        linter: &str,
        args: Vec<String>,
    ) -> Result<SandboxResult, SandboxError> {
        let mut command = vec![linter.to_string()];
        command.extend(args);
        self.run_command(SandboxInvocation {
            command,
            files,
            env: Default::default(),
            requirements: vec![],
            timeout_secs: 120,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_known_strings() {
        assert_eq!(SandboxMode::from_str_or_auto("bwrap"), Some(SandboxMode::Bwrap));
        assert_eq!(SandboxMode::from_str_or_auto("DOCKER"), Some(SandboxMode::Docker));
        assert_eq!(SandboxMode::from_str_or_auto("none"), Some(SandboxMode::Direct));
        assert_eq!(SandboxMode::from_str_or_auto("auto"), None);
    }

    #[test]
    fn docker_command_sets_memory_cpu_and_bridge_network() {
        let sandbox = Sandbox {
            mode: SandboxMode::Docker,
            image: "catalyst-runner".into(),
            memory_mb: 512,
            cpu_quota_millis: 500,
            concurrency: std::sync::Arc::new(Semaphore::new(1)),
        };
        let cmd = sandbox.docker_command("ctr-1", "/tmp/work", &["pytest".into()]);
        let program = format!("{cmd:?}");
        assert!(program.contains("--memory"));
        assert!(program.contains("512m"));
        assert!(program.contains("bridge"));
        assert!(!program.contains("\"host\""));
    }
}
