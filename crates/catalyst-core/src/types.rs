use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Pipeline phase a task is currently in. Transitions follow the fixed
/// agent chain (planning -> architecture -> coding -> testing ->
/// reviewing -> deploying -> complete), with `failed` reachable from any
/// non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Planning,
    Architecture,
    Coding,
    Testing,
    Reviewing,
    Deploying,
    Complete,
    Failed,
}

impl TaskPhase {
    /// The phase this one advances to on a successful agent handoff, or
    /// `None` if terminal.
    pub fn next(self) -> Option<TaskPhase> {
        use TaskPhase::*;
        match self {
            Planning => Some(Architecture),
            Architecture => Some(Coding),
            Coding => Some(Testing),
            Testing => Some(Reviewing),
            Reviewing => Some(Deploying),
            Deploying => Some(Complete),
            Complete | Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskPhase::Complete | TaskPhase::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: String,
    pub prompt: String,
    pub phase: TaskPhase,
    pub status: TaskStatus,
    pub summary: Option<String>,
    pub rework_attempts: u32,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(project_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            prompt: prompt.into(),
            phase: TaskPhase::Planning,
            status: TaskStatus::Queued,
            summary: None,
            rework_attempts: 0,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewStatus {
    Starting,
    Deployed,
    Unhealthy,
    CleanedUp,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unreachable,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewDeployment {
    pub task_id: Uuid,
    pub project_name: String,
    pub frontend_container_id: Option<String>,
    pub backend_container_id: Option<String>,
    pub db_container_id: Option<String>,
    pub network_id: Option<String>,
    pub backend_port: u16,
    pub frontend_port: u16,
    pub preview_url: String,
    pub fallback_url: String,
    pub status: PreviewStatus,
    pub health_status: HealthStatus,
    pub deployed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// A filesystem path -> file contents map, the currency agents pass for
/// generated project source.
pub type FileTree = HashMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInvocation {
    pub command: Vec<String>,
    pub files: FileTree,
    pub env: HashMap<String, String>,
    pub requirements: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
    pub container_id: Option<String>,
}

impl SandboxResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// A role-tagged message passed to the out-of-scope LLM collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: "user".into(), content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResults {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub coverage_percent: Option<u32>,
}

impl TestResults {
    pub fn ok(&self, threshold: Option<u32>) -> bool {
        if self.failed != 0 {
            return false;
        }
        match (self.coverage_percent, threshold) {
            (Some(cov), Some(min)) => cov >= min,
            _ => true,
        }
    }
}
