use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dotted event type naming the phase it advances. Kept as a thin
/// wrapper over `String` rather than a closed enum: the bus's binding
/// table matches glob patterns (`*.complete`) against this, and new
/// event types (e.g. `explorer.scan.request`) arrive from producers this
/// crate does not own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(pub String);

impl EventType {
    pub fn new(s: impl Into<String>) -> Self {
        EventType(s.into())
    }

    pub fn matches_pattern(&self, pattern: &str) -> bool {
        if let Some(suffix) = pattern.strip_prefix('*') {
            self.0.ends_with(suffix)
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            self.0.starts_with(prefix)
        } else {
            self.0 == pattern
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod event_types {
    pub const TASK_INITIATED: &str = "task.initiated";
    pub const PLAN_CREATED: &str = "plan.created";
    pub const ARCHITECTURE_PROPOSED: &str = "architecture.proposed";
    pub const CODE_PR_OPENED: &str = "code.pr.opened";
    pub const TEST_RESULTS: &str = "test.results";
    pub const REVIEW_DECISION: &str = "review.decision";
    pub const DEPLOY_STATUS: &str = "deploy.status";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const EXPLORER_SCAN_REQUEST: &str = "explorer.scan.request";
}

/// The canonical wire record for an agent-to-agent signal. Immutable once
/// constructed; appended to the store before being handed to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub trace_id: Uuid,
    pub task_id: Uuid,
    pub actor: String,
    pub event_type: EventType,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(
        trace_id: Uuid,
        task_id: Uuid,
        actor: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Envelope {
            version: 1,
            trace_id,
            task_id,
            actor: actor.into(),
            event_type: EventType::new(event_type),
            repo: None,
            branch: None,
            commit: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn with_repo(mut self, repo: impl Into<String>, branch: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self.branch = Some(branch.into());
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }
}

/// Defines the fixed successor for each pipeline event type. `None` means
/// the chain ends here (terminal events, or events whose successor
/// depends on payload content, e.g. `test.results` branches on pass/fail
/// and is handled explicitly by the orchestrator/worker rather than this
/// table).
pub fn fixed_successor_queue(event_type: &str) -> Option<&'static str> {
    use event_types::*;
    match event_type {
        TASK_INITIATED => Some("planner"),
        PLAN_CREATED => Some("architect"),
        ARCHITECTURE_PROPOSED => Some("coder"),
        CODE_PR_OPENED => Some("tester"),
        REVIEW_DECISION => Some("deployer"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_pattern_matches_suffix() {
        let et = EventType::new("deploy.status.complete");
        assert!(et.matches_pattern("*.complete"));
        assert!(!EventType::new("deploy.status").matches_pattern("*.complete"));
    }

    #[test]
    fn exact_pattern_matches_only_exact() {
        let et = EventType::new("task.initiated");
        assert!(et.matches_pattern("task.initiated"));
        assert!(!et.matches_pattern("task.initiated.v2"));
    }
}
