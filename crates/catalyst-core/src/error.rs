//! Typed error kinds for the subsystem boundaries named in the error
//! taxonomy. Callers at the HTTP edge still work in `anyhow::Result`; these
//! enums exist where a caller needs to match on *kind* (retry vs. not).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent output failed validation: {0}")]
    Validation(String),
    #[error("llm call failed: {0}")]
    Llm(String),
    #[error("tool call failed: {0}")]
    Tool(String),
    #[error("agent handler timed out")]
    Timeout,
    #[error("task was cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn retryable(&self) -> bool {
        matches!(self, AgentError::Llm(_) | AgentError::Tool(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Validation(_) => "validation_error",
            AgentError::Llm(_) => "llm_error",
            AgentError::Tool(_) => "tool_error",
            AgentError::Timeout => "timeout",
            AgentError::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("illegal phase/status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
    #[error("no queue bound to event type {0}")]
    Unrouted(String),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox runner image missing")]
    ImageMissing,
    #[error("sandbox runtime unavailable: {0}")]
    Unavailable(String),
    #[error("sandbox invocation timed out")]
    Timeout,
    #[error("sandbox invocation failed: {0}")]
    Failed(String),
}

impl SandboxError {
    pub fn retryable(&self) -> bool {
        matches!(self, SandboxError::Unavailable(_) | SandboxError::Timeout)
    }
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("no free ports available in the configured range")]
    ResourceExhausted,
    #[error("preview deployment failed: {0}")]
    Failed(String),
    #[error("preview not found for task {0}")]
    NotFound(uuid::Uuid),
}
