//! Polymorphic agent capability set (C5). A dual event/direct interface
//! every pipeline agent implements, with every invocation wrapped in a
//! timeout + bounded retry + structured logging shell.

use crate::error::AgentError;
use crate::event::Envelope;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// One pipeline phase's computation. Not itself long-lived state: agents
/// are cheap, stateless values owned by a [`Runtime`], which carries the
/// shared wiring (bus, store, stream, config).
#[async_trait]
pub trait Agent: Send + Sync {
    /// Human-readable name used in logs, commit trailers, and envelope
    /// `actor` fields.
    fn name(&self) -> &'static str;

    /// Consumes one event and produces its successor. Used on the
    /// event-driven path.
    async fn handle_event(&self, envelope: &Envelope) -> Result<Envelope, AgentError>;

    /// Direct invocation bypassing the bus, used on the sequential path.
    /// Default implementation synthesizes a throwaway envelope and
    /// delegates to `handle_event`, which is sufficient for agents whose
    /// logic doesn't depend on bus framing.
    async fn handle_direct(
        &self,
        trace_id: Uuid,
        task_id: Uuid,
        input_event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Envelope, AgentError> {
        let envelope = Envelope::new(trace_id, task_id, "orchestrator", input_event_type, payload);
        self.handle_event(&envelope).await
    }
}

/// Shared wiring plus one agent value. Wraps every call with a timeout,
/// a bounded retry loop keyed on `AgentError::retryable`, and dual-sink
/// logging (tracing + the task's log stream).
pub struct Runtime<A: Agent> {
    pub agent: A,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl<A: Agent> Runtime<A> {
    pub fn new(agent: A, timeout_secs: u64) -> Self {
        Runtime { agent, timeout: Duration::from_secs(timeout_secs), max_retries: 2 }
    }

    pub async fn run_event(&self, envelope: &Envelope) -> Result<Envelope, AgentError> {
        let mut attempt = 0u32;
        loop {
            let name = self.agent.name();
            let task_id = envelope.task_id;
            let result = tokio::time::timeout(self.timeout, self.agent.handle_event(envelope))
                .await
                .map_err(|_| AgentError::Timeout)
                .and_then(|inner| inner);

            match result {
                Ok(out) => {
                    info!(agent = name, %task_id, attempt, "agent phase succeeded");
                    return Ok(out);
                }
                Err(e) if e.retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(agent = name, %task_id, attempt, error = %e, "retrying agent phase");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => {
                    warn!(agent = name, %task_id, attempt, error = %e, "agent phase failed");
                    return Err(e);
                }
            }
        }
    }
}

/// The out-of-scope LLM collaborator boundary (C14). Every agent that
/// needs a completion calls through this trait rather than embedding a
/// specific provider's client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[crate::types::ChatMessage],
    ) -> Result<LlmCompletion, AgentError>;
}

#[derive(Debug, Clone)]
pub struct LlmCompletion {
    pub text: String,
    pub model: String,
    pub input_tokens: i32,
    pub output_tokens: i32,
}

pub type SharedLlmClient = Arc<dyn LlmClient>;

/// Sink for per-call token/cost accounting (C16). Agents that call an
/// `LlmClient` report each completion here; kept as a trait rather than
/// a direct `Store` dependency so an agent can be constructed in a test
/// without a live database.
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record_usage(&self, task_id: Uuid, agent: &'static str, completion: &LlmCompletion);
}

pub struct NullUsageRecorder;

#[async_trait]
impl UsageRecorder for NullUsageRecorder {
    async fn record_usage(&self, _task_id: Uuid, _agent: &'static str, _completion: &LlmCompletion) {}
}

pub type SharedUsageRecorder = Arc<dyn UsageRecorder>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_types;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn handle_event(&self, envelope: &Envelope) -> Result<Envelope, AgentError> {
            Ok(Envelope::new(
                envelope.trace_id,
                envelope.task_id,
                self.name(),
                event_types::PLAN_CREATED,
                serde_json::json!({"echo": true}),
            ))
        }
    }

    struct FlakyAgent {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn handle_event(&self, envelope: &Envelope) -> Result<Envelope, AgentError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                return Err(AgentError::Llm("transient".into()));
            }
            Ok(Envelope::new(
                envelope.trace_id,
                envelope.task_id,
                self.name(),
                event_types::PLAN_CREATED,
                serde_json::json!({}),
            ))
        }
    }

    #[tokio::test]
    async fn successful_run_returns_successor_envelope() {
        let runtime = Runtime::new(EchoAgent, 5);
        let input = Envelope::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "orchestrator",
            event_types::TASK_INITIATED,
            serde_json::json!({}),
        );
        let out = runtime.run_event(&input).await.unwrap();
        assert_eq!(out.event_type.0, event_types::PLAN_CREATED);
    }

    #[tokio::test]
    async fn retryable_error_is_retried_and_then_succeeds() {
        let runtime = Runtime::new(
            FlakyAgent { calls: std::sync::atomic::AtomicU32::new(0) },
            5,
        );
        let input = Envelope::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "orchestrator",
            event_types::TASK_INITIATED,
            serde_json::json!({}),
        );
        let out = runtime.run_event(&input).await.unwrap();
        assert_eq!(out.event_type.0, event_types::PLAN_CREATED);
    }

    struct AlwaysValidationFail;

    #[async_trait]
    impl Agent for AlwaysValidationFail {
        fn name(&self) -> &'static str {
            "bad"
        }

        async fn handle_event(&self, _envelope: &Envelope) -> Result<Envelope, AgentError> {
            Err(AgentError::Validation("missing feature list".into()))
        }
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let runtime = Runtime::new(AlwaysValidationFail, 5);
        let input = Envelope::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "orchestrator",
            event_types::TASK_INITIATED,
            serde_json::json!({}),
        );
        let err = runtime.run_event(&input).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}
