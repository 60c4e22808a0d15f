use async_trait::async_trait;
use catalyst_core::agent::{Agent, SharedLlmClient, SharedUsageRecorder};
use catalyst_core::error::AgentError;
use catalyst_core::event::{event_types, Envelope};
use catalyst_core::types::ChatMessage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct ReviewDecision {
    approve: bool,
    score: u8,
    rationale: String,
}

pub struct Reviewer {
    llm: SharedLlmClient,
    usage: SharedUsageRecorder,
}

impl Reviewer {
    pub fn new(llm: SharedLlmClient, usage: SharedUsageRecorder) -> Self {
        Reviewer { llm, usage }
    }
}

#[async_trait]
impl Agent for Reviewer {
    fn name(&self) -> &'static str {
        "reviewer"
    }

    async fn handle_event(&self, envelope: &Envelope) -> Result<Envelope, AgentError> {
        let passed = envelope.payload.get("passed_overall").and_then(|v| v.as_bool()).unwrap_or(false);
        if !passed {
            // The reviewer is only invoked on a passing test run; the
            // worker manager/orchestrator routes a failing run back to
            // the coder (bounded rework) or to task.failed instead.
            return Err(AgentError::Validation(
                "reviewer invoked with a non-passing test.results payload".into(),
            ));
        }

        let context = serde_json::to_string(&envelope.payload)
            .map_err(|e| AgentError::Validation(e.to_string()))?;
        let messages = vec![
            ChatMessage::system(
                "You are a code review agent. Respond with JSON: \
                 {\"approve\": bool, \"score\": 0-100, \"rationale\": \"...\"}",
            ),
            ChatMessage::user(context),
        ];

        let completion = self.llm.complete(&messages).await.map_err(|e| AgentError::Llm(e.to_string()))?;
        self.usage.record_usage(envelope.task_id, self.name(), &completion).await;
        let decision: ReviewDecision = serde_json::from_str(&completion.text)
            .map_err(|e| AgentError::Validation(format!("reviewer output not valid JSON: {e}")))?;

        let mut payload = serde_json::to_value(&decision).unwrap_or_default();
        if let Some(project_id) = envelope.payload.get("project_id") {
            payload["project_id"] = project_id.clone();
        }

        Ok(Envelope::new(
            envelope.trace_id,
            envelope.task_id,
            self.name(),
            event_types::REVIEW_DECISION,
            payload,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use catalyst_core::agent::LlmCompletion;
    use uuid::Uuid;

    struct StubLlm(&'static str);

    #[async_trait]
    impl catalyst_core::agent::LlmClient for StubLlm {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<LlmCompletion, AgentError> {
            Ok(LlmCompletion { text: self.0.to_string(), model: "stub".into(), input_tokens: 1, output_tokens: 1 })
        }
    }

    fn test_results(passed: bool) -> Envelope {
        Envelope::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "tester",
            event_types::TEST_RESULTS,
            serde_json::json!({"passed_overall": passed, "failed": 0}),
        )
    }

    fn null_usage() -> catalyst_core::agent::SharedUsageRecorder {
        std::sync::Arc::new(catalyst_core::agent::NullUsageRecorder)
    }

    #[tokio::test]
    async fn approving_review_produces_review_decision() {
        let reviewer = Reviewer::new(
            std::sync::Arc::new(StubLlm(r#"{"approve":true,"score":90,"rationale":"looks good"}"#)),
            null_usage(),
        );
        let out = reviewer.handle_event(&test_results(true)).await.unwrap();
        assert_eq!(out.event_type.0, event_types::REVIEW_DECISION);
    }

    #[tokio::test]
    async fn non_passing_test_results_is_rejected_before_llm_call() {
        let reviewer = Reviewer::new(std::sync::Arc::new(StubLlm("irrelevant")), null_usage());
        let err = reviewer.handle_event(&test_results(false)).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}
