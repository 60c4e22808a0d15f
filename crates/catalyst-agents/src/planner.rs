use async_trait::async_trait;
use catalyst_core::agent::{Agent, SharedLlmClient, SharedUsageRecorder};
use catalyst_core::error::AgentError;
use catalyst_core::event::{event_types, Envelope};
use catalyst_core::types::ChatMessage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Plan {
    pub features: Vec<String>,
    pub tasks: Vec<String>,
    pub acceptance_criteria: Vec<String>,
}

pub struct Planner {
    llm: SharedLlmClient,
    usage: SharedUsageRecorder,
}

impl Planner {
    pub fn new(llm: SharedLlmClient, usage: SharedUsageRecorder) -> Self {
        Planner { llm, usage }
    }
}

#[async_trait]
impl Agent for Planner {
    fn name(&self) -> &'static str {
        "planner"
    }

    async fn handle_event(&self, envelope: &Envelope) -> Result<Envelope, AgentError> {
        let prompt = envelope
            .payload
            .get("prompt")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::Validation("missing prompt in task.initiated payload".into()))?;

        let messages = vec![
            ChatMessage::system(
                "You are a planning agent. Respond with JSON: \
                 {\"features\": [...], \"tasks\": [...], \"acceptance_criteria\": [...]}",
            ),
            ChatMessage::user(prompt),
        ];

        let completion = self.llm.complete(&messages).await.map_err(|e| AgentError::Llm(e.to_string()))?;
        self.usage.record_usage(envelope.task_id, self.name(), &completion).await;
        let plan: Plan = serde_json::from_str(&completion.text)
            .map_err(|e| AgentError::Validation(format!("planner output not valid JSON: {e}")))?;

        if plan.features.is_empty() || plan.tasks.is_empty() {
            return Err(AgentError::Validation(
                "plan must contain at least one feature and one task".into(),
            ));
        }

        // project_id threads forward through the chain since only the
        // envelope's task_id (not project_id) is part of the fixed
        // envelope shape.
        let project_id = envelope.payload.get("project_id").cloned().unwrap_or_default();
        let mut payload = serde_json::to_value(&plan).unwrap_or_default();
        payload["project_id"] = project_id;

        Ok(Envelope::new(
            envelope.trace_id,
            envelope.task_id,
            self.name(),
            event_types::PLAN_CREATED,
            payload,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use catalyst_core::agent::{LlmClient, LlmCompletion};
    use uuid::Uuid;

    struct StubLlm(&'static str);

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<LlmCompletion, AgentError> {
            Ok(LlmCompletion {
                text: self.0.to_string(),
                model: "stub".into(),
                input_tokens: 1,
                output_tokens: 1,
            })
        }
    }

    fn task_initiated(prompt: &str) -> Envelope {
        Envelope::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "orchestrator",
            event_types::TASK_INITIATED,
            serde_json::json!({"prompt": prompt}),
        )
    }

    fn null_usage() -> catalyst_core::agent::SharedUsageRecorder {
        std::sync::Arc::new(catalyst_core::agent::NullUsageRecorder)
    }

    #[tokio::test]
    async fn valid_plan_produces_plan_created_event() {
        let planner = Planner::new(
            std::sync::Arc::new(StubLlm(
                r#"{"features":["auth"],"tasks":["build login"],"acceptance_criteria":["user can log in"]}"#,
            )),
            null_usage(),
        );
        let out = planner.handle_event(&task_initiated("build a todo app")).await.unwrap();
        assert_eq!(out.event_type.0, event_types::PLAN_CREATED);
    }

    #[tokio::test]
    async fn empty_features_fails_validation() {
        let planner = Planner::new(
            std::sync::Arc::new(StubLlm(r#"{"features":[],"tasks":["x"],"acceptance_criteria":[]}"#)),
            null_usage(),
        );
        let err = planner.handle_event(&task_initiated("build something")).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn missing_prompt_fails_before_calling_llm() {
        let planner = Planner::new(std::sync::Arc::new(StubLlm("irrelevant")), null_usage());
        let envelope = Envelope::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "orchestrator",
            event_types::TASK_INITIATED,
            serde_json::json!({}),
        );
        let err = planner.handle_event(&envelope).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}
