use async_trait::async_trait;
use catalyst_core::agent::{Agent, SharedLlmClient, SharedUsageRecorder};
use catalyst_core::error::AgentError;
use catalyst_core::event::{event_types, Envelope};
use catalyst_core::types::ChatMessage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Architecture {
    pub tech_stack: Vec<String>,
    pub data_model: Vec<String>,
    pub notes: Option<String>,
}

pub struct Architect {
    llm: SharedLlmClient,
    usage: SharedUsageRecorder,
}

impl Architect {
    pub fn new(llm: SharedLlmClient, usage: SharedUsageRecorder) -> Self {
        Architect { llm, usage }
    }
}

#[async_trait]
impl Agent for Architect {
    fn name(&self) -> &'static str {
        "architect"
    }

    async fn handle_event(&self, envelope: &Envelope) -> Result<Envelope, AgentError> {
        let plan = serde_json::to_string(&envelope.payload)
            .map_err(|e| AgentError::Validation(e.to_string()))?;

        let messages = vec![
            ChatMessage::system(
                "You are an architecture agent. Given a plan, respond with JSON: \
                 {\"tech_stack\": [...], \"data_model\": [...], \"notes\": \"...\"}",
            ),
            ChatMessage::user(plan),
        ];

        let completion = self.llm.complete(&messages).await.map_err(|e| AgentError::Llm(e.to_string()))?;
        self.usage.record_usage(envelope.task_id, self.name(), &completion).await;
        let architecture: Architecture = serde_json::from_str(&completion.text)
            .map_err(|e| AgentError::Validation(format!("architect output not valid JSON: {e}")))?;

        if architecture.data_model.is_empty() {
            return Err(AgentError::Validation("architecture must name a data model".into()));
        }

        let project_id = envelope.payload.get("project_id").cloned().unwrap_or_default();
        let mut payload = serde_json::to_value(&architecture).unwrap_or_default();
        payload["project_id"] = project_id;

        Ok(Envelope::new(
            envelope.trace_id,
            envelope.task_id,
            self.name(),
            event_types::ARCHITECTURE_PROPOSED,
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
            Ok(LlmCompletion { text: self.0.to_string(), model: "stub".into(), input_tokens: 1, output_tokens: 1 })
        }
    }

    fn plan_created() -> Envelope {
        Envelope::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "planner",
            event_types::PLAN_CREATED,
            serde_json::json!({"features": ["auth"], "tasks": ["login"], "acceptance_criteria": []}),
        )
    }

    fn null_usage() -> catalyst_core::agent::SharedUsageRecorder {
        std::sync::Arc::new(catalyst_core::agent::NullUsageRecorder)
    }

    #[tokio::test]
    async fn valid_architecture_produces_architecture_proposed() {
        let architect = Architect::new(
            std::sync::Arc::new(StubLlm(
                r#"{"tech_stack":["rust","postgres"],"data_model":["User"],"notes":null}"#,
            )),
            null_usage(),
        );
        let out = architect.handle_event(&plan_created()).await.unwrap();
        assert_eq!(out.event_type.0, event_types::ARCHITECTURE_PROPOSED);
    }

    #[tokio::test]
    async fn missing_data_model_fails_validation() {
        let architect = Architect::new(
            std::sync::Arc::new(StubLlm(r#"{"tech_stack":["rust"],"data_model":[],"notes":null}"#)),
            null_usage(),
        );
        let err = architect.handle_event(&plan_created()).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}
