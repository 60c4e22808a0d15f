use async_trait::async_trait;
use catalyst_core::agent::{Agent, SharedLlmClient, SharedUsageRecorder};
use catalyst_core::error::AgentError;
use catalyst_core::event::{event_types, Envelope};
use catalyst_core::git::{publish_remote, Git, RemoteForge};
use catalyst_core::types::ChatMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct FileTreeResponse {
    files: HashMap<String, String>,
}

pub struct Coder {
    llm: SharedLlmClient,
    repo_root: String,
    git_mode: String,
    author_name: String,
    author_email: String,
    forge: Arc<dyn RemoteForge>,
    usage: SharedUsageRecorder,
}

impl Coder {
    pub fn new(
        llm: SharedLlmClient,
        repo_root: impl Into<String>,
        git_mode: impl Into<String>,
        author_name: impl Into<String>,
        author_email: impl Into<String>,
        forge: Arc<dyn RemoteForge>,
        usage: SharedUsageRecorder,
    ) -> Self {
        Coder {
            llm,
            repo_root: repo_root.into(),
            git_mode: git_mode.into(),
            author_name: author_name.into(),
            author_email: author_email.into(),
            forge,
            usage,
        }
    }

    async fn generate_files(
        &self,
        task_id: Uuid,
        prompt_context: &str,
        rework_notes: Option<&str>,
    ) -> Result<HashMap<String, String>, AgentError> {
        let mut system = String::from(
            "You are a coding agent. Given an architecture, respond with JSON: \
             {\"files\": {\"path\": \"contents\", ...}}",
        );
        if let Some(notes) = rework_notes {
            system.push_str(&format!("\n\nPrevious test run failed. Findings: {notes}"));
        }
        let messages = vec![ChatMessage::system(system), ChatMessage::user(prompt_context)];
        let completion = self.llm.complete(&messages).await.map_err(|e| AgentError::Llm(e.to_string()))?;
        self.usage.record_usage(task_id, self.name(), &completion).await;
        let parsed: FileTreeResponse = serde_json::from_str(&completion.text)
            .map_err(|e| AgentError::Validation(format!("coder output not valid JSON: {e}")))?;
        if parsed.files.is_empty() {
            return Err(AgentError::Validation("coder produced an empty file tree".into()));
        }
        Ok(parsed.files)
    }
}

#[async_trait]
impl Agent for Coder {
    fn name(&self) -> &'static str {
        "coder"
    }

    async fn handle_event(&self, envelope: &Envelope) -> Result<Envelope, AgentError> {
        let project_id = envelope
            .payload
            .get("project_id")
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string();

        let rework_notes = if envelope.event_type.0 == event_types::TEST_RESULTS {
            envelope.payload.get("findings").and_then(|v| v.as_str()).map(str::to_string)
        } else {
            None
        };

        let context = serde_json::to_string(&envelope.payload)
            .map_err(|e| AgentError::Validation(e.to_string()))?;
        let files = self.generate_files(envelope.task_id, &context, rework_notes.as_deref()).await?;

        let branch = format!("feature/task-{}", envelope.task_id);
        let repo_path = format!("{}/{}", self.repo_root, project_id);
        let git = Git::new(repo_path.clone(), self.author_name.clone(), self.author_email.clone());
        git.init_repo().map_err(|e| AgentError::Tool(e.to_string()))?;
        git.create_branch(&branch).map_err(|e| AgentError::Tool(e.to_string()))?;

        let message = if rework_notes.is_some() {
            "fix: address test failures"
        } else {
            "feat: initial generated implementation"
        };
        let commit_sha = git
            .commit_files(&files, message, self.name())
            .map_err(|e| AgentError::Tool(e.to_string()))?;

        let publish = publish_remote(
            &git,
            self.forge.as_ref(),
            &self.git_mode,
            &project_id,
            &branch,
            message,
            "Generated by the coder agent.",
        )
        .await;

        let payload = serde_json::json!({
            "project_id": project_id.clone(),
            "branch": branch.clone(),
            "commit": commit_sha.clone(),
            "pr_url": publish.pr_url,
            "remote_skip_reason": publish.skip_reason,
        });

        let mut out = Envelope::new(
            envelope.trace_id,
            envelope.task_id,
            self.name(),
            event_types::CODE_PR_OPENED,
            payload,
        )
        .with_repo(project_id, branch);
        if let Some(sha) = commit_sha {
            out = out.with_commit(sha);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use catalyst_core::agent::{LlmClient, LlmCompletion};
    use catalyst_core::git::NoRemoteForge;
    use uuid::Uuid;

    struct StubLlm(&'static str);

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<LlmCompletion, AgentError> {
            Ok(LlmCompletion { text: self.0.to_string(), model: "stub".into(), input_tokens: 1, output_tokens: 1 })
        }
    }

    fn architecture_proposed(project_id: &str) -> Envelope {
        Envelope::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "architect",
            event_types::ARCHITECTURE_PROPOSED,
            serde_json::json!({"project_id": project_id, "tech_stack": ["rust"], "data_model": ["User"]}),
        )
    }

    fn null_usage() -> catalyst_core::agent::SharedUsageRecorder {
        std::sync::Arc::new(catalyst_core::agent::NullUsageRecorder)
    }

    #[tokio::test]
    async fn commits_generated_files_and_opens_code_pr_opened_event() {
        let dir = tempfile::tempdir().unwrap();
        let coder = Coder::new(
            std::sync::Arc::new(StubLlm(r#"{"files":{"src/main.rs":"fn main(){}"}}"#)),
            dir.path().to_string_lossy().to_string(),
            "local",
            "catalyst-agent",
            "agent@catalyst.local",
            std::sync::Arc::new(NoRemoteForge),
            null_usage(),
        );
        let out = coder.handle_event(&architecture_proposed("proj-a")).await.unwrap();
        assert_eq!(out.event_type.0, event_types::CODE_PR_OPENED);
        assert!(out.commit.is_some());
    }

    #[tokio::test]
    async fn empty_file_tree_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let coder = Coder::new(
            std::sync::Arc::new(StubLlm(r#"{"files":{}}"#)),
            dir.path().to_string_lossy().to_string(),
            "local",
            "catalyst-agent",
            "agent@catalyst.local",
            std::sync::Arc::new(NoRemoteForge),
            null_usage(),
        );
        let err = coder.handle_event(&architecture_proposed("proj-b")).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}
