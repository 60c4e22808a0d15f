//! One concrete `LlmClient` implementation over HTTP via `reqwest`.
//! Every agent reaches its model only through the `LlmClient` trait
//! boundary, so swapping transports never touches agent code.

use crate::agent::{LlmClient, LlmCompletion};
use crate::error::AgentError;
use crate::types::ChatMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub struct HttpLlmClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        HttpLlmClient {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct CompletionResponse {
    text: String,
    #[serde(default)]
    input_tokens: i32,
    #[serde(default)]
    output_tokens: i32,
}

/// Flat per-1k-token USD rate (C16's usage ledger). A placeholder until
/// per-model pricing is configured; keeps the ledger meaningful rather
/// than recording every row at zero.
const INPUT_RATE_PER_1K_USD: f64 = 0.003;
const OUTPUT_RATE_PER_1K_USD: f64 = 0.015;

pub fn estimate_cost_usd(input_tokens: i32, output_tokens: i32) -> f64 {
    (input_tokens as f64 / 1000.0) * INPUT_RATE_PER_1K_USD
        + (output_tokens as f64 / 1000.0) * OUTPUT_RATE_PER_1K_USD
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<LlmCompletion, AgentError> {
        debug!(model = %self.model, message_count = messages.len(), "calling llm client");
        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&CompletionRequest { model: &self.model, messages })
            .send()
            .await
            .map_err(|e| AgentError::Llm(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, body, "llm client returned error status");
            return Err(AgentError::Llm(format!("status {status}: {body}")));
        }

        let parsed: CompletionResponse =
            resp.json().await.map_err(|e| AgentError::Llm(e.to_string()))?;

        Ok(LlmCompletion {
            text: parsed.text,
            model: self.model.clone(),
            input_tokens: parsed.input_tokens,
            output_tokens: parsed.output_tokens,
        })
    }
}
