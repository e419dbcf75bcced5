//! OpenAI adapter for the `Generator` port.
//!
//! Uses the `chat/completions` endpoint, so any OpenAI-compatible server works
//! by pointing `base_url` at it.

use async_trait::async_trait;
use herald_core::{
    generation::{port::Generator, types::GenerationRequest},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

const MAX_TOKENS: u32 = 200;

#[derive(Clone, Debug)]
pub struct OpenAiGenerator {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    http: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
            http,
        })
    }

    fn body<'a>(&'a self, req: &'a GenerationRequest) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(req.messages.len() + 1);
        if let Some(system) = &req.system {
            messages.push(WireMessage {
                role: "system",
                content: system,
            });
        }
        messages.extend(req.messages.iter().map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));
        ChatRequest {
            model: &self.model,
            messages,
            max_tokens: MAX_TOKENS,
        }
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(&self, req: GenerationRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&self.body(&req))
            .send()
            .await
            .map_err(|e| Error::Generation(format!("openai request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Generation(format!(
                "openai completion failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: ChatResponse = resp
            .json()
            .await
            .map_err(|e| Error::Generation(format!("openai json error: {e}")))?;
        let text = v.first_text().ok_or_else(|| {
            Error::Generation("openai completion returned no text".to_string())
        })?;
        debug!(model = %self.model, chars = text.chars().count(), "completion");
        Ok(text)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl ChatResponse {
    fn first_text(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
    }
}
