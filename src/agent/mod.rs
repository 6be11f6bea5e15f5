//! Reasoning collaborator
//!
//! Sends the transcript plus session history to an OpenAI-compatible chat
//! completions endpoint. The same client serves `OpenAI` and `OpenRouter`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::pipeline::{Provider, Reply, Responder, Role, SessionContext, TokenUsage};
use crate::{Error, Result};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Chat completions responder
pub struct ChatResponder {
    client: Client,
    name: &'static str,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    system_prompt: String,
}

impl std::fmt::Debug for ChatResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatResponder")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl ChatResponder {
    /// Responder backed by `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(api_key: String, model: String) -> Result<Self> {
        Self::build("openai", OPENAI_BASE_URL, api_key, model)
    }

    /// Responder backed by `OpenRouter`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openrouter(api_key: String, model: String) -> Result<Self> {
        Self::build("openrouter", OPENROUTER_BASE_URL, api_key, model)
    }

    fn build(name: &'static str, base_url: &str, api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(format!("{name} API key required for reasoning")));
        }

        Ok(Self {
            client: Client::new(),
            name,
            base_url: base_url.to_string(),
            api_key,
            model,
            max_tokens: 512,
            system_prompt: String::new(),
        })
    }

    /// Set the completion token cap
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Point requests at a different API root (proxies, tests)
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_messages<'a>(&'a self, transcript: &'a str, context: &'a SessionContext) -> Vec<Message<'a>> {
        let mut messages = Vec::with_capacity(context.history.len() + 2);

        if !self.system_prompt.is_empty() {
            messages.push(Message {
                role: "system",
                content: &self.system_prompt,
            });
        }

        for turn in &context.history {
            messages.push(Message {
                role: match turn.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: &turn.content,
            });
        }

        messages.push(Message {
            role: "user",
            content: transcript,
        });

        messages
    }
}

impl Provider for ChatResponder {
    fn name(&self) -> &str {
        self.name
    }
}

#[async_trait]
impl Responder for ChatResponder {
    async fn respond(&self, transcript: &str, context: &SessionContext) -> Result<Reply> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: self.build_messages(transcript, context),
            max_tokens: Some(self.max_tokens),
        };

        tracing::debug!(
            provider = self.name,
            session_id = %context.session_id,
            history = context.history.len(),
            "requesting completion"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("{} request failed: {e}", self.name)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Agent(format!("{} API error: {status} - {body}", self.name)));
        }

        let result: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("failed to parse {} response: {e}", self.name)))?;

        let text = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Agent(format!("{} returned an empty completion", self.name)))?;

        let usage = result.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        });

        Ok(Reply { text, usage })
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
