mod client;
pub(crate) mod types;

use std::time::Duration;

use client::{OpenAiClient, OPENAI_API_URL};
use types::{ChatRequest, WireMessage};

use crate::error::{AiError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// OpenAI (or any OpenAI-compatible provider) for chat and embeddings.
#[derive(Clone)]
pub struct OpenAi {
    api_key: String,
    model: String,
    embedding_model: String,
    base_url: Option<String>,
    timeout: Duration,
}

impl OpenAi {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            embedding_model: "text-embedding-3-small".to_string(),
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AiError::Config("OPENAI_API_KEY environment variable not set".to_string()))?;
        Ok(Self::new(api_key, model))
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    fn client(&self) -> Result<OpenAiClient> {
        OpenAiClient::new(
            &self.api_key,
            self.base_url.as_deref().unwrap_or(OPENAI_API_URL),
            self.timeout,
        )
    }

    /// Single-turn chat completion. Returns the assistant's text.
    pub async fn chat_completion(
        &self,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<String> {
        let request = ChatRequest::new(&self.model)
            .message(WireMessage::system(system))
            .message(WireMessage::user(user))
            .token_limit(1024);

        let response = self.client()?.chat(&request).await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AiError::EmptyResponse("no choices in chat response".to_string()))
    }

    /// Embed one text with the configured embedding model.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.client()?
            .embed(&self.embedding_model, &[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AiError::EmptyResponse("no embedding in response".to_string()))
    }

    /// Embed many texts in one request, preserving input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        self.client()?.embed(&self.embedding_model, &refs).await
    }
}
