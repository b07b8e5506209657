use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{Message, StreamChunk, ToolDefinition};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_TOOL_NAME_LEN: usize = 64;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Everything the model sees for one generation step.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub system_prompt: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolDefinition],
}

/// The inference seam. The step loop only ever talks to this trait.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model(&self) -> &str;

    /// Starts one generation. Errors here, and errors yielded by the stream,
    /// are transport failures.
    async fn stream(&self, request: ModelRequest<'_>) -> Result<ChunkStream>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model must not be empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::InvalidInput(format!("build http client: {e}")))?;
        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
        })
    }

    /// Points the client at any OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn stream(&self, request: ModelRequest<'_>) -> Result<ChunkStream> {
        let c = OpenAiClient::new(
            self.client.clone(),
            &self.base_url,
            &self.api_key,
            &self.model,
        );
        c.chat_stream(request).await
    }
}

/// Tool names must satisfy `^[a-zA-Z0-9_-]{1,64}$`, the strictest rule among
/// the providers we target.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LlmError::InvalidInput("tool name must not be empty".to_string()));
    }
    if name.len() > MAX_TOOL_NAME_LEN {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} exceeds {MAX_TOOL_NAME_LEN} characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_follow_provider_rules() {
        validate_tool_name("createCalendarEvent").expect("camel case is valid");
        validate_tool_name("list_events-v2").expect("underscore and dash are valid");

        let err = validate_tool_name("calendar.create").expect_err("dot is invalid");
        assert!(err.to_string().contains("invalid character"));
        assert!(validate_tool_name("").is_err());
        assert!(validate_tool_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn base_url_is_normalized() {
        let client = LlmClient::new("k", "gpt-4o-mini", Duration::from_secs(5))
            .expect("client builds")
            .with_base_url("http://localhost:11434/v1/");
        assert_eq!(client.base_url(), "http://localhost:11434/v1");
        assert_eq!(client.model(), "gpt-4o-mini");
    }

    #[test]
    fn empty_model_is_rejected() {
        assert!(LlmClient::new("k", "  ", Duration::from_secs(5)).is_err());
    }
}
