use thiserror::Error;

use async_openai::error::OpenAIError;

/// Errors surfaced by the chat-completion layer.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing model API key; set MODEL_API_KEY or OPENAI_API_KEY")]
    MissingApiKey,
    #[error("invalid chat completion request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    OpenAi(#[from] OpenAIError),
}
