//! Chat-completion plumbing for the decision source.
//!
//! The loop only ever sees the [`ChatCompletionProvider`] trait, so tests
//! script completions without HTTP and alternate backends slot in without
//! touching the loop. The shipped implementation rides `async-openai`.

pub mod error;
pub mod openai;
pub mod provider;

pub use error::LlmError;
pub use openai::OpenAiChatProvider;
pub use provider::ChatCompletionProvider;
