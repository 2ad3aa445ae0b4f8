//! Decision Source: the external chooser of the next action.
//!
//! The loop treats whatever comes back as untrusted raw JSON; only the
//! Action Schema turns it into a typed value. Transport failures are the
//! single fatal condition here — malformed content is deliberately *not* an
//! error, it flows to the validator so the loop's bounded
//! invalid-action policy governs it.

use std::fmt;
use std::sync::Arc;

use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs, ResponseFormat,
};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::PilotConfig;
use crate::index::Snapshot;
use crate::llm::{ChatCompletionProvider, LlmError, OpenAiChatProvider};
use crate::logging::PilotLogger;
use crate::prompts;
use crate::schema::ActionRegistry;

/// Everything the decision source sees for one step.
pub struct DecisionContext<'a> {
    pub goal: &'a str,
    pub snapshot: &'a Snapshot,
    pub history_rendered: &'a str,
    /// Validation error from the immediately preceding step, fed back so
    /// the source can correct itself.
    pub last_validation_error: Option<&'a str>,
}

/// Loop-fatal failures of the decision source.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("decision source unavailable: {0}")]
    Unavailable(String),
    #[error("failed to build decision request: {0}")]
    InvalidRequest(String),
}

/// Callback invoked with (prompt_tokens, completion_tokens) after each
/// successful completion.
pub type UsageCallback = Arc<dyn Fn(u64, u64) + Send + Sync + 'static>;

/// Chooses the next action given the goal, the page surface, and history.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    async fn next_action(&self, ctx: DecisionContext<'_>) -> Result<Value, DecisionError>;
}

/// LLM-backed decision source over the provider seam.
pub struct LlmDecisionSource<P: ChatCompletionProvider> {
    provider: P,
    model: String,
    registry: ActionRegistry,
    reconnect_budget: u32,
    usage_callback: Option<UsageCallback>,
    logger: PilotLogger,
}

impl<P> fmt::Debug for LlmDecisionSource<P>
where
    P: ChatCompletionProvider,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmDecisionSource")
            .field("model", &self.model)
            .field("reconnect_budget", &self.reconnect_budget)
            .field("usage_callback", &self.usage_callback.is_some())
            .finish_non_exhaustive()
    }
}

impl LlmDecisionSource<OpenAiChatProvider> {
    /// Wire the shipped OpenAI-compatible provider from configuration.
    pub fn from_config(
        config: &PilotConfig,
        registry: ActionRegistry,
        logger: PilotLogger,
    ) -> Result<Self, LlmError> {
        let provider = OpenAiChatProvider::from_config(config)?;
        Ok(Self::new(provider, config, registry, logger))
    }
}

impl<P: ChatCompletionProvider> LlmDecisionSource<P> {
    pub fn new(
        provider: P,
        config: &PilotConfig,
        registry: ActionRegistry,
        logger: PilotLogger,
    ) -> Self {
        Self {
            provider,
            model: config.model_name.clone(),
            registry,
            reconnect_budget: config.decision_reconnect_budget,
            usage_callback: None,
            logger,
        }
    }

    pub fn with_usage_callback(mut self, callback: Option<UsageCallback>) -> Self {
        self.usage_callback = callback;
        self
    }

    fn build_messages(
        &self,
        ctx: &DecisionContext<'_>,
    ) -> Result<Vec<ChatCompletionRequestMessage>, DecisionError> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(ChatCompletionRequestSystemMessageContent::Text(
                prompts::build_system_prompt(&self.registry.kinds()),
            ))
            .build()
            .map_err(|err| DecisionError::InvalidRequest(err.to_string()))?;

        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Text(
                prompts::build_step_message(
                    ctx.goal,
                    &ctx.snapshot.page_url,
                    &ctx.snapshot.render_listing(),
                    ctx.history_rendered,
                    ctx.last_validation_error,
                ),
            ))
            .build()
            .map_err(|err| DecisionError::InvalidRequest(err.to_string()))?;

        Ok(vec![
            ChatCompletionRequestMessage::System(system),
            ChatCompletionRequestMessage::User(user),
        ])
    }
}

#[async_trait]
impl<P: ChatCompletionProvider> DecisionSource for LlmDecisionSource<P> {
    async fn next_action(&self, ctx: DecisionContext<'_>) -> Result<Value, DecisionError> {
        let messages = self.build_messages(&ctx)?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .messages(messages)
            .response_format(ResponseFormat::JsonObject)
            .build()
            .map_err(|err| DecisionError::InvalidRequest(err.to_string()))?;

        let mut last_error = String::new();
        for attempt in 0..=self.reconnect_budget {
            match self.provider.create_chat_completion(request.clone()).await {
                Ok(response) => {
                    if let (Some(callback), Some(usage)) =
                        (self.usage_callback.as_ref(), response.usage.as_ref())
                    {
                        callback(
                            u64::from(usage.prompt_tokens),
                            u64::from(usage.completion_tokens),
                        );
                    }

                    let content = response
                        .choices
                        .first()
                        .and_then(|choice| choice.message.content.clone())
                        .unwrap_or_default();

                    self.logger.debug(
                        "decision source response",
                        Some("decision"),
                        Some(serde_json::json!({ "content": content })),
                    );

                    // Non-JSON content is returned as a bare string so the
                    // schema rejects it through the normal validation path.
                    return Ok(serde_json::from_str(&content)
                        .unwrap_or_else(|_| Value::String(content)));
                }
                Err(err) => {
                    last_error = err.to_string();
                    self.logger.error(
                        format!(
                            "decision request failed (attempt {} of {}): {last_error}",
                            attempt + 1,
                            self.reconnect_budget + 1
                        ),
                        Some("decision"),
                        None,
                    );
                }
            }
        }

        Err(DecisionError::Unavailable(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Verbosity;
    use async_openai::error::{ApiError, OpenAIError};
    use async_openai::types::{CreateChatCompletionRequest, CreateChatCompletionResponse};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedProvider {
        responses: Mutex<Vec<Result<CreateChatCompletionResponse, OpenAIError>>>,
        requests: Mutex<Vec<CreateChatCompletionRequest>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<CreateChatCompletionResponse, OpenAIError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatCompletionProvider for ScriptedProvider {
        async fn create_chat_completion(
            &self,
            request: CreateChatCompletionRequest,
        ) -> Result<CreateChatCompletionResponse, OpenAIError> {
            self.requests.lock().unwrap().push(request);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(api_error("no response scripted"));
            }
            responses.remove(0)
        }
    }

    fn api_error(message: &str) -> OpenAIError {
        OpenAIError::ApiError(ApiError {
            message: message.to_string(),
            r#type: None,
            param: None,
            code: None,
        })
    }

    fn completion(content: &str) -> CreateChatCompletionResponse {
        serde_json::from_value(json!({
            "id": "cmpl-test",
            "object": "chat.completion",
            "created": 0,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "finish_reason": "stop",
                "message": { "role": "assistant", "content": content },
                "logprobs": null
            }],
            "usage": {
                "prompt_tokens": 120,
                "completion_tokens": 18,
                "total_tokens": 138
            },
            "system_fingerprint": null
        }))
        .unwrap()
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            generation: 1,
            elements: Vec::new(),
            captured_at: Utc::now(),
            page_url: "https://example.com".to_string(),
        }
    }

    fn source(provider: ScriptedProvider) -> LlmDecisionSource<ScriptedProvider> {
        LlmDecisionSource::new(
            provider,
            &PilotConfig::default(),
            ActionRegistry::new(),
            PilotLogger::new(Verbosity::Minimal),
        )
    }

    fn ctx(snapshot: &Snapshot) -> DecisionContext<'_> {
        DecisionContext {
            goal: "click submit",
            snapshot,
            history_rendered: "(no steps taken yet)",
            last_validation_error: None,
        }
    }

    #[tokio::test]
    async fn returns_parsed_json_payload() {
        let provider = ScriptedProvider::new(vec![Ok(completion(
            r#"{"kind": "click-element", "element_index": 3}"#,
        ))]);
        let source = source(provider);
        let snapshot = snapshot();

        let value = source.next_action(ctx(&snapshot)).await.expect("decision");
        assert_eq!(value["kind"], "click-element");
        assert_eq!(value["element_index"], 3);
    }

    #[tokio::test]
    async fn non_json_content_is_passed_through_for_validation() {
        let provider = ScriptedProvider::new(vec![Ok(completion("click the blue button"))]);
        let source = source(provider);
        let snapshot = snapshot();

        let value = source.next_action(ctx(&snapshot)).await.expect("decision");
        assert_eq!(value, Value::String("click the blue button".to_string()));
    }

    #[tokio::test]
    async fn retries_within_reconnect_budget() {
        let provider = ScriptedProvider::new(vec![
            Err(api_error("connection reset")),
            Ok(completion(r#"{"kind": "wait", "milliseconds": 100}"#)),
        ]);
        let source = source(provider);
        let snapshot = snapshot();

        let value = source.next_action(ctx(&snapshot)).await.expect("decision");
        assert_eq!(value["kind"], "wait");
    }

    #[tokio::test]
    async fn exhausted_budget_is_unavailable() {
        let provider = ScriptedProvider::new(vec![
            Err(api_error("down")),
            Err(api_error("down")),
            Err(api_error("still down")),
        ]);
        let source = source(provider);
        let snapshot = snapshot();

        match source.next_action(ctx(&snapshot)).await {
            Err(DecisionError::Unavailable(message)) => {
                assert!(message.contains("still down"));
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn usage_callback_receives_token_counts() {
        let provider = ScriptedProvider::new(vec![Ok(completion(
            r#"{"kind": "done", "message": "finished"}"#,
        ))]);
        let counts = Arc::new(Mutex::new((0u64, 0u64)));
        let sink = Arc::clone(&counts);
        let source = source(provider).with_usage_callback(Some(Arc::new(move |p, c| {
            let mut guard = sink.lock().unwrap();
            guard.0 += p;
            guard.1 += c;
        })));
        let snapshot = snapshot();

        source.next_action(ctx(&snapshot)).await.expect("decision");
        assert_eq!(*counts.lock().unwrap(), (120, 18));
    }
}
