//! Action Executor: applies a validated action to the live session.
//!
//! The executor is deliberately infallible at the type level. Stale
//! indices, missing elements, driver refusals, and timeouts are all
//! expected operating conditions of a mutating page, so each one becomes a
//! failure-outcome [`ActionResult`] for the loop to reason about — never an
//! `Err` that would tear the run down.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;

use crate::config::PilotConfig;
use crate::index::{ElementIndex, ResolveError, Snapshot};
use crate::logging::PilotLogger;
use crate::schema::ActionRequest;
use crate::session::{BrowserSession, DriverError, DriverErrorKind, Locator};

/// Did the action take effect?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Why an action failed, in loop vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorKind {
    StaleElement,
    ElementNotFound,
    ElementNotInteractable,
    Timeout,
    NavigationFailed,
    /// The decision payload never validated; recorded by the loop, not
    /// produced by execution.
    InvalidAction,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome record for one executed (or rejected) action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    pub is_done: bool,
}

impl ActionResult {
    pub fn success() -> Self {
        Self {
            outcome: Outcome::Success,
            extracted_content: None,
            error: None,
            is_done: false,
        }
    }

    pub fn success_with_content(content: impl Into<String>) -> Self {
        Self {
            extracted_content: Some(content.into()),
            ..Self::success()
        }
    }

    /// Terminal result produced by the reserved `done` action.
    pub fn done(message: impl Into<String>, success: bool) -> Self {
        Self {
            outcome: if success {
                Outcome::Success
            } else {
                Outcome::Failure
            },
            extracted_content: Some(message.into()),
            error: None,
            is_done: true,
        }
    }

    pub fn failure(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            extracted_content: None,
            error: Some(ActionError::new(kind, message)),
            is_done: false,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == Outcome::Failure
    }
}

fn driver_failure(err: DriverError) -> ActionResult {
    let kind = match err.kind {
        DriverErrorKind::NavigationFailed => ActionErrorKind::NavigationFailed,
        DriverErrorKind::NotInteractable => ActionErrorKind::ElementNotInteractable,
        DriverErrorKind::TargetMissing => ActionErrorKind::ElementNotFound,
        DriverErrorKind::SessionUnavailable
        | DriverErrorKind::EvaluationFailed
        | DriverErrorKind::Other => ActionErrorKind::Unknown,
    };
    ActionResult::failure(kind, err.message)
}

fn resolve_failure(err: ResolveError) -> ActionResult {
    match err {
        ResolveError::Stale { .. } => {
            ActionResult::failure(ActionErrorKind::StaleElement, err.to_string())
        }
        ResolveError::NotFound { .. } => {
            ActionResult::failure(ActionErrorKind::ElementNotFound, err.to_string())
        }
    }
}

/// Executes validated actions with per-action timeout enforcement.
pub struct ActionExecutor {
    action_timeout: Duration,
    max_wait: Duration,
    logger: PilotLogger,
}

impl ActionExecutor {
    pub fn new(config: &PilotConfig, logger: PilotLogger) -> Self {
        Self {
            action_timeout: Duration::from_millis(config.action_timeout_ms),
            max_wait: Duration::from_millis(config.max_wait_ms),
            logger,
        }
    }

    /// Bound a driver call by the per-action timeout and fold both failure
    /// layers into a result.
    async fn bounded<F>(&self, what: &str, call: F) -> ActionResult
    where
        F: Future<Output = Result<(), DriverError>>,
    {
        match timeout(self.action_timeout, call).await {
            Ok(Ok(())) => ActionResult::success(),
            Ok(Err(err)) => driver_failure(err),
            Err(_) => ActionResult::failure(
                ActionErrorKind::Timeout,
                format!("{what} did not complete within {:?}", self.action_timeout),
            ),
        }
    }

    /// Apply `action` against the session, resolving element targets
    /// through the index under the snapshot's generation.
    pub async fn execute(
        &self,
        action: &ActionRequest,
        snapshot: &Snapshot,
        index: &ElementIndex,
        session: &dyn BrowserSession,
    ) -> ActionResult {
        let result = match action {
            ActionRequest::Navigate(navigate) => {
                self.bounded("navigation", session.navigate(&navigate.url))
                    .await
            }
            ActionRequest::ClickElement(click) => {
                match index.resolve(click.element_index, snapshot.generation) {
                    Ok(element) => {
                        let locator = element.locator();
                        self.bounded("click", session.click(&locator)).await
                    }
                    Err(err) => resolve_failure(err),
                }
            }
            ActionRequest::TypeText(type_text) => {
                match index.resolve(type_text.element_index, snapshot.generation) {
                    Ok(element) => {
                        let locator = element.locator();
                        self.bounded(
                            "typing",
                            session.type_text(
                                &locator,
                                &type_text.text,
                                type_text.press_enter_after.unwrap_or(false),
                            ),
                        )
                        .await
                    }
                    Err(err) => resolve_failure(err),
                }
            }
            ActionRequest::Scroll(scroll) => {
                self.bounded("scroll", session.scroll(scroll.delta_y)).await
            }
            ActionRequest::ExtractContent(extract) => {
                let locator = match extract.element_index {
                    Some(element_index) => {
                        match index.resolve(element_index, snapshot.generation) {
                            Ok(element) => Some(element.locator()),
                            Err(err) => return resolve_failure(err),
                        }
                    }
                    None => None,
                };
                match timeout(self.action_timeout, session.extract_text(locator.as_ref())).await
                {
                    Ok(Ok(content)) => ActionResult::success_with_content(content),
                    Ok(Err(err)) => driver_failure(err),
                    Err(_) => ActionResult::failure(
                        ActionErrorKind::Timeout,
                        format!(
                            "extraction did not complete within {:?}",
                            self.action_timeout
                        ),
                    ),
                }
            }
            ActionRequest::Wait(wait) => {
                let requested = Duration::from_millis(wait.milliseconds);
                let bounded = requested.min(self.max_wait);
                tokio::time::sleep(bounded).await;
                ActionResult::success()
            }
            ActionRequest::Done(done) => {
                ActionResult::done(done.message.clone(), done.success.unwrap_or(true))
            }
        };

        self.logger.debug(
            format!("executed {}", action.kind()),
            Some("executor"),
            Some(json!({
                "outcome": result.outcome,
                "error": result.error.as_ref().map(|e| e.kind),
            })),
        );

        result
    }
}
