//! Browser session collaborator interface.
//!
//! The loop never touches a browser API directly: everything goes through
//! [`BrowserSession`], which a runtime (see [`crate::runtime`]) implements
//! over a real CDP connection and tests implement with scripted fakes. The
//! module also owns the planning step that turns configuration into a
//! strongly-typed launch/attach decision, so the runtime only ever sees an
//! unambiguous [`SessionPlan`].

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::PilotConfig;

/// Classified failure from the driver layer.
///
/// The executor translates these into the action-result error taxonomy; the
/// kinds here describe what the driver knows, not what the loop decides to
/// do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    /// The session is gone or was never established.
    SessionUnavailable,
    /// The target element exists but refused the interaction.
    NotInteractable,
    /// The target element could not be located in the live document.
    TargetMissing,
    /// A navigation did not complete.
    NavigationFailed,
    /// Script evaluation inside the page failed.
    EvaluationFailed,
    /// Anything the driver could not classify.
    Other,
}

/// Error surfaced by every [`BrowserSession`] operation.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("driver error ({kind:?}): {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn session_unavailable(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::SessionUnavailable, message)
    }
}

/// How an element is addressed inside the live page.
///
/// Locators come out of the element-index walker (absolute XPath within the
/// element's frame) and are only meaningful for the page state they were
/// captured from; staleness is policed by the index, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum Locator {
    #[serde(rename = "xpath")]
    XPath(String),
    Css(String),
}

/// Viewport dimensions for local launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport {
            width: 1280,
            height: 800,
        }
    }
}

/// Resolved decision about how the browser is obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPlan {
    /// Attach to an already-running browser over CDP. The URL may be a
    /// direct `ws://` endpoint or an `http(s)://` debugging address whose
    /// websocket URL still needs discovery.
    AttachCdp { url: String },
    /// Launch a local browser process.
    LaunchLocal {
        chrome_executable: Option<PathBuf>,
        headless: bool,
        viewport: Viewport,
        args: Vec<String>,
        user_data_dir: Option<PathBuf>,
    },
}

impl SessionPlan {
    /// Derive the plan from configuration: an explicit CDP URL wins,
    /// otherwise a local launch is assembled from the browser settings.
    pub fn from_config(config: &PilotConfig) -> Self {
        match &config.cdp_url {
            Some(url) => SessionPlan::AttachCdp { url: url.clone() },
            None => SessionPlan::LaunchLocal {
                chrome_executable: config.chrome_executable.clone(),
                headless: config.headless,
                viewport: config.viewport,
                args: config.browser_args.clone(),
                user_data_dir: config.user_data_dir.clone(),
            },
        }
    }
}

/// The operations the agent loop needs from a live browser page.
///
/// One session maps to one page; multi-tab orchestration is out of scope.
/// Every method may fail with a [`DriverError`], and implementations are
/// expected to report failures rather than block indefinitely.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigate the page and wait for the load to settle.
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// Click the element addressed by `locator`.
    async fn click(&self, locator: &Locator) -> Result<(), DriverError>;

    /// Focus the element and type `text` into it, optionally submitting
    /// with Enter afterwards.
    async fn type_text(
        &self,
        locator: &Locator,
        text: &str,
        press_enter: bool,
    ) -> Result<(), DriverError>;

    /// Scroll the page vertically by `delta_y` CSS pixels (negative is up).
    async fn scroll(&self, delta_y: i64) -> Result<(), DriverError>;

    /// Extract visible text from the element, or from the whole page when
    /// no locator is given.
    async fn extract_text(&self, locator: Option<&Locator>) -> Result<String, DriverError>;

    /// Evaluate a script in page context and return its JSON result. Used
    /// by the element index to run the embedded walker.
    async fn evaluate(&self, script: &str) -> Result<Value, DriverError>;

    /// Current page URL.
    async fn current_url(&self) -> Result<String, DriverError>;

    /// Tear the session down. Idempotent; the loop calls this on every
    /// exit path.
    async fn close(&self) -> Result<(), DriverError>;
}

#[async_trait]
impl<S: BrowserSession + ?Sized> BrowserSession for std::sync::Arc<S> {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        (**self).navigate(url).await
    }

    async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
        (**self).click(locator).await
    }

    async fn type_text(
        &self,
        locator: &Locator,
        text: &str,
        press_enter: bool,
    ) -> Result<(), DriverError> {
        (**self).type_text(locator, text, press_enter).await
    }

    async fn scroll(&self, delta_y: i64) -> Result<(), DriverError> {
        (**self).scroll(delta_y).await
    }

    async fn extract_text(&self, locator: Option<&Locator>) -> Result<String, DriverError> {
        (**self).extract_text(locator).await
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        (**self).evaluate(script).await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        (**self).current_url().await
    }

    async fn close(&self) -> Result<(), DriverError> {
        (**self).close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_prefers_cdp_url() {
        let mut config = PilotConfig::default();
        config.cdp_url = Some("ws://127.0.0.1:9222/devtools/browser/abc".to_string());
        config.chrome_executable = Some(PathBuf::from("/usr/bin/chromium"));

        match SessionPlan::from_config(&config) {
            SessionPlan::AttachCdp { url } => {
                assert!(url.starts_with("ws://127.0.0.1:9222"));
            }
            other => panic!("expected AttachCdp, got {other:?}"),
        }
    }

    #[test]
    fn plan_falls_back_to_local_launch() {
        let mut config = PilotConfig::default();
        config.headless = false;
        config.browser_args = vec!["--disable-gpu".to_string()];

        match SessionPlan::from_config(&config) {
            SessionPlan::LaunchLocal {
                headless,
                args,
                viewport,
                ..
            } => {
                assert!(!headless);
                assert_eq!(args, vec!["--disable-gpu".to_string()]);
                assert_eq!(viewport, Viewport::default());
            }
            other => panic!("expected LaunchLocal, got {other:?}"),
        }
    }

    #[test]
    fn locator_serializes_with_tag() {
        let locator = Locator::XPath("/html/body/button[1]".to_string());
        let json = serde_json::to_value(&locator).unwrap();
        assert_eq!(json["by"], "xpath");
        assert_eq!(json["value"], "/html/body/button[1]");
    }
}
