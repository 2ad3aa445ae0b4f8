//! Shared fakes for unit tests: a scripted [`BrowserSession`] over a fixed
//! candidate list, plus builders for walker records.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::index::{BoundingBox, RawCandidate};
use crate::session::{BrowserSession, DriverError, DriverErrorKind, Locator};

/// Build a visible, natively-interactive walker record.
pub fn candidate(tag: &str, xpath: &str, text: Option<&str>) -> RawCandidate {
    RawCandidate {
        tag: tag.to_string(),
        attributes: HashMap::new(),
        text: text.map(|t| t.to_string()),
        frame_id: None,
        xpath: xpath.to_string(),
        bounding_box: BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 120.0,
            height: 24.0,
        },
        in_viewport: true,
        displayed: true,
        native_interactive: true,
        disabled: false,
        role: None,
        tabindex: None,
        has_click_handler: false,
        pointer_cursor: false,
        editable: false,
    }
}

/// What a [`StaticPageSession`] saw, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCall {
    Navigate(String),
    Click(Locator),
    TypeText(Locator, String, bool),
    Scroll(i64),
    ExtractText(Option<Locator>),
    Close,
}

/// Scripted session that serves a fixed candidate list to the walker and
/// records every interaction.
pub struct StaticPageSession {
    url: Mutex<String>,
    candidates: Mutex<Vec<RawCandidate>>,
    pub calls: Mutex<Vec<SessionCall>>,
    pub extract_result: Mutex<String>,
    pub fail_next_click: Mutex<Option<DriverError>>,
    pub fail_evaluate: Mutex<bool>,
}

impl StaticPageSession {
    pub fn new(url: &str, candidates: Vec<RawCandidate>) -> Self {
        Self {
            url: Mutex::new(url.to_string()),
            candidates: Mutex::new(candidates),
            calls: Mutex::new(Vec::new()),
            extract_result: Mutex::new("page text".to_string()),
            fail_next_click: Mutex::new(None),
            fail_evaluate: Mutex::new(false),
        }
    }

    pub fn set_candidates(&self, candidates: Vec<RawCandidate>) {
        *self.candidates.lock().unwrap() = candidates;
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, SessionCall::Close))
            .count()
    }
}

#[async_trait]
impl BrowserSession for StaticPageSession {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.calls
            .lock()
            .unwrap()
            .push(SessionCall::Navigate(url.to_string()));
        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
        self.calls
            .lock()
            .unwrap()
            .push(SessionCall::Click(locator.clone()));
        if let Some(err) = self.fail_next_click.lock().unwrap().take() {
            return Err(err);
        }
        Ok(())
    }

    async fn type_text(
        &self,
        locator: &Locator,
        text: &str,
        press_enter: bool,
    ) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(SessionCall::TypeText(
            locator.clone(),
            text.to_string(),
            press_enter,
        ));
        Ok(())
    }

    async fn scroll(&self, delta_y: i64) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(SessionCall::Scroll(delta_y));
        Ok(())
    }

    async fn extract_text(&self, locator: Option<&Locator>) -> Result<String, DriverError> {
        self.calls
            .lock()
            .unwrap()
            .push(SessionCall::ExtractText(locator.cloned()));
        Ok(self.extract_result.lock().unwrap().clone())
    }

    async fn evaluate(&self, _script: &str) -> Result<Value, DriverError> {
        if *self.fail_evaluate.lock().unwrap() {
            return Err(DriverError::new(
                DriverErrorKind::SessionUnavailable,
                "evaluate failed by test configuration",
            ));
        }
        let candidates = self.candidates.lock().unwrap().clone();
        serde_json::to_value(candidates)
            .map_err(|err| DriverError::new(DriverErrorKind::EvaluationFailed, err.to_string()))
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(SessionCall::Close);
        Ok(())
    }
}
