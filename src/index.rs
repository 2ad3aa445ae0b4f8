//! Element Index: the page's interactive surface, snapshotted into a
//! stable, integer-keyed registry.
//!
//! A capture runs the embedded walker (see [`crate::dom_scripts`]) inside
//! the page, filters the returned candidates through an
//! [`InteractabilityPolicy`], and assigns indices in the walker's
//! deterministic depth-first document order. Indices are only meaningful
//! within the snapshot generation that produced them; [`ElementIndex::resolve`]
//! enforces that at the call site instead of letting a stale index silently
//! act on the wrong element.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dom_scripts::element_index_script;
use crate::logging::PilotLogger;
use crate::session::{BrowserSession, DriverError, Locator};

/// Pixel rectangle reported by the walker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn is_zero(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Raw per-element record emitted by the page walker, before policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawCandidate {
    pub tag: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub frame_id: Option<String>,
    pub xpath: String,
    #[serde(rename = "box")]
    pub bounding_box: BoundingBox,
    #[serde(default)]
    pub in_viewport: bool,
    #[serde(default)]
    pub displayed: bool,
    #[serde(default)]
    pub native_interactive: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub tabindex: Option<String>,
    #[serde(default)]
    pub has_click_handler: bool,
    #[serde(default)]
    pub pointer_cursor: bool,
    #[serde(default)]
    pub editable: bool,
}

impl RawCandidate {
    pub fn is_visible(&self) -> bool {
        self.displayed && !self.bounding_box.is_zero()
    }

    pub fn is_interactive(&self) -> bool {
        self.native_interactive
            || self.editable
            || self.has_click_handler
            || self.pointer_cursor
            || self.tabindex.is_some()
            || matches!(
                self.role.as_deref(),
                Some(
                    "button"
                        | "link"
                        | "checkbox"
                        | "radio"
                        | "tab"
                        | "menuitem"
                        | "option"
                        | "combobox"
                        | "textbox"
                        | "searchbox"
                        | "switch"
                        | "slider"
                )
            )
    }
}

/// Decides which walker candidates become addressable elements.
///
/// A policy is a heuristic, not an identity guarantee: false positives and
/// negatives are tolerated downstream via retry, never treated as fatal.
pub trait InteractabilityPolicy: Send + Sync {
    fn admit(&self, candidate: &RawCandidate) -> bool;
}

/// Default policy: visible, enabled, and carrying at least one
/// interactivity signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultInteractability;

impl InteractabilityPolicy for DefaultInteractability {
    fn admit(&self, candidate: &RawCandidate) -> bool {
        candidate.is_visible() && !candidate.disabled && candidate.is_interactive()
    }
}

/// One addressable element within a snapshot generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElementHandle {
    pub index: u32,
    pub tag: String,
    pub attributes: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub bounding_box: BoundingBox,
    pub is_interactive: bool,
    pub is_visible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<String>,
    /// Absolute XPath; frame-nested elements prefix their iframe chain
    /// separated by `|`, which the runtime resolves hop by hop.
    pub xpath: String,
}

impl ElementHandle {
    fn from_candidate(index: u32, candidate: &RawCandidate) -> Self {
        let xpath = match &candidate.frame_id {
            Some(frame) => format!("{frame}|{}", candidate.xpath),
            None => candidate.xpath.clone(),
        };
        Self {
            index,
            tag: candidate.tag.clone(),
            attributes: candidate.attributes.clone(),
            text: candidate.text.clone(),
            bounding_box: candidate.bounding_box,
            is_interactive: candidate.is_interactive(),
            is_visible: candidate.is_visible(),
            frame_id: candidate.frame_id.clone(),
            xpath,
        }
    }

    /// Locator the session layer acts on.
    pub fn locator(&self) -> Locator {
        Locator::XPath(self.xpath.clone())
    }

    /// One prompt line: `[3] <button type="submit"> "Submit"`.
    pub fn describe(&self) -> String {
        let mut line = format!("[{}] <{}", self.index, self.tag);
        for key in ["id", "name", "type", "href", "placeholder", "aria-label"] {
            if let Some(value) = self.attributes.get(key) {
                if !value.is_empty() {
                    line.push_str(&format!(" {key}={value:?}"));
                }
            }
        }
        line.push('>');
        if let Some(text) = self.text.as_ref().filter(|t| !t.is_empty()) {
            line.push_str(&format!(" {text:?}"));
        }
        line
    }
}

/// Compact description of a snapshot, recorded per history entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub generation: u64,
    pub page_url: String,
    pub element_count: usize,
}

/// One point-in-time indexing of the page. Immutable once produced;
/// superseded, never mutated, by the next capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub generation: u64,
    pub elements: Vec<ElementHandle>,
    pub captured_at: DateTime<Utc>,
    pub page_url: String,
}

impl Snapshot {
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            generation: self.generation,
            page_url: self.page_url.clone(),
            element_count: self.elements.len(),
        }
    }

    /// Indexed element listing rendered into the decision prompt.
    pub fn render_listing(&self) -> String {
        if self.elements.is_empty() {
            return "(no interactive elements found)".to_string();
        }
        let mut out = String::new();
        for element in &self.elements {
            out.push_str(&element.describe());
            out.push('\n');
        }
        out
    }
}

/// Failure to produce a snapshot at all.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("session unavailable: {source}")]
    SessionUnavailable {
        #[source]
        source: DriverError,
    },
    #[error("walker returned a malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

/// Failure to resolve an element index against the current generation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("index from generation {requested} is stale (current generation {current})")]
    Stale { requested: u64, current: u64 },
    #[error("no element {index} in the current snapshot")]
    NotFound { index: u32 },
}

/// Generation-scoped registry of interactive elements.
pub struct ElementIndex {
    policy: Box<dyn InteractabilityPolicy>,
    generation: u64,
    current: Option<Arc<Snapshot>>,
    logger: PilotLogger,
}

impl ElementIndex {
    pub fn new(logger: PilotLogger) -> Self {
        Self {
            policy: Box::new(DefaultInteractability),
            generation: 0,
            current: None,
            logger,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn InteractabilityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn current_generation(&self) -> u64 {
        self.generation
    }

    pub fn current_snapshot(&self) -> Option<&Arc<Snapshot>> {
        self.current.as_ref()
    }

    /// Walk the live document and produce the next snapshot generation.
    ///
    /// The previous generation is superseded wholesale: every index handed
    /// out before this call is invalid afterwards.
    pub async fn capture_snapshot(
        &mut self,
        session: &dyn BrowserSession,
    ) -> Result<Arc<Snapshot>, IndexError> {
        let page_url = session
            .current_url()
            .await
            .map_err(|source| IndexError::SessionUnavailable { source })?;
        let payload = session
            .evaluate(element_index_script())
            .await
            .map_err(|source| IndexError::SessionUnavailable { source })?;

        let candidates: Vec<RawCandidate> = serde_json::from_value(payload)?;
        let total = candidates.len();

        let mut elements = Vec::new();
        let mut next_index: u32 = 1;
        for candidate in &candidates {
            if !self.policy.admit(candidate) {
                continue;
            }
            elements.push(ElementHandle::from_candidate(next_index, candidate));
            next_index += 1;
        }

        self.generation += 1;
        let snapshot = Arc::new(Snapshot {
            generation: self.generation,
            elements,
            captured_at: Utc::now(),
            page_url,
        });
        self.current = Some(Arc::clone(&snapshot));

        self.logger.debug(
            format!(
                "captured snapshot generation {} ({} of {} candidates admitted)",
                snapshot.generation,
                snapshot.elements.len(),
                total
            ),
            Some("index"),
            None,
        );

        Ok(snapshot)
    }

    /// Resolve an element index minted by generation `generation`.
    ///
    /// Fails fast on any generation other than the current one; a stale
    /// index must never resolve against a different snapshot.
    pub fn resolve(&self, index: u32, generation: u64) -> Result<&ElementHandle, ResolveError> {
        let snapshot = match self.current.as_ref() {
            Some(snapshot) if generation == self.generation => snapshot,
            _ => {
                return Err(ResolveError::Stale {
                    requested: generation,
                    current: self.generation,
                })
            }
        };
        snapshot
            .elements
            .iter()
            .find(|element| element.index == index)
            .ok_or(ResolveError::NotFound { index })
    }
}
