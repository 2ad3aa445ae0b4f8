//! Action Schema: the closed set of actions the decision source may choose.
//!
//! Decision-source output is untrusted text. It becomes a typed value only
//! through [`ActionRegistry::validate`], which enforces strict-mode rules:
//! a single recognized `kind`, all required parameters with their declared
//! types, and no unknown fields. Anything else is a
//! [`SchemaValidationError`] carrying enough detail to feed back into the
//! next prompt. Growing the kind set requires a [`SCHEMA_VERSION`] bump so
//! prompts and validators move together.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Version of the action kind set.
pub const SCHEMA_VERSION: u32 = 1;

/// Every kind the schema recognizes, in prompt order.
pub const REGISTERED_KINDS: &[&str] = &[
    "navigate",
    "click-element",
    "type-text",
    "scroll",
    "extract-content",
    "wait",
    "done",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NavigateAction {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClickElementAction {
    #[serde(alias = "elementIndex")]
    pub element_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TypeTextAction {
    #[serde(alias = "elementIndex")]
    pub element_index: u32,
    pub text: String,
    #[serde(
        default,
        alias = "pressEnterAfter",
        skip_serializing_if = "Option::is_none"
    )]
    pub press_enter_after: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScrollAction {
    #[serde(alias = "deltaY")]
    pub delta_y: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct ExtractContentAction {
    #[serde(default, alias = "elementIndex", skip_serializing_if = "Option::is_none")]
    pub element_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WaitAction {
    #[serde(alias = "ms")]
    pub milliseconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DoneAction {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// The closed action union. `done` is reserved: it is the only action that
/// can mark a run's goal as satisfied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ActionRequest {
    Navigate(NavigateAction),
    ClickElement(ClickElementAction),
    TypeText(TypeTextAction),
    Scroll(ScrollAction),
    ExtractContent(ExtractContentAction),
    Wait(WaitAction),
    Done(DoneAction),
}

impl ActionRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionRequest::Navigate(_) => "navigate",
            ActionRequest::ClickElement(_) => "click-element",
            ActionRequest::TypeText(_) => "type-text",
            ActionRequest::Scroll(_) => "scroll",
            ActionRequest::ExtractContent(_) => "extract-content",
            ActionRequest::Wait(_) => "wait",
            ActionRequest::Done(_) => "done",
        }
    }

    /// The element index this action targets, when it targets one.
    pub fn element_index(&self) -> Option<u32> {
        match self {
            ActionRequest::ClickElement(action) => Some(action.element_index),
            ActionRequest::TypeText(action) => Some(action.element_index),
            ActionRequest::ExtractContent(action) => action.element_index,
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ActionRequest::Done(_))
    }
}

/// A validated decision: the typed action plus the model's stated reasoning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub action: ActionRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Rejection of a raw decision payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaValidationError {
    #[error("decision payload must be a JSON object")]
    NotAnObject,
    #[error("decision payload must carry a string `kind` field")]
    MissingKind,
    #[error("unknown action kind {kind:?}; registered kinds: {registered}")]
    UnknownKind { kind: String, registered: String },
    #[error("action kind {kind:?} is excluded for this run")]
    ExcludedKind { kind: String },
    #[error("invalid parameters for {kind:?}: {details}")]
    InvalidParameters { kind: String, details: String },
    #[error("`rationale` must be a string when present")]
    InvalidRationale,
}

/// The kind set in force for one run: the registered kinds minus any the
/// embedder excluded up front.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    excluded: BTreeSet<String>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove kinds from the run's palette. Unknown names are ignored: an
    /// exclusion list written for a newer schema should not break older
    /// binaries.
    pub fn without_kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: kinds.into_iter().map(Into::into).collect(),
        }
    }

    /// Kinds available to this run, in prompt order.
    pub fn kinds(&self) -> Vec<&'static str> {
        REGISTERED_KINDS
            .iter()
            .copied()
            .filter(|kind| !self.excluded.contains(*kind))
            .collect()
    }

    /// Strict-mode validation of a raw decision payload.
    pub fn validate(&self, raw: &Value) -> Result<Decision, SchemaValidationError> {
        let object = raw.as_object().ok_or(SchemaValidationError::NotAnObject)?;
        let mut object = object.clone();

        let rationale = match object.remove("rationale") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text),
            Some(_) => return Err(SchemaValidationError::InvalidRationale),
        };

        let kind = match object.get("kind") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(SchemaValidationError::MissingKind),
        };

        if !REGISTERED_KINDS.contains(&kind.as_str()) {
            return Err(SchemaValidationError::UnknownKind {
                kind,
                registered: REGISTERED_KINDS.join(", "),
            });
        }
        if self.excluded.contains(&kind) {
            return Err(SchemaValidationError::ExcludedKind { kind });
        }

        let action: ActionRequest = serde_json::from_value(Value::Object(object)).map_err(
            |err| SchemaValidationError::InvalidParameters {
                kind: kind.clone(),
                details: err.to_string(),
            },
        )?;

        Ok(Decision { action, rationale })
    }
}
