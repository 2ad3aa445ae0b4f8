//! webpilot: goal-driven browser automation.
//!
//! An external decision source (an LLM) steers a live browser session
//! toward a stated goal. Each iteration the agent loop snapshots the
//! page's interactive elements into a numbered index, asks the decision
//! source for the next action, validates the reply against a closed action
//! schema, executes it over CDP, and appends the outcome to an append-only
//! history — stopping when the goal is declared done, a failure budget is
//! spent, or the step budget runs out.
//!
//! The collaborators are traits: [`session::BrowserSession`] for the
//! driver (shipped: [`runtime::ChromiumoxideSession`]) and
//! [`decision::DecisionSource`] for the model (shipped:
//! [`decision::LlmDecisionSource`] over `async-openai`), so the loop is
//! fully exercisable with scripted fakes.

pub mod agent;
pub mod config;
pub mod decision;
pub mod dom_scripts;
pub mod executor;
pub mod history;
pub mod index;
pub mod llm;
pub mod logging;
pub mod metrics;
pub mod prompts;
pub mod runtime;
pub mod schema;
pub mod session;

#[cfg(test)]
mod test_support;

pub use agent::{Agent, AgentRunResult, CancelHandle, FailureReason, RunOutcome};
pub use config::{PilotConfig, Verbosity};
pub use decision::{DecisionContext, DecisionError, DecisionSource, LlmDecisionSource};
pub use executor::{ActionError, ActionErrorKind, ActionResult, Outcome};
pub use history::{HistoryEntry, HistoryLog};
pub use index::{ElementHandle, ElementIndex, Snapshot, SnapshotSummary};
pub use schema::{ActionRegistry, ActionRequest, Decision, SchemaValidationError};
pub use session::{BrowserSession, DriverError, DriverErrorKind, Locator, SessionPlan};
