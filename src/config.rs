//! Run configuration.
//!
//! [`PilotConfig`] collects every tunable the loop, the element index, the
//! executor, and the decision source consume. Values can be constructed from
//! defaults, loaded from the environment (with `.env` support via `dotenvy`),
//! or adjusted field-by-field before [`PilotConfig::validate`] pins them
//! down. The configuration is serializable so a run's settings can travel
//! with its history.

use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogCallback;
use crate::session::Viewport;

/// Default model used for the decision source.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Logging verbosity: 0 errors only, 1 medium, 2 detailed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Minimal,
    Medium,
    Detailed,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Medium
    }
}

/// Errors surfaced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid integer in {variable}: {source}")]
    InvalidInteger {
        variable: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("max_steps must be at least 1")]
    ZeroSteps,
    #[error("failure budgets must be at least 1")]
    ZeroFailureBudget,
    #[error("action_timeout_ms must be non-zero")]
    ZeroActionTimeout,
    #[error("model name must not be empty")]
    EmptyModel,
}

/// Everything a single agent run needs to know up front.
#[derive(Clone, Serialize, Deserialize)]
pub struct PilotConfig {
    /// Hard cap on action-executing iterations.
    pub max_steps: u32,
    /// Consecutive failure-outcome results tolerated before the run fails.
    pub max_consecutive_failures: u32,
    /// Consecutive schema rejections tolerated before the run fails.
    pub max_validation_failures: u32,
    /// Snapshot capture attempts per iteration before the session is
    /// declared unavailable.
    pub snapshot_retry_limit: u32,
    /// Backoff between snapshot capture attempts, doubled per retry.
    pub snapshot_retry_backoff_ms: u64,
    /// Transport-level retries for the decision source before it is
    /// declared unavailable.
    pub decision_reconnect_budget: u32,
    /// Per-action execution timeout.
    pub action_timeout_ms: u64,
    /// Upper bound applied to the `wait` action regardless of what the
    /// decision source asked for.
    pub max_wait_ms: u64,
    /// History entries rendered into the decision prompt.
    pub history_prompt_entries: usize,

    /// Decision-source model name.
    pub model_name: String,
    /// API key for the decision source; falls back to env at client build.
    #[serde(skip_serializing)]
    pub model_api_key: Option<String>,
    /// Override for OpenAI-compatible endpoints.
    pub model_base_url: Option<String>,

    /// Attach to an existing CDP endpoint instead of launching a browser.
    pub cdp_url: Option<String>,
    /// Explicit Chrome/Chromium binary for local launches.
    pub chrome_executable: Option<PathBuf>,
    pub headless: bool,
    pub viewport: Viewport,
    /// Extra Chromium command-line arguments.
    pub browser_args: Vec<String>,
    pub user_data_dir: Option<PathBuf>,

    /// Action kinds removed from the schema for this run.
    pub excluded_actions: Vec<String>,

    pub verbosity: Verbosity,
    /// External log sink; the CLI bridges this to `log`.
    #[serde(skip)]
    pub logger: Option<LogCallback>,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            max_consecutive_failures: 3,
            max_validation_failures: 3,
            snapshot_retry_limit: 3,
            snapshot_retry_backoff_ms: 500,
            decision_reconnect_budget: 2,
            action_timeout_ms: 5_000,
            max_wait_ms: 30_000,
            history_prompt_entries: 10,
            model_name: DEFAULT_MODEL.to_string(),
            model_api_key: None,
            model_base_url: None,
            cdp_url: None,
            chrome_executable: None,
            headless: true,
            viewport: Viewport::default(),
            browser_args: Vec::new(),
            user_data_dir: None,
            excluded_actions: Vec::new(),
            verbosity: Verbosity::default(),
            logger: None,
        }
    }
}

impl std::fmt::Debug for PilotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PilotConfig")
            .field("max_steps", &self.max_steps)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .field("max_validation_failures", &self.max_validation_failures)
            .field("model_name", &self.model_name)
            .field("model_api_key", &self.model_api_key.as_ref().map(|_| "***"))
            .field("cdp_url", &self.cdp_url)
            .field("chrome_executable", &self.chrome_executable)
            .field("headless", &self.headless)
            .field("excluded_actions", &self.excluded_actions)
            .field("verbosity", &self.verbosity)
            .finish_non_exhaustive()
    }
}

impl PilotConfig {
    /// Build a configuration from environment variables, loading `.env`
    /// first when present.
    ///
    /// Recognized variables: `WEBPILOT_MODEL`, `MODEL_API_KEY` /
    /// `OPENAI_API_KEY`, `WEBPILOT_MODEL_BASE_URL`, `WEBPILOT_CDP_URL`,
    /// `WEBPILOT_CHROME_BIN`, `WEBPILOT_HEADLESS`, `WEBPILOT_MAX_STEPS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv();

        let mut config = Self::default();

        if let Some(model) = non_empty_var("WEBPILOT_MODEL") {
            config.model_name = model;
        }
        config.model_api_key =
            non_empty_var("MODEL_API_KEY").or_else(|| non_empty_var("OPENAI_API_KEY"));
        config.model_base_url = non_empty_var("WEBPILOT_MODEL_BASE_URL");
        config.cdp_url = non_empty_var("WEBPILOT_CDP_URL");
        config.chrome_executable = non_empty_var("WEBPILOT_CHROME_BIN").map(PathBuf::from);

        if let Some(headless) = non_empty_var("WEBPILOT_HEADLESS") {
            config.headless = !matches!(headless.as_str(), "0" | "false" | "no");
        }

        if let Some(raw) = non_empty_var("WEBPILOT_MAX_STEPS") {
            config.max_steps = raw.parse().map_err(|source| ConfigError::InvalidInteger {
                variable: "WEBPILOT_MAX_STEPS",
                source,
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the loop relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_steps == 0 {
            return Err(ConfigError::ZeroSteps);
        }
        if self.max_consecutive_failures == 0 || self.max_validation_failures == 0 {
            return Err(ConfigError::ZeroFailureBudget);
        }
        if self.action_timeout_ms == 0 {
            return Err(ConfigError::ZeroActionTimeout);
        }
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::EmptyModel);
        }
        Ok(())
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PilotConfig::default();
        config.validate().expect("default config validates");
        assert_eq!(config.max_steps, 25);
        assert_eq!(config.max_consecutive_failures, 3);
        assert_eq!(config.model_name, DEFAULT_MODEL);
    }

    #[test]
    fn rejects_zero_budgets() {
        let mut config = PilotConfig::default();
        config.max_steps = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroSteps)));

        let mut config = PilotConfig::default();
        config.max_validation_failures = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroFailureBudget)
        ));
    }

    #[test]
    fn rejects_empty_model() {
        let mut config = PilotConfig::default();
        config.model_name = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyModel)));
    }
}
