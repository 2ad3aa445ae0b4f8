//! Structured logging for the agent loop.
//!
//! The library never talks to a global logger directly. Components log
//! through a [`PilotLogger`] so embedders can forward records to their own
//! sinks (the CLI bridges them to `log::info!`); a plain console printer is
//! the default when no callback is installed. Process-wide logger setup is
//! the entry point's job, not this module's.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Verbosity;

/// Callback type for external log sinks.
pub type LogCallback = Arc<dyn Fn(&PilotLogRecord) + Send + Sync + 'static>;

/// Log severity used across the crate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 0,
    Info = 1,
    Debug = 2,
}

impl LogLevel {
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    fn rank(self) -> u8 {
        self as u8
    }
}

fn verbosity_rank(verbosity: Verbosity) -> u8 {
    match verbosity {
        Verbosity::Minimal => 0,
        Verbosity::Medium => 1,
        Verbosity::Detailed => 2,
    }
}

/// One structured log entry, shared with external callbacks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PilotLogRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auxiliary: Option<Value>,
}

impl PilotLogRecord {
    pub fn new(
        message: impl Into<String>,
        level: LogLevel,
        category: Option<&str>,
        auxiliary: Option<Value>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            level,
            category: category.map(|c| c.to_string()),
            auxiliary,
        }
    }
}

/// Default console printer used when no external callback is configured.
pub fn default_log_handler(record: &PilotLogRecord) {
    let timestamp = record
        .timestamp
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    match &record.category {
        Some(category) => println!(
            "[{}] {:<5} [{}] {}",
            timestamp,
            record.level.label(),
            category,
            record.message
        ),
        None => println!(
            "[{}] {:<5} {}",
            timestamp,
            record.level.label(),
            record.message
        ),
    }
    if let Some(aux) = &record.auxiliary {
        if !aux.is_null() {
            println!("    {aux}");
        }
    }
}

/// Verbosity-gated logger handed to every component of a run.
#[derive(Clone)]
pub struct PilotLogger {
    verbosity: Verbosity,
    external: Option<LogCallback>,
}

impl fmt::Debug for PilotLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PilotLogger")
            .field("verbosity", &self.verbosity)
            .field("external", &self.external.is_some())
            .finish()
    }
}

impl PilotLogger {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            external: None,
        }
    }

    pub fn with_callback(mut self, callback: Option<LogCallback>) -> Self {
        self.external = callback;
        self
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Errors always pass; info/debug pass when the configured verbosity
    /// admits them.
    pub fn should_log(&self, level: LogLevel) -> bool {
        level == LogLevel::Error || level.rank() <= verbosity_rank(self.verbosity)
    }

    pub fn log(
        &self,
        message: impl Into<String>,
        level: LogLevel,
        category: Option<&str>,
        auxiliary: Option<Value>,
    ) {
        if !self.should_log(level) {
            return;
        }
        let record = PilotLogRecord::new(message, level, category, auxiliary);
        match &self.external {
            Some(callback) => callback(&record),
            None => default_log_handler(&record),
        }
    }

    pub fn error(&self, message: impl Into<String>, category: Option<&str>, aux: Option<Value>) {
        self.log(message, LogLevel::Error, category, aux);
    }

    pub fn info(&self, message: impl Into<String>, category: Option<&str>, aux: Option<Value>) {
        self.log(message, LogLevel::Info, category, aux);
    }

    pub fn debug(&self, message: impl Into<String>, category: Option<&str>, aux: Option<Value>) {
        self.log(message, LogLevel::Debug, category, aux);
    }
}
