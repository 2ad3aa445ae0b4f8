//! Run-level accounting: how long each phase of the loop spends and what the
//! decision source costs in tokens.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// The phases of one loop iteration that are worth timing separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Capture,
    Decide,
    Execute,
}

/// Aggregated metrics for a single agent run.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunMetrics {
    pub capture_count: u64,
    pub capture_time_ms: u64,

    pub decide_count: u64,
    pub decide_time_ms: u64,
    pub decide_prompt_tokens: u64,
    pub decide_completion_tokens: u64,

    pub execute_count: u64,
    pub execute_time_ms: u64,

    pub total_time_ms: u64,
}

impl RunMetrics {
    /// Record one completed phase.
    pub fn record(&mut self, phase: RunPhase, elapsed_ms: u64) {
        match phase {
            RunPhase::Capture => {
                self.capture_count += 1;
                self.capture_time_ms += elapsed_ms;
            }
            RunPhase::Decide => {
                self.decide_count += 1;
                self.decide_time_ms += elapsed_ms;
            }
            RunPhase::Execute => {
                self.execute_count += 1;
                self.execute_time_ms += elapsed_ms;
            }
        }
        self.total_time_ms += elapsed_ms;
    }

    /// Record token usage reported by the decision source.
    pub fn record_tokens(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.decide_prompt_tokens += prompt_tokens;
        self.decide_completion_tokens += completion_tokens;
    }

    /// Fold another metrics instance into this one.
    pub fn merge(&mut self, other: &RunMetrics) {
        self.capture_count += other.capture_count;
        self.capture_time_ms += other.capture_time_ms;
        self.decide_count += other.decide_count;
        self.decide_time_ms += other.decide_time_ms;
        self.decide_prompt_tokens += other.decide_prompt_tokens;
        self.decide_completion_tokens += other.decide_completion_tokens;
        self.execute_count += other.execute_count;
        self.execute_time_ms += other.execute_time_ms;
        self.total_time_ms += other.total_time_ms;
    }
}

/// Elapsed milliseconds since `start`, saturated into `u64`.
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
