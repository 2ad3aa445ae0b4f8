//! History Log: the sole source of truth for what a run did.
//!
//! Entries are appended, never mutated or removed; the log's length is the
//! authoritative step counter. The log renders itself into the next
//! decision prompt (oldest entries truncated first, the very first entry
//! always kept so the original goal framing survives) and serializes to a
//! flat JSONL record stream for offline replay.

use std::io::{self, BufRead, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::ActionResult;
use crate::index::SnapshotSummary;
use crate::schema::ActionRequest;

/// One recorded step. `chosen_action` is `None` when the decision payload
/// never survived validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub step_number: u32,
    pub snapshot_summary: SnapshotSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_action: Option<ActionRequest>,
    pub result: ActionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    fn render(&self) -> String {
        let action = match &self.chosen_action {
            Some(action) => {
                serde_json::to_string(action).unwrap_or_else(|_| action.kind().to_string())
            }
            None => "(rejected before execution)".to_string(),
        };
        let status = match &self.result.error {
            Some(error) => format!("failure [{:?}] {}", error.kind, error.message),
            None if self.result.is_done => "done".to_string(),
            None => "success".to_string(),
        };
        let mut line = format!("step {}: {} -> {}", self.step_number, action, status);
        if let Some(content) = self.result.extracted_content.as_ref() {
            let trimmed: String = content.chars().take(200).collect();
            line.push_str(&format!(" | extracted: {trimmed:?}"));
        }
        if let Some(rationale) = self.rationale.as_ref() {
            line.push_str(&format!(" | rationale: {rationale}"));
        }
        line
    }
}

/// Stable per-line shape used for offline replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayRecord {
    pub step_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionRequest>,
    pub result: ActionResult,
}

/// Failure while reading a persisted history stream.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("i/o error reading history: {0}")]
    Io(#[from] io::Error),
    #[error("malformed record on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Append-only, ordered record of a run.
#[derive(Debug, Default, Clone)]
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Entries from step index `n` (0-based) onward.
    pub fn entries_since(&self, n: usize) -> &[HistoryEntry] {
        &self.entries[self.entries.len().min(n)..]
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// Serialized summary for the next decision prompt.
    ///
    /// When the log exceeds `max_entries`, the first entry is always kept
    /// and the remainder comes from the most recent steps, with an elision
    /// marker in between.
    pub fn render_for_prompt(&self, max_entries: usize) -> String {
        if self.entries.is_empty() {
            return "(no steps taken yet)".to_string();
        }
        if max_entries == 0 {
            return format!("({} steps elided)", self.entries.len());
        }

        let mut lines = Vec::new();
        if self.entries.len() <= max_entries {
            for entry in &self.entries {
                lines.push(entry.render());
            }
        } else {
            let recent = max_entries.saturating_sub(1).max(1);
            let skipped = self.entries.len() - 1 - recent;
            lines.push(self.entries[0].render());
            if skipped > 0 {
                lines.push(format!("... {skipped} earlier steps elided ..."));
            }
            for entry in &self.entries[self.entries.len() - recent..] {
                lines.push(entry.render());
            }
        }
        lines.join("\n")
    }

    /// Write one stable `{step_number, action, result}` record per line.
    pub fn write_jsonl<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for entry in &self.entries {
            let record = ReplayRecord {
                step_number: entry.step_number,
                action: entry.chosen_action.clone(),
                result: entry.result.clone(),
            };
            let line = serde_json::to_string(&record)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            writeln!(writer, "{line}")?;
        }
        Ok(())
    }

    /// Load replay records previously produced by [`Self::write_jsonl`].
    pub fn read_jsonl<R: BufRead>(reader: R) -> Result<Vec<ReplayRecord>, ReplayError> {
        let mut records = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| ReplayError::Malformed {
                line: number + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }
}
