//! Agent Loop: capture, decide, validate, execute, record, repeat.
//!
//! The loop reconciles three unreliable layers — a mutating DOM, a
//! free-text decision source, and a stateful driver — by giving each its
//! own bounded retry policy: snapshot capture retries with backoff before
//! the session is declared unavailable, consecutive schema rejections are
//! capped separately from consecutive execution failures, and no single
//! layer can stall the run past its step budget. Every iteration leaves a
//! history entry behind; the run never terminates silently or with a
//! partially-written log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

use crate::config::PilotConfig;
use crate::decision::{DecisionContext, DecisionSource};
use crate::executor::{ActionErrorKind, ActionExecutor, ActionResult};
use crate::history::{HistoryEntry, HistoryLog};
use crate::index::{ElementIndex, Snapshot};
use crate::logging::PilotLogger;
use crate::metrics::{elapsed_ms, RunMetrics, RunPhase};
use crate::schema::ActionRegistry;
use crate::session::BrowserSession;

/// Why a run ended in the `Failed` terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SessionUnavailable,
    RepeatedInvalidAction,
    RepeatedActionFailure,
    DecisionSourceUnavailable,
    Cancelled,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    GoalReached,
    MaxStepsExceeded,
    Failed(FailureReason),
}

/// The externally consumed artifact of a run: terminal outcome, the full
/// history, and what it cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub outcome: RunOutcome,
    pub entries: Vec<HistoryEntry>,
    pub duration_ms: u64,
    pub metrics: RunMetrics,
}

impl AgentRunResult {
    /// Content of the terminal `done` action, when the run produced one.
    pub fn final_message(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.result.is_done)
            .and_then(|entry| entry.result.extracted_content.as_deref())
    }

    pub fn steps(&self) -> usize {
        self.entries.len()
    }
}

/// Cooperative cancellation flag, checked at the top of each iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// The orchestrator. Owns the session for the lifetime of one run and
/// guarantees it is closed on every exit path.
pub struct Agent<S: BrowserSession, D: DecisionSource> {
    config: PilotConfig,
    session: S,
    decision_source: D,
    logger: PilotLogger,
    metrics: Arc<StdMutex<RunMetrics>>,
    cancel: CancelHandle,
    events: broadcast::Sender<HistoryEntry>,
}

impl<S: BrowserSession, D: DecisionSource> Agent<S, D> {
    pub fn new(config: PilotConfig, session: S, decision_source: D) -> Self {
        let logger =
            PilotLogger::new(config.verbosity).with_callback(config.logger.clone());
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            session,
            decision_source,
            logger,
            metrics: Arc::new(StdMutex::new(RunMetrics::default())),
            cancel: CancelHandle::new(),
            events,
        }
    }

    /// Handle for cancelling the run from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Share an externally owned metrics accumulator, so a decision
    /// source's usage callback and the loop write into the same totals.
    pub fn with_metrics(mut self, metrics: Arc<StdMutex<RunMetrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Shared metrics accumulator, for wiring the decision source's usage
    /// callback before the run starts.
    pub fn metrics_handle(&self) -> Arc<StdMutex<RunMetrics>> {
        Arc::clone(&self.metrics)
    }

    /// Live stream of appended history entries.
    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEntry> {
        self.events.subscribe()
    }

    /// Drive the loop to a terminal state. Blocks until the goal is
    /// reached, a failure budget is spent, or the step budget runs out;
    /// the session is closed before the result is returned, whatever the
    /// exit path.
    pub async fn run(self, goal: &str) -> AgentRunResult {
        let started = Instant::now();
        self.logger.info(
            format!("starting run: {goal:?}"),
            Some("agent"),
            Some(json!({ "max_steps": self.config.max_steps })),
        );

        let mut history = HistoryLog::new();
        let mut index = ElementIndex::new(self.logger.clone());
        let outcome = self.drive(goal, &mut history, &mut index).await;

        if let Err(err) = self.session.close().await {
            self.logger
                .error(format!("session close failed: {err}"), Some("agent"), None);
        }

        let metrics = self
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        self.logger.info(
            format!("run finished: {outcome:?} after {} steps", history.len()),
            Some("agent"),
            None,
        );

        AgentRunResult {
            outcome,
            entries: history.entries().to_vec(),
            duration_ms: elapsed_ms(started),
            metrics,
        }
    }

    async fn drive(
        &self,
        goal: &str,
        history: &mut HistoryLog,
        index: &mut ElementIndex,
    ) -> RunOutcome {
        let registry = ActionRegistry::without_kinds(self.config.excluded_actions.clone());
        let executor = ActionExecutor::new(&self.config, self.logger.clone());

        let mut executed_steps: u32 = 0;
        let mut consecutive_failures: u32 = 0;
        let mut consecutive_invalid: u32 = 0;
        let mut last_validation_error: Option<String> = None;

        while executed_steps < self.config.max_steps {
            if self.cancel.is_cancelled() {
                self.logger
                    .info("run cancelled before next capture", Some("agent"), None);
                return RunOutcome::Failed(FailureReason::Cancelled);
            }

            let snapshot = match self.capture_with_retry(index).await {
                Some(snapshot) => snapshot,
                None => return RunOutcome::Failed(FailureReason::SessionUnavailable),
            };

            let decide_started = Instant::now();
            let raw = self
                .decision_source
                .next_action(DecisionContext {
                    goal,
                    snapshot: &snapshot,
                    history_rendered: &history
                        .render_for_prompt(self.config.history_prompt_entries),
                    last_validation_error: last_validation_error.as_deref(),
                })
                .await;
            self.record_phase(RunPhase::Decide, elapsed_ms(decide_started));

            let raw = match raw {
                Ok(raw) => raw,
                Err(err) => {
                    self.logger
                        .error(format!("decision source failed: {err}"), Some("agent"), None);
                    return RunOutcome::Failed(FailureReason::DecisionSourceUnavailable);
                }
            };

            let decision = match registry.validate(&raw) {
                Ok(decision) => decision,
                Err(err) => {
                    consecutive_invalid += 1;
                    let message = err.to_string();
                    self.logger.info(
                        format!(
                            "rejected decision ({consecutive_invalid} of {}): {message}",
                            self.config.max_validation_failures
                        ),
                        Some("agent"),
                        None,
                    );
                    self.append(
                        history,
                        HistoryEntry {
                            step_number: history.len() as u32 + 1,
                            snapshot_summary: snapshot.summary(),
                            chosen_action: None,
                            result: ActionResult::failure(
                                ActionErrorKind::InvalidAction,
                                message.clone(),
                            ),
                            rationale: None,
                            recorded_at: Utc::now(),
                        },
                    );
                    if consecutive_invalid >= self.config.max_validation_failures {
                        return RunOutcome::Failed(FailureReason::RepeatedInvalidAction);
                    }
                    last_validation_error = Some(message);
                    continue;
                }
            };
            consecutive_invalid = 0;
            last_validation_error = None;

            let execute_started = Instant::now();
            let result = executor
                .execute(&decision.action, &snapshot, index, &self.session)
                .await;
            self.record_phase(RunPhase::Execute, elapsed_ms(execute_started));
            executed_steps += 1;

            let is_done = result.is_done;
            let failed = result.is_failure();
            self.append(
                history,
                HistoryEntry {
                    step_number: history.len() as u32 + 1,
                    snapshot_summary: snapshot.summary(),
                    chosen_action: Some(decision.action),
                    result,
                    rationale: decision.rationale,
                    recorded_at: Utc::now(),
                },
            );

            if is_done {
                return RunOutcome::GoalReached;
            }
            if failed {
                consecutive_failures += 1;
                if consecutive_failures >= self.config.max_consecutive_failures {
                    return RunOutcome::Failed(FailureReason::RepeatedActionFailure);
                }
            } else {
                consecutive_failures = 0;
            }
        }

        RunOutcome::MaxStepsExceeded
    }

    /// Capture the next snapshot, retrying with doubling backoff inside the
    /// configured bound.
    async fn capture_with_retry(&self, index: &mut ElementIndex) -> Option<Arc<Snapshot>> {
        let mut backoff = Duration::from_millis(self.config.snapshot_retry_backoff_ms);
        for attempt in 1..=self.config.snapshot_retry_limit.max(1) {
            let capture_started = Instant::now();
            match index.capture_snapshot(&self.session).await {
                Ok(snapshot) => {
                    self.record_phase(RunPhase::Capture, elapsed_ms(capture_started));
                    return Some(snapshot);
                }
                Err(err) => {
                    self.logger.error(
                        format!(
                            "snapshot capture failed (attempt {attempt} of {}): {err}",
                            self.config.snapshot_retry_limit
                        ),
                        Some("index"),
                        None,
                    );
                    if attempt < self.config.snapshot_retry_limit {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }
        None
    }

    fn record_phase(&self, phase: RunPhase, elapsed: u64) {
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(phase, elapsed);
    }

    fn append(&self, history: &mut HistoryLog, entry: HistoryEntry) {
        // Send failures only mean nobody is listening.
        let _ = self.events.send(entry.clone());
        history.append(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Verbosity;
    use crate::decision::DecisionError;
    use crate::schema::ActionRequest;
    use crate::test_support::{candidate, StaticPageSession};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    struct ScriptedDecisions {
        responses: Mutex<Vec<Result<Value, DecisionError>>>,
    }

    impl ScriptedDecisions {
        fn new(responses: Vec<Result<Value, DecisionError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait::async_trait]
    impl DecisionSource for ScriptedDecisions {
        async fn next_action(&self, _ctx: DecisionContext<'_>) -> Result<Value, DecisionError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                // Out of script: finish the run.
                return Ok(json!({ "kind": "done", "message": "script exhausted" }));
            }
            responses.remove(0)
        }
    }

    fn quiet_config() -> PilotConfig {
        let mut config = PilotConfig::default();
        config.verbosity = Verbosity::Minimal;
        config.snapshot_retry_backoff_ms = 1;
        config
    }

    fn submit_page() -> StaticPageSession {
        StaticPageSession::new(
            "https://example.com/form",
            vec![
                candidate("input", "/html/body/input[1]", None),
                candidate("a", "/html/body/a[1]", Some("Home")),
                candidate("button", "/html/body/button[1]", Some("Submit")),
            ],
        )
    }

    #[tokio::test]
    async fn click_then_done_reaches_goal() {
        let session = submit_page();
        let decisions = ScriptedDecisions::new(vec![
            Ok(json!({
                "kind": "click-element",
                "element_index": 3,
                "rationale": "the Submit button matches the goal"
            })),
            Ok(json!({ "kind": "done", "message": "clicked Submit" })),
        ]);

        let agent = Agent::new(quiet_config(), session, decisions);
        let result = agent.run("click the button labeled Submit").await;

        assert_eq!(result.outcome, RunOutcome::GoalReached);
        assert_eq!(result.steps(), 2);
        assert_eq!(result.entries[0].result.outcome, crate::executor::Outcome::Success);
        assert!(!result.entries[0].result.is_done);
        assert_eq!(
            result.entries[0].rationale.as_deref(),
            Some("the Submit button matches the goal")
        );
        assert_eq!(result.final_message(), Some("clicked Submit"));
    }

    #[tokio::test]
    async fn unknown_element_failure_is_recorded_but_not_fatal() {
        let session = submit_page();
        let decisions = ScriptedDecisions::new(vec![
            Ok(json!({ "kind": "click-element", "element_index": 99 })),
            Ok(json!({ "kind": "done", "message": "gave up gracefully" })),
        ]);

        let agent = Agent::new(quiet_config(), session, decisions);
        let result = agent.run("click something that is not there").await;

        assert_eq!(result.outcome, RunOutcome::GoalReached);
        assert_eq!(result.entries.len(), 2);
        assert_eq!(
            result.entries[0].result.error.as_ref().map(|e| e.kind),
            Some(ActionErrorKind::ElementNotFound)
        );
    }

    #[tokio::test]
    async fn three_malformed_decisions_fail_the_run() {
        let session = submit_page();
        let decisions = ScriptedDecisions::new(vec![
            Ok(json!({ "kind": "teleport", "x": 1 })),
            Ok(json!({ "kind": "click-element" })),
            Ok(json!("just click the thing")),
        ]);

        let agent = Agent::new(quiet_config(), session, decisions);
        let result = agent.run("impossible instructions").await;

        assert_eq!(
            result.outcome,
            RunOutcome::Failed(FailureReason::RepeatedInvalidAction)
        );
        assert_eq!(result.entries.len(), 3);
        for entry in &result.entries {
            assert!(entry.chosen_action.is_none());
            assert_eq!(
                entry.result.error.as_ref().map(|e| e.kind),
                Some(ActionErrorKind::InvalidAction)
            );
        }
    }

    #[tokio::test]
    async fn validation_counter_resets_on_valid_action() {
        let session = submit_page();
        let decisions = ScriptedDecisions::new(vec![
            Ok(json!({ "kind": "teleport" })),
            Ok(json!({ "kind": "teleport" })),
            Ok(json!({ "kind": "scroll", "delta_y": 100 })),
            Ok(json!({ "kind": "teleport" })),
            Ok(json!({ "kind": "done", "message": "ok" })),
        ]);

        let agent = Agent::new(quiet_config(), session, decisions);
        let result = agent.run("scroll around").await;

        // Two rejections, a success, one more rejection, then done: the
        // invalid streak never reaches three.
        assert_eq!(result.outcome, RunOutcome::GoalReached);
        assert_eq!(result.entries.len(), 5);
    }

    #[tokio::test]
    async fn repeated_execution_failures_exhaust_the_budget() {
        let session = submit_page();
        let decisions = ScriptedDecisions::new(vec![
            Ok(json!({ "kind": "click-element", "element_index": 90 })),
            Ok(json!({ "kind": "click-element", "element_index": 91 })),
            Ok(json!({ "kind": "click-element", "element_index": 92 })),
        ]);

        let agent = Agent::new(quiet_config(), session, decisions);
        let result = agent.run("keep missing").await;

        assert_eq!(
            result.outcome,
            RunOutcome::Failed(FailureReason::RepeatedActionFailure)
        );
        assert_eq!(result.entries.len(), 3);
    }

    #[tokio::test]
    async fn step_budget_bounds_the_run() {
        let mut config = quiet_config();
        config.max_steps = 4;
        let session = submit_page();
        // Scroll forever; never done.
        let decisions = ScriptedDecisions::new(
            (0..20)
                .map(|_| Ok(json!({ "kind": "scroll", "delta_y": 200 })))
                .collect(),
        );

        let agent = Agent::new(config, session, decisions);
        let result = agent.run("scroll forever").await;

        assert_eq!(result.outcome, RunOutcome::MaxStepsExceeded);
        assert_eq!(result.entries.len(), 4);
    }

    #[tokio::test]
    async fn each_iteration_captures_a_fresh_generation() {
        let session = submit_page();
        let decisions = ScriptedDecisions::new(vec![
            Ok(json!({ "kind": "scroll", "delta_y": 100 })),
            Ok(json!({ "kind": "scroll", "delta_y": 100 })),
            Ok(json!({ "kind": "done", "message": "ok" })),
        ]);

        let agent = Agent::new(quiet_config(), session, decisions);
        let result = agent.run("scroll twice").await;

        let generations: Vec<u64> = result
            .entries
            .iter()
            .map(|entry| entry.snapshot_summary.generation)
            .collect();
        assert_eq!(generations, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn cancellation_preempts_the_pending_action() {
        let session = submit_page();
        let decisions = ScriptedDecisions::new(vec![Ok(
            json!({ "kind": "click-element", "element_index": 3 }),
        )]);

        let agent = Agent::new(quiet_config(), session, decisions);
        let cancel = agent.cancel_handle();
        cancel.cancel();
        let result = agent.run("cancelled before it starts").await;

        assert_eq!(result.outcome, RunOutcome::Failed(FailureReason::Cancelled));
        assert!(result.entries.is_empty());
    }

    #[tokio::test]
    async fn session_is_closed_on_every_terminal_path() {
        // Success path.
        let session = Arc::new(submit_page());
        let decisions =
            ScriptedDecisions::new(vec![Ok(json!({ "kind": "done", "message": "ok" }))]);
        let agent = Agent::new(quiet_config(), Arc::clone(&session), decisions);
        let result = agent.run("done immediately").await;
        assert_eq!(result.outcome, RunOutcome::GoalReached);
        assert_eq!(session.close_count(), 1);

        // Failure path: the session stops answering the walker.
        let session = Arc::new(submit_page());
        *session.fail_evaluate.lock().unwrap() = true;
        let decisions = ScriptedDecisions::new(vec![]);
        let agent = Agent::new(quiet_config(), Arc::clone(&session), decisions);
        let result = agent.run("session breaks").await;
        assert_eq!(
            result.outcome,
            RunOutcome::Failed(FailureReason::SessionUnavailable)
        );
        assert_eq!(session.close_count(), 1);

        // Cancellation path.
        let session = Arc::new(submit_page());
        let decisions = ScriptedDecisions::new(vec![]);
        let agent = Agent::new(quiet_config(), Arc::clone(&session), decisions);
        agent.cancel_handle().cancel();
        let result = agent.run("cancelled").await;
        assert_eq!(result.outcome, RunOutcome::Failed(FailureReason::Cancelled));
        assert_eq!(session.close_count(), 1);
    }

    #[tokio::test]
    async fn decision_source_outage_is_fatal() {
        let session = submit_page();
        let decisions = ScriptedDecisions::new(vec![Err(DecisionError::Unavailable(
            "connection refused".to_string(),
        ))]);

        let agent = Agent::new(quiet_config(), session, decisions);
        let result = agent.run("no model to ask").await;

        assert_eq!(
            result.outcome,
            RunOutcome::Failed(FailureReason::DecisionSourceUnavailable)
        );
        assert!(result.entries.is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_entries_as_they_append() {
        let session = submit_page();
        let decisions = ScriptedDecisions::new(vec![
            Ok(json!({ "kind": "scroll", "delta_y": 50 })),
            Ok(json!({ "kind": "done", "message": "ok" })),
        ]);

        let agent = Agent::new(quiet_config(), session, decisions);
        let mut events = agent.subscribe();
        let result = agent.run("stream me").await;
        assert_eq!(result.outcome, RunOutcome::GoalReached);

        let first = events.try_recv().expect("first event");
        assert_eq!(first.step_number, 1);
        assert_eq!(
            first.chosen_action.as_ref().map(ActionRequest::kind),
            Some("scroll")
        );
        let second = events.try_recv().expect("second event");
        assert!(second.result.is_done);
    }

}
