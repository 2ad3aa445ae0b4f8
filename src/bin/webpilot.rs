//! webpilot CLI.
//!
//! Drives a full agent run from the command line: build configuration from
//! flags and environment, establish the browser session (local launch or
//! CDP attach), wire the LLM decision source, stream step records as they
//! land, and report the terminal state.
//!
//! Usage examples:
//!   Local launch:
//!     $ WEBPILOT_CHROME_BIN=/usr/bin/chromium OPENAI_API_KEY=... \
//!       cargo run --bin webpilot -- run "find the pricing page" \
//!         --url https://example.com
//!   Attach to a running browser:
//!     $ cargo run --bin webpilot -- run "accept the cookie banner" \
//!       --cdp-url http://127.0.0.1:9222 --url https://example.com

use std::env;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use webpilot::agent::Agent;
use webpilot::config::{PilotConfig, Verbosity};
use webpilot::decision::LlmDecisionSource;
use webpilot::history::HistoryLog;
use webpilot::logging::{LogCallback, LogLevel, PilotLogger};
use webpilot::metrics::RunMetrics;
use webpilot::runtime::ChromiumoxideSession;
use webpilot::schema::ActionRegistry;
use webpilot::session::{BrowserSession, SessionPlan};
use webpilot::{FailureReason, RunOutcome};

#[derive(Parser)]
#[command(name = "webpilot", author, version, about = "Goal-driven browser automation")]
struct Cli {
    /// Increase log verbosity (pass twice for debug output).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent loop against a goal until it reaches a terminal state.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Natural-language goal for the run.
    goal: String,

    /// Page to open before the first iteration.
    #[arg(long)]
    url: Option<String>,

    /// Attach to an existing CDP endpoint instead of launching a browser.
    #[arg(long)]
    cdp_url: Option<String>,

    /// Chrome/Chromium binary for local launches.
    #[arg(long)]
    chrome_bin: Option<PathBuf>,

    /// Show the browser window (local launches only).
    #[arg(long)]
    show_browser: bool,

    /// Override the step budget.
    #[arg(long)]
    max_steps: Option<u32>,

    /// Override the decision-source model.
    #[arg(long)]
    model: Option<String>,

    /// Action kinds to remove from the schema for this run (repeatable).
    #[arg(long = "exclude-action")]
    exclude_actions: Vec<String>,

    /// Write the run history as JSONL to this path.
    #[arg(long)]
    history_out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env_logger();

    let cli = Cli::parse();
    let verbosity = verbosity_from_count(cli.verbose);

    match cli.command {
        Command::Run(args) => run(args, verbosity).await,
    }
}

async fn run(args: RunArgs, verbosity: Verbosity) -> Result<()> {
    let config = build_config(&args, verbosity)?;
    let logger = PilotLogger::new(config.verbosity).with_callback(config.logger.clone());

    let plan = SessionPlan::from_config(&config);
    let session = ChromiumoxideSession::connect(&plan, logger.clone())
        .await
        .context("failed to establish browser session")?;

    if let Some(url) = args.url.as_deref() {
        session
            .navigate(url)
            .await
            .with_context(|| format!("failed to open {url}"))?;
        info!("Opened {url}");
    }

    let registry = ActionRegistry::without_kinds(config.excluded_actions.clone());
    let metrics = Arc::new(Mutex::new(RunMetrics::default()));
    let usage_sink = Arc::clone(&metrics);
    let decision_source = LlmDecisionSource::from_config(&config, registry, logger.clone())
        .context("failed to construct decision source")?
        .with_usage_callback(Some(Arc::new(move |prompt, completion| {
            if let Ok(mut totals) = usage_sink.lock() {
                totals.record_tokens(prompt, completion);
            }
        })));

    let agent = Agent::new(config, session, decision_source).with_metrics(metrics);

    let cancel = agent.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            cancel.cancel();
        }
    });

    let mut events = agent.subscribe();
    tokio::spawn(async move {
        while let Ok(entry) = events.recv().await {
            let action = entry
                .chosen_action
                .as_ref()
                .map(|action| action.kind())
                .unwrap_or("rejected");
            info!(
                "step {}: {} -> {:?}",
                entry.step_number, action, entry.result.outcome
            );
        }
    });

    let result = agent.run(&args.goal).await;

    info!(
        "Run finished: {:?} in {} steps ({} ms, {} prompt / {} completion tokens)",
        result.outcome,
        result.steps(),
        result.duration_ms,
        result.metrics.decide_prompt_tokens,
        result.metrics.decide_completion_tokens,
    );
    if let Some(message) = result.final_message() {
        info!("Final message: {message}");
    }

    if let Some(path) = args.history_out.as_ref() {
        let mut log = HistoryLog::new();
        for entry in &result.entries {
            log.append(entry.clone());
        }
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        log.write_jsonl(BufWriter::new(file))
            .context("failed to write history")?;
        info!("History written to {}", path.display());
    }

    match result.outcome {
        RunOutcome::GoalReached => Ok(()),
        RunOutcome::MaxStepsExceeded => {
            warn!("step budget exhausted before the goal was reached");
            Ok(())
        }
        RunOutcome::Failed(reason) => Err(anyhow!(describe_failure(reason))),
    }
}

fn build_config(args: &RunArgs, verbosity: Verbosity) -> Result<PilotConfig> {
    let mut config = PilotConfig::from_env().context("invalid environment configuration")?;
    config.verbosity = verbosity;
    config.logger = Some(make_logger_callback());
    config.headless = !args.show_browser;

    if let Some(url) = args.cdp_url.clone() {
        config.cdp_url = Some(url);
    }
    if let Some(path) = args.chrome_bin.clone() {
        config.chrome_executable = Some(path);
    }
    if let Some(max_steps) = args.max_steps {
        config.max_steps = max_steps;
    }
    if let Some(model) = args.model.clone() {
        config.model_name = model;
    }
    config.excluded_actions = args.exclude_actions.clone();

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn describe_failure(reason: FailureReason) -> String {
    match reason {
        FailureReason::SessionUnavailable => "browser session became unavailable".to_string(),
        FailureReason::RepeatedInvalidAction => {
            "decision source kept producing invalid actions".to_string()
        }
        FailureReason::RepeatedActionFailure => {
            "too many consecutive action failures".to_string()
        }
        FailureReason::DecisionSourceUnavailable => "decision source unavailable".to_string(),
        FailureReason::Cancelled => "run cancelled".to_string(),
    }
}

fn make_logger_callback() -> LogCallback {
    Arc::new(|record| {
        let category = record.category.as_deref().unwrap_or("webpilot");
        match record.level {
            LogLevel::Error => log::error!("[{category}] {}", record.message),
            LogLevel::Info => log::info!("[{category}] {}", record.message),
            LogLevel::Debug => log::debug!("[{category}] {}", record.message),
        }
    })
}

fn verbosity_from_count(count: u8) -> Verbosity {
    match count {
        0 => Verbosity::Medium,
        _ => Verbosity::Detailed,
    }
}

fn init_env_logger() {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }

    let _ = env_logger::Builder::from_env(env_logger::Env::default())
        .format_timestamp_secs()
        .try_init();
}
