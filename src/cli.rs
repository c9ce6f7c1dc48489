use crate::engine::BenchClient;
use crate::model::{RunConfig, RunOutcome, StalenessScope, SyncEvent};
use crate::orchestrator::{self, PostRunTargets, Selection, UiCommand};
use crate::sync::{DEFAULT_MAX_IDLE_POLLS, DEFAULT_STALE_AFTER};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "swapbench",
    version,
    about = "Start face-swap benchmark runs and follow their scores live"
)]
pub struct Cli {
    /// Base URL of the benchmark server
    #[arg(
        long,
        global = true,
        env = "SWAPBENCH_URL",
        default_value = "http://127.0.0.1:8000"
    )]
    pub base_url: String,

    /// Push channel base URL (defaults to the base URL with a ws/wss scheme)
    #[arg(long, global = true, env = "SWAPBENCH_PUSH_URL")]
    pub push_url: Option<String>,

    /// Log level when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Per-request HTTP timeout
    #[arg(long, global = true, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// List the test cases and tools offered by the server
    List {
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start a run and follow it until every item is scored
    Run(RunArgs),
    /// Rate one run item (1 to 5 stars)
    Rate {
        /// Run item id, as shown in the run output
        #[arg(long)]
        item: i64,
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
        stars: u8,
    },
    /// Download the HTML report of a run
    Report {
        #[arg(long)]
        run_id: String,
        /// File or directory to write to (defaults to the download directory)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Test case id to include (repeatable; default: all)
    #[arg(long = "case")]
    pub cases: Vec<String>,

    /// Tool id to include (repeatable; default: all)
    #[arg(long = "tool")]
    pub tools: Vec<String>,

    /// Print the final outcome as JSON
    #[arg(long, conflicts_with_all = ["text", "silent"])]
    pub json: bool,

    /// Stream slot updates and print a text summary (default)
    #[arg(long, conflicts_with = "silent")]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Interval between status polls
    #[arg(long, default_value = "3s")]
    pub poll_interval: humantime::Duration,

    /// Age after which a queued slot is refreshed from a poll
    #[arg(long, default_value = "30s")]
    pub stale_after: humantime::Duration,

    /// Polling stops after more than this many polls without progress
    #[arg(long, default_value_t = DEFAULT_MAX_IDLE_POLLS)]
    pub max_idle_polls: u32,

    /// Whether staleness is measured per slot or for the whole run
    #[arg(long, value_enum, default_value_t = StalenessScope::Slot)]
    pub staleness: StalenessScope,

    /// Do not open the push channel; rely on polling only
    #[arg(long)]
    pub no_push: bool,

    /// Download the report to this file or directory once fully scored
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Export the final outcome as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Export the final slot grid as CSV
    #[arg(long)]
    pub export_csv: Option<PathBuf>,
}

impl Cli {
    pub fn is_silent(&self) -> bool {
        matches!(&self.command, Command::Run(r) if r.silent)
    }
}

pub async fn run(args: Cli) -> Result<()> {
    match &args.command {
        Command::List { json } => run_list(&args, *json).await,
        Command::Run(run_args) => run_benchmark(&args, run_args).await,
        Command::Rate { item, stars } => run_rate(&args, *item, *stars).await,
        Command::Report { run_id, output } => run_report(&args, run_id, output.as_deref()).await,
    }
}

/// Build a `RunConfig` from CLI arguments. Commands other than `run` get the default sync policy.
pub fn build_config(args: &Cli, run: Option<&RunArgs>) -> RunConfig {
    RunConfig {
        base_url: args.base_url.clone(),
        push_url: args.push_url.clone(),
        user_agent: format!("swapbench/{}", env!("CARGO_PKG_VERSION")),
        request_timeout: Duration::from(args.request_timeout),
        poll_interval: run
            .map(|r| Duration::from(r.poll_interval))
            .unwrap_or(Duration::from_secs(3)),
        stale_after: run
            .map(|r| Duration::from(r.stale_after))
            .unwrap_or(DEFAULT_STALE_AFTER),
        max_idle_polls: run.map(|r| r.max_idle_polls).unwrap_or(DEFAULT_MAX_IDLE_POLLS),
        staleness: run.map(|r| r.staleness).unwrap_or_default(),
        push_enabled: run.map(|r| !r.no_push).unwrap_or(true),
    }
}

/// One progress line per event; `None` for events text mode does not show.
fn render_event(ev: &SyncEvent) -> Option<String> {
    match ev {
        SyncEvent::RunStarted {
            run_id,
            total_slots,
        } => Some(format!("== Run {run_id} started ({total_slots} items) ==")),
        SyncEvent::SlotUpdated { forced: true, .. } => None,
        SyncEvent::SlotUpdated { update, .. } => {
            let mut line = format!("{}: {}", update.slot, update.status.as_str());
            if let Some(score) = update.score {
                line.push_str(&format!(" ({score:.3})"));
            }
            Some(line)
        }
        SyncEvent::RunFullyScored { run_id } => Some(format!("Run {run_id} fully scored")),
        SyncEvent::PollingStoppedInactive { run_id } => Some(format!(
            "Run {run_id}: no progress from polling, stopped polling"
        )),
        SyncEvent::Info(info) => Some(info.to_message()),
    }
}

async fn run_benchmark(args: &Cli, run_args: &RunArgs) -> Result<()> {
    let cfg = build_config(args, Some(run_args));
    let client = BenchClient::new(&cfg).context("failed to build HTTP client")?;
    let streaming = !run_args.json && !run_args.silent;

    let (out_tx, out_handle) = if run_args.silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };

    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<SyncEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cmd_tx.send(UiCommand::Cancel);
        }
    });

    let selection = Selection {
        cases: run_args.cases.clone(),
        tools: run_args.tools.clone(),
    };
    let handle = tokio::spawn(orchestrator::run_controller(
        client.clone(),
        cfg,
        selection,
        evt_tx,
        cmd_rx,
    ));

    // Events are drained in every mode so the monitor never backs up.
    while let Some(ev) = evt_rx.recv().await {
        if !streaming {
            continue;
        }
        if let (Some(tx), Some(line)) = (out_tx.as_ref(), render_event(&ev)) {
            let _ = tx.send(OutputLine::Stderr(line));
        }
    }

    let outcome = handle
        .await
        .context("run controller task failed")?
        .context("benchmark run failed")?;

    let targets = PostRunTargets {
        report: run_args.report.clone(),
        export_json: run_args.export_json.clone(),
        export_csv: run_args.export_csv.clone(),
    };
    let processed = orchestrator::process_run_completion(&client, &targets, &outcome).await;

    if let Some(tx) = out_tx.as_ref() {
        if run_args.json {
            let out = serde_json::to_string_pretty(&outcome)?;
            let _ = tx.send(OutputLine::Stdout(out));
        } else {
            let summary =
                crate::text_summary::build_text_summary(&outcome, |u| client.resolve_url(u));
            for line in summary.lines {
                let _ = tx.send(OutputLine::Stdout(line));
            }
        }
        for msg in processed.messages {
            let _ = tx.send(OutputLine::Stderr(msg));
        }
    }

    if let Some(tx) = out_tx {
        drop(tx);
    }
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }

    check_outcome(&outcome)
}

fn check_outcome(outcome: &RunOutcome) -> Result<()> {
    if outcome.fully_scored {
        return Ok(());
    }
    if outcome.cancelled {
        anyhow::bail!(
            "run {} cancelled with {}/{} items scored",
            outcome.run_id,
            outcome.scored,
            outcome.total_slots
        );
    }
    anyhow::bail!(
        "run {} not fully scored ({}/{} items)",
        outcome.run_id,
        outcome.scored,
        outcome.total_slots
    )
}

async fn run_list(args: &Cli, json: bool) -> Result<()> {
    let cfg = build_config(args, None);
    let client = BenchClient::new(&cfg).context("failed to build HTTP client")?;
    let (cases, tools) = tokio::try_join!(client.fetch_test_cases(), client.fetch_tools())
        .context("failed to load test cases and tools")?;

    let (out_tx, out_handle) = spawn_output_writer();
    if json {
        let out = serde_json::to_string_pretty(&serde_json::json!({
            "test_cases": cases,
            "tools": tools,
        }))?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        let _ = out_tx.send(OutputLine::Stdout("Test cases:".into()));
        for case in &cases {
            let line = match case.description.as_deref() {
                Some(d) if !d.is_empty() => format!("  {}  {}", case.id, d),
                _ => format!("  {}", case.id),
            };
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
        let _ = out_tx.send(OutputLine::Stdout("Tools:".into()));
        for tool in &tools {
            let _ = out_tx.send(OutputLine::Stdout(format!("  {tool}")));
        }
    }
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

async fn run_rate(args: &Cli, item: i64, stars: u8) -> Result<()> {
    let cfg = build_config(args, None);
    let client = BenchClient::new(&cfg).context("failed to build HTTP client")?;
    // Ratings are fire-and-forget: a failure is reported but never fails the command.
    if let Err(e) = client.rate(item, stars).await {
        warn!(item, stars, error = %e, "rating failed");
    }
    Ok(())
}

async fn run_report(args: &Cli, run_id: &str, output: Option<&std::path::Path>) -> Result<()> {
    let cfg = build_config(args, None);
    let client = BenchClient::new(&cfg).context("failed to build HTTP client")?;
    let line = save_report(&client, run_id, output).await?;

    let (out_tx, out_handle) = spawn_output_writer();
    let _ = out_tx.send(OutputLine::Stderr(line));
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

/// Download a run's report; `output` defaults to the user's download directory.
async fn save_report(
    client: &BenchClient,
    run_id: &str,
    output: Option<&std::path::Path>,
) -> Result<String> {
    let dest = match output {
        Some(p) => p.to_path_buf(),
        None => dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
    };
    let saved = client
        .download_report(&crate::model::RunId::new(run_id), &dest)
        .await
        .with_context(|| format!("failed to download report for run {run_id}"))?;
    Ok(format!("Saved: {}", saved.display()))
}
