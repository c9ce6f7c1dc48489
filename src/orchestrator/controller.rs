//! Run lifecycle controller.
//!
//! Resolves the selection, starts the run, drives the monitor and relays cancel
//! requests from the presentation layer.

use crate::engine::{BenchClient, MonitorControl, RunMonitor};
use crate::model::{RunConfig, RunOutcome, SyncEvent};
use crate::sync::{SyncPolicy, SyncState};
use anyhow::{bail, Context, Result};
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Commands emitted by UI layers to control the followed run.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Cancel,
}

/// Requested case and tool ids. Empty means everything the server offers.
#[derive(Debug, Clone, Default)]
pub(crate) struct Selection {
    pub cases: Vec<String>,
    pub tools: Vec<String>,
}

fn pick(requested: &[String], available: &[String], kind: &str) -> Result<Vec<String>> {
    let wanted = if requested.is_empty() {
        available
    } else {
        requested
    };
    let mut out: Vec<String> = Vec::with_capacity(wanted.len());
    for id in wanted {
        if !available.contains(id) {
            bail!("unknown {kind} `{id}` (available: {})", available.join(", "));
        }
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    Ok(out)
}

/// Check the selection against what the server offers.
pub(crate) fn select_ids(
    selection: &Selection,
    known_cases: &[String],
    known_tools: &[String],
) -> Result<(Vec<String>, Vec<String>)> {
    let case_ids = pick(&selection.cases, known_cases, "test case")?;
    let tool_ids = pick(&selection.tools, known_tools, "tool")?;
    if case_ids.is_empty() || tool_ids.is_empty() {
        bail!("select at least one test case and one tool");
    }
    Ok((case_ids, tool_ids))
}

async fn resolve_selection(
    client: &BenchClient,
    selection: &Selection,
) -> Result<(Vec<String>, Vec<String>)> {
    let (cases, tools) = tokio::try_join!(client.fetch_test_cases(), client.fetch_tools())
        .context("failed to load test cases and tools")?;
    let known_cases: Vec<String> = cases.into_iter().map(|c| c.id).collect();
    select_ids(selection, &known_cases, &tools)
}

/// Start a run and follow it to the end, emitting events for presentation layers.
pub(crate) async fn run_controller(
    client: BenchClient,
    cfg: RunConfig,
    selection: Selection,
    event_tx: UnboundedSender<SyncEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<RunOutcome> {
    let (case_ids, tool_ids) = resolve_selection(&client, &selection).await?;

    if let Ok(UiCommand::Cancel) = cmd_rx.try_recv() {
        bail!("cancelled before the run was started");
    }

    let run_id = client
        .start_run(&case_ids, &tool_ids)
        .await
        .context("failed to start run")?;

    let state = SyncState::new(
        run_id.clone(),
        &case_ids,
        &tool_ids,
        SyncPolicy::from_config(&cfg),
        Instant::now(),
    );
    let _ = event_tx.send(SyncEvent::RunStarted {
        run_id,
        total_slots: state.total_slots(),
    });

    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<MonitorControl>();
    let monitor = RunMonitor::new(client, cfg, state);
    let mut handle = tokio::spawn(monitor.run(event_tx, ctrl_rx));

    loop {
        tokio::select! {
            res = &mut handle => return res.context("run monitor task failed"),
            cmd = cmd_rx.recv() => match cmd {
                Some(UiCommand::Cancel) => {
                    let _ = ctrl_tx.send(MonitorControl::Cancel);
                }
                None => return handle.await.context("run monitor task failed"),
            }
        }
    }
}
