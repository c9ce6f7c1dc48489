//! Post-run processing utilities.
//!
//! Handles exports and the report download once monitoring has ended.

use crate::engine::BenchClient;
use crate::export;
use crate::model::RunOutcome;
use std::path::{Path, PathBuf};

/// Where post-run output should go.
#[derive(Debug, Clone, Default)]
pub(crate) struct PostRunTargets {
    pub report: Option<PathBuf>,
    pub export_json: Option<PathBuf>,
    pub export_csv: Option<PathBuf>,
}

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub messages: Vec<String>,
}

async fn fetch_report(client: &BenchClient, outcome: &RunOutcome, dest: &Path) -> Result<PathBuf, String> {
    // The server only has a meaningful report once every item is scored.
    if !outcome.fully_scored {
        return Err("Report skipped: run is not fully scored".into());
    }
    client
        .download_report(&outcome.run_id, dest)
        .await
        .map_err(|e| format!("Report download failed: {e}"))
}

/// Process a finished run: exports, then the report download when requested.
pub(crate) async fn process_run_completion(
    client: &BenchClient,
    targets: &PostRunTargets,
    outcome: &RunOutcome,
) -> ProcessedRun {
    let mut messages = Vec::new();

    if let Some(p) = targets.export_json.as_deref() {
        match export::export_json(p, outcome) {
            Ok(()) => messages.push(format!("Exported JSON: {}", p.display())),
            Err(e) => messages.push(format!("Export JSON failed: {e:#}")),
        }
    }
    if let Some(p) = targets.export_csv.as_deref() {
        match export::export_csv(p, outcome) {
            Ok(()) => messages.push(format!("Exported CSV: {}", p.display())),
            Err(e) => messages.push(format!("Export CSV failed: {e:#}")),
        }
    }

    if let Some(dest) = targets.report.as_deref() {
        match fetch_report(client, outcome, dest).await {
            Ok(path) => messages.push(format!("Saved report: {}", path.display())),
            Err(msg) => messages.push(msg),
        }
    }

    ProcessedRun { messages }
}
