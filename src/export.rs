use crate::model::RunOutcome;
use anyhow::{Context, Result};
use std::path::Path;

/// Write the run outcome as pretty JSON.
pub fn export_json(path: &Path, outcome: &RunOutcome) -> Result<()> {
    let body = serde_json::to_string_pretty(outcome).context("serialize run outcome")?;
    std::fs::write(path, body).with_context(|| format!("write {}", path.display()))
}

fn csv_field(value: &str) -> String {
    if value.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render the slot grid as CSV, one row per slot.
pub fn outcome_csv(outcome: &RunOutcome) -> String {
    let mut out = String::from("run_id,case_id,tool_id,status,score,image_url,run_item_id\n");
    for slot in &outcome.slots {
        let row = [
            csv_field(outcome.run_id.as_str()),
            csv_field(&slot.case_id),
            csv_field(&slot.tool_id),
            csv_field(slot.status.as_ref().map(|s| s.as_str()).unwrap_or("")),
            slot.score.map(|s| s.to_string()).unwrap_or_default(),
            csv_field(slot.image_url.as_deref().unwrap_or("")),
            slot.run_item_id.map(|i| i.to_string()).unwrap_or_default(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

pub fn export_csv(path: &Path, outcome: &RunOutcome) -> Result<()> {
    std::fs::write(path, outcome_csv(outcome)).with_context(|| format!("write {}", path.display()))
}
