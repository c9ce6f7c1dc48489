//! Text summary builder for CLI output.
//!
//! Formats the final slot grid and per-tool score statistics for text mode.

use crate::metrics;
use crate::model::RunOutcome;
use std::collections::BTreeMap;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a finished run. `resolve_url` turns server-relative
/// image paths into something the operator can open.
pub(crate) fn build_text_summary(
    outcome: &RunOutcome,
    resolve_url: impl Fn(&str) -> String,
) -> TextSummary {
    let mut lines = Vec::new();
    lines.push(format!(
        "Run {}: {}/{} scored",
        outcome.run_id, outcome.scored, outcome.total_slots
    ));

    let mut by_tool: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for slot in &outcome.slots {
        let status = slot
            .status
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("queued");
        let mut line = format!("  {} / {}: {}", slot.case_id, slot.tool_id, status);
        if let Some(score) = slot.score {
            line.push_str(&format!("  score {score:.3}"));
            by_tool.entry(slot.tool_id.as_str()).or_default().push(score);
        }
        if let Some(url) = slot.image_url.as_deref() {
            line.push_str(&format!("  {}", resolve_url(url)));
        }
        if let Some(item) = slot.run_item_id {
            line.push_str(&format!("  (item {item})"));
        }
        lines.push(line);
    }

    if !by_tool.is_empty() {
        lines.push("Scores by tool:".to_string());
        for (tool, scores) in &by_tool {
            if let Some((mean, median, p25, p75)) = metrics::compute_metrics(scores) {
                lines.push(format!(
                    "  {tool}: n={} avg {:.3} med {:.3} p25 {:.3} p75 {:.3}",
                    scores.len(),
                    mean,
                    median,
                    p25,
                    p75
                ));
            }
        }
    }

    if outcome.cancelled {
        lines.push("Stopped following the run (cancelled).".to_string());
    } else if !outcome.fully_scored {
        if outcome.polling_stopped_inactive {
            lines.push("Polling stopped due to inactivity before every item was scored.".into());
        } else {
            lines.push("Run ended before every item was scored.".into());
        }
    }

    TextSummary { lines }
}
