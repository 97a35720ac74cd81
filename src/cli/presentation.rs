//! Text rendering of command results.

use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;

use crate::cli::route::SimulationSummary;
use crate::recovery::checkpoint::Checkpoint;
use crate::recovery::telemetry::AttemptEvent;

fn format_timestamp(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

pub fn format_checkpoints_text(job: &str, checkpoints: &[Checkpoint]) -> String {
    if checkpoints.is_empty() {
        return format!("No checkpoints for job {job}.");
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Created", "Type", "Id", "Description"]);
    for checkpoint in checkpoints {
        table.add_row(vec![
            format_timestamp(checkpoint.created_at_ms),
            checkpoint.checkpoint_type.to_string(),
            checkpoint.id.clone(),
            checkpoint.description.clone(),
        ]);
    }
    format!("Checkpoints for job {job} ({}):\n{table}", checkpoints.len())
}

pub fn format_checkpoint_detail(checkpoint: &Checkpoint) -> String {
    let payload = serde_json::to_string_pretty(&checkpoint.payload)
        .unwrap_or_else(|_| checkpoint.payload.to_string());
    format!(
        "Checkpoint {}\n  Job: {}\n  Type: {}\n  Created: {}\n  Description: {}\n  Payload:\n{}",
        checkpoint.id,
        checkpoint.job_id,
        checkpoint.checkpoint_type,
        format_timestamp(checkpoint.created_at_ms),
        checkpoint.description,
        payload
    )
}

pub fn format_attempts_text(job: &str, events: &[AttemptEvent]) -> String {
    if events.is_empty() {
        return format!("No attempts recorded for job {job}.");
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Seq", "Time", "Operation", "Event", "Attempt", "Detail"]);
    for event in events {
        let detail = match &event.data {
            serde_json::Value::Null => String::new(),
            serde_json::Value::Object(map) if map.is_empty() => String::new(),
            other => other.to_string(),
        };
        table.add_row(vec![
            event.seq.to_string(),
            format_timestamp(event.ts_ms),
            event.operation.clone(),
            event.event_type.as_str().to_string(),
            event.attempt.to_string(),
            detail,
        ]);
    }
    table.to_string()
}

pub fn format_simulation_text(summary: &SimulationSummary) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Feature", "Status", "Attempts", "Error"]);
    for row in &summary.features {
        table.add_row(vec![
            row.feature.clone(),
            row.status.clone(),
            row.attempts.to_string(),
            row.error.clone().unwrap_or_default(),
        ]);
    }
    let mut out = format!(
        "Job {} finished: {} of {} features completed ({:.0}%), outcome {}\n{table}",
        summary.job_id,
        summary.completed,
        summary.total,
        summary.completion_rate * 100.0,
        summary.outcome
    );
    out.push_str(&format!(
        "\nPreview: {} bytes, features applied in order: {}",
        summary.preview_bytes,
        summary.applied_order.join(", ")
    ));
    if let Some(path) = &summary.preview_path {
        out.push_str(&format!("\nPreview written to {path}"));
    }
    out
}
