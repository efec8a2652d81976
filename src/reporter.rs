use crate::types::{AlertPayload, CycleReport};

/// Emit a cycle summary as a single JSON line to stdout.
pub fn report_cycle(report: &CycleReport) {
    if let Ok(json) = serde_json::to_string(report) {
        println!("{json}");
    }
}

/// Emit a delivered (or dry-run) alert as a single JSON line to stdout.
pub fn report_alert(payload: &AlertPayload) {
    if let Ok(json) = serde_json::to_string(payload) {
        println!("{json}");
    }
}
