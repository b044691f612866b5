//! Report events
//!
//! Structured records describing what the daemon observed and did. They are
//! broadcast to observers and printed as one JSON object per line by the
//! binary, so external tools can follow telemetry, inventory and sequencing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use crate::error::{TransmissionError, TransmissionFailure};
use crate::inventory::Color;

/// Current time as f64 seconds since the UNIX epoch, microsecond precision
pub fn current_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Where an inventory change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    Telemetry,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ConnectFailed,
    WriteFailed,
    SourceUnavailable,
}

impl From<TransmissionFailure> for FailureReason {
    fn from(reason: TransmissionFailure) -> Self {
        match reason {
            TransmissionFailure::ConnectFailed => FailureReason::ConnectFailed,
            TransmissionFailure::WriteFailed => FailureReason::WriteFailed,
            TransmissionFailure::SourceUnavailable => FailureReason::SourceUnavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportKind {
    /// One trimmed telemetry fragment as received
    Telemetry { peer: String, line: String },
    /// Listener or controller diagnostic
    Diagnostic { message: String },
    InventoryChanged {
        color: Color,
        delta: i64,
        count: u64,
        origin: ChangeOrigin,
    },
    InventoryFailed { color: Color, delta: i64, error: String },
    ScriptSent { script: String },
    ScriptFailed {
        script: String,
        reason: FailureReason,
        detail: String,
    },
    SequenceStarted { steps: usize },
    SequenceAlreadyRunning,
    StepDispatched { index: usize, script: String },
    StepAcknowledged { index: usize, name: String },
    AckIgnored { received: String, expected: String },
    SequenceFinished,
    SequenceCancelled { index: Option<usize> },
    SequenceAborted {
        index: usize,
        script: String,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEvent {
    pub timestamp: f64,
    #[serde(flatten)]
    pub kind: ReportKind,
}

impl ReportEvent {
    pub fn new(kind: ReportKind) -> Self {
        Self {
            timestamp: current_timestamp(),
            kind,
        }
    }

    pub fn diagnostic(message: impl Into<String>) -> Self {
        Self::new(ReportKind::Diagnostic { message: message.into() })
    }

    pub fn script_failed(error: &TransmissionError) -> Self {
        Self::new(ReportKind::ScriptFailed {
            script: error.script.clone(),
            reason: error.reason.into(),
            detail: error.detail.clone(),
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Print a report event to stdout as a single JSON line
pub fn output_event(event: &ReportEvent) {
    if let Ok(json) = event.to_json() {
        println!("{}", json);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inventory_change_serializes_flat() {
        let event = ReportEvent {
            timestamp: 12.5,
            kind: ReportKind::InventoryChanged {
                color: Color::Green,
                delta: 2,
                count: 14,
                origin: ChangeOrigin::Telemetry,
            },
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "timestamp": 12.5,
                "type": "inventory_changed",
                "color": "Green",
                "delta": 2,
                "count": 14,
                "origin": "telemetry"
            })
        );
    }

    #[test]
    fn transmission_failure_maps_reason() {
        let error =
            TransmissionError::new(TransmissionFailure::ConnectFailed, "roed_26.script", "refused");
        let event = ReportEvent::script_failed(&error);
        let json = event.to_json().unwrap();
        assert!(json.contains(r#""type":"script_failed""#));
        assert!(json.contains(r#""reason":"connect_failed""#));

        let back: ReportEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, event.kind);
    }

    #[test]
    fn timestamps_are_recent() {
        let now = current_timestamp();
        assert!(now > 1_600_000_000.0);
    }
}
