//! Telemetry line classification
//!
//! The robot scripts report progress as free text, for example:
//!
//! ```text
//! STEP EyesLocate DONE cnt=2
//! DATA EyesWorkpCount=12
//! STEP Place DONE color=RED
//! RUN blaa_26 END
//! ```
//!
//! A single delivered line may carry several of these, separated either by real
//! line breaks or by a literal backslash-n escape.

use regex::Regex;
use std::num::IntErrorKind;
use serde::{Deserialize, Serialize};
use crate::inventory::Color;

pub const MIN_QUANTITY: u32 = 1;
pub const MAX_QUANTITY: u32 = 200;

const EYES_LOCATE_PREFIX: &str = "STEP EyesLocate DONE cnt=";
const EYES_WORKP_PREFIX: &str = "DATA EyesWorkpCount=";
const PLACE_DONE_PREFIX: &str = "STEP Place DONE color=";

/// Which telemetry line a quantity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantitySource {
    /// `STEP EyesLocate DONE cnt=<n>`
    Preferred,
    /// `DATA EyesWorkpCount=<n>`
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    QuantityObserved { source: QuantitySource, value: u32 },
    PlacementCompleted { color: Color, raw_line: String },
    SequenceStepAcknowledged { name: String },
    Unclassified { raw_line: String },
}

/// Split a raw line into trimmed, non-empty fragments
pub fn split_fragments(raw_line: &str) -> Vec<&str> {
    raw_line
        .split('\n')
        .flat_map(|part| part.split("\\n"))
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .collect()
}

/// Turns raw telemetry lines into [`TelemetryEvent`]s
#[derive(Debug, Clone)]
pub struct TelemetryClassifier {
    run_end_pattern: Regex,
}

impl TelemetryClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        let run_end_pattern = Regex::new(r"(?i)^\s*RUN\s+(?P<name>.+?)\s+END\b")?;
        Ok(Self { run_end_pattern })
    }

    /// Classify every logical message contained in a raw telemetry line
    pub fn classify(&self, raw_line: &str) -> Vec<TelemetryEvent> {
        split_fragments(raw_line)
            .into_iter()
            .filter_map(|fragment| self.classify_fragment(fragment))
            .collect()
    }

    /// Classify a single trimmed fragment
    ///
    /// Returns `None` only for quantity lines whose number does not parse; those
    /// observations are dropped.
    pub fn classify_fragment(&self, fragment: &str) -> Option<TelemetryEvent> {
        if let Some(rest) = strip_prefix_ignore_case(fragment, EYES_LOCATE_PREFIX) {
            return parse_quantity(rest).map(|value| TelemetryEvent::QuantityObserved {
                source: QuantitySource::Preferred,
                value,
            });
        }

        if let Some(rest) = strip_prefix_ignore_case(fragment, EYES_WORKP_PREFIX) {
            return parse_quantity(rest).map(|value| TelemetryEvent::QuantityObserved {
                source: QuantitySource::Fallback,
                value,
            });
        }

        if let Some(rest) = strip_prefix_ignore_case(fragment, PLACE_DONE_PREFIX) {
            return Some(match Color::parse(rest) {
                Some(color) => TelemetryEvent::PlacementCompleted {
                    color,
                    raw_line: fragment.to_string(),
                },
                None => TelemetryEvent::Unclassified {
                    raw_line: fragment.to_string(),
                },
            });
        }

        if let Some(captures) = self.run_end_pattern.captures(fragment) {
            let name = captures["name"].trim().to_string();
            return Some(TelemetryEvent::SequenceStepAcknowledged { name });
        }

        Some(TelemetryEvent::Unclassified {
            raw_line: fragment.to_string(),
        })
    }
}

/// Clamp a reported quantity into the accepted range
pub fn clamp_quantity(n: i64) -> u32 {
    n.clamp(MIN_QUANTITY as i64, MAX_QUANTITY as i64) as u32
}

/// Parse a reported quantity; integers too large for `i64` saturate at the bounds
fn parse_quantity(text: &str) -> Option<u32> {
    match text.trim().parse::<i64>() {
        Ok(n) => Some(clamp_quantity(n)),
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => Some(MAX_QUANTITY),
            IntErrorKind::NegOverflow => Some(MIN_QUANTITY),
            _ => None,
        },
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}
