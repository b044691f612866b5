//! Count aggregation
//!
//! Tracks the most recent vision quantities and turns each accepted placement
//! into an inventory delta. The aggregator never caches inventory values; it
//! only holds transient observations for the current cycle.

use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::classifier::{QuantitySource, TelemetryEvent, MAX_QUANTITY, MIN_QUANTITY};
use crate::inventory::Color;

const DEFAULT_QUANTITY: u32 = 1;

/// Inventory change produced by an accepted placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDelta {
    pub color: Color,
    pub delta: u32,
}

/// Point-in-time view of the aggregator state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSnapshot {
    pub preferred_quantity: u32,
    pub fallback_quantity: u32,
    pub last_placement_line: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CountAggregator {
    preferred_quantity: u32,
    fallback_quantity: u32,
    last_placement_line: Option<String>,
}

impl Default for CountAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl CountAggregator {
    pub fn new() -> Self {
        Self {
            preferred_quantity: DEFAULT_QUANTITY,
            fallback_quantity: DEFAULT_QUANTITY,
            last_placement_line: None,
        }
    }

    /// Apply one telemetry event, returning the delta to book if any
    pub fn apply(&mut self, event: &TelemetryEvent) -> Option<InventoryDelta> {
        match event {
            TelemetryEvent::QuantityObserved { source, value } => {
                self.observe_quantity(*source, *value);
                None
            }
            TelemetryEvent::PlacementCompleted { color, raw_line } => {
                self.complete_placement(*color, raw_line)
            }
            TelemetryEvent::SequenceStepAcknowledged { .. }
            | TelemetryEvent::Unclassified { .. } => None,
        }
    }

    /// Record a quantity observation; values outside the valid range are ignored
    pub fn observe_quantity(&mut self, source: QuantitySource, value: u32) {
        if !(MIN_QUANTITY..=MAX_QUANTITY).contains(&value) {
            debug!("Ignoring out-of-range {:?} quantity {}", source, value);
            return;
        }
        match source {
            QuantitySource::Preferred => self.preferred_quantity = value,
            QuantitySource::Fallback => self.fallback_quantity = value,
        }
    }

    /// Book a placement unless it repeats the previously booked line
    pub fn complete_placement(&mut self, color: Color, raw_line: &str) -> Option<InventoryDelta> {
        if self.last_placement_line.as_deref() == Some(raw_line) {
            debug!("Suppressing duplicate placement line: {}", raw_line);
            return None;
        }
        self.last_placement_line = Some(raw_line.to_string());

        let delta = self.current_quantity();

        // Next placement without a fresh observation must not inherit this count
        self.preferred_quantity = DEFAULT_QUANTITY;
        self.fallback_quantity = DEFAULT_QUANTITY;

        Some(InventoryDelta { color, delta })
    }

    /// Quantity a placement would book right now: preferred, else fallback
    pub fn current_quantity(&self) -> u32 {
        if self.preferred_quantity > 0 {
            self.preferred_quantity
        } else {
            self.fallback_quantity
        }
    }

    pub fn preferred_quantity(&self) -> u32 {
        self.preferred_quantity
    }

    pub fn fallback_quantity(&self) -> u32 {
        self.fallback_quantity
    }

    pub fn snapshot(&self) -> CountSnapshot {
        CountSnapshot {
            preferred_quantity: self.preferred_quantity,
            fallback_quantity: self.fallback_quantity,
            last_placement_line: self.last_placement_line.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::TelemetryClassifier;

    fn feed(aggregator: &mut CountAggregator, raw_line: &str) -> Vec<InventoryDelta> {
        let classifier = TelemetryClassifier::new().unwrap();
        classifier
            .classify(raw_line)
            .iter()
            .filter_map(|event| aggregator.apply(event))
            .collect()
    }

    #[test]
    fn starts_at_one() {
        let aggregator = CountAggregator::new();
        assert_eq!(aggregator.preferred_quantity(), 1);
        assert_eq!(aggregator.fallback_quantity(), 1);
        assert_eq!(aggregator.snapshot().last_placement_line, None);
    }

    #[test]
    fn placement_uses_observed_quantity_then_resets() {
        let mut aggregator = CountAggregator::new();
        assert!(feed(&mut aggregator, "STEP EyesLocate DONE cnt=5").is_empty());
        assert!(feed(&mut aggregator, "DATA EyesWorkpCount=9").is_empty());
        assert_eq!(aggregator.preferred_quantity(), 5);
        assert_eq!(aggregator.fallback_quantity(), 9);

        let deltas = feed(&mut aggregator, "STEP Place DONE color=BLUE");
        assert_eq!(deltas, vec![InventoryDelta { color: Color::Blue, delta: 5 }]);
        assert_eq!(aggregator.preferred_quantity(), 1);
        assert_eq!(aggregator.fallback_quantity(), 1);

        // No fresh observation: the next placement books 1
        let deltas = feed(&mut aggregator, "STEP Place DONE color=RED");
        assert_eq!(deltas, vec![InventoryDelta { color: Color::Red, delta: 1 }]);
    }

    #[test]
    fn identical_placement_line_is_booked_once() {
        let mut aggregator = CountAggregator::new();
        feed(&mut aggregator, "STEP EyesLocate DONE cnt=3");

        let first = feed(&mut aggregator, "STEP Place DONE color=RED");
        let second = feed(&mut aggregator, "STEP Place DONE color=RED");
        assert_eq!(first, vec![InventoryDelta { color: Color::Red, delta: 3 }]);
        assert!(second.is_empty());
        assert_eq!(
            aggregator.snapshot().last_placement_line.as_deref(),
            Some("STEP Place DONE color=RED")
        );
    }

    #[test]
    fn duplicate_does_not_consume_pending_quantity() {
        let mut aggregator = CountAggregator::new();
        feed(&mut aggregator, "STEP Place DONE color=GREEN");
        feed(&mut aggregator, "STEP EyesLocate DONE cnt=7");

        assert!(feed(&mut aggregator, "STEP Place DONE color=GREEN").is_empty());
        assert_eq!(aggregator.preferred_quantity(), 7);

        let deltas = feed(&mut aggregator, "STEP Place DONE color=green");
        assert_eq!(deltas, vec![InventoryDelta { color: Color::Green, delta: 7 }]);
    }

    #[test]
    fn embedded_break_applies_quantity_before_placement() {
        let mut aggregator = CountAggregator::new();
        let deltas =
            feed(&mut aggregator, "STEP EyesLocate DONE cnt=2\nSTEP Place DONE color=GREEN");
        assert_eq!(deltas, vec![InventoryDelta { color: Color::Green, delta: 2 }]);
    }

    #[test]
    fn out_of_range_values_leave_state_unchanged() {
        let mut aggregator = CountAggregator::new();
        aggregator.observe_quantity(QuantitySource::Preferred, 12);
        aggregator.observe_quantity(QuantitySource::Preferred, 0);
        aggregator.observe_quantity(QuantitySource::Fallback, 201);
        assert_eq!(aggregator.preferred_quantity(), 12);
        assert_eq!(aggregator.fallback_quantity(), 1);

        // Unparseable telemetry never reaches the aggregator
        feed(&mut aggregator, "STEP EyesLocate DONE cnt=lots");
        assert_eq!(aggregator.preferred_quantity(), 12);
    }

    #[test]
    fn acknowledgements_do_not_touch_counts() {
        let mut aggregator = CountAggregator::new();
        feed(&mut aggregator, "STEP EyesLocate DONE cnt=4");
        assert!(feed(&mut aggregator, "RUN blaa_26 END").is_empty());
        assert!(feed(&mut aggregator, "hello robot").is_empty());
        assert_eq!(aggregator.preferred_quantity(), 4);
    }
}
