//! Severity banding tables.
//!
//! Each detector grades the magnitude of a positive detection against an
//! ordered list of `(multiplier, severity)` pairs. Bands are checked top-down
//! with a strict `>` against `base * multiplier`; the first band exceeded
//! wins and anything below every band gets the floor severity.

use crate::detect::Severity;

#[derive(Debug, Clone, Copy)]
pub struct SeverityBands {
    bands: &'static [(f64, Severity)],
    floor: Severity,
}

/// Multiples of the configured z-score threshold.
pub const Z_SCORE: SeverityBands = SeverityBands::new(
    &[(2.0, Severity::Critical), (1.5, Severity::High)],
    Severity::Medium,
);

/// Multiples of the configured deviation percentage.
pub const MOVING_AVERAGE: SeverityBands = SeverityBands::new(
    &[(3.0, Severity::Critical), (2.0, Severity::High)],
    Severity::Medium,
);

/// Absolute change percentages; classify with a base of 1.0.
pub const RATE_OF_CHANGE: SeverityBands = SeverityBands::new(
    &[(200.0, Severity::Critical), (100.0, Severity::High)],
    Severity::Medium,
);

impl SeverityBands {
    pub const fn new(bands: &'static [(f64, Severity)], floor: Severity) -> Self {
        Self { bands, floor }
    }

    pub fn classify(&self, magnitude: f64, base: f64) -> Severity {
        self.bands
            .iter()
            .find(|(multiplier, _)| magnitude > base * multiplier)
            .map(|(_, severity)| *severity)
            .unwrap_or(self.floor)
    }
}
