use crate::detect::{bands, DetectionContext, DetectionResult, DetectionType, Detector, Severity};
use crate::metrics::MetricSample;

/// Flags sudden spikes or drops against the most recent historical value.
pub struct RateOfChangeDetector;

impl Detector for RateOfChangeDetector {
    fn kind(&self) -> DetectionType {
        DetectionType::RateOfChange
    }

    fn detect(&self, sample: &MetricSample, ctx: &DetectionContext<'_>) -> DetectionResult {
        let value = sample.value;
        let previous = match ctx.history.last().copied() {
            Some(p) if p != 0.0 => p,
            _ => {
                return DetectionResult::normal(
                    DetectionType::RateOfChange,
                    value,
                    "No previous value available for rate of change analysis",
                );
            }
        };

        let change = (value - previous) * 100.0 / previous.abs();
        let spike_threshold = ctx.config.deviation_percentage_threshold;

        if change.abs() <= spike_threshold {
            return DetectionResult::normal(
                DetectionType::RateOfChange,
                value,
                format!("Rate of change within limits ({change:.1}%)"),
            )
            .with_expected(previous)
            .with_threshold(spike_threshold)
            .with_deviation(change);
        }

        let direction = if change > 0.0 { "spike" } else { "drop" };
        let severity = bands::RATE_OF_CHANGE.classify(change.abs(), 1.0);
        let description = match severity {
            Severity::Critical => {
                format!("Critical {direction}: {change:.1}% change ({previous:.2} -> {value:.2})")
            }
            Severity::High => {
                format!("Severe {direction}: {change:.1}% change ({previous:.2} -> {value:.2})")
            }
            _ => format!("Sudden {direction}: {change:.1}% change ({previous:.2} -> {value:.2})"),
        };

        DetectionResult::anomaly(DetectionType::RateOfChange, severity, value, description)
            .with_expected(previous)
            .with_threshold(spike_threshold)
            .with_deviation(change)
    }
}
