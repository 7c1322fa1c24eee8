use crate::detect::baseline::TimeSeries;
use crate::detect::{bands, DetectionContext, DetectionResult, DetectionType, Detector, Severity};
use crate::metrics::MetricSample;

/// Flags values deviating from the window average by more than the
/// configured percentage.
pub struct MovingAverageDetector;

/// Percentage distance of `value` from `average`.
pub fn deviation_percentage(value: f64, average: f64) -> f64 {
    if average == 0.0 {
        return if value == 0.0 { 0.0 } else { 100.0 };
    }
    (value - average).abs() * 100.0 / average.abs()
}

impl Detector for MovingAverageDetector {
    fn kind(&self) -> DetectionType {
        DetectionType::MovingAverage
    }

    fn detect(&self, sample: &MetricSample, ctx: &DetectionContext<'_>) -> DetectionResult {
        let value = sample.value;
        let series = TimeSeries::new(ctx.history);
        if series
            .require(ctx.config.min_samples_required as usize)
            .is_err()
        {
            return DetectionResult::normal(
                DetectionType::MovingAverage,
                value,
                "Insufficient data for moving average analysis",
            );
        }

        let average = series.mean();
        let threshold = ctx.config.deviation_percentage_threshold;
        let deviation = deviation_percentage(value, average);
        let direction = if value > average { "above" } else { "below" };

        if deviation <= threshold {
            return DetectionResult::normal(
                DetectionType::MovingAverage,
                value,
                format!("Value within {deviation:.1}% of moving average"),
            )
            .with_expected(average)
            .with_threshold(threshold)
            .with_deviation(deviation);
        }

        let severity = bands::MOVING_AVERAGE.classify(deviation, threshold);
        let description = match severity {
            Severity::Critical => format!(
                "Critical deviation: {deviation:.1}% {direction} moving average ({value:.2} vs avg {average:.2})"
            ),
            Severity::High => format!(
                "High deviation: {deviation:.1}% {direction} moving average ({value:.2} vs avg {average:.2})"
            ),
            _ => format!(
                "Moving average anomaly: {deviation:.1}% {direction} average ({value:.2} vs avg {average:.2})"
            ),
        };

        DetectionResult::anomaly(DetectionType::MovingAverage, severity, value, description)
            .with_expected(average)
            .with_threshold(threshold)
            .with_deviation(deviation)
    }
}
