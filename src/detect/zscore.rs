use crate::detect::baseline::TimeSeries;
use crate::detect::{bands, DetectError, DetectionContext, DetectionResult, DetectionType, Detector, Severity};
use crate::metrics::MetricSample;

/// Flags values far from the historical mean in units of standard deviation.
pub struct ZScoreDetector;

impl Detector for ZScoreDetector {
    fn kind(&self) -> DetectionType {
        DetectionType::ZScore
    }

    fn detect(&self, sample: &MetricSample, ctx: &DetectionContext<'_>) -> DetectionResult {
        let value = sample.value;
        let threshold = ctx.config.z_score_threshold;
        let series = TimeSeries::new(ctx.history);

        let z = match series.z_score(value, ctx.config.min_samples_required as usize) {
            Ok(z) => z,
            Err(DetectError::InsufficientBaseline { .. }) => {
                return DetectionResult::normal(
                    DetectionType::ZScore,
                    value,
                    "Insufficient historical data for z-score analysis",
                );
            }
            Err(DetectError::ZeroVariance) => {
                return DetectionResult::normal(
                    DetectionType::ZScore,
                    value,
                    "Standard deviation is zero, cannot calculate z-score",
                )
                .with_expected(series.mean());
            }
        };

        let mean = series.mean();
        let deviation = if mean != 0.0 {
            (value - mean) * 100.0 / mean.abs()
        } else {
            0.0
        };

        if z.abs() <= threshold {
            return DetectionResult::normal(
                DetectionType::ZScore,
                value,
                format!("Value within normal range (z-score: {z:.2})"),
            )
            .with_expected(mean)
            .with_threshold(threshold)
            .with_deviation(deviation)
            .with_z_score(z);
        }

        let severity = bands::Z_SCORE.classify(z.abs(), threshold);
        let description = match severity {
            Severity::Critical => format!("Extreme deviation: z-score {z:.2} (threshold: {threshold:.2})"),
            Severity::High => format!("High deviation: z-score {z:.2} (threshold: {threshold:.2})"),
            _ => format!("Statistical anomaly: z-score {z:.2} exceeds threshold {threshold:.2}"),
        };

        DetectionResult::anomaly(DetectionType::ZScore, severity, value, description)
            .with_expected(mean)
            .with_threshold(threshold)
            .with_deviation(deviation)
            .with_z_score(z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::testing::{config, sample};
    use crate::metrics::MetricType;

    /// Ten values with mean 10 and population stddev 1.
    fn unit_history() -> Vec<f64> {
        (0..10).map(|i| if i % 2 == 0 { 9.0 } else { 11.0 }).collect()
    }

    fn run(value: f64, history: &[f64]) -> DetectionResult {
        let cfg = config(MetricType::Custom);
        let ctx = DetectionContext {
            config: &cfg,
            history,
        };
        ZScoreDetector.detect(&sample(value), &ctx)
    }

    #[test]
    fn test_identical_history_cannot_calculate() {
        let history = vec![42.0; 20];
        for value in [0.0, 42.0, 1.0e6] {
            let r = run(value, &history);
            assert!(!r.anomaly_detected);
            assert!(r.description.contains("cannot calculate"));
            assert_eq!(r.expected_value, Some(42.0));
        }
    }

    #[test]
    fn test_insufficient_history() {
        let r = run(100.0, &[1.0, 2.0, 3.0]);
        assert!(!r.anomaly_detected);
        assert_eq!(r.description, "Insufficient historical data for z-score analysis");
    }

    #[test]
    fn test_threshold_is_strict() {
        let r = run(13.0, &unit_history());
        assert!(!r.anomaly_detected);
        assert_eq!(r.z_score, Some(3.0));
    }

    #[test]
    fn test_severity_bands() {
        let history = unit_history();

        let medium = run(13.5, &history);
        assert_eq!(medium.severity, Some(Severity::Medium));
        assert_eq!(medium.description, "Statistical anomaly: z-score 3.50 exceeds threshold 3.00");

        let high = run(15.0, &history);
        assert_eq!(high.severity, Some(Severity::High));

        let critical = run(16.5, &history);
        assert_eq!(critical.severity, Some(Severity::Critical));
        assert_eq!(critical.expected_value, Some(10.0));
        assert_eq!(critical.deviation_percentage, Some(65.0));
    }

    #[test]
    fn test_negative_deviation_is_anomalous() {
        let r = run(4.0, &unit_history());
        assert_eq!(r.severity, Some(Severity::High));
        assert_eq!(r.z_score, Some(-6.0));
    }
}
