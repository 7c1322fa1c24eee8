use crate::detect::{DetectionContext, DetectionResult, DetectionType, Detector, Severity};
use crate::metrics::MetricSample;

/// Static bound checks. Precedence: critical, warning, max, min.
pub struct ThresholdDetector;

impl Detector for ThresholdDetector {
    fn kind(&self) -> DetectionType {
        DetectionType::Threshold
    }

    fn detect(&self, sample: &MetricSample, ctx: &DetectionContext<'_>) -> DetectionResult {
        let value = sample.value;
        let cfg = ctx.config;
        let hit = |bound: f64, severity: Severity, description: String| {
            DetectionResult::anomaly(DetectionType::Threshold, severity, value, description)
                .with_threshold(bound)
        };

        if let Some(bound) = cfg.critical_threshold.filter(|b| value >= *b) {
            return hit(
                bound,
                Severity::Critical,
                format!("Value {value:.2} exceeds critical threshold {bound:.2}"),
            );
        }
        if let Some(bound) = cfg.warning_threshold.filter(|b| value >= *b) {
            return hit(
                bound,
                Severity::High,
                format!("Value {value:.2} exceeds warning threshold {bound:.2}"),
            );
        }
        if let Some(bound) = cfg.max_threshold.filter(|b| value > *b) {
            return hit(
                bound,
                Severity::Medium,
                format!("Value {value:.2} exceeds max threshold {bound:.2}"),
            );
        }
        if let Some(bound) = cfg.min_threshold.filter(|b| value < *b) {
            return hit(
                bound,
                Severity::Medium,
                format!("Value {value:.2} below min threshold {bound:.2}"),
            );
        }

        DetectionResult::normal(DetectionType::Threshold, value, "Value within configured thresholds")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::testing::{config, sample};
    use crate::metrics::MetricType;

    fn run(value: f64, setup: impl FnOnce(&mut crate::detect::ThresholdConfig)) -> DetectionResult {
        let mut cfg = config(MetricType::Custom);
        setup(&mut cfg);
        let ctx = DetectionContext {
            config: &cfg,
            history: &[],
        };
        ThresholdDetector.detect(&sample(value), &ctx)
    }

    #[test]
    fn test_critical_takes_precedence_over_every_lower_bound() {
        for value in [95.0, 100.0, 1_000.0] {
            let r = run(value, |c| {
                c.warning_threshold = Some(80.0);
                c.critical_threshold = Some(95.0);
                c.max_threshold = Some(90.0);
            });
            assert!(r.anomaly_detected);
            assert_eq!(r.severity, Some(Severity::Critical));
            assert_eq!(r.threshold_value, Some(95.0));
        }
    }

    #[test]
    fn test_warning_is_inclusive() {
        let r = run(80.0, |c| {
            c.warning_threshold = Some(80.0);
            c.critical_threshold = Some(95.0);
        });
        assert_eq!(r.severity, Some(Severity::High));
        assert_eq!(r.description, "Value 80.00 exceeds warning threshold 80.00");
    }

    #[test]
    fn test_max_is_exclusive_and_min_is_exclusive() {
        let at_max = run(90.0, |c| c.max_threshold = Some(90.0));
        assert!(!at_max.anomaly_detected);
        let over_max = run(90.5, |c| c.max_threshold = Some(90.0));
        assert_eq!(over_max.severity, Some(Severity::Medium));

        let at_min = run(1.0, |c| c.min_threshold = Some(1.0));
        assert!(!at_min.anomaly_detected);
        let under_min = run(0.5, |c| c.min_threshold = Some(1.0));
        assert_eq!(under_min.severity, Some(Severity::Medium));
        assert_eq!(under_min.description, "Value 0.50 below min threshold 1.00");
    }

    #[test]
    fn test_unset_bounds_never_fire() {
        let r = run(1.0e9, |_| {});
        assert!(!r.anomaly_detected);
        assert!(r.severity.is_none());
    }
}
