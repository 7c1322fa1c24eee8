use crate::detect::DetectError;

/// A borrowed window of historical values for statistical analysis.
pub struct TimeSeries<'a> {
    values: &'a [f64],
}

impl<'a> TimeSeries<'a> {
    pub fn new(values: &'a [f64]) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Most recent value.
    pub fn last(&self) -> Option<f64> {
        self.values.last().copied()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self
            .values
            .iter()
            .map(|&x| (x - mean).powi(2))
            .sum();
        sum_sq_diff / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Fails unless the series holds at least `min_samples` values (and at
    /// least one).
    pub fn require(&self, min_samples: usize) -> Result<(), DetectError> {
        let needed = min_samples.max(1);
        if self.values.len() < needed {
            return Err(DetectError::InsufficientBaseline {
                needed,
                have: self.values.len(),
            });
        }
        Ok(())
    }

    /// Calculate the Z-score of a value relative to this series.
    /// Z = (value - mean) / std_dev
    pub fn z_score(&self, value: f64, min_samples: usize) -> Result<f64, DetectError> {
        self.require(min_samples)?;
        let std = self.std_dev();
        if std == 0.0 {
            return Err(DetectError::ZeroVariance);
        }
        Ok((value - self.mean()) / std)
    }
}
