//! Pluggable per-task aggregation functions, generalized from the teacher
//! crate's `AggregationStrategy` enum into a trait so custom functions can
//! be registered per task without touching the tensor database.

use crate::error::{CoordinatorError, Result};
use crate::types::{LocalTensor, Tensor};

pub trait AggregationFunction: Send + Sync {
    fn aggregate(&self, contributions: &[LocalTensor]) -> Result<Tensor>;
}

/// Required for `metric`-tagged tensors (spec §4.6 step 1) and the default
/// for task-declared aggregation otherwise.
pub struct WeightedAverage;

impl AggregationFunction for WeightedAverage {
    fn aggregate(&self, contributions: &[LocalTensor]) -> Result<Tensor> {
        let first = contributions
            .first()
            .ok_or_else(|| CoordinatorError::Codec("no contributions to aggregate".into()))?;
        let len = first.tensor.values.len();
        let mut accumulated = vec![0.0f32; len];

        for contribution in contributions {
            if contribution.tensor.values.len() != len {
                return Err(CoordinatorError::Codec("tensor shape mismatch in aggregation".into()));
            }
            for (acc, value) in accumulated.iter_mut().zip(contribution.tensor.values.iter()) {
                *acc += value * contribution.weight;
            }
        }

        Ok(Tensor { shape: first.tensor.shape.clone(), values: accumulated, metadata: Vec::new() })
    }
}

/// Elementwise median across contributions, ignoring weights. A supplemental
/// built-in carried over from the teacher's aggregation strategy set.
pub struct Median;

impl AggregationFunction for Median {
    fn aggregate(&self, contributions: &[LocalTensor]) -> Result<Tensor> {
        let first = contributions
            .first()
            .ok_or_else(|| CoordinatorError::Codec("no contributions to aggregate".into()))?;
        let len = first.tensor.values.len();
        let mut result = vec![0.0f32; len];

        for i in 0..len {
            let mut values: Vec<f32> = contributions
                .iter()
                .map(|c| c.tensor.values[i])
                .collect();
            values.sort_by(f32::total_cmp);
            let mid = values.len() / 2;
            result[i] = if values.len() % 2 == 0 {
                (values[mid - 1] + values[mid]) / 2.0
            } else {
                values[mid]
            };
        }

        Ok(Tensor { shape: first.tensor.shape.clone(), values: result, metadata: Vec::new() })
    }
}

/// Drops the top and bottom `trim_fraction` of contributions per element
/// before weighted-averaging the remainder.
pub struct TrimmedMean {
    pub trim_fraction: f32,
}

impl AggregationFunction for TrimmedMean {
    fn aggregate(&self, contributions: &[LocalTensor]) -> Result<Tensor> {
        let first = contributions
            .first()
            .ok_or_else(|| CoordinatorError::Codec("no contributions to aggregate".into()))?;
        let len = first.tensor.values.len();
        let trim = ((contributions.len() as f32) * self.trim_fraction).floor() as usize;
        let mut result = vec![0.0f32; len];

        for i in 0..len {
            let mut values: Vec<f32> = contributions.iter().map(|c| c.tensor.values[i]).collect();
            values.sort_by(f32::total_cmp);
            let kept = &values[trim.min(values.len())..values.len().saturating_sub(trim)];
            let kept = if kept.is_empty() { &values[..] } else { kept };
            result[i] = kept.iter().sum::<f32>() / kept.len() as f32;
        }

        Ok(Tensor { shape: first.tensor.shape.clone(), values: result, metadata: Vec::new() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(value: f32, weight: f32) -> LocalTensor {
        LocalTensor { col_name: "c".to_string(), tensor: Tensor::scalar(value), weight }
    }

    #[test]
    fn weighted_average_respects_weights() {
        let contributions = vec![contribution(10.0, 0.25), contribution(2.0, 0.75)];
        let result = WeightedAverage.aggregate(&contributions).unwrap();
        assert!((result.values[0] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn median_ignores_weight() {
        let contributions = vec![
            contribution(1.0, 0.1),
            contribution(100.0, 0.8),
            contribution(2.0, 0.1),
        ];
        let result = Median.aggregate(&contributions).unwrap();
        assert!((result.values[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn median_does_not_panic_on_nan_contribution() {
        let contributions = vec![contribution(1.0, 0.1), contribution(f32::NAN, 0.8), contribution(2.0, 0.1)];
        let result = Median.aggregate(&contributions).unwrap();
        assert!(result.values[0].is_finite() || result.values[0].is_nan());
    }

    #[test]
    fn trimmed_mean_does_not_panic_on_nan_contribution() {
        let contributions = vec![
            contribution(1.0, 0.25),
            contribution(f32::NAN, 0.25),
            contribution(2.0, 0.25),
            contribution(3.0, 0.25),
        ];
        let result = TrimmedMean { trim_fraction: 0.25 }.aggregate(&contributions).unwrap();
        let _ = result.values[0];
    }
}
