//! Tensor Database (C2): keyed tensor cache with round-based eviction and
//! weighted aggregation lookup. Guarded by its own lock, independent of the
//! coordinator-wide round-state mutex (spec §5).

use crate::aggregation::AggregationFunction;
use crate::error::{CoordinatorError, Result};
use crate::types::{LocalTensor, Tensor, TensorKey};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DynamicArgKey {
    pub task_name: String,
    pub arg_name: String,
    pub round_number: u64,
    pub agg_id: String,
}

#[derive(Default)]
pub struct TensorDb {
    tensors: RwLock<HashMap<TensorKey, Tensor>>,
    dynamic_args: RwLock<HashMap<DynamicArgKey, f64>>,
    round_index: RwLock<HashMap<u64, HashSet<TensorKey>>>,
}

impl TensorDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches `tensor` under `key`, overwriting any previous value.
    pub fn cache(&self, key: TensorKey, tensor: Tensor) {
        self.round_index
            .write()
            .entry(key.round_number)
            .or_default()
            .insert(key.clone());
        self.tensors.write().insert(key, tensor);
    }

    pub fn get(&self, key: &TensorKey) -> Option<Tensor> {
        self.tensors.read().get(key).cloned()
    }

    pub fn contains(&self, key: &TensorKey) -> bool {
        self.tensors.read().contains_key(key)
    }

    /// All tensors tagged `tag` for the given `origin`/`round_number`, used
    /// to snapshot the `model`-tagged tensors into a checkpoint file.
    pub fn snapshot_round(&self, origin: &str, round_number: u64, tag: &str) -> HashMap<TensorKey, Tensor> {
        self.tensors
            .read()
            .iter()
            .filter(|(k, _)| k.origin == origin && k.round_number == round_number && k.has_tag(tag))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Aggregates the per-collaborator versions of `template` (a key
    /// carrying no collaborator tag) using `weights`, normalised to sum 1.
    /// Fails with `MissingContributor` if any weighted collaborator has no
    /// cached tensor for the synthesized key.
    pub fn aggregate(
        &self,
        template: &TensorKey,
        weights: &HashMap<String, f64>,
        function: &dyn AggregationFunction,
    ) -> Result<Tensor> {
        let total: f64 = weights.values().sum();
        if total <= 0.0 {
            return Err(CoordinatorError::MissingContributor {
                tensor_name: template.tensor_name.clone(),
                collaborator: "<none>".to_string(),
            });
        }

        let tensors = self.tensors.read();
        let mut contributions = Vec::with_capacity(weights.len());
        for (collab, weight) in weights {
            let key = template.with_tag_added(collab.clone());
            let tensor = tensors.get(&key).ok_or_else(|| CoordinatorError::MissingContributor {
                tensor_name: template.tensor_name.clone(),
                collaborator: collab.clone(),
            })?;
            contributions.push(LocalTensor {
                col_name: collab.clone(),
                tensor: tensor.clone(),
                weight: (weight / total) as f32,
            });
        }
        drop(tensors);

        function.aggregate(&contributions)
    }

    /// Deletes every tensor whose `round_number < current_round - window`.
    pub fn evict(&self, current_round: u64, window: u64) {
        let cutoff = current_round.saturating_sub(window);
        let mut round_index = self.round_index.write();
        let mut tensors = self.tensors.write();

        let expired: Vec<u64> = round_index.keys().copied().filter(|&r| r < cutoff).collect();
        for round in expired {
            if let Some(keys) = round_index.remove(&round) {
                for key in keys {
                    tensors.remove(&key);
                }
            }
        }
    }

    pub fn cache_dynamic_arg(&self, key: DynamicArgKey, value: f64) {
        self.dynamic_args.write().insert(key, value);
    }

    pub fn get_dynamic_arg(&self, key: &DynamicArgKey) -> Option<f64> {
        self.dynamic_args.read().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.tensors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::WeightedAverage;

    fn key(round: u64) -> TensorKey {
        TensorKey::new("w", "agg", round, false, ["model"])
    }

    #[test]
    fn cache_and_get_round_trip() {
        let db = TensorDb::new();
        let k = key(0);
        let t = Tensor::new(vec![2], vec![1.0, 2.0]);
        db.cache(k.clone(), t.clone());
        assert_eq!(db.get(&k), Some(t));
    }

    #[test]
    fn aggregate_fails_on_missing_contributor() {
        let db = TensorDb::new();
        let template = key(1);
        db.cache(template.with_tag_added("a"), Tensor::new(vec![1], vec![1.0]));

        let mut weights = HashMap::new();
        weights.insert("a".to_string(), 1.0);
        weights.insert("b".to_string(), 1.0);

        let err = db.aggregate(&template, &weights, &WeightedAverage).unwrap_err();
        assert!(matches!(err, CoordinatorError::MissingContributor { .. }));
    }

    #[test]
    fn aggregate_weighted_average() {
        let db = TensorDb::new();
        let template = key(1);
        db.cache(template.with_tag_added("a"), Tensor::scalar(1.0));
        db.cache(template.with_tag_added("b"), Tensor::scalar(3.0));

        let mut weights = HashMap::new();
        weights.insert("a".to_string(), 1.0);
        weights.insert("b".to_string(), 1.0);

        let result = db.aggregate(&template, &weights, &WeightedAverage).unwrap();
        assert!((result.values[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn evict_drops_old_rounds_only() {
        let db = TensorDb::new();
        db.cache(key(0), Tensor::scalar(1.0));
        db.cache(key(1), Tensor::scalar(2.0));
        db.cache(key(2), Tensor::scalar(3.0));

        db.evict(2, 1);

        assert!(db.get(&key(0)).is_none());
        assert!(db.get(&key(1)).is_some());
        assert!(db.get(&key(2)).is_some());
    }
}
