//! Core value types shared across the coordinator: composite tensor and
//! task-result identities, the opaque tensor buffer, and task/group records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An immutable, structurally-hashable composite identifier for a tensor.
///
/// `tags` ordering is significant for equality (per the federation's wire
/// protocol, a tag list is canonicalized by the emitter) but carries no
/// other semantics the coordinator interprets beyond membership checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorKey {
    pub tensor_name: String,
    pub origin: String,
    pub round_number: u64,
    pub report: bool,
    pub tags: Vec<String>,
}

impl TensorKey {
    pub fn new(
        tensor_name: impl Into<String>,
        origin: impl Into<String>,
        round_number: u64,
        report: bool,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            tensor_name: tensor_name.into(),
            origin: origin.into(),
            round_number,
            report,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Returns a copy of this key with `tag` appended to the tag list.
    pub fn with_tag_added(&self, tag: impl Into<String>) -> Self {
        let mut tags = self.tags.clone();
        tags.push(tag.into());
        Self { tags, ..self.clone() }
    }

    /// Returns a copy of this key with every occurrence of `tag` removed.
    pub fn with_tag_removed(&self, tag: &str) -> Self {
        let tags = self.tags.iter().filter(|t| t.as_str() != tag).cloned().collect();
        Self { tags, ..self.clone() }
    }

    /// Returns a copy of this key with its tag list replaced wholesale.
    pub fn with_tags(&self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..self.clone()
        }
    }

    pub fn with_round(&self, round_number: u64) -> Self {
        Self { round_number, ..self.clone() }
    }
}

impl fmt::Display for TensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}#r{}[{}]",
            self.tensor_name,
            self.origin,
            self.round_number,
            self.tags.join(".")
        )
    }
}

/// Identifies a single collaborator's submission for one task of one round.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskResultKey {
    pub task_name: String,
    pub owner: String,
    pub round_number: u64,
}

impl TaskResultKey {
    pub fn new(task_name: impl Into<String>, owner: impl Into<String>, round_number: u64) -> Self {
        Self {
            task_name: task_name.into(),
            owner: owner.into(),
            round_number,
        }
    }
}

/// Per-tensor metadata emitted by the codec pipeline (int/float scale
/// factors and auxiliary lists needed to reconstruct a lossily-compressed
/// tensor). Opaque to everything except the codec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformerMetadata {
    pub int_to_float: std::collections::HashMap<i64, f32>,
    pub int_list: Vec<i64>,
    pub bool_list: Vec<bool>,
}

/// An opaque multi-dimensional numeric buffer. The coordinator never
/// interprets the contents directly; it only moves, compresses, diffs and
/// aggregates them via the codec (C3) and aggregation (§4.1/§4.6) layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
    pub metadata: Vec<TransformerMetadata>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values, metadata: Vec::new() }
    }

    pub fn scalar(value: f32) -> Self {
        Self::new(vec![1], vec![value])
    }

    pub fn zeros_like(&self) -> Self {
        Self::new(self.shape.clone(), vec![0.0; self.values.len()])
    }
}

/// A single collaborator's contribution to a tensor aggregation, carrying
/// its unnormalized data-size weight alongside the value. Mirrors OpenFL's
/// `LocalTensor` namedtuple.
#[derive(Debug, Clone)]
pub struct LocalTensor {
    pub col_name: String,
    pub tensor: Tensor,
    pub weight: f32,
}

/// A name/value metric pair, as reported by a collaborator or synthesized
/// by the aggregator. Mirrors OpenFL's `Metric` namedtuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f32,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f32) -> Self {
        Self { name: name.into(), value }
    }
}

/// How a task's results from multiple collaborators are combined into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationType {
    WeightedAverage,
    Median,
    TrimmedMean,
}

impl Default for AggregationType {
    fn default() -> Self {
        AggregationType::WeightedAverage
    }
}

/// What kind of work a task performs. Only this distinction (and the task
/// `name`) is inspected by the coordinator; every other field is opaque
/// and passed through to collaborators unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    Train,
    Validate,
}

/// A single unit of work assigned to collaborators. Supports the legacy
/// bare-name form for backward compatibility; new plans should only ever
/// emit the record form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Task {
    Bare(String),
    Record {
        name: String,
        #[serde(default)]
        function_name: Option<String>,
        task_type: TaskType,
        #[serde(default)]
        apply_local: bool,
    },
}

impl Task {
    pub fn name(&self) -> &str {
        match self {
            Task::Bare(name) => name,
            Task::Record { name, .. } => name,
        }
    }

    pub fn task_type(&self) -> Option<TaskType> {
        match self {
            Task::Bare(_) => None,
            Task::Record { task_type, .. } => Some(*task_type),
        }
    }
}

/// A declarative bundle assigning the same task list to a random fraction
/// of the assignees for a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub percentage: f64,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub aggregation_type: AggregationType,
}
