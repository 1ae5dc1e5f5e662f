//! Plan configuration: the declarative description of a federation, read
//! once at coordinator construction.

use crate::types::TaskGroup;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignerKind {
    DynamicRandomGrouped,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StragglerPolicyConfig {
    CutoffTime {
        straggler_cutoff_time_secs: f64,
        minimum_reporting: usize,
    },
    Percentage {
        threshold: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionPipelineKind {
    None,
    Zstd,
    Lz4,
    Snappy,
    Quantized,
}

/// Bounds and default for a single per-task, per-round dynamic argument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DynamicTaskArgSpec {
    pub min: f64,
    pub max: f64,
    pub value: f64,
}

/// `admin_cn → { allowed admin RPC endpoint names }`.
pub type AdminEndpointsMapping = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    pub federation_uuid: String,
    pub authorized_cols: Vec<String>,
    pub admins_endpoints_mapping: AdminEndpointsMapping,
    pub init_state_path: PathBuf,
    pub best_state_path: PathBuf,
    pub last_state_path: PathBuf,
    pub assigner: AssignerKind,
    pub task_groups: Vec<TaskGroup>,
    pub straggler_handling_policy: StragglerPolicyConfig,
    pub rounds_to_train: u64,
    pub db_store_rounds: u64,
    pub compression_pipeline: CompressionPipelineKind,
    #[serde(default)]
    pub dynamictaskargs: HashMap<String, HashMap<String, DynamicTaskArgSpec>>,
}

impl PlanConfig {
    /// Validates the invariant that task-group percentages sum to 1.0 ± 0.01 (I6 precondition).
    pub fn validate(&self) -> Result<(), String> {
        let total: f64 = self.task_groups.iter().map(|g| g.percentage).sum();
        if (total - 1.0).abs() > 0.01 {
            return Err(format!(
                "task group percentages must sum to 1.0 +/- 0.01, got {total}"
            ));
        }
        Ok(())
    }
}
