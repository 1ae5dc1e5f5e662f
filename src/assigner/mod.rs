//! Task Assigner (C5): per-round collaborator→tasks and task→collaborators
//! maps, built from a declarative group configuration.

pub mod dynamic_random_grouped;

pub use dynamic_random_grouped::DynamicRandomGroupedAssigner;

use crate::types::{AggregationType, Task};
use async_trait::async_trait;

#[async_trait]
pub trait Assigner: Send + Sync {
    async fn get_tasks_for_collaborator(&self, collaborator: &str, round: u64) -> Vec<Task>;
    async fn get_collaborators_for_task(&self, task_name: &str, round: u64) -> Vec<String>;
    async fn get_all_tasks_for_round(&self, round: u64) -> Vec<String>;
    async fn get_aggregation_type_for_task(&self, task_name: &str) -> AggregationType;
    async fn get_assigned_collaborators(&self) -> Vec<String>;
    async fn end_of_round(&self, available: Vec<String>, stragglers: Vec<String>, next_round: u64);
    async fn add_collaborator(&self, collaborator: String);
    async fn remove_collaborator(&self, collaborator: &str);
}
