//! Grounded on `DynamicRandomGroupedAssigner` from the original aggregator:
//! a changing roster of authorized collaborators is randomly partitioned
//! into task groups each round, re-planned only when the assignable set
//! actually changes between rounds.

use crate::assigner::Assigner;
use crate::error::{CoordinatorError, Result};
use crate::types::{AggregationType, Task, TaskGroup};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;

struct Inner {
    task_groups: Vec<TaskGroup>,
    authorized_cols: Vec<String>,
    collaborators_to_assign: Vec<String>,
    collaborator_tasks: HashMap<String, HashMap<u64, Vec<Task>>>,
    collaborators_for_task: HashMap<String, HashMap<u64, Vec<String>>>,
    rounds_to_train: u64,
}

pub struct DynamicRandomGroupedAssigner {
    inner: RwLock<Inner>,
}

impl DynamicRandomGroupedAssigner {
    pub fn new(
        task_groups: Vec<TaskGroup>,
        authorized_cols: Vec<String>,
        rounds_to_train: u64,
    ) -> Result<Self> {
        let total: f64 = task_groups.iter().map(|g| g.percentage).sum();
        if (total - 1.0).abs() > 0.01 {
            return Err(CoordinatorError::PartitionError);
        }

        let mut collaborator_tasks = HashMap::new();
        for col in &authorized_cols {
            collaborator_tasks.insert(col.clone(), HashMap::new());
        }
        let mut collaborators_for_task = HashMap::new();
        for group in &task_groups {
            for task in &group.tasks {
                collaborators_for_task
                    .entry(task.name().to_string())
                    .or_insert_with(HashMap::new);
            }
        }

        let mut inner = Inner {
            task_groups,
            authorized_cols: authorized_cols.clone(),
            collaborators_to_assign: authorized_cols,
            collaborator_tasks,
            collaborators_for_task,
            rounds_to_train,
        };
        Self::assign_tasks(&mut inner, 0)?;

        Ok(Self { inner: RwLock::new(inner) })
    }

    /// Randomly partitions `collaborators_to_assign` per task group for
    /// every round in `[from_round, rounds_to_train)`, re-shuffling
    /// independently each round.
    fn assign_tasks(inner: &mut Inner, from_round: u64) -> Result<()> {
        let to_assign = inner.collaborators_to_assign.clone();
        let assignable: std::collections::HashSet<&String> = to_assign.iter().collect();

        for col in &inner.authorized_cols {
            if !assignable.contains(col) {
                let entry = inner.collaborator_tasks.entry(col.clone()).or_default();
                for round in from_round..inner.rounds_to_train {
                    entry.insert(round, Vec::new());
                }
            }
        }

        for task_rounds in inner.collaborators_for_task.values_mut() {
            for round in from_round..inner.rounds_to_train {
                task_rounds.insert(round, Vec::new());
            }
        }

        let col_list_size = to_assign.len();
        let mut rng = rand::thread_rng();

        for round in from_round..inner.rounds_to_train {
            let mut permutation = to_assign.clone();
            permutation.shuffle(&mut rng);

            let mut col_idx = 0usize;
            let num_groups = inner.task_groups.len();
            for (i, group) in inner.task_groups.iter().enumerate() {
                let is_last = i + 1 == num_groups;
                let count = if is_last {
                    col_list_size.saturating_sub(col_idx)
                } else {
                    ((group.percentage * col_list_size as f64).floor() as usize)
                        .min(col_list_size - col_idx)
                };

                let selected: Vec<String> =
                    permutation[col_idx..col_idx + count].to_vec();

                for col in &selected {
                    inner
                        .collaborator_tasks
                        .entry(col.clone())
                        .or_default()
                        .insert(round, group.tasks.clone());
                }

                for task in &group.tasks {
                    inner
                        .collaborators_for_task
                        .entry(task.name().to_string())
                        .or_default()
                        .entry(round)
                        .or_default()
                        .extend(selected.iter().cloned());
                }

                col_idx += count;
            }

            if col_idx != col_list_size {
                return Err(CoordinatorError::PartitionError);
            }
        }

        Ok(())
    }

    pub fn authorized_cols(&self) -> Vec<String> {
        self.inner.read().authorized_cols.clone()
    }
}

#[async_trait]
impl Assigner for DynamicRandomGroupedAssigner {
    async fn get_tasks_for_collaborator(&self, collaborator: &str, round: u64) -> Vec<Task> {
        self.inner
            .read()
            .collaborator_tasks
            .get(collaborator)
            .and_then(|rounds| rounds.get(&round))
            .cloned()
            .unwrap_or_default()
    }

    async fn get_collaborators_for_task(&self, task_name: &str, round: u64) -> Vec<String> {
        self.inner
            .read()
            .collaborators_for_task
            .get(task_name)
            .and_then(|rounds| rounds.get(&round))
            .cloned()
            .unwrap_or_default()
    }

    async fn get_all_tasks_for_round(&self, round: u64) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .collaborators_for_task
            .iter()
            .filter(|(_, rounds)| rounds.get(&round).is_some_and(|c| !c.is_empty()))
            .map(|(name, _)| name.clone())
            .collect()
    }

    async fn get_aggregation_type_for_task(&self, task_name: &str) -> AggregationType {
        let inner = self.inner.read();
        inner
            .task_groups
            .iter()
            .find(|g| g.tasks.iter().any(|t| t.name() == task_name))
            .map(|g| g.aggregation_type)
            .unwrap_or_default()
    }

    async fn get_assigned_collaborators(&self) -> Vec<String> {
        self.inner.read().collaborators_to_assign.clone()
    }

    async fn end_of_round(&self, available: Vec<String>, stragglers: Vec<String>, next_round: u64) {
        let straggler_set: std::collections::HashSet<&String> = stragglers.iter().collect();
        let mut new_assignees: Vec<String> =
            available.into_iter().filter(|c| !straggler_set.contains(c)).collect();
        new_assignees.sort();

        let mut inner = self.inner.write();
        let mut current = inner.collaborators_to_assign.clone();
        current.sort();

        if current == new_assignees {
            return;
        }

        let mut new_assignees_unsorted = new_assignees;
        new_assignees_unsorted.sort();
        inner.collaborators_to_assign = new_assignees_unsorted;
        let _ = Self::assign_tasks(&mut inner, next_round);
    }

    async fn add_collaborator(&self, collaborator: String) {
        let mut inner = self.inner.write();
        if !inner.authorized_cols.contains(&collaborator) {
            inner.authorized_cols.push(collaborator.clone());
        }
        inner.collaborator_tasks.entry(collaborator).or_default();
    }

    async fn remove_collaborator(&self, collaborator: &str) {
        let mut inner = self.inner.write();
        inner.authorized_cols.retain(|c| c != collaborator);
        inner.collaborators_to_assign.retain(|c| c != collaborator);
        inner.collaborator_tasks.remove(collaborator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Task, TaskType};
    use proptest::prelude::*;

    fn groups() -> Vec<TaskGroup> {
        vec![TaskGroup {
            name: "all".to_string(),
            percentage: 1.0,
            tasks: vec![
                Task::Record {
                    name: "train".to_string(),
                    function_name: None,
                    task_type: TaskType::Train,
                    apply_local: false,
                },
                Task::Record {
                    name: "validate".to_string(),
                    function_name: None,
                    task_type: TaskType::Validate,
                    apply_local: false,
                },
            ],
            aggregation_type: AggregationType::WeightedAverage,
        }]
    }

    #[tokio::test]
    async fn full_percentage_assigns_every_collaborator() {
        let cols = vec!["a".to_string(), "b".to_string()];
        let assigner = DynamicRandomGroupedAssigner::new(groups(), cols.clone(), 3).unwrap();

        for c in &cols {
            let tasks = assigner.get_tasks_for_collaborator(c, 0).await;
            assert_eq!(tasks.len(), 2);
        }
        let for_train = assigner.get_collaborators_for_task("train", 0).await;
        assert_eq!(for_train.len(), 2);
    }

    #[tokio::test]
    async fn end_of_round_noop_when_assignees_unchanged() {
        let cols = vec!["a".to_string(), "b".to_string()];
        let assigner = DynamicRandomGroupedAssigner::new(groups(), cols.clone(), 3).unwrap();
        assigner.end_of_round(cols.clone(), vec![], 1).await;
        assert_eq!(assigner.get_assigned_collaborators().await.len(), 2);
    }

    #[tokio::test]
    async fn end_of_round_drops_stragglers() {
        let cols = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let assigner = DynamicRandomGroupedAssigner::new(groups(), cols.clone(), 3).unwrap();
        assigner.end_of_round(cols, vec!["c".to_string()], 1).await;
        let assigned = assigner.get_assigned_collaborators().await;
        assert_eq!(assigned.len(), 2);
        assert!(!assigned.contains(&"c".to_string()));
    }

    proptest! {
        /// Generalizes `percentage_partition_invariant_holds` (I6): for any
        /// number of groups with arbitrary percentages summing to 1.0 and
        /// any roster size, every collaborator is assigned exactly one
        /// group's tasks, and no collaborator is assigned twice.
        #[test]
        fn partition_invariant_holds_for_arbitrary_groups(
            weights in prop::collection::vec(1u32..20, 1..6),
            num_cols in 1usize..40,
        ) {
            let total_weight: u32 = weights.iter().sum();
            let groups: Vec<TaskGroup> = weights
                .iter()
                .enumerate()
                .map(|(i, w)| TaskGroup {
                    name: format!("g{i}"),
                    percentage: *w as f64 / total_weight as f64,
                    tasks: vec![Task::Bare(format!("task{i}"))],
                    aggregation_type: AggregationType::WeightedAverage,
                })
                .collect();
            let cols: Vec<String> = (0..num_cols).map(|i| format!("c{i}")).collect();

            let assigner = DynamicRandomGroupedAssigner::new(groups, cols.clone(), 1).unwrap();

            let assigned_exactly_once = futures::executor::block_on(async {
                let mut seen = std::collections::HashSet::new();
                for c in &cols {
                    let tasks = assigner.get_tasks_for_collaborator(c, 0).await;
                    assert_eq!(tasks.len(), 1, "collaborator {c} should be assigned exactly one group's tasks");
                    seen.insert(c.clone());
                }
                seen.len() == cols.len()
            });
            prop_assert!(assigned_exactly_once);
        }
    }

    #[tokio::test]
    async fn percentage_partition_invariant_holds() {
        let cols: Vec<String> = (0..10).map(|i| format!("c{i}")).collect();
        let groups = vec![
            TaskGroup {
                name: "g1".to_string(),
                percentage: 0.3,
                tasks: vec![Task::Bare("train".to_string())],
                aggregation_type: AggregationType::WeightedAverage,
            },
            TaskGroup {
                name: "g2".to_string(),
                percentage: 0.7,
                tasks: vec![Task::Bare("validate".to_string())],
                aggregation_type: AggregationType::WeightedAverage,
            },
        ];
        let assigner = DynamicRandomGroupedAssigner::new(groups, cols.clone(), 1).unwrap();
        let mut seen = std::collections::HashSet::new();
        for c in &cols {
            let tasks = assigner.get_tasks_for_collaborator(c, 0).await;
            assert_eq!(tasks.len(), 1);
            seen.insert(c.clone());
        }
        assert_eq!(seen.len(), cols.len());
    }
}
