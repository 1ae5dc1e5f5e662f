//! Round-scoped mutable state (spec §3 "Round State"), held behind the
//! single coordinator-wide mutex spec §5 calls for.

use crate::coordinator::wire::RoundStatus;
use crate::types::TensorKey;
use crate::types::TaskResultKey;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

pub(crate) struct RoundState {
    pub round_number: u64,
    pub authorized_cols: Vec<String>,

    pub collaborators_done: Vec<String>,
    pub collaborator_task_weight: HashMap<TaskResultKey, u64>,
    pub collaborator_tasks_results: HashMap<TaskResultKey, Vec<TensorKey>>,
    pub stragglers: Vec<String>,
    pub available_collaborators: Vec<String>,

    pub first_col_start: Option<Instant>,
    pub collaborator_start_time: HashMap<String, Duration>,
    pub collaborator_end_time: HashMap<String, HashMap<String, Duration>>,

    pub collaborators_to_add: Vec<(String, String)>,
    pub collaborators_to_remove: Vec<(String, String)>,

    pub quit_job_sent_to: Vec<String>,
    pub straggler_handling_policy_started_for_round: bool,

    /// Treated as an unbounded set (open question in spec §9): rounds never
    /// revisit, so a `HashSet` costs nothing a `Vec<bool>` would save.
    pub end_of_round_done: HashSet<u64>,

    pub previous_round_status: Option<RoundStatus>,
    pub best_model_score: Option<f32>,
}

impl RoundState {
    pub fn new(authorized_cols: Vec<String>) -> Self {
        Self {
            round_number: 0,
            authorized_cols,
            collaborators_done: Vec::new(),
            collaborator_task_weight: HashMap::new(),
            collaborator_tasks_results: HashMap::new(),
            stragglers: Vec::new(),
            available_collaborators: Vec::new(),
            first_col_start: None,
            collaborator_start_time: HashMap::new(),
            collaborator_end_time: HashMap::new(),
            collaborators_to_add: Vec::new(),
            collaborators_to_remove: Vec::new(),
            quit_job_sent_to: Vec::new(),
            straggler_handling_policy_started_for_round: false,
            end_of_round_done: HashSet::new(),
            previous_round_status: None,
            best_model_score: None,
        }
    }

    pub fn all_quit_jobs_sent(&self) -> bool {
        let sent: HashSet<&String> = self.quit_job_sent_to.iter().collect();
        let authorized: HashSet<&String> = self.authorized_cols.iter().collect();
        sent == authorized
    }
}
