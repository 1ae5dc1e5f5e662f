//! Wire-shaped request/response records for the collaborator and admin RPC
//! surfaces (spec §6). The concrete transport (gRPC envelopes, TLS, CN
//! extraction) is out of scope; these are the payloads a transport adapter
//! marshals to and from whatever wire format it uses.

use crate::types::{Task, TransformerMetadata};
use serde::{Deserialize, Serialize};

/// `NamedTensor` wire shape: a tensor plus enough codec metadata to
/// decompress and, if tagged `delta`, reconstitute it against a base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedTensorMessage {
    pub name: String,
    pub round_number: u64,
    pub report: bool,
    pub tags: Vec<String>,
    pub data_bytes: Vec<u8>,
    pub transformer_metadata: Vec<TransformerMetadata>,
}

/// Response to `GetTasks`.
#[derive(Debug, Clone, PartialEq)]
pub struct GetTasksResult {
    pub tasks: Option<Vec<Task>>,
    pub round_number: u64,
    pub sleep_time_secs: u64,
    pub quit: bool,
}

/// Response to `GetAggregatedTensor`: the resolved key plus a compressed,
/// codec-ready payload.
#[derive(Debug, Clone)]
pub struct AggregatedTensorResult {
    pub round_number: u64,
    pub named_tensor: NamedTensorMessage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaboratorProgress {
    pub collaborator: String,
    pub start_time_secs: Option<f64>,
    pub end_times_secs: std::collections::HashMap<String, f64>,
}

/// `GetExperimentStatus` response half: current-or-previous round snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundStatus {
    pub round: u64,
    pub round_start_secs: Option<f64>,
    pub collaborators_progress: Vec<CollaboratorProgress>,
    pub stragglers: Vec<String>,
    pub to_add_next_round: Vec<(String, String)>,
    pub to_remove_next_round: Vec<(String, String)>,
    pub available_collaborators: Vec<String>,
    pub assigned_collaborators: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentStatus {
    pub current: RoundStatus,
    pub previous: Option<RoundStatus>,
}
