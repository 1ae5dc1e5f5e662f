//! The round state machine (C6): ties the task assigner, tensor database,
//! codec and straggler policy together behind the two RPC-facing traits.
//! Grounded line-for-line on `aggregator.py`'s `Aggregator` class, restructured
//! into the lock-guarded-struct-with-async-methods shape of
//! `coordinator/round.rs::RoundCoordinator`.

use crate::aggregation::{AggregationFunction, Median, TrimmedMean, WeightedAverage};
use crate::assigner::{Assigner, DynamicRandomGroupedAssigner};
use crate::checkpoint::Checkpoint;
use crate::codec::pipeline::{
    CompressionPipeline, Lz4Pipeline, NoCompressionPipeline, QuantizedPipeline, SnappyPipeline, ZstdPipeline,
};
use crate::codec::TensorCodec;
use crate::config::{CompressionPipelineKind, DynamicTaskArgSpec, PlanConfig, StragglerPolicyConfig};
use crate::coordinator::state::RoundState;
use crate::coordinator::wire::{
    AggregatedTensorResult, CollaboratorProgress, ExperimentStatus, GetTasksResult, NamedTensorMessage, RoundStatus,
};
use crate::error::{CoordinatorError, Result};
use crate::metrics::{MetricRecord, MetricSink};
use crate::straggler::cutoff::StragglerCallback;
use crate::straggler::{CutoffTimeBasedStragglerHandling, PercentageBasedStragglerHandling, StragglerPolicy};
use crate::tensor_db::{DynamicArgKey, TensorDb};
use crate::types::{AggregationType, Metric, Tensor, TaskResultKey, TensorKey};
use async_trait::async_trait;
use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[async_trait]
pub trait CollaboratorApi: Send + Sync {
    async fn get_tasks(&self, cert_common_name: &str, collaborator: &str) -> anyhow::Result<GetTasksResult>;

    async fn send_local_task_results(
        &self,
        cert_common_name: &str,
        collaborator: &str,
        round_number: u64,
        task_name: &str,
        data_size: u64,
        named_tensors: Vec<NamedTensorMessage>,
    ) -> anyhow::Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn get_aggregated_tensor(
        &self,
        cert_common_name: &str,
        collaborator: &str,
        tensor_name: &str,
        round_number: u64,
        report: bool,
        tags: Vec<String>,
        require_lossless: bool,
    ) -> anyhow::Result<AggregatedTensorResult>;
}

#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn add_collaborator(
        &self,
        cert_common_name: &str,
        admin_common_name: &str,
        collaborator_label: &str,
        collaborator_cn: &str,
    ) -> anyhow::Result<()>;

    async fn remove_collaborator(
        &self,
        cert_common_name: &str,
        admin_common_name: &str,
        collaborator_label: &str,
        collaborator_cn: &str,
    ) -> anyhow::Result<()>;

    async fn get_experiment_status(
        &self,
        cert_common_name: &str,
        admin_common_name: &str,
    ) -> anyhow::Result<ExperimentStatus>;

    async fn set_straggler_cutoff_time(
        &self,
        cert_common_name: &str,
        admin_common_name: &str,
        straggler_cutoff_time_secs: f64,
    ) -> anyhow::Result<()>;

    /// Sets the next value for a declared dynamic task argument, bounds-checked
    /// against its configured `[min, max]`.
    async fn set_dynamic_task_arg(
        &self,
        cert_common_name: &str,
        admin_common_name: &str,
        task_name: &str,
        arg_name: &str,
        value: f64,
    ) -> anyhow::Result<()>;

    /// Returns `(current_published_value, next_round_value)` for a dynamic
    /// task argument.
    async fn get_dynamic_task_arg(
        &self,
        cert_common_name: &str,
        admin_common_name: &str,
        task_name: &str,
        arg_name: &str,
    ) -> anyhow::Result<(Option<f64>, f64)>;
}

/// The central coordinator. Round-scoped mutable state lives behind a single
/// `tokio::sync::Mutex` (spec §5); the tensor database carries its own lock
/// and is never touched while the coordinator mutex is held across an
/// `.await` unless the call genuinely needs both.
pub struct Coordinator {
    self_weak: Weak<Coordinator>,

    uuid: String,
    #[allow(dead_code)]
    federation_uuid: String,
    rounds_to_train: u64,
    db_store_rounds: u64,
    single_col_cert_common_name: String,
    admins_endpoints_mapping: crate::config::AdminEndpointsMapping,

    best_state_path: PathBuf,
    last_state_path: PathBuf,

    dynamictaskargs: SyncRwLock<HashMap<String, HashMap<String, DynamicTaskArgSpec>>>,

    state: tokio::sync::Mutex<RoundState>,
    tensor_db: TensorDb,
    tensor_codec: TensorCodec,
    assigner: Arc<dyn Assigner>,
    straggler_handling_policy: Arc<dyn StragglerPolicy>,
    metric_sink: Arc<dyn MetricSink>,
}

impl Coordinator {
    pub fn new(
        config: PlanConfig,
        initial_tensors: HashMap<String, Tensor>,
        metric_sink: Arc<dyn MetricSink>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate().map_err(anyhow::Error::msg)?;

        let assigner: Arc<dyn Assigner> = Arc::new(DynamicRandomGroupedAssigner::new(
            config.task_groups.clone(),
            config.authorized_cols.clone(),
            config.rounds_to_train,
        )?);

        let straggler_handling_policy: Arc<dyn StragglerPolicy> = match config.straggler_handling_policy {
            StragglerPolicyConfig::CutoffTime { straggler_cutoff_time_secs, minimum_reporting } => {
                Arc::new(CutoffTimeBasedStragglerHandling::new(straggler_cutoff_time_secs, minimum_reporting))
            }
            StragglerPolicyConfig::Percentage { threshold } => {
                Arc::new(PercentageBasedStragglerHandling::new(threshold))
            }
        };

        let pipeline: Box<dyn CompressionPipeline> = match config.compression_pipeline {
            CompressionPipelineKind::None => Box::new(NoCompressionPipeline),
            CompressionPipelineKind::Zstd => Box::new(ZstdPipeline::default()),
            CompressionPipelineKind::Lz4 => Box::new(Lz4Pipeline::default()),
            CompressionPipelineKind::Snappy => Box::new(SnappyPipeline),
            CompressionPipelineKind::Quantized => Box::new(QuantizedPipeline),
        };
        let tensor_codec = TensorCodec::new(pipeline);
        let tensor_db = TensorDb::new();

        let uuid = uuid::Uuid::new_v4().to_string();
        for (name, tensor) in initial_tensors {
            let key = TensorKey::new(name, uuid.clone(), 0, false, ["model"]);
            tensor_db.cache(key, tensor);
        }

        let coordinator = Arc::new_cyclic(|weak| Coordinator {
            self_weak: weak.clone(),
            uuid,
            federation_uuid: config.federation_uuid,
            rounds_to_train: config.rounds_to_train,
            db_store_rounds: config.db_store_rounds,
            single_col_cert_common_name: String::new(),
            admins_endpoints_mapping: config.admins_endpoints_mapping,
            best_state_path: config.best_state_path,
            last_state_path: config.last_state_path,
            dynamictaskargs: SyncRwLock::new(config.dynamictaskargs),
            state: tokio::sync::Mutex::new(RoundState::new(config.authorized_cols)),
            tensor_db,
            tensor_codec,
            assigner,
            straggler_handling_policy,
            metric_sink,
        });

        coordinator.write_dynamic_task_args(0);
        Ok(coordinator)
    }

    fn time_to_quit(&self, state: &RoundState) -> bool {
        state.round_number >= self.rounds_to_train
    }

    fn valid_collaborator_cn_and_id(
        &self,
        cert_common_name: &str,
        collaborator_common_name: &str,
        authorized_cols: &[String],
    ) -> bool {
        let cn_matches = if self.single_col_cert_common_name.is_empty() {
            cert_common_name == collaborator_common_name
        } else {
            cert_common_name == self.single_col_cert_common_name
        };
        cn_matches && authorized_cols.iter().any(|c| c == collaborator_common_name)
    }

    fn valid_admin_cn_and_id(&self, cert_common_name: &str, admin_common_name: &str) -> bool {
        cert_common_name == admin_common_name && self.admins_endpoints_mapping.contains_key(admin_common_name)
    }

    fn valid_admin_endpoint(&self, endpoint_id: &str, admin_common_name: &str) -> bool {
        self.admins_endpoints_mapping
            .get(admin_common_name)
            .is_some_and(|endpoints| endpoints.iter().any(|e| e == endpoint_id))
    }

    fn authorize_admin(&self, cert_common_name: &str, admin_common_name: &str, endpoint: &str) -> Result<()> {
        if !self.valid_admin_cn_and_id(cert_common_name, admin_common_name) {
            return Err(CoordinatorError::Unauthenticated);
        }
        if !self.valid_admin_endpoint(endpoint, admin_common_name) {
            return Err(CoordinatorError::Unauthorized);
        }
        Ok(())
    }

    fn aggregation_function_for(&self, kind: AggregationType) -> Box<dyn AggregationFunction> {
        match kind {
            AggregationType::WeightedAverage => Box::new(WeightedAverage),
            AggregationType::Median => Box::new(Median),
            AggregationType::TrimmedMean => Box::new(TrimmedMean { trim_fraction: 0.1 }),
        }
    }

    async fn get_tasks_locked(&self, state: &mut RoundState, collaborator: &str) -> GetTasksResult {
        if !state.available_collaborators.iter().any(|c| c == collaborator) {
            state.available_collaborators.push(collaborator.to_string());
        }

        if self.time_to_quit(state) {
            info!(%collaborator, "sending quit signal");
            if !state.quit_job_sent_to.iter().any(|c| c == collaborator) {
                state.quit_job_sent_to.push(collaborator.to_string());
            }
            return GetTasksResult { tasks: None, round_number: state.round_number, sleep_time_secs: 0, quit: true };
        }

        let round_number = state.round_number;
        let mut tasks = self.assigner.get_tasks_for_collaborator(collaborator, round_number).await;
        tasks.retain(|task| {
            let key = TaskResultKey::new(task.name(), collaborator, round_number);
            !state.collaborator_tasks_results.contains_key(&key)
        });
        if state.stragglers.iter().any(|c| c == collaborator) {
            tasks.clear();
        }

        if tasks.is_empty() {
            return GetTasksResult { tasks: None, round_number, sleep_time_secs: 10, quit: false };
        }

        if !state.straggler_handling_policy_started_for_round {
            state.straggler_handling_policy_started_for_round = true;
            let weak = self.self_weak.clone();
            let callback: StragglerCallback = Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator.straggler_cutoff_time_elapsed().await;
                    }
                })
            });
            self.straggler_handling_policy.start_policy(callback).await;
        }

        let now = Instant::now();
        let first_col_start = *state.first_col_start.get_or_insert(now);
        state
            .collaborator_start_time
            .entry(collaborator.to_string())
            .or_insert_with(|| now.duration_since(first_col_start));

        GetTasksResult { tasks: Some(tasks), round_number, sleep_time_secs: 0, quit: false }
    }

    fn process_named_tensor(&self, named_tensor: NamedTensorMessage, collaborator: &str) -> Result<(TensorKey, Tensor)> {
        let tensor_key = TensorKey::new(
            named_tensor.name.clone(),
            self.uuid.clone(),
            named_tensor.round_number,
            named_tensor.report,
            named_tensor.tags.clone(),
        );
        let metadata = named_tensor.transformer_metadata.first().cloned().unwrap_or_default();

        let is_lossless = tensor_key.has_tag("compressed");
        let is_lossy = tensor_key.has_tag("lossy_compressed");
        if !is_lossless && !is_lossy {
            return Err(CoordinatorError::Codec(format!("named tensor {tensor_key} is not compressed")));
        }

        let (decoded_key, decoded_tensor) =
            self.tensor_codec.decompress(&tensor_key, &named_tensor.data_bytes, &metadata, is_lossless)?;
        let tagged_key = decoded_key.with_tag_added(collaborator);

        let (final_key, final_tensor) = if tagged_key.has_tag("delta") {
            let base_key = TensorKey::new(
                tensor_key.tensor_name.clone(),
                tensor_key.origin.clone(),
                tensor_key.round_number,
                tensor_key.report,
                ["model"],
            );
            let base_tensor = self.tensor_db.get(&base_key).ok_or_else(|| CoordinatorError::MissingContributor {
                tensor_name: base_key.tensor_name.clone(),
                collaborator: "model".to_string(),
            })?;
            self.tensor_codec.apply_delta(&tagged_key, &decoded_tensor, &base_tensor)?
        } else {
            (tagged_key, decoded_tensor)
        };

        self.tensor_db.cache(final_key.clone(), final_tensor.clone());
        Ok((final_key, final_tensor))
    }

    async fn mark_collaborator_done_if_complete(&self, state: &mut RoundState, collaborator: &str) {
        let round_number = state.round_number;
        let tasks = self.assigner.get_tasks_for_collaborator(collaborator, round_number).await;
        let all_done = tasks.iter().all(|task| {
            let key = TaskResultKey::new(task.name(), collaborator, round_number);
            state.collaborator_tasks_results.contains_key(&key)
        });
        if all_done && !state.collaborators_done.iter().any(|c| c == collaborator) {
            state.collaborators_done.push(collaborator.to_string());
            info!(%collaborator, round = round_number, "collaborator completed all assigned tasks");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_local_task_results_locked(
        &self,
        state: &mut RoundState,
        collaborator: &str,
        round_number: u64,
        task_name: &str,
        data_size: u64,
        named_tensors: Vec<NamedTensorMessage>,
    ) -> Result<()> {
        if self.time_to_quit(state) || state.stragglers.iter().any(|c| c == collaborator) {
            warn!(%collaborator, task_name, "result rejected: experiment finished or collaborator is a straggler");
            return Ok(());
        }
        if state.round_number != round_number {
            warn!(%collaborator, round_number, current = state.round_number, "result for wrong round rejected");
            return Ok(());
        }

        let task_key = TaskResultKey::new(task_name, collaborator, round_number);
        if state.collaborator_tasks_results.contains_key(&task_key) {
            return Err(CoordinatorError::DuplicateResult(task_key));
        }

        state.collaborator_task_weight.insert(task_key.clone(), data_size);

        let mut result_keys = Vec::with_capacity(named_tensors.len());
        for named_tensor in named_tensors {
            let (final_key, final_tensor) = self.process_named_tensor(named_tensor, collaborator)?;
            if final_key.has_tag("metric") {
                let metric = Metric::new(final_key.tensor_name.clone(), final_tensor.values.first().copied().unwrap_or_default());
                self.metric_sink.emit(MetricRecord {
                    round: round_number,
                    metric_origin: collaborator.to_string(),
                    task_name: task_name.to_string(),
                    metric_name: metric.name,
                    metric_value: metric.value,
                });
            }
            result_keys.push(final_key);
        }
        state.collaborator_tasks_results.insert(task_key, result_keys);

        let elapsed = state.first_col_start.map(|start| start.elapsed()).unwrap_or_default();
        state.collaborator_end_time.entry(collaborator.to_string()).or_default().insert(task_name.to_string(), elapsed);

        self.mark_collaborator_done_if_complete(state, collaborator).await;

        let assigned = self.assigner.get_assigned_collaborators().await;
        if state.collaborators_done.len() == assigned.len() {
            self.end_of_round_check(state).await?;
        } else if self.straggler_handling_policy.straggler_cutoff_check(state.collaborators_done.len(), assigned.len()).await {
            let stragglers: Vec<String> = assigned.into_iter().filter(|c| !state.collaborators_done.contains(c)).collect();
            if !stragglers.is_empty() {
                warn!(?stragglers, "straggler cutoff reached, ending round early");
            }
            state.stragglers = stragglers;
            self.end_of_round_check(state).await?;
        }

        Ok(())
    }

    async fn straggler_cutoff_time_elapsed(&self) {
        let mut state = self.state.lock().await;
        let assigned = self.assigner.get_assigned_collaborators().await;
        info!(
            round = state.round_number,
            done = state.collaborators_done.len(),
            assigned = assigned.len(),
            "straggler cutoff timer elapsed"
        );
        if self.straggler_handling_policy.straggler_cutoff_check(state.collaborators_done.len(), assigned.len()).await {
            let stragglers: Vec<String> = assigned.into_iter().filter(|c| !state.collaborators_done.contains(c)).collect();
            if !stragglers.is_empty() {
                warn!(?stragglers, "identified straggler collaborators");
            }
            state.stragglers = stragglers;
            if let Err(err) = self.end_of_round_check(&mut state).await {
                error!(?err, "end-of-round check failed after straggler cutoff");
            }
        }
    }

    async fn get_aggregated_tensor_inner(
        &self,
        tensor_name: &str,
        round_number: u64,
        report: bool,
        tags: Vec<String>,
        require_lossless: bool,
    ) -> Result<AggregatedTensorResult> {
        let compress_lossless = tags.iter().any(|t| t == "compressed") || require_lossless;
        let clean_tags: Vec<String> = tags.into_iter().filter(|t| t != "compressed" && t != "lossy_compressed").collect();
        let requested_key = TensorKey::new(tensor_name, self.uuid.clone(), round_number, report, clean_tags);

        let agg_tensor_key = if requested_key.has_tag("aggregated") && requested_key.has_tag("delta") && round_number != 0 {
            TensorKey::new(tensor_name, self.uuid.clone(), round_number, report, ["aggregated"])
        } else {
            requested_key.clone()
        };

        let mut tensor = self.tensor_db.get(&agg_tensor_key);
        let start = Instant::now();
        while tensor.is_none() && start.elapsed() < Duration::from_secs(60) {
            tokio::time::sleep(Duration::from_secs(5)).await;
            tensor = self.tensor_db.get(&agg_tensor_key);
        }
        let tensor = tensor.ok_or(CoordinatorError::NotReady)?;

        let named_tensor = self.nparray_to_named_tensor(&agg_tensor_key, &tensor, true, compress_lossless)?;
        Ok(AggregatedTensorResult { round_number, named_tensor })
    }

    fn nparray_to_named_tensor(
        &self,
        key: &TensorKey,
        tensor: &Tensor,
        send_model_deltas: bool,
        compress_lossless: bool,
    ) -> Result<NamedTensorMessage> {
        if key.has_tag("aggregated") && send_model_deltas {
            let model_key = TensorKey::new(
                key.tensor_name.clone(),
                key.origin.clone(),
                key.round_number.saturating_sub(1),
                key.report,
                ["model"],
            );
            let model_tensor = self.tensor_db.get(&model_key).ok_or_else(|| CoordinatorError::MissingContributor {
                tensor_name: key.tensor_name.clone(),
                collaborator: "model".to_string(),
            })?;
            let (delta_key, delta_tensor) = self.tensor_codec.generate_delta(key, tensor, &model_tensor)?;
            let (comp_key, bytes, metadata) = self.tensor_codec.compress(&delta_key, &delta_tensor, compress_lossless)?;
            Ok(Self::to_named_tensor_message(&comp_key, bytes, metadata))
        } else {
            let (comp_key, bytes, metadata) = self.tensor_codec.compress(key, tensor, true)?;
            Ok(Self::to_named_tensor_message(&comp_key, bytes, metadata))
        }
    }

    fn to_named_tensor_message(
        key: &TensorKey,
        data_bytes: Vec<u8>,
        metadata: crate::types::TransformerMetadata,
    ) -> NamedTensorMessage {
        NamedTensorMessage {
            name: key.tensor_name.clone(),
            round_number: key.round_number,
            report: key.report,
            tags: key.tags.clone(),
            data_bytes,
            transformer_metadata: vec![metadata],
        }
    }

    fn save_model(&self, round_number: u64, path: &std::path::Path) -> Result<()> {
        let tensors = self.tensor_db.snapshot_round(&self.uuid, round_number, "model");
        if tensors.is_empty() {
            info!(round = round_number, "no model tensors cached yet, skipping checkpoint");
            return Ok(());
        }
        Checkpoint::from_tensors(round_number, &tensors).write(path)
    }

    fn write_dynamic_task_args(&self, round_number: u64) {
        let args = self.dynamictaskargs.read();
        for (task_name, arg_map) in args.iter() {
            for (arg_name, spec) in arg_map.iter() {
                let key = DynamicArgKey {
                    task_name: task_name.clone(),
                    arg_name: arg_name.clone(),
                    round_number,
                    agg_id: self.uuid.clone(),
                };
                self.tensor_db.cache_dynamic_arg(key, spec.value);
            }
        }
    }

    fn set_dynamic_task_arg_locked(&self, task_name: &str, arg_name: &str, value: f64) -> Result<()> {
        let mut args = self.dynamictaskargs.write();
        let spec = args
            .get_mut(task_name)
            .and_then(|tasks| tasks.get_mut(arg_name))
            .ok_or_else(|| CoordinatorError::OutOfRange { arg_name: arg_name.to_string(), value, min: 0.0, max: 0.0 })?;
        if value < spec.min || value > spec.max {
            return Err(CoordinatorError::OutOfRange {
                arg_name: arg_name.to_string(),
                value,
                min: spec.min,
                max: spec.max,
            });
        }
        spec.value = value;
        Ok(())
    }

    async fn get_dynamic_task_arg_locked(&self, task_name: &str, arg_name: &str) -> Result<(Option<f64>, f64)> {
        let round_number = self.state.lock().await.round_number;
        let args = self.dynamictaskargs.read();
        let spec = args
            .get(task_name)
            .and_then(|tasks| tasks.get(arg_name))
            .ok_or_else(|| CoordinatorError::OutOfRange { arg_name: arg_name.to_string(), value: 0.0, min: 0.0, max: 0.0 })?;
        let key = DynamicArgKey {
            task_name: task_name.to_string(),
            arg_name: arg_name.to_string(),
            round_number,
            agg_id: self.uuid.clone(),
        };
        Ok((self.tensor_db.get_dynamic_arg(&key), spec.value))
    }

    async fn round_status(&self, state: &RoundState) -> RoundStatus {
        let assigned_collaborators = self.assigner.get_assigned_collaborators().await;

        let mut names: std::collections::BTreeSet<String> = state.collaborator_start_time.keys().cloned().collect();
        names.extend(state.collaborator_end_time.keys().cloned());
        let collaborators_progress = names
            .into_iter()
            .map(|collaborator| CollaboratorProgress {
                start_time_secs: state.collaborator_start_time.get(&collaborator).map(Duration::as_secs_f64),
                end_times_secs: state
                    .collaborator_end_time
                    .get(&collaborator)
                    .map(|tasks| tasks.iter().map(|(k, v)| (k.clone(), v.as_secs_f64())).collect())
                    .unwrap_or_default(),
                collaborator,
            })
            .collect();

        RoundStatus {
            round: state.round_number,
            round_start_secs: state.first_col_start.map(|start| start.elapsed().as_secs_f64()),
            collaborators_progress,
            stragglers: state.stragglers.clone(),
            to_add_next_round: state.collaborators_to_add.clone(),
            to_remove_next_round: state.collaborators_to_remove.clone(),
            available_collaborators: state.available_collaborators.clone(),
            assigned_collaborators,
        }
    }

    async fn compute_validation_related_task_metrics(&self, state: &mut RoundState, task_name: &str) -> Result<()> {
        let round_number = state.round_number;
        let task_agg_kind = self.assigner.get_aggregation_type_for_task(task_name).await;
        let all_collaborators_for_task = self.assigner.get_collaborators_for_task(task_name, round_number).await;

        // Leave out stragglers even if they partially completed the task.
        let collaborators_for_task: Vec<String> =
            all_collaborators_for_task.into_iter().filter(|c| state.collaborators_done.iter().any(|d| d == c)).collect();
        if collaborators_for_task.is_empty() {
            return Ok(());
        }

        let mut weights: HashMap<String, f64> = HashMap::new();
        for collaborator in &collaborators_for_task {
            let key = TaskResultKey::new(task_name, collaborator.clone(), round_number);
            if let Some(&weight) = state.collaborator_task_weight.get(&key) {
                weights.insert(collaborator.clone(), weight as f64);
            }
        }
        if weights.is_empty() {
            return Ok(());
        }

        // Every collaborator sent the same tensor list, so the first one
        // (already filtered to done-and-not-straggling) can stand in for all.
        let representative = &collaborators_for_task[0];
        let task_key = TaskResultKey::new(task_name, representative.clone(), round_number);
        let Some(result_keys) = state.collaborator_tasks_results.get(&task_key).cloned() else {
            return Ok(());
        };

        for tensor_key in result_keys {
            if !tensor_key.has_tag(representative) {
                continue;
            }
            let agg_tensor_key = tensor_key.with_tag_removed(representative);
            let function: Box<dyn AggregationFunction> = if agg_tensor_key.has_tag("metric") {
                Box::new(WeightedAverage)
            } else {
                self.aggregation_function_for(task_agg_kind)
            };

            let agg_result = match self.tensor_db.aggregate(&agg_tensor_key, &weights, function.as_ref()) {
                Ok(tensor) => tensor,
                Err(err) => {
                    warn!(tensor = %agg_tensor_key, round = round_number, ?err, "could not aggregate tensor, skipping");
                    continue;
                }
            };

            if agg_tensor_key.report {
                let metric = Metric::new(agg_tensor_key.tensor_name.clone(), agg_result.values.first().copied().unwrap_or_default());
                let value = metric.value;
                self.metric_sink.emit(MetricRecord {
                    round: round_number,
                    metric_origin: "aggregator".to_string(),
                    task_name: task_name.to_string(),
                    metric_name: metric.name,
                    metric_value: metric.value,
                });

                if agg_tensor_key.has_tag("validate_agg") {
                    let improved = state.best_model_score.map(|best| value > best).unwrap_or(true);
                    if improved {
                        info!(round = round_number, score = value, "saving new best model");
                        state.best_model_score = Some(value);
                        self.save_model(round_number, &self.best_state_path)?;
                    }
                }
            }

            if agg_tensor_key.has_tag("trained") {
                self.prepare_trained(&agg_tensor_key, round_number, &agg_result)?;
            }
        }

        Ok(())
    }

    fn prepare_trained(&self, base_key: &TensorKey, round_number: u64, agg_results: &Tensor) -> Result<()> {
        let agg_tag_key =
            TensorKey::new(base_key.tensor_name.clone(), base_key.origin.clone(), round_number + 1, base_key.report, ["aggregated"]);
        self.tensor_db.cache(agg_tag_key.clone(), agg_results.clone());

        let base_model_key =
            TensorKey::new(base_key.tensor_name.clone(), base_key.origin.clone(), round_number, base_key.report, ["model"]);
        let base_model_tensor = self.tensor_db.get(&base_model_key);

        let (delta_key, delta_tensor) = match &base_model_tensor {
            Some(base) => self.tensor_codec.generate_delta(&agg_tag_key, agg_results, base)?,
            None => (agg_tag_key.clone(), agg_results.clone()),
        };

        let (compressed_key, compressed_bytes, metadata) = self.tensor_codec.compress(&delta_key, &delta_tensor, false)?;
        let (decompressed_key, decompressed_tensor) =
            self.tensor_codec.decompress(&compressed_key, &compressed_bytes, &metadata, false)?;
        self.tensor_db.cache(decompressed_key.clone(), decompressed_tensor.clone());

        let (new_model_key, new_model_tensor) = match &base_model_tensor {
            Some(base) => self.tensor_codec.apply_delta(&decompressed_key, &decompressed_tensor, base)?,
            None => (decompressed_key, decompressed_tensor),
        };

        let final_model_key = new_model_key.with_tags(["model"]);
        self.tensor_db.cache(final_model_key, new_model_tensor);
        Ok(())
    }

    async fn end_of_round_check(&self, state: &mut RoundState) -> Result<()> {
        let round_number = state.round_number;
        if state.end_of_round_done.contains(&round_number) {
            return Ok(());
        }
        info!(round = round_number, "running end of round");

        let all_tasks = self.assigner.get_all_tasks_for_round(round_number).await;
        for task_name in &all_tasks {
            self.compute_validation_related_task_metrics(state, task_name).await?;
        }

        let status = self.round_status(state).await;
        state.previous_round_status = Some(status);

        state.collaborator_start_time.clear();
        state.collaborator_end_time.clear();
        state.first_col_start = None;

        state.end_of_round_done.insert(round_number);
        state.round_number = round_number + 1;

        for (_, cn) in &state.collaborators_to_add {
            if !state.available_collaborators.iter().any(|c| c == cn) {
                state.available_collaborators.push(cn.clone());
            }
        }
        for (_, cn) in &state.collaborators_to_remove {
            state.available_collaborators.retain(|c| c != cn);
        }

        self.assigner
            .end_of_round(state.available_collaborators.clone(), state.stragglers.clone(), state.round_number)
            .await;

        state.straggler_handling_policy_started_for_round = false;
        state.stragglers.clear();
        state.available_collaborators.clear();
        state.collaborators_done.clear();

        self.save_model(state.round_number, &self.last_state_path)?;
        self.tensor_db.evict(state.round_number, self.db_store_rounds);
        self.straggler_handling_policy.reset_policy_for_round().await;
        self.write_dynamic_task_args(state.round_number);

        let to_add = std::mem::take(&mut state.collaborators_to_add);
        for (_, cn) in &to_add {
            if !state.authorized_cols.iter().any(|c| c == cn) {
                state.authorized_cols.push(cn.clone());
            }
            self.assigner.add_collaborator(cn.clone()).await;
        }
        let to_remove = std::mem::take(&mut state.collaborators_to_remove);
        for (_, cn) in &to_remove {
            state.authorized_cols.retain(|c| c != cn);
            self.assigner.remove_collaborator(cn).await;
        }

        if self.time_to_quit(state) {
            info!(round = state.round_number, "experiment complete, draining remaining collaborators");
        } else {
            info!(round = state.round_number, "starting next round");
        }

        Ok(())
    }
}

#[async_trait]
impl CollaboratorApi for Coordinator {
    async fn get_tasks(&self, cert_common_name: &str, collaborator: &str) -> anyhow::Result<GetTasksResult> {
        let mut state = self.state.lock().await;
        if !self.valid_collaborator_cn_and_id(cert_common_name, collaborator, &state.authorized_cols) {
            return Err(CoordinatorError::Unauthenticated.into());
        }
        Ok(self.get_tasks_locked(&mut state, collaborator).await)
    }

    async fn send_local_task_results(
        &self,
        cert_common_name: &str,
        collaborator: &str,
        round_number: u64,
        task_name: &str,
        data_size: u64,
        named_tensors: Vec<NamedTensorMessage>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if !self.valid_collaborator_cn_and_id(cert_common_name, collaborator, &state.authorized_cols) {
            return Err(CoordinatorError::Unauthenticated.into());
        }
        self.send_local_task_results_locked(&mut state, collaborator, round_number, task_name, data_size, named_tensors)
            .await?;
        Ok(())
    }

    async fn get_aggregated_tensor(
        &self,
        cert_common_name: &str,
        collaborator: &str,
        tensor_name: &str,
        round_number: u64,
        report: bool,
        tags: Vec<String>,
        require_lossless: bool,
    ) -> anyhow::Result<AggregatedTensorResult> {
        {
            let state = self.state.lock().await;
            if !self.valid_collaborator_cn_and_id(cert_common_name, collaborator, &state.authorized_cols) {
                return Err(CoordinatorError::Unauthenticated.into());
            }
        }
        Ok(self.get_aggregated_tensor_inner(tensor_name, round_number, report, tags, require_lossless).await?)
    }
}

#[async_trait]
impl AdminApi for Coordinator {
    async fn add_collaborator(
        &self,
        cert_common_name: &str,
        admin_common_name: &str,
        collaborator_label: &str,
        collaborator_cn: &str,
    ) -> anyhow::Result<()> {
        self.authorize_admin(cert_common_name, admin_common_name, "AddCollaborator")?;
        let mut state = self.state.lock().await;
        let pair = (collaborator_label.to_string(), collaborator_cn.to_string());

        if let Some(pos) = state.collaborators_to_remove.iter().position(|p| p == &pair) {
            state.collaborators_to_remove.remove(pos);
            return Ok(());
        }
        if state.collaborators_to_add.iter().any(|p| p == &pair) {
            return Err(CoordinatorError::AlreadyQueued.into());
        }
        if state.authorized_cols.iter().any(|c| c == collaborator_cn) {
            return Err(CoordinatorError::AlreadyAuthorized.into());
        }
        state.collaborators_to_add.push(pair);
        Ok(())
    }

    async fn remove_collaborator(
        &self,
        cert_common_name: &str,
        admin_common_name: &str,
        collaborator_label: &str,
        collaborator_cn: &str,
    ) -> anyhow::Result<()> {
        self.authorize_admin(cert_common_name, admin_common_name, "RemoveCollaborator")?;
        let mut state = self.state.lock().await;
        let pair = (collaborator_label.to_string(), collaborator_cn.to_string());

        if let Some(pos) = state.collaborators_to_add.iter().position(|p| p == &pair) {
            state.collaborators_to_add.remove(pos);
            return Ok(());
        }
        if state.collaborators_to_remove.iter().any(|p| p == &pair) {
            return Err(CoordinatorError::AlreadyQueued.into());
        }
        if !state.authorized_cols.iter().any(|c| c == collaborator_cn) {
            return Err(CoordinatorError::AlreadyAuthorized.into());
        }
        state.collaborators_to_remove.push(pair);
        Ok(())
    }

    async fn get_experiment_status(
        &self,
        cert_common_name: &str,
        admin_common_name: &str,
    ) -> anyhow::Result<ExperimentStatus> {
        self.authorize_admin(cert_common_name, admin_common_name, "GetExperimentStatus")?;
        let state = self.state.lock().await;
        let current = self.round_status(&state).await;
        let previous = state.previous_round_status.clone();
        Ok(ExperimentStatus { current, previous })
    }

    async fn set_straggler_cutoff_time(
        &self,
        cert_common_name: &str,
        admin_common_name: &str,
        straggler_cutoff_time_secs: f64,
    ) -> anyhow::Result<()> {
        self.authorize_admin(cert_common_name, admin_common_name, "SetStragglerCutoffTime")?;
        self.straggler_handling_policy.set_straggler_cutoff_time(straggler_cutoff_time_secs);
        Ok(())
    }

    async fn set_dynamic_task_arg(
        &self,
        cert_common_name: &str,
        admin_common_name: &str,
        task_name: &str,
        arg_name: &str,
        value: f64,
    ) -> anyhow::Result<()> {
        self.authorize_admin(cert_common_name, admin_common_name, "SetDynamicTaskArg")?;
        Ok(self.set_dynamic_task_arg_locked(task_name, arg_name, value)?)
    }

    async fn get_dynamic_task_arg(
        &self,
        cert_common_name: &str,
        admin_common_name: &str,
        task_name: &str,
        arg_name: &str,
    ) -> anyhow::Result<(Option<f64>, f64)> {
        self.authorize_admin(cert_common_name, admin_common_name, "GetDynamicTaskArg")?;
        Ok(self.get_dynamic_task_arg_locked(task_name, arg_name).await?)
    }
}
