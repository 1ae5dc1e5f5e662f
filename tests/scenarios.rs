//! Integration tests exercising the coordinator's public RPC surface end to
//! end, one test per literal scenario from the round state machine design
//! (happy path, straggler exclusion, admin cancel, duplicate rejection, and
//! end-of-experiment draining).

use fedcoord::codec::pipeline::NoCompressionPipeline;
use fedcoord::codec::TensorCodec;
use fedcoord::config::{AssignerKind, CompressionPipelineKind, DynamicTaskArgSpec, PlanConfig, StragglerPolicyConfig};
use fedcoord::coordinator::wire::NamedTensorMessage;
use fedcoord::metrics::VecMetricSink;
use fedcoord::types::{AggregationType, Task, TaskGroup, TaskType, Tensor, TensorKey};
use fedcoord::{AdminApi, CollaboratorApi, Coordinator};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn unique_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("fedcoord-scenarios-{}-{}", std::process::id(), name))
}

fn single_task_group(task_name: &str) -> Vec<TaskGroup> {
    vec![TaskGroup {
        name: "all".to_string(),
        percentage: 1.0,
        tasks: vec![Task::Record {
            name: task_name.to_string(),
            function_name: None,
            task_type: TaskType::Train,
            apply_local: false,
        }],
        aggregation_type: AggregationType::WeightedAverage,
    }]
}

fn build_config(
    authorized_cols: Vec<String>,
    task_groups: Vec<TaskGroup>,
    straggler_handling_policy: StragglerPolicyConfig,
    rounds_to_train: u64,
) -> PlanConfig {
    let mut admins_endpoints_mapping = HashMap::new();
    admins_endpoints_mapping.insert(
        "admin1".to_string(),
        vec![
            "AddCollaborator".to_string(),
            "RemoveCollaborator".to_string(),
            "GetExperimentStatus".to_string(),
            "SetStragglerCutoffTime".to_string(),
            "SetDynamicTaskArg".to_string(),
            "GetDynamicTaskArg".to_string(),
        ],
    );

    PlanConfig {
        federation_uuid: "fed-1".to_string(),
        authorized_cols,
        admins_endpoints_mapping,
        init_state_path: unique_path("init.bin"),
        best_state_path: unique_path("best.bin"),
        last_state_path: unique_path("last.bin"),
        assigner: AssignerKind::DynamicRandomGrouped,
        task_groups,
        straggler_handling_policy,
        rounds_to_train,
        db_store_rounds: 2,
        compression_pipeline: CompressionPipelineKind::None,
        dynamictaskargs: HashMap::new(),
    }
}

/// Encodes a scalar metric tensor exactly as a collaborator would before
/// submission: compressed (here, a no-op pipeline) and tagged accordingly.
fn encode_metric(name: &str, round_number: u64, value: f32) -> NamedTensorMessage {
    let codec = TensorCodec::new(Box::new(NoCompressionPipeline));
    let key = TensorKey::new(name, "collaborator", round_number, true, ["metric"]);
    let (comp_key, bytes, metadata) = codec.compress(&key, &Tensor::scalar(value), true).unwrap();
    NamedTensorMessage {
        name: comp_key.tensor_name.clone(),
        round_number: comp_key.round_number,
        report: comp_key.report,
        tags: comp_key.tags.clone(),
        data_bytes: bytes,
        transformer_metadata: vec![metadata],
    }
}

/// Encodes a trained-weight tensor exactly as a collaborator would submit it
/// for a training task: compressed and tagged `trained` (report=false, so it
/// contributes to the model rather than the metric stream).
fn encode_trained(name: &str, round_number: u64, values: Vec<f32>) -> NamedTensorMessage {
    let codec = TensorCodec::new(Box::new(NoCompressionPipeline));
    let key = TensorKey::new(name, "collaborator", round_number, false, ["trained"]);
    let tensor = Tensor::new(vec![values.len()], values);
    let (comp_key, bytes, metadata) = codec.compress(&key, &tensor, true).unwrap();
    NamedTensorMessage {
        name: comp_key.tensor_name.clone(),
        round_number: comp_key.round_number,
        report: comp_key.report,
        tags: comp_key.tags.clone(),
        data_bytes: bytes,
        transformer_metadata: vec![metadata],
    }
}

#[tokio::test]
async fn happy_path_round_completes_with_weighted_metric() {
    let cols = vec!["A".to_string(), "B".to_string()];
    let config = build_config(
        cols.clone(),
        single_task_group("train"),
        StragglerPolicyConfig::Percentage { threshold: 1.0 },
        5,
    );
    let metric_sink = Arc::new(VecMetricSink::new());
    let coordinator = Coordinator::new(config, HashMap::new(), metric_sink.clone()).unwrap();

    for col in &cols {
        let result = coordinator.get_tasks(col, col).await.unwrap();
        assert!(!result.quit);
        assert!(result.tasks.is_some());
    }

    for col in &cols {
        coordinator
            .send_local_task_results(col, col, 0, "train", 10, vec![encode_metric("loss", 0, 1.0)])
            .await
            .unwrap();
    }

    let status = coordinator.get_experiment_status("admin1", "admin1").await.unwrap();
    assert_eq!(status.current.round, 1);

    let aggregated = metric_sink
        .records()
        .into_iter()
        .find(|r| r.metric_origin == "aggregator" && r.metric_name == "loss")
        .expect("aggregator metric record");
    assert!((aggregated.metric_value - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn duplicate_submission_is_rejected_and_first_result_kept() {
    let cols = vec!["A".to_string(), "B".to_string()];
    let config = build_config(
        cols.clone(),
        single_task_group("train"),
        StragglerPolicyConfig::Percentage { threshold: 1.0 },
        5,
    );
    let metric_sink = Arc::new(VecMetricSink::new());
    let coordinator = Coordinator::new(config, HashMap::new(), metric_sink).unwrap();

    coordinator.get_tasks("A", "A").await.unwrap();

    coordinator
        .send_local_task_results("A", "A", 0, "train", 10, vec![encode_metric("loss", 0, 1.0)])
        .await
        .unwrap();

    let err = coordinator
        .send_local_task_results("A", "A", 0, "train", 10, vec![encode_metric("loss", 0, 99.0)])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("duplicate result"));
}

#[tokio::test]
async fn admin_add_then_cancel_leaves_authorized_cols_unchanged() {
    let cols = vec!["A".to_string()];
    let config = build_config(
        cols,
        single_task_group("train"),
        StragglerPolicyConfig::Percentage { threshold: 1.0 },
        5,
    );
    let metric_sink = Arc::new(VecMetricSink::new());
    let coordinator = Coordinator::new(config, HashMap::new(), metric_sink).unwrap();

    coordinator.add_collaborator("admin1", "admin1", "new-label", "D").await.unwrap();
    coordinator.remove_collaborator("admin1", "admin1", "new-label", "D").await.unwrap();

    let status = coordinator.get_experiment_status("admin1", "admin1").await.unwrap();
    assert!(status.current.to_add_next_round.is_empty());
    assert!(status.current.to_remove_next_round.is_empty());
}

#[tokio::test]
async fn unauthenticated_collaborator_is_rejected() {
    let cols = vec!["A".to_string()];
    let config = build_config(
        cols,
        single_task_group("train"),
        StragglerPolicyConfig::Percentage { threshold: 1.0 },
        5,
    );
    let metric_sink = Arc::new(VecMetricSink::new());
    let coordinator = Coordinator::new(config, HashMap::new(), metric_sink).unwrap();

    let err = coordinator.get_tasks("not-A", "A").await.unwrap_err();
    assert!(err.to_string().contains("unauthenticated"));
}

#[tokio::test]
async fn percentage_straggler_cutoff_excludes_late_collaborator() {
    let cols = vec!["A".to_string(), "B".to_string(), "C".to_string()];
    let config = build_config(
        cols.clone(),
        single_task_group("train"),
        StragglerPolicyConfig::Percentage { threshold: 0.6 },
        5,
    );
    let metric_sink = Arc::new(VecMetricSink::new());
    let coordinator = Coordinator::new(config, HashMap::new(), metric_sink.clone()).unwrap();

    for col in &cols {
        coordinator.get_tasks(col, col).await.unwrap();
    }

    coordinator
        .send_local_task_results("A", "A", 0, "train", 10, vec![encode_metric("loss", 0, 2.0)])
        .await
        .unwrap();
    coordinator
        .send_local_task_results("B", "B", 0, "train", 10, vec![encode_metric("loss", 0, 2.0)])
        .await
        .unwrap();

    // two of three collaborators crossed the 0.6 threshold: the round ends
    // early, excluding C's (never submitted) contribution from aggregation.
    let status = coordinator.get_experiment_status("admin1", "admin1").await.unwrap();
    assert_eq!(status.current.round, 1);

    let aggregated = metric_sink
        .records()
        .into_iter()
        .find(|r| r.metric_origin == "aggregator" && r.metric_name == "loss")
        .expect("aggregator metric record");
    assert!((aggregated.metric_value - 2.0).abs() < 1e-6);
}

#[tokio::test]
async fn quit_signal_sent_once_experiment_is_done() {
    let cols = vec!["A".to_string()];
    let config = build_config(
        cols,
        single_task_group("train"),
        StragglerPolicyConfig::Percentage { threshold: 1.0 },
        1,
    );
    let metric_sink = Arc::new(VecMetricSink::new());
    let coordinator = Coordinator::new(config, HashMap::new(), metric_sink).unwrap();

    coordinator.get_tasks("A", "A").await.unwrap();
    coordinator
        .send_local_task_results("A", "A", 0, "train", 10, vec![encode_metric("loss", 0, 1.0)])
        .await
        .unwrap();

    let result = coordinator.get_tasks("A", "A").await.unwrap();
    assert!(result.quit);
    assert!(result.tasks.is_none());
}

/// S2's literal scenario, driven against the real `CutoffTime` timer rather
/// than the percentage policy: time is paused and advanced past the 20s
/// floor so the straggler timer actually fires and ends the round early.
#[tokio::test(start_paused = true)]
async fn cutoff_time_timer_fires_and_excludes_the_straggler() {
    let cols = vec!["A".to_string(), "B".to_string(), "C".to_string()];
    let config = build_config(
        cols.clone(),
        single_task_group("train"),
        StragglerPolicyConfig::CutoffTime { straggler_cutoff_time_secs: 20.0, minimum_reporting: 2 },
        5,
    );
    let metric_sink = Arc::new(VecMetricSink::new());
    let coordinator = Coordinator::new(config, HashMap::new(), metric_sink.clone()).unwrap();

    for col in &cols {
        coordinator.get_tasks(col, col).await.unwrap();
    }

    coordinator
        .send_local_task_results("A", "A", 0, "train", 10, vec![encode_metric("loss", 0, 2.0)])
        .await
        .unwrap();
    coordinator
        .send_local_task_results("B", "B", 0, "train", 10, vec![encode_metric("loss", 0, 2.0)])
        .await
        .unwrap();

    // C never submits. Advance the paused clock past the 20s cutoff floor
    // and give the spawned timer task a chance to run and fire the callback.
    tokio::time::advance(Duration::from_secs(21)).await;

    let mut round_advanced = false;
    for _ in 0..20 {
        tokio::task::yield_now().await;
        let status = coordinator.get_experiment_status("admin1", "admin1").await.unwrap();
        if status.current.round == 1 {
            round_advanced = true;
            break;
        }
    }
    assert!(round_advanced, "straggler cutoff timer never fired the round to completion");

    let status = coordinator.get_experiment_status("admin1", "admin1").await.unwrap();
    assert!(status.previous.unwrap().stragglers.iter().any(|c| c == "C"));

    let aggregated = metric_sink
        .records()
        .into_iter()
        .find(|r| r.metric_origin == "aggregator" && r.metric_name == "loss")
        .expect("aggregator metric record");
    assert!((aggregated.metric_value - 2.0).abs() < 1e-6);
}

/// S5's literal scenario: on round 2, a collaborator requests
/// `(name="w", round=2, tags=("aggregated","delta"), require_lossless=true)`.
/// The server subtracts the round-1 model tensor and returns the delta;
/// decompressing it and adding the round-1 model back must reproduce the
/// cached round-2 aggregated tensor exactly.
#[tokio::test]
async fn aggregated_tensor_delta_path_round_trips_against_round_minus_one_model() {
    let cols = vec!["A".to_string()];
    let config = build_config(
        cols.clone(),
        single_task_group("train"),
        StragglerPolicyConfig::Percentage { threshold: 1.0 },
        2,
    );
    let metric_sink = Arc::new(VecMetricSink::new());
    let mut initial_tensors = HashMap::new();
    initial_tensors.insert("w".to_string(), Tensor::new(vec![2], vec![0.0, 0.0]));
    let coordinator = Coordinator::new(config, initial_tensors, metric_sink).unwrap();

    // Round 0: train w up from the seeded [0, 0] model to [1, 2].
    coordinator.get_tasks("A", "A").await.unwrap();
    coordinator
        .send_local_task_results("A", "A", 0, "train", 10, vec![encode_trained("w", 0, vec![1.0, 2.0])])
        .await
        .unwrap();

    // Round 1: train w further to [3, 5], producing a round-2 model/aggregated pair.
    coordinator.get_tasks("A", "A").await.unwrap();
    coordinator
        .send_local_task_results("A", "A", 1, "train", 10, vec![encode_trained("w", 1, vec![3.0, 5.0])])
        .await
        .unwrap();

    let result = coordinator
        .get_aggregated_tensor("A", "A", "w", 2, false, vec!["aggregated".to_string(), "delta".to_string()], true)
        .await
        .unwrap();
    assert_eq!(result.round_number, 2);
    assert!(result.named_tensor.tags.iter().any(|t| t == "delta"));

    let codec = TensorCodec::new(Box::new(NoCompressionPipeline));
    let metadata = result.named_tensor.transformer_metadata.first().cloned().unwrap();
    let key = TensorKey::new("w", "unused", 2, false, result.named_tensor.tags.clone());
    let (_, delta_tensor) = codec.decompress(&key, &result.named_tensor.data_bytes, &metadata, true).unwrap();

    let round_1_model = [1.0f32, 2.0f32];
    let reconstructed: Vec<f32> = delta_tensor.values.iter().zip(round_1_model.iter()).map(|(d, m)| d + m).collect();
    for (got, want) in reconstructed.iter().zip([3.0f32, 5.0f32].iter()) {
        assert!((got - want).abs() < 1e-6);
    }
}

#[tokio::test]
async fn admin_can_set_and_read_back_dynamic_task_arg() {
    let cols = vec!["A".to_string()];
    let mut config = build_config(
        cols,
        single_task_group("train"),
        StragglerPolicyConfig::Percentage { threshold: 1.0 },
        5,
    );
    let mut train_args = HashMap::new();
    train_args.insert("lr".to_string(), DynamicTaskArgSpec { min: 0.0, max: 1.0, value: 0.1 });
    config.dynamictaskargs.insert("train".to_string(), train_args);

    let metric_sink = Arc::new(VecMetricSink::new());
    let coordinator = Coordinator::new(config, HashMap::new(), metric_sink).unwrap();

    let (current, next) = coordinator.get_dynamic_task_arg("admin1", "admin1", "train", "lr").await.unwrap();
    assert_eq!(current, Some(0.1));
    assert_eq!(next, 0.1);

    coordinator.set_dynamic_task_arg("admin1", "admin1", "train", "lr", 0.5).await.unwrap();
    let (current_before_round, next) = coordinator.get_dynamic_task_arg("admin1", "admin1", "train", "lr").await.unwrap();
    assert_eq!(current_before_round, Some(0.1));
    assert_eq!(next, 0.5);

    let err = coordinator.set_dynamic_task_arg("admin1", "admin1", "train", "lr", 5.0).await.unwrap_err();
    assert!(err.to_string().contains("lr"));
}
