//! Metric stream (spec §6): an append-only, single-producer sink the
//! coordinator emits round/task/value records to.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub round: u64,
    pub metric_origin: String,
    pub task_name: String,
    pub metric_name: String,
    pub metric_value: f32,
}

pub trait MetricSink: Send + Sync {
    fn emit(&self, record: MetricRecord);
}

/// Default sink: logs each record at `info` under the `metric` target,
/// mirroring the original aggregator's `self.logger.metric(...)` calls.
pub struct TracingMetricSink;

impl MetricSink for TracingMetricSink {
    fn emit(&self, record: MetricRecord) {
        tracing::info!(
            target: "metric",
            round = record.round,
            origin = %record.metric_origin,
            task = %record.task_name,
            name = %record.metric_name,
            value = record.metric_value,
            "metric"
        );
    }
}

/// In-memory sink for tests and local inspection.
#[derive(Default)]
pub struct VecMetricSink {
    records: Mutex<Vec<MetricRecord>>,
}

impl VecMetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().clone()
    }
}

impl MetricSink for VecMetricSink {
    fn emit(&self, record: MetricRecord) {
        self.records.lock().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_sink_accumulates_records() {
        let sink = VecMetricSink::new();
        sink.emit(MetricRecord {
            round: 0,
            metric_origin: "aggregator".to_string(),
            task_name: "train".to_string(),
            metric_name: "loss".to_string(),
            metric_value: 1.0,
        });
        assert_eq!(sink.records().len(), 1);
    }
}
