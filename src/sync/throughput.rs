//! Per-metric I/O accounting over a sync event.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Upload,
    Download,
    Rename,
    Copy,
    Delete,
}

/// Accumulated ops and bytes for one metric within a sync event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Throughput {
    pub metric: Metric,
    pub num_ops: u64,
    pub size_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Throughput {
    pub fn start(metric: Metric) -> Self {
        Self {
            metric,
            num_ops: 0,
            size_bytes: 0,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.num_ops += 1;
        self.size_bytes += bytes;
    }

    pub fn stop(&mut self) {
        self.ended_at = Some(Utc::now());
    }
}

/// All metrics of one sync event.
#[derive(Debug, Clone, Default)]
pub struct ThroughputSet {
    metrics: HashMap<Metric, Throughput>,
}

impl ThroughputSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, metric: Metric, bytes: u64) {
        self.metrics
            .entry(metric)
            .or_insert_with(|| Throughput::start(metric))
            .record(bytes);
    }

    pub fn get(&self, metric: Metric) -> Option<&Throughput> {
        self.metrics.get(&metric)
    }

    /// Fold another set into this one, metric by metric.
    pub fn merge(&mut self, other: ThroughputSet) {
        for (metric, incoming) in other.metrics {
            let entry = self
                .metrics
                .entry(metric)
                .or_insert_with(|| Throughput::start(metric));
            entry.num_ops += incoming.num_ops;
            entry.size_bytes += incoming.size_bytes;
            if incoming.started_at < entry.started_at {
                entry.started_at = incoming.started_at;
            }
        }
    }

    /// Close out every open metric and return the records.
    pub fn finish(mut self) -> Vec<Throughput> {
        for throughput in self.metrics.values_mut() {
            throughput.stop();
        }
        let mut records: Vec<Throughput> = self.metrics.into_values().collect();
        records.sort_by_key(|t| t.metric as u8);
        records
    }
}
