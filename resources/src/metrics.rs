use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::workload::WorkloadRef;

/// One collection-cycle observation of a workload, aggregated over its
/// ready pods. Immutable after write.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MetricSample {
    pub workload: WorkloadRef,
    pub timestamp: NaiveDateTime,
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    pub replica_count: u32,
    /// CPU utilization relative to requests, clamped to [0, 200] to allow
    /// overshoot readings.
    pub cpu_percent: f64,
    /// Set while any pod of the workload is inside its startup filter
    /// window; learners skip flagged rows.
    #[serde(default)]
    pub startup: bool,
}

impl MetricSample {
    pub fn cpu_millis_per_pod(&self) -> f64 {
        if self.replica_count == 0 {
            return 0.0;
        }
        self.cpu_millicores as f64 / self.replica_count as f64
    }

    pub fn memory_bytes_per_pod(&self) -> f64 {
        if self.replica_count == 0 {
            return 0.0;
        }
        self.memory_bytes as f64 / self.replica_count as f64
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScalingEvent {
    pub workload: WorkloadRef,
    pub timestamp: NaiveDateTime,
    pub old_replicas: u32,
    pub new_replicas: u32,
    pub reason: String,
}

/// Per-node usage for one cycle, with the query variant that produced it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NodeUsage {
    pub node: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub allocatable_cpu_millis: i64,
    pub allocatable_memory_bytes: i64,
    pub cpu_source: String,
    pub memory_source: String,
}

/// Cluster-wide view assembled by summing per-node values.
/// Never the product of a separate cluster-level query.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ClusterSnapshot {
    pub collected_at: Option<NaiveDateTime>,
    pub nodes: Vec<NodeUsage>,
    pub cpu_used_millis: i64,
    pub cpu_allocatable_millis: i64,
    pub memory_used_bytes: i64,
    pub memory_allocatable_bytes: i64,
}

impl ClusterSnapshot {
    /// Used CPU divided by allocatable CPU, cluster-wide.
    pub fn cpu_pressure(&self) -> f64 {
        if self.cpu_allocatable_millis == 0 {
            return 0.0;
        }
        self.cpu_used_millis as f64 / self.cpu_allocatable_millis as f64
    }
}
