use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::workload::WorkloadRef;

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AnomalyKind {
    CpuSpike,
    ScalingThrashing,
    HighMemory,
    LowEfficiency,
    HpaFlapping,
    CostOptimization,
    MemoryLeak,
    PrescaleEvent,
    AutopilotAction,
}

#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Anomaly {
    pub id: Uuid,
    pub workload: Option<WorkloadRef>,
    pub timestamp: NaiveDateTime,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub description: String,
    pub metrics_snapshot: serde_json::Value,
}

impl Anomaly {
    pub fn new(
        workload: Option<WorkloadRef>,
        timestamp: NaiveDateTime,
        kind: AnomalyKind,
        severity: Severity,
        description: String,
        metrics_snapshot: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workload,
            timestamp,
            kind,
            severity,
            description,
            metrics_snapshot,
        }
    }
}
