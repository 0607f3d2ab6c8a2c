use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{
    learning::Horizon,
    workload::WorkloadRef,
};

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PrescaleState {
    Idle,
    PreScaling,
    CoolingDown,
}

/// Per-workload pre-scale bookkeeping. The `original_*` fields are captured
/// once, on first read, and are the source of truth for rollback; patches
/// made by the operator itself never overwrite them.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PrescaleProfile {
    pub workload: WorkloadRef,
    pub state: PrescaleState,
    pub original_min_replicas: Option<u32>,
    pub original_max_replicas: Option<u32>,
    pub current_min_replicas: u32,
    pub pre_scale_started_at: Option<NaiveDateTime>,
    pub pre_scale_reason: Option<String>,
    pub predicted_cpu: Option<f64>,
    pub prediction_confidence: Option<f64>,
    pub prediction_window: Option<Horizon>,
    pub rollback_at: Option<NaiveDateTime>,
    pub cooldown_until: Option<NaiveDateTime>,
    /// Consecutive intervals with all predictions below the threshold
    /// while PreScaling; two trigger an early rollback.
    pub low_prediction_streak: u32,
    pub pre_scale_count: u64,
    pub successful_predictions: u64,
    pub failed_predictions: u64,
    /// Set while the coordinator has preempted this workload's maxReplicas.
    pub preempted_at: Option<NaiveDateTime>,
    pub preempted_max_replicas: Option<u32>,
}

impl PrescaleProfile {
    pub fn new(workload: WorkloadRef) -> Self {
        Self {
            workload,
            state: PrescaleState::Idle,
            original_min_replicas: None,
            original_max_replicas: None,
            current_min_replicas: 0,
            pre_scale_started_at: None,
            pre_scale_reason: None,
            predicted_cpu: None,
            prediction_confidence: None,
            prediction_window: None,
            rollback_at: None,
            cooldown_until: None,
            low_prediction_streak: 0,
            pre_scale_count: 0,
            successful_predictions: 0,
            failed_predictions: 0,
            preempted_at: None,
            preempted_max_replicas: None,
        }
    }
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AutopilotLevel {
    Disabled,
    Observe,
    Recommend,
    Autopilot,
}

impl Default for AutopilotLevel {
    fn default() -> Self {
        AutopilotLevel::Disabled
    }
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AutopilotState {
    Learning,
    Ready,
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl ResourceKind {
    pub fn as_k8s_key(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
        }
    }
}

/// Health counters snapshotted at apply time and compared by the monitor.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    pub restart_count: u32,
    pub oom_count: u32,
    pub ready_fraction: f64,
}

/// The request change an apply performed, kept for auto-rollback.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RequestChange {
    pub container: String,
    pub resource: ResourceKind,
    pub previous: String,
    pub applied: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PendingHealthCheck {
    pub applied_at: NaiveDateTime,
    pub until: NaiveDateTime,
    pub snapshot: HealthSnapshot,
    pub changes: Vec<RequestChange>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AutopilotProfile {
    pub workload: WorkloadRef,
    pub state: AutopilotState,
    pub learning_started_at: NaiveDateTime,
    pub baseline_cpu_p95: Option<f64>,
    pub baseline_memory_p95: Option<f64>,
    pub samples_collected: u64,
    /// Cooldown is a property of this timestamp.
    pub last_action_at: Option<NaiveDateTime>,
    pub pending: Option<PendingHealthCheck>,
    pub auto_rollbacks: u64,
}

impl AutopilotProfile {
    pub fn new(workload: WorkloadRef, now: NaiveDateTime) -> Self {
        Self {
            workload,
            state: AutopilotState::Learning,
            learning_started_at: now,
            baseline_cpu_p95: None,
            baseline_memory_p95: None,
            samples_collected: 0,
            last_action_at: None,
            pending: None,
            auto_rollbacks: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Recommendation {
    pub id: Uuid,
    pub workload: WorkloadRef,
    pub created_at: NaiveDateTime,
    pub container: String,
    pub resource: ResourceKind,
    pub current: String,
    pub target: String,
    pub change_percent: f64,
    pub confidence: f64,
    pub reason: String,
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionEffect {
    /// Prior state recorded, patch not yet acknowledged. Only visible
    /// while a patch is in flight or after a crash mid-apply.
    Pending,
    Applied,
    /// The patch was sent and rejected; nothing changed on the cluster.
    Failed,
    NoOp,
}

/// Audit row for every mutation; carries enough to reconstruct the prior
/// state. Written as `Pending` before the patch is sent and finalized to
/// `Applied` or `Failed` once the cluster answered.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppliedAction {
    pub id: Uuid,
    pub workload: WorkloadRef,
    pub timestamp: NaiveDateTime,
    pub field: String,
    pub previous: String,
    pub desired: String,
    pub reason: String,
    pub dry_run: bool,
    pub effect: ActionEffect,
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    CooldownActive,
    LowConfidence,
    LearningActive,
    ObservationWindow,
    ChangeTooSmall,
    PriorityDegrade,
    PrescaleConflict,
}

/// Guardrail denial, recorded instead of an action.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SkipRecord {
    pub workload: WorkloadRef,
    pub timestamp: NaiveDateTime,
    pub lever: String,
    pub reason: SkipReason,
    pub detail: String,
}
