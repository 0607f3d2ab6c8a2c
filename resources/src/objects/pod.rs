use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Metadata;

/// Subset of the Pod object: enough to judge readiness, restarts and
/// OOM kills, and to apply the startup filter.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Pod {
    pub metadata: Metadata,
    pub status: Option<PodStatus>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PodStatus {
    pub phase: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub conditions: Vec<PodCondition>,
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerStatus {
    pub name: String,
    pub restart_count: u32,
    pub last_state: Option<ContainerState>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ContainerState {
    pub terminated: Option<TerminatedState>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminatedState {
    pub reason: Option<String>,
    pub exit_code: i32,
}

impl Pod {
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.phase.as_deref() == Some("Running")
                    && s.conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }

    pub fn restart_count(&self) -> u32 {
        self.status
            .as_ref()
            .map(|s| s.container_statuses.iter().map(|c| c.restart_count).sum())
            .unwrap_or(0)
    }

    /// Containers whose last termination was an OOM kill.
    pub fn oom_count(&self) -> u32 {
        self.status
            .as_ref()
            .map(|s| {
                s.container_statuses
                    .iter()
                    .filter(|c| {
                        c.last_state
                            .as_ref()
                            .and_then(|ls| ls.terminated.as_ref())
                            .map(|t| t.reason.as_deref() == Some("OOMKilled"))
                            .unwrap_or(false)
                    })
                    .count() as u32
            })
            .unwrap_or(0)
    }

    /// True while the pod is inside its startup filter window.
    pub fn in_startup_window(&self, now: DateTime<Utc>, filter_minutes: u32) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.start_time)
            .map(|start| now - start < chrono::Duration::minutes(filter_minutes as i64))
            .unwrap_or(false)
    }
}
