use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Identity of a managed workload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        }
    }

    /// Store key prefix, also used in log lines.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn parse(key: &str) -> Option<Self> {
        key.split_once('/')
            .map(|(namespace, name)| WorkloadRef::new(namespace, name))
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Ordinal workload class used to arbitrate under cluster pressure.
/// Variant order doubles as processing order within a cycle.
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    BestEffort,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    /// Confidence floor the auto-tuner must clear before proposing
    /// a target change.
    pub fn tuner_confidence_floor(&self) -> f64 {
        match self {
            Priority::Critical => 0.85,
            Priority::High => 0.80,
            Priority::Medium => 0.75,
            Priority::Low => 0.70,
            Priority::BestEffort => 0.65,
        }
    }

    /// Minimum prediction confidence required to pre-scale.
    pub fn prescale_confidence_floor(&self) -> f64 {
        match self {
            Priority::Critical => 0.60,
            Priority::High => 0.65,
            Priority::Medium => 0.70,
            Priority::Low => 0.75,
            Priority::BestEffort => 0.80,
        }
    }

    /// Offset applied to the pattern-default HPA target, in percentage points.
    pub fn target_offset(&self) -> i32 {
        match self {
            Priority::Critical => -15,
            Priority::High => -10,
            Priority::Medium => 0,
            Priority::Low => 10,
            Priority::BestEffort => 15,
        }
    }

    pub fn scale_up_factor(&self) -> f64 {
        match self {
            Priority::Critical => 2.0,
            Priority::High => 1.5,
            Priority::Medium => 1.0,
            Priority::Low => 0.5,
            Priority::BestEffort => 0.25,
        }
    }

    pub fn scale_down_factor(&self) -> f64 {
        match self {
            Priority::Critical => 0.25,
            Priority::High => 0.5,
            Priority::Medium => 1.0,
            Priority::Low => 2.0,
            Priority::BestEffort => 3.0,
        }
    }

    pub fn preemptible(&self) -> bool {
        matches!(self, Priority::Low | Priority::BestEffort)
    }
}

/// A workload under management, merged from configuration and
/// auto-discovery annotations.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Workload {
    #[serde(flatten)]
    pub target: WorkloadRef,
    /// Name of the HPA steering this workload. Absent means the workload
    /// is observed only: no target tuning and no pre-scaling.
    pub hpa_name: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Initial period after a pod start during which its CPU samples are
    /// excluded from learning.
    #[serde(default = "default_startup_filter")]
    pub startup_filter_minutes: u32,
    #[serde(default)]
    pub auto_discovered: bool,
}

fn default_startup_filter() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_key_round_trip() {
        let wl = WorkloadRef::new("demo", "demo-app");
        assert_eq!(wl.key(), "demo/demo-app");
        assert_eq!(WorkloadRef::parse("demo/demo-app"), Some(wl));
        assert_eq!(WorkloadRef::parse("malformed"), None);
    }

    #[test]
    fn priority_processing_order() {
        let mut priorities = vec![
            Priority::Low,
            Priority::Critical,
            Priority::BestEffort,
            Priority::Medium,
            Priority::High,
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![
                Priority::Critical,
                Priority::High,
                Priority::Medium,
                Priority::Low,
                Priority::BestEffort,
            ]
        );
    }
}
