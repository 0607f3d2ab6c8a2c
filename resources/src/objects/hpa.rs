use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Metadata;

/// Subset of `autoscaling/v2` the operator reads and patches.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HorizontalPodAutoscaler {
    pub metadata: Metadata,
    pub spec: HorizontalPodAutoscalerSpec,
    pub status: Option<HorizontalPodAutoscalerStatus>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalPodAutoscalerSpec {
    /// The upper limit for the number of replicas
    /// to which the autoscaler can scale up.
    pub max_replicas: u32,
    /// The lower limit for the number of replicas.
    /// Defaults to 1 pod when unset on the cluster object.
    pub min_replicas: Option<u32>,
    /// Points to the target resource to scale.
    pub scale_target_ref: ScaleTargetRef,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

impl HorizontalPodAutoscaler {
    pub fn min_replicas(&self) -> u32 {
        self.spec.min_replicas.unwrap_or(1)
    }

    /// Current CPU target utilization, if the HPA steers on one.
    pub fn target_utilization(&self) -> Option<u32> {
        self.spec.metrics.iter().find_map(|m| {
            m.resource
                .as_ref()
                .filter(|r| r.name == "cpu")
                .and_then(|r| r.target.average_utilization)
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    pub api_version: Option<String>,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    #[serde(rename = "type")]
    pub type_: String,
    pub resource: Option<ResourceMetricSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetricSpec {
    pub name: String,
    pub target: MetricTarget,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricTarget {
    #[serde(rename = "type")]
    pub type_: String,
    pub average_utilization: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalPodAutoscalerStatus {
    #[serde(default)]
    pub current_replicas: u32,
    #[serde(default)]
    pub desired_replicas: u32,
    pub last_scale_time: Option<DateTime<Utc>>,
}

/// Build the CPU utilization metric block used when patching the target.
pub fn cpu_utilization_metrics(target: u32) -> Vec<MetricSpec> {
    vec![MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSpec {
            name: "cpu".to_string(),
            target: MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(target),
            },
        }),
    }]
}
