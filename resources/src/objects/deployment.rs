use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{parse_cpu_millis, parse_memory_bytes, Metadata};

/// Subset of `apps/v1` Deployment the operator reads and patches.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Deployment {
    pub metadata: Metadata,
    pub spec: DeploymentSpec,
    pub status: Option<DeploymentStatus>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub selector: LabelSelector,
    pub template: PodTemplateSpec,
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSelector {
    pub match_labels: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: Metadata,
    pub spec: PodTemplateInner,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodTemplateInner {
    pub containers: Vec<Container>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ResourceRequirements {
    pub requests: HashMap<String, String>,
    pub limits: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentStatus {
    pub replicas: u32,
    pub ready_replicas: u32,
    pub available_replicas: u32,
}

impl Deployment {
    /// Summed CPU requests across template containers, in millicores.
    pub fn cpu_request_millis(&self) -> i64 {
        self.spec
            .template
            .spec
            .containers
            .iter()
            .filter_map(|c| c.resources.requests.get("cpu"))
            .filter_map(|q| parse_cpu_millis(q))
            .sum()
    }

    /// Summed memory requests across template containers, in bytes.
    pub fn memory_request_bytes(&self) -> i64 {
        self.spec
            .template
            .spec
            .containers
            .iter()
            .filter_map(|c| c.resources.requests.get("memory"))
            .filter_map(|q| parse_memory_bytes(q))
            .sum()
    }

    pub fn ready_fraction(&self) -> f64 {
        let status = match &self.status {
            Some(status) => status,
            None => return 0.0,
        };
        if self.spec.replicas == 0 {
            return 1.0;
        }
        status.ready_replicas as f64 / self.spec.replicas as f64
    }
}
