use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{parse_cpu_millis, parse_memory_bytes, Metadata};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Node {
    pub metadata: Metadata,
    pub status: NodeStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStatus {
    /// Total resources of the node.
    pub capacity: HashMap<String, String>,
    /// Resources available for scheduling. Defaults to capacity.
    pub allocatable: HashMap<String, String>,
}

impl Node {
    pub fn allocatable_cpu_millis(&self) -> i64 {
        self.quantity(&self.status.allocatable, "cpu")
            .or_else(|| self.quantity(&self.status.capacity, "cpu"))
            .unwrap_or(0)
    }

    pub fn allocatable_memory_bytes(&self) -> i64 {
        let parse = |m: &HashMap<String, String>| {
            m.get("memory").and_then(|q| parse_memory_bytes(q))
        };
        parse(&self.status.allocatable)
            .or_else(|| parse(&self.status.capacity))
            .unwrap_or(0)
    }

    fn quantity(&self, map: &HashMap<String, String>, key: &str) -> Option<i64> {
        map.get(key).and_then(|q| parse_cpu_millis(q))
    }
}
