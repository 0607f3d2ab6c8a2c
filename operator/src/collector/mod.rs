use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use resources::{
    config::OperatorConfig,
    metrics::{ClusterSnapshot, MetricSample, NodeUsage},
    objects::{deployment::Deployment, node::Node, pod::Pod},
    workload::Workload,
};

use self::{
    prom::{PromClient, VectorSample},
    queries::{NodeQueryVariant, NODE_CPU_VARIANTS, NODE_MEMORY_VARIANTS},
};

pub mod prom;
pub mod queries;

/// Fallback CPU request assumed when a pod template carries none, so a
/// utilization percentage can still be derived.
const DEFAULT_POD_CPU_REQUEST_MILLIS: i64 = 1000;

/// Periodic puller of workload and node usage from the metrics source.
pub struct Collector {
    prom: PromClient,
    /// Variant index that last succeeded, per metric family.
    last_good: DashMap<&'static str, usize>,
    /// Malformed-response patterns already logged, one log line each.
    logged_malformed: DashMap<String, ()>,
}

impl Collector {
    pub fn new(config: &OperatorConfig) -> Result<Self> {
        Ok(Self {
            prom: PromClient::new(config)?,
            last_good: DashMap::new(),
            logged_malformed: DashMap::new(),
        })
    }

    /// Node usage for every cluster node, then cluster totals summed from
    /// the per-node values fetched this cycle. A separate cluster-level
    /// query is deliberately never issued.
    pub async fn collect_cluster(
        &self,
        nodes: &[Node],
        now: NaiveDateTime,
    ) -> Result<ClusterSnapshot> {
        let (cpu_by_node, cpu_source) = self
            .query_with_fallbacks("node_cpu", &NODE_CPU_VARIANTS)
            .await?;
        let (memory_by_node, memory_source) = self
            .query_with_fallbacks("node_memory", &NODE_MEMORY_VARIANTS)
            .await?;

        let mut usages = Vec::with_capacity(nodes.len());
        let mut cpu_used = 0i64;
        let mut cpu_allocatable = 0i64;
        let mut memory_used = 0i64;
        let mut memory_allocatable = 0i64;
        for node in nodes {
            let name = &node.metadata.name;
            let cpu_percent = lookup_node_value(&cpu_by_node, name).unwrap_or(0.0);
            let memory_percent = lookup_node_value(&memory_by_node, name).unwrap_or(0.0);
            let alloc_cpu = node.allocatable_cpu_millis();
            let alloc_memory = node.allocatable_memory_bytes();
            cpu_used += (cpu_percent / 100.0 * alloc_cpu as f64) as i64;
            cpu_allocatable += alloc_cpu;
            memory_used += (memory_percent / 100.0 * alloc_memory as f64) as i64;
            memory_allocatable += alloc_memory;
            usages.push(NodeUsage {
                node: name.to_owned(),
                cpu_percent,
                memory_percent,
                allocatable_cpu_millis: alloc_cpu,
                allocatable_memory_bytes: alloc_memory,
                cpu_source: cpu_source.to_owned(),
                memory_source: memory_source.to_owned(),
            });
        }
        Ok(ClusterSnapshot {
            collected_at: Some(now),
            nodes: usages,
            cpu_used_millis: cpu_used,
            cpu_allocatable_millis: cpu_allocatable,
            memory_used_bytes: memory_used,
            memory_allocatable_bytes: memory_allocatable,
        })
    }

    /// One aggregated sample for a workload. Pods inside their startup
    /// window are excluded from the sums and flag the sample instead.
    pub async fn collect_workload(
        &self,
        workload: &Workload,
        deployment: &Deployment,
        pods: &[Pod],
        now: NaiveDateTime,
    ) -> Result<MetricSample> {
        let now_utc = DateTime::<Utc>::from_utc(now, Utc);
        let mut counted = HashSet::new();
        let mut warming = HashSet::new();
        for pod in pods {
            if !pod.is_ready() {
                continue;
            }
            if pod.in_startup_window(now_utc, workload.startup_filter_minutes) {
                warming.insert(pod.metadata.name.to_owned());
            } else {
                counted.insert(pod.metadata.name.to_owned());
            }
        }

        let cpu = self
            .prom
            .instant(&queries::pod_cpu_query(
                &workload.target.namespace,
                &workload.target.name,
            ))
            .await?;
        let memory = self
            .prom
            .instant(&queries::pod_memory_query(
                &workload.target.namespace,
                &workload.target.name,
            ))
            .await?;

        let sum_counted = |samples: &[VectorSample]| {
            samples
                .iter()
                .filter(|s| {
                    s.labels
                        .get("pod")
                        .map(|pod| counted.contains(pod))
                        .unwrap_or(false)
                })
                .map(|s| s.value)
                .sum::<f64>()
        };
        let cpu_millicores = sum_counted(&cpu) as i64;
        let memory_bytes = sum_counted(&memory) as i64;

        let replica_count = deployment.spec.replicas;
        let mut per_pod_request = deployment.cpu_request_millis();
        if per_pod_request == 0 {
            tracing::debug!(
                "No CPU request on {}, assuming {}m per pod",
                workload.target,
                DEFAULT_POD_CPU_REQUEST_MILLIS
            );
            per_pod_request = DEFAULT_POD_CPU_REQUEST_MILLIS;
        }
        let denominator = (counted.len().max(1) as i64 * per_pod_request) as f64;
        let cpu_percent = (cpu_millicores as f64 / denominator * 100.0).clamp(0.0, 200.0);

        Ok(MetricSample {
            workload: workload.target.clone(),
            timestamp: now,
            cpu_millicores,
            memory_bytes,
            replica_count,
            cpu_percent,
            startup: !warming.is_empty(),
        })
    }

    /// Try each variant in declared order; the first non-empty, non-zero
    /// result wins. The winning variant is remembered and logged for
    /// diagnostics.
    async fn query_with_fallbacks(
        &self,
        family: &'static str,
        variants: &[NodeQueryVariant],
    ) -> Result<(HashMap<String, f64>, &'static str)> {
        for (index, variant) in variants.iter().enumerate() {
            let result = self.prom.instant(variant.expr).await;
            let samples = match result {
                Ok(samples) => samples,
                Err(err) => {
                    self.log_malformed_once(family, variant.name, &err);
                    continue;
                },
            };
            if !variant_usable(&samples) {
                tracing::debug!(
                    "{} variant {} returned no usable data, advancing",
                    family,
                    variant.name
                );
                continue;
            }
            if self.last_good.get(family).map(|v| *v) != Some(index) {
                tracing::info!("{} metrics served by variant {}", family, variant.name);
                self.last_good.insert(family, index);
            }
            let by_node = samples
                .into_iter()
                .filter_map(|s| {
                    s.labels
                        .get(variant.node_label)
                        .map(|node| (node.to_owned(), s.value))
                })
                .collect();
            return Ok((by_node, variant.name));
        }
        Err(anyhow!("All {} query variants failed or were empty", family))
    }

    fn log_malformed_once(&self, family: &str, variant: &str, err: &anyhow::Error) {
        let key = format!("{}/{}", family, variant);
        if self.logged_malformed.insert(key, ()).is_none() {
            tracing::warn!("{} variant {} failed: {:#}", family, variant, err);
        }
    }
}

/// Non-empty and not all-zero.
pub(crate) fn variant_usable(samples: &[VectorSample]) -> bool {
    !samples.is_empty() && samples.iter().any(|s| s.value != 0.0)
}

/// Match a metrics label value against a node name; `instance` labels
/// often carry a scrape port suffix.
fn lookup_node_value(by_node: &HashMap<String, f64>, node_name: &str) -> Option<f64> {
    if let Some(value) = by_node.get(node_name) {
        return Some(*value);
    }
    by_node.iter().find_map(|(label, value)| {
        let stripped = label.rsplit_once(':').map(|(host, _)| host).unwrap_or(label);
        if stripped == node_name {
            Some(*value)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vs(label: &str, node: &str, value: f64) -> VectorSample {
        let mut labels = HashMap::new();
        labels.insert(label.to_owned(), node.to_owned());
        VectorSample {
            labels,
            timestamp: 0.0,
            value,
        }
    }

    #[test]
    fn empty_or_zero_variants_are_unusable() {
        assert!(!variant_usable(&[]));
        assert!(!variant_usable(&[vs("instance", "a", 0.0)]));
        assert!(variant_usable(&[
            vs("instance", "a", 0.0),
            vs("instance", "b", 12.0)
        ]));
    }

    #[test]
    fn node_lookup_strips_scrape_port() {
        let mut by_node = HashMap::new();
        by_node.insert("node-a:9100".to_owned(), 55.0);
        assert_eq!(lookup_node_value(&by_node, "node-a"), Some(55.0));
        assert_eq!(lookup_node_value(&by_node, "node-b"), None);
    }
}
