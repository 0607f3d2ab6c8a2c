//! PromQL used by the collector.
//!
//! Real clusters split node metrics between node-exporter, cAdvisor and
//! kube-state-metrics with inconsistent `instance`/`node` labeling, so the
//! node-level queries each carry five fallback variants tried in declared
//! order. The first non-empty, non-zero result wins and its variant is
//! remembered for diagnostics.

/// One fallback variant for a node-level query. `node_label` names the
/// label carrying the node identity in this variant's result.
#[derive(Debug, Clone, Copy)]
pub struct NodeQueryVariant {
    pub name: &'static str,
    pub expr: &'static str,
    pub node_label: &'static str,
}

pub const NODE_CPU_VARIANTS: [NodeQueryVariant; 5] = [
    NodeQueryVariant {
        name: "node-exporter/instance",
        expr: "100 - (avg by (instance) (rate(node_cpu_seconds_total{mode=\"idle\"}[5m])) * 100)",
        node_label: "instance",
    },
    NodeQueryVariant {
        name: "node-exporter/node",
        expr: "100 - (avg by (node) (rate(node_cpu_seconds_total{mode=\"idle\"}[5m])) * 100)",
        node_label: "node",
    },
    NodeQueryVariant {
        name: "recording-rule",
        expr: "instance:node_cpu_utilisation:rate5m * 100",
        node_label: "instance",
    },
    NodeQueryVariant {
        name: "cadvisor-root",
        expr: "sum by (instance) (rate(container_cpu_usage_seconds_total{id=\"/\"}[5m])) \
               / on (instance) machine_cpu_cores * 100",
        node_label: "instance",
    },
    NodeQueryVariant {
        name: "node-exporter/busy",
        expr: "avg by (instance) (1 - rate(node_cpu_seconds_total{mode=\"idle\"}[5m])) * 100",
        node_label: "instance",
    },
];

pub const NODE_MEMORY_VARIANTS: [NodeQueryVariant; 5] = [
    NodeQueryVariant {
        name: "node-exporter/available",
        expr: "(1 - node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes) * 100",
        node_label: "instance",
    },
    NodeQueryVariant {
        name: "node-exporter/node-label",
        expr: "(1 - sum by (node) (node_memory_MemAvailable_bytes) \
               / sum by (node) (node_memory_MemTotal_bytes)) * 100",
        node_label: "node",
    },
    NodeQueryVariant {
        name: "recording-rule",
        expr: "instance:node_memory_utilisation:ratio * 100",
        node_label: "instance",
    },
    NodeQueryVariant {
        name: "node-exporter/free-buffers-cached",
        expr: "(node_memory_MemTotal_bytes - node_memory_MemFree_bytes \
               - node_memory_Buffers_bytes - node_memory_Cached_bytes) \
               / node_memory_MemTotal_bytes * 100",
        node_label: "instance",
    },
    NodeQueryVariant {
        name: "cadvisor-vs-allocatable",
        expr: "sum by (node) (container_memory_working_set_bytes{id=\"/\"}) \
               / on (node) kube_node_status_allocatable{resource=\"memory\"} * 100",
        node_label: "node",
    },
];

/// Total CPU usage of a workload's pods in millicores, grouped by pod.
pub fn pod_cpu_query(namespace: &str, deployment: &str) -> String {
    format!(
        "sum by (pod) (\
            rate(\
                container_cpu_usage_seconds_total{{\
                    namespace=\"{}\",\
                    pod=~\"{}-.*\",\
                    container!=\"\",container!=\"POD\"\
                }}[2m]\
            )\
        ) * 1000",
        namespace, deployment
    )
}

/// Working-set memory of a workload's pods in bytes, grouped by pod.
pub fn pod_memory_query(namespace: &str, deployment: &str) -> String {
    format!(
        "sum by (pod) (\
            container_memory_working_set_bytes{{\
                namespace=\"{}\",\
                pod=~\"{}-.*\",\
                container!=\"\",container!=\"POD\"\
            }}\
        )",
        namespace, deployment
    )
}
