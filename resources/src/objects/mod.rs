use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub mod deployment;
pub mod hpa;
pub mod node;
pub mod pod;

/// Subset of Kubernetes object metadata the operator reads.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Metadata {
    pub name: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

/// List envelope returned by the Kubernetes API.
#[derive(Debug, Serialize, Deserialize)]
pub struct KubeList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// Parse a Kubernetes CPU quantity into millicores.
/// Accepts `"250m"`, `"1"`, `"1.5"` and the raw nano form `"1500000n"`.
pub fn parse_cpu_millis(quantity: &str) -> Option<i64> {
    let q = quantity.trim();
    if q.is_empty() {
        return None;
    }
    if let Some(n) = q.strip_suffix('n') {
        return n.parse::<i64>().ok().map(|v| v / 1_000_000);
    }
    if let Some(m) = q.strip_suffix('m') {
        return m.parse::<i64>().ok();
    }
    q.parse::<f64>().ok().map(|cores| (cores * 1000.0) as i64)
}

/// Parse a Kubernetes memory quantity into bytes.
pub fn parse_memory_bytes(quantity: &str) -> Option<i64> {
    let q = quantity.trim();
    if q.is_empty() {
        return None;
    }
    let suffixes: [(&str, i64); 10] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1i64 << 40),
        ("K", 1_000),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("", 1),
    ];
    for (suffix, factor) in suffixes {
        if suffix.is_empty() {
            return q.parse::<f64>().ok().map(|v| v as i64);
        }
        if let Some(value) = q.strip_suffix(suffix) {
            return value.parse::<f64>().ok().map(|v| (v * factor as f64) as i64);
        }
    }
    None
}

/// Render millicores back into the `"250m"` form used in patches.
pub fn format_cpu_millis(millis: i64) -> String {
    format!("{}m", millis)
}

/// Render bytes back into a Mi-granular quantity used in patches.
pub fn format_memory_bytes(bytes: i64) -> String {
    format!("{}Mi", (bytes as f64 / (1 << 20) as f64).ceil() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quantities() {
        assert_eq!(parse_cpu_millis("250m"), Some(250));
        assert_eq!(parse_cpu_millis("1"), Some(1000));
        assert_eq!(parse_cpu_millis("1.5"), Some(1500));
        assert_eq!(parse_cpu_millis(""), None);
    }

    #[test]
    fn memory_quantities() {
        assert_eq!(parse_memory_bytes("64Mi"), Some(64 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("1Gi"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("128974848"), Some(128974848));
        assert_eq!(parse_memory_bytes("1500K"), Some(1_500_000));
    }

    #[test]
    fn quantity_formatting() {
        assert_eq!(format_cpu_millis(300), "300m");
        assert_eq!(format_memory_bytes(256 * 1024 * 1024), "256Mi");
    }
}
