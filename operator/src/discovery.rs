//! Workload inventory: configured entries merged with HPAs adopted via
//! the `smart-autoscaler.io/enabled` annotation. Configuration wins on
//! conflict.

use std::collections::HashMap;
use std::str::FromStr;

use resources::{
    config::OperatorConfig,
    objects::hpa::HorizontalPodAutoscaler,
    workload::{Priority, Workload, WorkloadRef},
};

pub const ENABLED_ANNOTATION: &str = "smart-autoscaler.io/enabled";
pub const PRIORITY_ANNOTATION: &str = "smart-autoscaler.io/priority";
pub const STARTUP_FILTER_ANNOTATION: &str = "smart-autoscaler.io/startup-filter";

pub fn discover(config: &OperatorConfig, hpas: &[HorizontalPodAutoscaler]) -> Vec<Workload> {
    let mut by_target: HashMap<WorkloadRef, Workload> = HashMap::new();

    if config.enable_auto_discovery {
        for hpa in hpas {
            if hpa
                .metadata
                .annotations
                .get(ENABLED_ANNOTATION)
                .map(|v| v == "true")
                .unwrap_or(false)
            {
                let workload = from_annotations(hpa);
                by_target.insert(workload.target.clone(), workload);
            }
        }
    }

    // Configured workloads override discovered ones.
    for entry in &config.workloads {
        let target = WorkloadRef::new(&entry.namespace, &entry.name);
        by_target.insert(
            target.clone(),
            Workload {
                target,
                hpa_name: entry.hpa_name.clone(),
                priority: entry.priority,
                startup_filter_minutes: entry.startup_filter_minutes,
                auto_discovered: false,
            },
        );
    }

    by_target.into_values().collect()
}

fn from_annotations(hpa: &HorizontalPodAutoscaler) -> Workload {
    let annotations = &hpa.metadata.annotations;
    let priority = annotations
        .get(PRIORITY_ANNOTATION)
        .and_then(|v| Priority::from_str(v).ok())
        .unwrap_or_default();
    let startup_filter_minutes = annotations
        .get(STARTUP_FILTER_ANNOTATION)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(5);
    Workload {
        target: WorkloadRef::new(&hpa.metadata.namespace, &hpa.spec.scale_target_ref.name),
        hpa_name: Some(hpa.metadata.name.clone()),
        priority,
        startup_filter_minutes,
        auto_discovered: true,
    }
}

#[cfg(test)]
mod tests {
    use resources::{
        config::WorkloadConfig,
        objects::hpa::{HorizontalPodAutoscalerSpec, ScaleTargetRef},
        objects::Metadata,
    };

    use super::*;

    fn annotated_hpa(annotations: &[(&str, &str)]) -> HorizontalPodAutoscaler {
        HorizontalPodAutoscaler {
            metadata: Metadata {
                name: "demo-app-hpa".to_string(),
                namespace: "demo".to_string(),
                annotations: annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Metadata::default()
            },
            spec: HorizontalPodAutoscalerSpec {
                max_replicas: 10,
                min_replicas: Some(2),
                scale_target_ref: ScaleTargetRef {
                    api_version: Some("apps/v1".to_string()),
                    kind: "Deployment".to_string(),
                    name: "demo-app".to_string(),
                },
                metrics: Vec::new(),
            },
            status: None,
        }
    }

    #[test]
    fn annotated_hpas_are_adopted() {
        let config = OperatorConfig {
            enable_auto_discovery: true,
            ..OperatorConfig::default()
        };
        let hpas = vec![
            annotated_hpa(&[
                (ENABLED_ANNOTATION, "true"),
                (PRIORITY_ANNOTATION, "high"),
                (STARTUP_FILTER_ANNOTATION, "10"),
            ]),
            {
                let mut unannotated = annotated_hpa(&[]);
                unannotated.metadata.name = "other-hpa".to_string();
                unannotated.spec.scale_target_ref.name = "other".to_string();
                unannotated
            },
        ];
        let workloads = discover(&config, &hpas);
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].target, WorkloadRef::new("demo", "demo-app"));
        assert_eq!(workloads[0].priority, Priority::High);
        assert_eq!(workloads[0].startup_filter_minutes, 10);
        assert!(workloads[0].auto_discovered);
    }

    #[test]
    fn configuration_overrides_discovery() {
        let mut config = OperatorConfig {
            enable_auto_discovery: true,
            ..OperatorConfig::default()
        };
        config.workloads.push(WorkloadConfig {
            namespace: "demo".to_string(),
            name: "demo-app".to_string(),
            hpa_name: Some("demo-app-hpa".to_string()),
            priority: Priority::Critical,
            startup_filter_minutes: 3,
        });
        let hpas = vec![annotated_hpa(&[
            (ENABLED_ANNOTATION, "true"),
            (PRIORITY_ANNOTATION, "low"),
        ])];
        let workloads = discover(&config, &hpas);
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].priority, Priority::Critical);
        assert!(!workloads[0].auto_discovered);
    }

    #[test]
    fn discovery_can_be_disabled() {
        let config = OperatorConfig {
            enable_auto_discovery: false,
            ..OperatorConfig::default()
        };
        let hpas = vec![annotated_hpa(&[(ENABLED_ANNOTATION, "true")])];
        assert!(discover(&config, &hpas).is_empty());
    }
}
