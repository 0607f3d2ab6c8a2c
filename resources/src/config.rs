use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{profiles::AutopilotLevel, workload::Priority};

/// Process-wide configuration. Loaded once at startup from a YAML file
/// overlaid with environment variables; passed explicitly to every
/// component.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct OperatorConfig {
    pub check_interval_secs: u64,
    pub metrics_url: String,
    pub mimir_tenant_id: Option<String>,
    pub metrics_auth: MetricsAuth,
    pub kube_api_url: String,
    pub kube_token: Option<String>,
    pub kube_insecure_tls: bool,
    pub listen_addr: String,
    pub log_level: String,
    pub data_dir: String,
    pub target_node_utilization: f64,
    pub dry_run: bool,
    pub enable_predictive: bool,
    pub enable_autotuning: bool,
    pub enable_autopilot: bool,
    pub enable_prescale: bool,
    pub enable_auto_discovery: bool,
    pub prescale: PrescaleConfig,
    pub autopilot: AutopilotConfig,
    pub tuner: TunerConfig,
    pub retention: RetentionConfig,
    pub costs: CostConfig,
    pub prom_rate_limit: u32,
    pub k8s_rate_limit: u32,
    pub prom_timeout_secs: u64,
    pub kube_timeout_secs: u64,
    pub webhook_timeout_secs: u64,
    pub workloads: Vec<WorkloadConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MetricsAuth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    Headers { headers: HashMap<String, String> },
}

impl Default for MetricsAuth {
    fn default() -> Self {
        MetricsAuth::None
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct PrescaleConfig {
    pub min_confidence: f64,
    pub threshold: f64,
    pub rollback_minutes: i64,
    pub cooldown_minutes: i64,
}

impl Default for PrescaleConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.70,
            threshold: 75.0,
            rollback_minutes: 60,
            cooldown_minutes: 15,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct AutopilotConfig {
    pub level: AutopilotLevel,
    pub min_confidence: f64,
    pub max_change_percent: f64,
    pub cooldown_hours: i64,
    pub enable_learning_mode: bool,
    pub learning_days: i64,
    pub auto_graduate: bool,
    pub min_observation_days: i64,
    pub enable_auto_rollback: bool,
    pub rollback_monitor_minutes: i64,
    pub max_restart_increase: u32,
    pub max_oom_increase: u32,
    pub max_readiness_drop_percent: f64,
    /// Fraction added on top of the p95 when sizing requests.
    pub cpu_safety_fraction: f64,
    pub memory_safety_fraction: f64,
    pub cpu_base_headroom_millis: i64,
    pub memory_base_headroom_bytes: i64,
    /// Raise the memory floor from 64Mi to 256Mi when recommending,
    /// to avoid OOMs on tight workloads.
    pub strict_memory_floor: bool,
    /// |change| above which critical/high priority applies degrade to
    /// Recommend and wait for a human.
    pub priority_degrade_percent: f64,
    /// Minimum relative change worth recommending at all.
    pub min_change_percent: f64,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            level: AutopilotLevel::Disabled,
            min_confidence: 0.80,
            max_change_percent: 30.0,
            cooldown_hours: 24,
            enable_learning_mode: true,
            learning_days: 7,
            auto_graduate: true,
            min_observation_days: 7,
            enable_auto_rollback: true,
            rollback_monitor_minutes: 10,
            max_restart_increase: 2,
            max_oom_increase: 1,
            max_readiness_drop_percent: 20.0,
            cpu_safety_fraction: 0.15,
            memory_safety_fraction: 0.20,
            cpu_base_headroom_millis: 10,
            memory_base_headroom_bytes: 32 * 1024 * 1024,
            strict_memory_floor: false,
            priority_degrade_percent: 15.0,
            min_change_percent: 20.0,
        }
    }
}

/// The reward weighting is deliberately tunable; starting values follow
/// the tuner design.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct TunerConfig {
    pub epsilon: f64,
    pub learning_rate: f64,
    pub waste_weight: f64,
    pub thrash_weight: f64,
    pub exploration_radius: f64,
    pub min_step: f64,
    /// Scaling events per hour above which the reward treats the
    /// workload as thrashing.
    pub thrash_event_density: f64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.20,
            learning_rate: 0.10,
            waste_weight: 1.0,
            thrash_weight: 1.0,
            exploration_radius: 5.0,
            min_step: 3.0,
            thrash_event_density: 4.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct RetentionConfig {
    pub samples_days: i64,
    pub events_days: i64,
    pub predictions_days: i64,
    pub anomalies_days: i64,
    pub cleanup_interval_hours: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            samples_days: 30,
            events_days: 30,
            predictions_days: 30,
            anomalies_days: 90,
            cleanup_interval_hours: 6,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct CostConfig {
    pub per_vcpu_hour: f64,
    pub per_gb_memory_hour: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            per_vcpu_hour: 0.04,
            per_gb_memory_hour: 0.005,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct WorkloadConfig {
    pub namespace: String,
    pub name: String,
    pub hpa_name: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_startup_filter")]
    pub startup_filter_minutes: u32,
}

fn default_startup_filter() -> u32 {
    5
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            metrics_url: "http://prometheus:9090".to_string(),
            mimir_tenant_id: None,
            metrics_auth: MetricsAuth::None,
            kube_api_url: "https://kubernetes.default.svc".to_string(),
            kube_token: None,
            kube_insecure_tls: false,
            listen_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            data_dir: "/var/lib/smart-autoscaler".to_string(),
            target_node_utilization: 30.0,
            dry_run: false,
            enable_predictive: true,
            enable_autotuning: true,
            enable_autopilot: false,
            enable_prescale: true,
            enable_auto_discovery: true,
            prescale: PrescaleConfig::default(),
            autopilot: AutopilotConfig::default(),
            tuner: TunerConfig::default(),
            retention: RetentionConfig::default(),
            costs: CostConfig::default(),
            prom_rate_limit: 10,
            k8s_rate_limit: 20,
            prom_timeout_secs: 5,
            kube_timeout_secs: 10,
            webhook_timeout_secs: 5,
            workloads: Vec::new(),
        }
    }
}
