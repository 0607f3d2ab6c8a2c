//! Post-apply health monitor. After an autopilot apply the workload is
//! watched for a fixed window; restart, OOM-kill or readiness regressions
//! against the apply-time snapshot revert the request change.

use std::sync::Arc;

use anyhow::Result;
use resources::{
    anomaly::{Anomaly, AnomalyKind, Severity},
    config::AutopilotConfig,
    objects::{deployment::Deployment, pod::Pod},
    profiles::HealthSnapshot,
};
use serde_json::json;

use crate::{actuator::Actuator, clock::Clock, kube::ClusterApi, store::MetricStore};

pub fn snapshot(deployment: &Deployment, pods: &[Pod]) -> HealthSnapshot {
    HealthSnapshot {
        restart_count: pods.iter().map(Pod::restart_count).sum(),
        oom_count: pods.iter().map(Pod::oom_count).sum(),
        ready_fraction: deployment.ready_fraction(),
    }
}

pub struct HealthMonitor {
    config: AutopilotConfig,
}

impl HealthMonitor {
    pub fn new(config: AutopilotConfig) -> Self {
        Self { config }
    }

    fn breach(&self, before: &HealthSnapshot, current: &HealthSnapshot) -> Option<String> {
        let restart_delta = current.restart_count.saturating_sub(before.restart_count);
        if restart_delta > self.config.max_restart_increase {
            return Some(format!("{} new restarts", restart_delta));
        }
        let oom_delta = current.oom_count.saturating_sub(before.oom_count);
        if oom_delta > self.config.max_oom_increase {
            return Some(format!("{} new OOM kills", oom_delta));
        }
        let readiness_drop = (before.ready_fraction - current.ready_fraction) * 100.0;
        if readiness_drop > self.config.max_readiness_drop_percent {
            return Some(format!("readiness dropped {:.0} points", readiness_drop));
        }
        None
    }

    /// Sweep every profile with a pending check. Breaches revert by
    /// re-applying the snapshot; clean expiry clears the pending check.
    pub async fn run(
        &self,
        store: &MetricStore,
        cluster: &Arc<dyn ClusterApi>,
        actuator: &Actuator,
        clock: &dyn Clock,
    ) -> Result<Vec<Anomaly>> {
        let now = clock.now();
        let mut anomalies = Vec::new();
        for mut profile in store.all_autopilot()? {
            let pending = match &profile.pending {
                Some(pending) => pending.clone(),
                None => continue,
            };
            let workload = profile.workload.clone();
            let deployment = match cluster
                .get_deployment(&workload.namespace, &workload.name)
                .await
            {
                Ok(deployment) => deployment,
                Err(err) => {
                    tracing::warn!("Health check for {} skipped: {:#}", workload, err);
                    continue;
                },
            };
            let pods = cluster
                .list_pods(&workload.namespace, &deployment.spec.selector.match_labels)
                .await
                .unwrap_or_default();
            let current = snapshot(&deployment, &pods);

            if let Some(breach) = self.breach(&pending.snapshot, &current) {
                for change in &pending.changes {
                    actuator
                        .ensure_container_requests(
                            &workload,
                            &deployment,
                            &change.container,
                            change.resource,
                            &change.previous,
                            "autopilot auto-rollback",
                        )
                        .await?;
                }
                profile.pending = None;
                profile.auto_rollbacks += 1;
                store.put_autopilot(&profile)?;

                let anomaly = Anomaly::new(
                    Some(workload.clone()),
                    now,
                    AnomalyKind::AutopilotAction,
                    Severity::Warning,
                    format!(
                        "Auto-rolled back autopilot change on {}: {}",
                        workload, breach
                    ),
                    json!({
                        "breach": breach,
                        "snapshot": pending.snapshot,
                        "observed": current,
                    }),
                );
                store.append_anomaly(&anomaly)?;
                anomalies.push(anomaly);
            } else if now >= pending.until {
                profile.pending = None;
                store.put_autopilot(&profile)?;
                tracing::info!("Autopilot change on {} verified healthy", workload);
            }
        }
        Ok(anomalies)
    }
}
