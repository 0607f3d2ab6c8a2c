use anyhow::Result;
use chrono::Duration;
use resources::{
    anomaly::{Anomaly, AnomalyKind, Severity},
    config::PrescaleConfig,
    learning::Prediction,
    objects::{deployment::Deployment, hpa::HorizontalPodAutoscaler},
    profiles::{PrescaleProfile, PrescaleState},
    workload::Workload,
};
use serde_json::json;

use crate::{actuator::Actuator, clock::Clock, store::MetricStore};

/// Exiting `PreScaling` without stored originals. Fatal for the workload
/// only; the control plane quarantines it.
#[derive(Debug, thiserror::Error)]
#[error("pre-scale contract violation for {workload}: {detail}")]
pub struct ContractViolation {
    pub workload: String,
    pub detail: String,
}

/// Patches HPA `minReplicas` ahead of predicted spikes so the pods are
/// ready before the spike, not after. Lowering the HPA target alone does
/// not reliably force a scale-out, so the Deployment is also scaled
/// directly for immediate effect.
pub struct PrescaleManager {
    config: PrescaleConfig,
}

impl PrescaleManager {
    pub fn new(config: PrescaleConfig) -> Self {
        Self { config }
    }

    /// Confidence floor for this workload's priority tier, anchored on the
    /// configured medium-tier value.
    fn confidence_floor(&self, workload: &Workload) -> f64 {
        (self.config.min_confidence + workload.priority.prescale_confidence_floor() - 0.70)
            .clamp(0.40, 0.95)
    }

    pub async fn reconcile(
        &self,
        workload: &Workload,
        hpa: &HorizontalPodAutoscaler,
        deployment: &Deployment,
        predictions: &[Prediction],
        current_cpu_percent: f64,
        actuator: &Actuator,
        store: &MetricStore,
        clock: &dyn Clock,
    ) -> Result<Vec<Anomaly>> {
        let now = clock.now();
        let mut profile = store
            .get_prescale(&workload.target)?
            .unwrap_or_else(|| PrescaleProfile::new(workload.target.clone()));
        if profile.current_min_replicas == 0 {
            profile.current_min_replicas = hpa.min_replicas();
        }
        let mut anomalies = Vec::new();

        match profile.state {
            PrescaleState::CoolingDown => {
                if profile
                    .cooldown_until
                    .map(|until| now >= until)
                    .unwrap_or(true)
                {
                    profile.state = PrescaleState::Idle;
                    profile.cooldown_until = None;
                    tracing::debug!("Pre-scale cooldown over for {}", workload.target);
                }
                store.put_prescale(&profile)?;
            },
            PrescaleState::PreScaling => {
                let rollback_at = profile.rollback_at.ok_or_else(|| ContractViolation {
                    workload: workload.target.key(),
                    detail: "PreScaling without a scheduled rollback".to_string(),
                })?;

                let floor = self.confidence_floor(workload);
                let still_hot = predictions.iter().any(|p| {
                    p.predicted_cpu_percent >= self.config.threshold && p.confidence >= floor
                });
                if still_hot {
                    profile.low_prediction_streak = 0;
                } else {
                    profile.low_prediction_streak += 1;
                }

                if now >= rollback_at || profile.low_prediction_streak >= 2 {
                    let reason = if now >= rollback_at {
                        "scheduled rollback"
                    } else {
                        "predictions subsided"
                    };
                    anomalies.push(
                        self.roll_back(
                            workload, hpa, deployment, &mut profile, reason, actuator, store,
                            clock,
                        )
                        .await?,
                    );
                } else {
                    store.put_prescale(&profile)?;
                }
            },
            PrescaleState::Idle => {
                if profile
                    .cooldown_until
                    .map(|until| now < until)
                    .unwrap_or(false)
                {
                    store.put_prescale(&profile)?;
                    return Ok(anomalies);
                }
                let floor = self.confidence_floor(workload);
                let trigger = predictions
                    .iter()
                    .filter(|p| {
                        p.predicted_cpu_percent >= self.config.threshold && p.confidence >= floor
                    })
                    .max_by(|a, b| {
                        a.predicted_cpu_percent
                            .partial_cmp(&b.predicted_cpu_percent)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                let trigger = match trigger {
                    Some(trigger) => trigger.clone(),
                    None => {
                        store.put_prescale(&profile)?;
                        return Ok(anomalies);
                    },
                };

                // Captured once; later patches by the operator itself must
                // not overwrite the rollback source of truth.
                if profile.original_min_replicas.is_none() {
                    profile.original_min_replicas = Some(hpa.min_replicas());
                }
                if profile.original_max_replicas.is_none() {
                    profile.original_max_replicas = Some(hpa.spec.max_replicas);
                }
                let original_min = profile.original_min_replicas.unwrap_or(1);
                let original_max = profile.original_max_replicas.unwrap_or(hpa.spec.max_replicas);

                let current_replicas = deployment.spec.replicas.max(1);
                let ratio =
                    trigger.predicted_cpu_percent / current_cpu_percent.max(1.0);
                let projected = (current_replicas as f64 * ratio).ceil() as u32;
                let new_min = projected.max(original_min + 1).min(original_max);

                profile.state = PrescaleState::PreScaling;
                profile.pre_scale_started_at = Some(now);
                profile.pre_scale_reason = Some(format!(
                    "predicted {:.0}% CPU in {} (confidence {:.2})",
                    trigger.predicted_cpu_percent, trigger.horizon, trigger.confidence
                ));
                profile.predicted_cpu = Some(trigger.predicted_cpu_percent);
                profile.prediction_confidence = Some(trigger.confidence);
                profile.prediction_window = Some(trigger.horizon);
                profile.rollback_at = Some(now + Duration::minutes(self.config.rollback_minutes));
                profile.low_prediction_streak = 0;
                profile.current_min_replicas = new_min;
                profile.pre_scale_count += 1;
                // Persisted before actuation so a rollback is always
                // scheduled for a PreScaling profile.
                store.put_prescale(&profile)?;

                actuator
                    .ensure_hpa_min_replicas(&workload.target, hpa, new_min, "prescale")
                    .await?;
                if deployment.spec.replicas < new_min {
                    actuator
                        .ensure_deployment_replicas(&workload.target, deployment, new_min, "prescale")
                        .await?;
                }

                let anomaly = Anomaly::new(
                    Some(workload.target.clone()),
                    now,
                    AnomalyKind::PrescaleEvent,
                    Severity::Info,
                    format!(
                        "Pre-scaled {} to minReplicas={} ahead of predicted {:.0}% CPU",
                        workload.target, new_min, trigger.predicted_cpu_percent
                    ),
                    json!({
                        "predicted_cpu_percent": trigger.predicted_cpu_percent,
                        "confidence": trigger.confidence,
                        "horizon_minutes": trigger.horizon.minutes(),
                        "new_min_replicas": new_min,
                        "original_min_replicas": original_min,
                    }),
                );
                store.append_anomaly(&anomaly)?;
                anomalies.push(anomaly);
            },
        }
        Ok(anomalies)
    }

    #[allow(clippy::too_many_arguments)]
    async fn roll_back(
        &self,
        workload: &Workload,
        hpa: &HorizontalPodAutoscaler,
        deployment: &Deployment,
        profile: &mut PrescaleProfile,
        reason: &str,
        actuator: &Actuator,
        store: &MetricStore,
        clock: &dyn Clock,
    ) -> Result<Anomaly> {
        let now = clock.now();
        let original_min = profile.original_min_replicas.ok_or_else(|| ContractViolation {
            workload: workload.target.key(),
            detail: "rollback without stored original minReplicas".to_string(),
        })?;

        // Score the prediction that triggered this pre-scale.
        if let Some(started_at) = profile.pre_scale_started_at {
            let observed = store.aggregates(&workload.target, started_at, now)?;
            if observed.cpu_percent_p95 >= self.config.threshold * 0.9 {
                profile.successful_predictions += 1;
            } else {
                profile.failed_predictions += 1;
            }
        }

        actuator
            .ensure_hpa_min_replicas(&workload.target, hpa, original_min, "prescale rollback")
            .await?;
        // Restore the Deployment directly as well; waiting for the HPA to
        // scale down on its own leaves the replica count stuck.
        actuator
            .ensure_deployment_replicas(
                &workload.target,
                deployment,
                original_min,
                "prescale rollback",
            )
            .await?;

        profile.state = PrescaleState::CoolingDown;
        profile.cooldown_until = Some(now + Duration::minutes(self.config.cooldown_minutes));
        profile.current_min_replicas = original_min;
        profile.rollback_at = None;
        profile.pre_scale_started_at = None;
        profile.pre_scale_reason = None;
        profile.predicted_cpu = None;
        profile.prediction_confidence = None;
        profile.prediction_window = None;
        profile.low_prediction_streak = 0;
        store.put_prescale(profile)?;

        let anomaly = Anomaly::new(
            Some(workload.target.clone()),
            now,
            AnomalyKind::PrescaleEvent,
            Severity::Info,
            format!(
                "Rolled back pre-scale of {} to minReplicas={} ({})",
                workload.target, original_min, reason
            ),
            json!({ "reason": reason, "restored_min_replicas": original_min }),
        );
        store.append_anomaly(&anomaly)?;
        Ok(anomaly)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDateTime;
    use resources::{
        learning::{Horizon, PredictionModel},
        workload::{Priority, WorkloadRef},
    };
    use uuid::Uuid;

    use super::*;
    use crate::{
        actuator::tests::{base, demo_deployment, demo_hpa},
        clock::test::ManualClock,
        kube::{mock::MockCluster, ClusterApi},
    };

    fn demo_workload() -> Workload {
        Workload {
            target: WorkloadRef::new("demo", "demo-app"),
            hpa_name: Some("demo-app-hpa".to_string()),
            priority: Priority::Medium,
            startup_filter_minutes: 5,
            auto_discovered: false,
        }
    }

    fn prediction(cpu: f64, confidence: f64, made_at: NaiveDateTime) -> Prediction {
        Prediction {
            id: Uuid::new_v4(),
            workload: WorkloadRef::new("demo", "demo-app"),
            made_at,
            horizon: Horizon::M30,
            predicted_cpu_percent: cpu,
            confidence,
            ci_low: cpu - 10.0,
            ci_high: cpu + 10.0,
            model_used: PredictionModel::Ensemble,
            reasoning: String::new(),
        }
    }

    struct Harness {
        cluster: Arc<MockCluster>,
        store: Arc<MetricStore>,
        clock: Arc<ManualClock>,
        actuator: Actuator,
        manager: PrescaleManager,
    }

    fn harness() -> Harness {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert_hpa(demo_hpa(2, 10, 75));
        cluster.insert_deployment(demo_deployment(2, "250m", "256Mi"));
        let store = Arc::new(MetricStore::temporary().unwrap());
        let clock = Arc::new(ManualClock::at(base()));
        let actuator = Actuator::new(cluster.clone(), store.clone(), clock.clone(), false);
        Harness {
            cluster,
            store,
            clock,
            actuator,
            manager: PrescaleManager::new(PrescaleConfig::default()),
        }
    }

    async fn reconcile(h: &Harness, predictions: &[Prediction], current_cpu: f64) -> Vec<Anomaly> {
        let hpa = h.cluster.get_hpa("demo", "demo-app-hpa").await.unwrap();
        let deployment = h.cluster.get_deployment("demo", "demo-app").await.unwrap();
        h.manager
            .reconcile(
                &demo_workload(),
                &hpa,
                &deployment,
                predictions,
                current_cpu,
                &h.actuator,
                &h.store,
                h.clock.as_ref(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn confident_spike_prediction_pre_scales() {
        let h = harness();
        let anomalies = reconcile(&h, &[prediction(85.0, 0.82, base())], 50.0).await;

        let hpa = h.cluster.get_hpa("demo", "demo-app-hpa").await.unwrap();
        let deployment = h.cluster.get_deployment("demo", "demo-app").await.unwrap();
        assert!(hpa.min_replicas() >= 3);
        assert!(deployment.spec.replicas >= 3);

        let profile = h
            .store
            .get_prescale(&WorkloadRef::new("demo", "demo-app"))
            .unwrap()
            .unwrap();
        assert_eq!(profile.state, PrescaleState::PreScaling);
        assert_eq!(profile.original_min_replicas, Some(2));
        assert_eq!(profile.original_max_replicas, Some(10));
        assert!(profile.rollback_at.is_some());
        assert_eq!(profile.pre_scale_count, 1);

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::PrescaleEvent);
    }

    #[tokio::test]
    async fn low_confidence_prediction_does_nothing() {
        let h = harness();
        reconcile(&h, &[prediction(85.0, 0.40, base())], 50.0).await;
        let hpa = h.cluster.get_hpa("demo", "demo-app-hpa").await.unwrap();
        assert_eq!(hpa.min_replicas(), 2);
    }

    #[tokio::test]
    async fn scheduled_rollback_restores_originals() {
        let h = harness();
        reconcile(&h, &[prediction(85.0, 0.82, base())], 50.0).await;

        h.clock.advance_minutes(61);
        reconcile(&h, &[], 50.0).await;

        let hpa = h.cluster.get_hpa("demo", "demo-app-hpa").await.unwrap();
        let deployment = h.cluster.get_deployment("demo", "demo-app").await.unwrap();
        assert_eq!(hpa.min_replicas(), 2);
        assert_eq!(deployment.spec.replicas, 2);

        let profile = h
            .store
            .get_prescale(&WorkloadRef::new("demo", "demo-app"))
            .unwrap()
            .unwrap();
        assert_eq!(profile.state, PrescaleState::CoolingDown);
        assert!(profile.rollback_at.is_none());
        assert_eq!(profile.current_min_replicas, 2);
    }

    #[tokio::test]
    async fn two_quiet_intervals_roll_back_early() {
        let h = harness();
        reconcile(&h, &[prediction(85.0, 0.82, base())], 50.0).await;

        h.clock.advance_minutes(5);
        reconcile(&h, &[prediction(40.0, 0.82, h.clock.now())], 50.0).await;
        let profile = h
            .store
            .get_prescale(&WorkloadRef::new("demo", "demo-app"))
            .unwrap()
            .unwrap();
        assert_eq!(profile.state, PrescaleState::PreScaling);
        assert_eq!(profile.low_prediction_streak, 1);

        h.clock.advance_minutes(5);
        reconcile(&h, &[prediction(40.0, 0.82, h.clock.now())], 50.0).await;
        let hpa = h.cluster.get_hpa("demo", "demo-app-hpa").await.unwrap();
        assert_eq!(hpa.min_replicas(), 2);
        let profile = h
            .store
            .get_prescale(&WorkloadRef::new("demo", "demo-app"))
            .unwrap()
            .unwrap();
        assert_eq!(profile.state, PrescaleState::CoolingDown);
    }

    #[tokio::test]
    async fn cooldown_blocks_immediate_re_entry() {
        let h = harness();
        reconcile(&h, &[prediction(85.0, 0.82, base())], 50.0).await;
        h.clock.advance_minutes(61);
        reconcile(&h, &[], 50.0).await;

        // Still cooling down; a hot prediction must not pre-scale again.
        h.clock.advance_minutes(5);
        reconcile(&h, &[prediction(90.0, 0.9, h.clock.now())], 50.0).await;
        let hpa = h.cluster.get_hpa("demo", "demo-app-hpa").await.unwrap();
        assert_eq!(hpa.min_replicas(), 2);

        // Cooldown over, pre-scaling may resume.
        h.clock.advance_minutes(11);
        reconcile(&h, &[], 50.0).await;
        reconcile(&h, &[prediction(90.0, 0.9, h.clock.now())], 50.0).await;
        let hpa = h.cluster.get_hpa("demo", "demo-app-hpa").await.unwrap();
        assert!(hpa.min_replicas() > 2);
    }

    #[tokio::test]
    async fn missing_originals_is_a_contract_violation() {
        let h = harness();
        let wl = WorkloadRef::new("demo", "demo-app");
        let mut profile = PrescaleProfile::new(wl.clone());
        profile.state = PrescaleState::PreScaling;
        profile.rollback_at = Some(base() - Duration::minutes(1));
        h.store.put_prescale(&profile).unwrap();

        let hpa = h.cluster.get_hpa("demo", "demo-app-hpa").await.unwrap();
        let deployment = h.cluster.get_deployment("demo", "demo-app").await.unwrap();
        let err = h
            .manager
            .reconcile(
                &demo_workload(),
                &hpa,
                &deployment,
                &[],
                50.0,
                &h.actuator,
                &h.store,
                h.clock.as_ref(),
            )
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ContractViolation>().is_some());
    }
}
