use anyhow::Result;
use chrono::Duration;
use resources::{
    config::PrescaleConfig,
    objects::{deployment::Deployment, hpa::HorizontalPodAutoscaler},
    workload::{Priority, Workload},
};

use crate::{actuator::Actuator, clock::Clock, store::MetricStore};

/// Cluster CPU pressure at which preemption becomes possible.
pub const PREEMPTION_PRESSURE: f64 = 0.80;
/// Pressure at which tier offsets widen.
const WIDEN_PRESSURE: f64 = 0.85;
/// Pressure below which the cost-optimization bias applies.
const COST_BIAS_PRESSURE: f64 = 0.40;
const PREEMPTION_COOLDOWN_MINUTES: i64 = 5;
const OFFSET_WIDEN_FACTOR: f64 = 1.5;
const COST_BIAS_EXTRA_OFFSET: f64 = 5.0;

/// Orders workloads by priority, shifts their effective HPA targets under
/// cluster pressure, and arbitrates preemption of low tiers.
pub struct Coordinator;

impl Coordinator {
    pub fn new() -> Self {
        Self
    }

    /// Processing order within a cycle: priority tiers first, stable by
    /// name inside a tier.
    pub fn order(&self, workloads: &mut [Workload]) {
        workloads.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.target.cmp(&b.target))
        });
    }

    /// Pattern default shifted by the tier offset, widened under pressure,
    /// biased toward savings when the cluster runs cold.
    pub fn effective_target(&self, base: u32, priority: Priority, pressure: f64) -> u32 {
        let mut offset = priority.target_offset() as f64;
        if pressure >= WIDEN_PRESSURE {
            offset *= OFFSET_WIDEN_FACTOR;
        } else if pressure < COST_BIAS_PRESSURE && priority.preemptible() {
            offset += COST_BIAS_EXTRA_OFFSET;
        }
        (base as f64 + offset).clamp(20.0, 95.0).round() as u32
    }

    /// Tier-modulated pre-scale timing: slow-scale-down tiers hold their
    /// pre-scaled floor longer.
    pub fn prescale_config_for(&self, base: &PrescaleConfig, priority: Priority) -> PrescaleConfig {
        let mut config = base.clone();
        config.rollback_minutes =
            ((base.rollback_minutes as f64 / priority.scale_down_factor()).round() as i64).max(5);
        config.cooldown_minutes =
            ((base.cooldown_minutes as f64 / priority.scale_up_factor()).round() as i64).max(1);
        config
    }

    /// An HPA pinned at its ceiling cannot add pods; that is the signal a
    /// higher tier may need room.
    pub fn is_saturated(hpa: &HorizontalPodAutoscaler, deployment: &Deployment) -> bool {
        deployment.spec.replicas >= hpa.spec.max_replicas
    }

    /// Lower one preemptible workload's `maxReplicas` by one step so a
    /// blocked high-tier workload can scale, honoring the per-workload
    /// preemption cooldown. Returns the preempted workload, if any.
    #[allow(clippy::too_many_arguments)]
    pub async fn preempt(
        &self,
        pressure: f64,
        blocked: &Workload,
        candidates: &[(Workload, HorizontalPodAutoscaler, Deployment)],
        actuator: &Actuator,
        store: &MetricStore,
        clock: &dyn Clock,
    ) -> Result<Option<Workload>> {
        if pressure < PREEMPTION_PRESSURE {
            return Ok(None);
        }
        if !matches!(blocked.priority, Priority::Critical | Priority::High) {
            return Ok(None);
        }
        let now = clock.now();

        // Lowest tier first, largest ceiling first inside a tier.
        let mut ordered: Vec<_> = candidates
            .iter()
            .filter(|(workload, _, _)| workload.priority.preemptible())
            .collect();
        ordered.sort_by(|a, b| {
            b.0.priority
                .cmp(&a.0.priority)
                .then_with(|| b.1.spec.max_replicas.cmp(&a.1.spec.max_replicas))
        });

        for (workload, hpa, _deployment) in ordered {
            let mut profile = store
                .get_prescale(&workload.target)?
                .unwrap_or_else(|| {
                    resources::profiles::PrescaleProfile::new(workload.target.clone())
                });
            if let Some(preempted_at) = profile.preempted_at {
                if now - preempted_at < Duration::minutes(PREEMPTION_COOLDOWN_MINUTES) {
                    continue;
                }
            }
            let floor = hpa.min_replicas().max(1);
            if hpa.spec.max_replicas <= floor {
                continue;
            }
            let new_max = hpa.spec.max_replicas - 1;

            if profile.preempted_max_replicas.is_none() {
                profile.preempted_max_replicas = Some(hpa.spec.max_replicas);
            }
            profile.preempted_at = Some(now);
            store.put_prescale(&profile)?;

            actuator
                .ensure_hpa_max_replicas(
                    &workload.target,
                    hpa,
                    new_max,
                    &format!("preempted for {}", blocked.target),
                )
                .await?;
            tracing::info!(
                "Preempted {} (maxReplicas {} -> {}) for {}",
                workload.target,
                hpa.spec.max_replicas,
                new_max,
                blocked.target
            );
            return Ok(Some(workload.clone()));
        }
        Ok(None)
    }

    /// Undo preemption once the cluster has room again.
    pub async fn restore_preempted(
        &self,
        pressure: f64,
        workload: &Workload,
        hpa: &HorizontalPodAutoscaler,
        actuator: &Actuator,
        store: &MetricStore,
    ) -> Result<()> {
        if pressure >= PREEMPTION_PRESSURE {
            return Ok(());
        }
        let mut profile = match store.get_prescale(&workload.target)? {
            Some(profile) => profile,
            None => return Ok(()),
        };
        let original_max = match profile.preempted_max_replicas {
            Some(original_max) => original_max,
            None => return Ok(()),
        };
        actuator
            .ensure_hpa_max_replicas(&workload.target, hpa, original_max, "preemption restore")
            .await?;
        profile.preempted_max_replicas = None;
        profile.preempted_at = None;
        store.put_prescale(&profile)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use resources::workload::WorkloadRef;

    use super::*;
    use crate::{
        actuator::tests::{base, demo_deployment, demo_hpa},
        clock::test::ManualClock,
        kube::{mock::MockCluster, ClusterApi},
    };

    fn workload(name: &str, priority: Priority) -> Workload {
        Workload {
            target: WorkloadRef::new("demo", name),
            hpa_name: Some(format!("{}-hpa", name)),
            priority,
            startup_filter_minutes: 5,
            auto_discovered: false,
        }
    }

    #[test]
    fn processing_order_follows_priority() {
        let coordinator = Coordinator::new();
        let mut workloads = vec![
            workload("c", Priority::Low),
            workload("a", Priority::Critical),
            workload("b", Priority::Critical),
            workload("d", Priority::BestEffort),
        ];
        coordinator.order(&mut workloads);
        let names: Vec<&str> = workloads.iter().map(|w| w.target.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn tier_offsets_shift_the_target() {
        let coordinator = Coordinator::new();
        assert_eq!(coordinator.effective_target(75, Priority::Medium, 0.5), 75);
        assert_eq!(coordinator.effective_target(75, Priority::Critical, 0.5), 60);
        assert_eq!(coordinator.effective_target(75, Priority::BestEffort, 0.5), 90);
    }

    #[test]
    fn pressure_widens_offsets() {
        let coordinator = Coordinator::new();
        // -15 widens to -22.5 at high pressure.
        assert_eq!(coordinator.effective_target(75, Priority::Critical, 0.9), 53);
        // +15 widens to +22.5, clamped at the target ceiling.
        assert_eq!(coordinator.effective_target(75, Priority::BestEffort, 0.9), 95);
    }

    #[test]
    fn cold_cluster_biases_low_tiers_toward_savings() {
        let coordinator = Coordinator::new();
        assert_eq!(coordinator.effective_target(75, Priority::Low, 0.3), 90);
        // Non-preemptible tiers are unaffected.
        assert_eq!(coordinator.effective_target(75, Priority::Critical, 0.3), 60);
    }

    #[tokio::test]
    async fn preemption_lowers_one_low_tier_ceiling_once() {
        let coordinator = Coordinator::new();
        let cluster = Arc::new(MockCluster::new());
        let mut low_hpa = demo_hpa(2, 6, 75);
        low_hpa.metadata.name = "low-app-hpa".to_string();
        cluster.insert_hpa(low_hpa.clone());
        let store = Arc::new(crate::store::MetricStore::temporary().unwrap());
        let clock = Arc::new(ManualClock::at(base()));
        let actuator = Actuator::new(cluster.clone(), store.clone(), clock.clone(), false);

        let blocked = workload("critical-app", Priority::Critical);
        let low = workload("low-app", Priority::Low);
        let candidates = vec![(low.clone(), low_hpa.clone(), demo_deployment(6, "250m", "256Mi"))];

        let preempted = coordinator
            .preempt(0.88, &blocked, &candidates, &actuator, &store, clock.as_ref())
            .await
            .unwrap();
        assert_eq!(preempted.map(|w| w.target.name), Some("low-app".to_string()));
        let hpa = cluster.get_hpa("demo", "low-app-hpa").await.unwrap();
        assert_eq!(hpa.spec.max_replicas, 5);

        // Within the five-minute cooldown nothing else may be preempted.
        clock.advance_minutes(2);
        let again = coordinator
            .preempt(0.88, &blocked, &candidates, &actuator, &store, clock.as_ref())
            .await
            .unwrap();
        assert!(again.is_none());

        // After the cooldown preemption may continue.
        clock.advance_minutes(4);
        let candidates = vec![(
            low.clone(),
            cluster.get_hpa("demo", "low-app-hpa").await.unwrap(),
            demo_deployment(5, "250m", "256Mi"),
        )];
        let third = coordinator
            .preempt(0.88, &blocked, &candidates, &actuator, &store, clock.as_ref())
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn low_pressure_never_preempts_and_restores() {
        let coordinator = Coordinator::new();
        let cluster = Arc::new(MockCluster::new());
        let mut low_hpa = demo_hpa(2, 6, 75);
        low_hpa.metadata.name = "low-app-hpa".to_string();
        cluster.insert_hpa(low_hpa.clone());
        let store = Arc::new(crate::store::MetricStore::temporary().unwrap());
        let clock = Arc::new(ManualClock::at(base()));
        let actuator = Actuator::new(cluster.clone(), store.clone(), clock.clone(), false);

        let blocked = workload("critical-app", Priority::Critical);
        let low = workload("low-app", Priority::Low);
        let candidates = vec![(low.clone(), low_hpa.clone(), demo_deployment(6, "250m", "256Mi"))];

        let preempted = coordinator
            .preempt(0.60, &blocked, &candidates, &actuator, &store, clock.as_ref())
            .await
            .unwrap();
        assert!(preempted.is_none());

        // Preempt under pressure, then restore once the pressure clears.
        coordinator
            .preempt(0.88, &blocked, &candidates, &actuator, &store, clock.as_ref())
            .await
            .unwrap();
        let hpa = cluster.get_hpa("demo", "low-app-hpa").await.unwrap();
        assert_eq!(hpa.spec.max_replicas, 5);

        coordinator
            .restore_preempted(0.50, &low, &hpa, &actuator, &store)
            .await
            .unwrap();
        let hpa = cluster.get_hpa("demo", "low-app-hpa").await.unwrap();
        assert_eq!(hpa.spec.max_replicas, 6);
        let profile = store.get_prescale(&low.target).unwrap().unwrap();
        assert!(profile.preempted_at.is_none());
    }

    #[test]
    fn prescale_timing_is_tier_modulated() {
        let coordinator = Coordinator::new();
        let base_config = PrescaleConfig::default();
        let critical = coordinator.prescale_config_for(&base_config, Priority::Critical);
        let best_effort = coordinator.prescale_config_for(&base_config, Priority::BestEffort);
        // Critical holds its pre-scaled floor longer than best-effort.
        assert!(critical.rollback_minutes > base_config.rollback_minutes);
        assert!(best_effort.rollback_minutes < base_config.rollback_minutes);
    }
}
