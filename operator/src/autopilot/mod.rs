use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use resources::{
    anomaly::{Anomaly, AnomalyKind, Severity},
    config::AutopilotConfig,
    objects::{
        deployment::Deployment, format_cpu_millis, format_memory_bytes, parse_cpu_millis,
        parse_memory_bytes, pod::Pod,
    },
    profiles::{
        AutopilotLevel, AutopilotProfile, AutopilotState, HealthSnapshot, PendingHealthCheck,
        PrescaleState, Recommendation, RequestChange, ResourceKind, SkipReason, SkipRecord,
    },
    workload::{Priority, Workload},
};
use serde_json::json;
use uuid::Uuid;

use crate::{actuator::Actuator, clock::Clock, store::MetricStore};

pub mod health;

const CPU_FLOOR_MILLIS: i64 = 50;
const MEMORY_FLOOR_BYTES: i64 = 64 * 1024 * 1024;
const STRICT_MEMORY_FLOOR_BYTES: i64 = 256 * 1024 * 1024;
/// Samples per observation day at which sufficiency saturates.
const SAMPLES_PER_DAY_FULL: f64 = 96.0;

/// Tunes pod *requests*, never limits. Observe collects, Recommend emits
/// readable recommendations, Autopilot applies them behind the guardrails.
pub struct Autopilot {
    config: AutopilotConfig,
}

impl Autopilot {
    pub fn new(config: AutopilotConfig) -> Self {
        Self { config }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn reconcile(
        &self,
        workload: &Workload,
        deployment: &Deployment,
        pods: &[Pod],
        prescale_state: PrescaleState,
        actuator: &Actuator,
        store: &MetricStore,
        clock: &dyn Clock,
    ) -> Result<Vec<Anomaly>> {
        let level = self.config.level;
        if level == AutopilotLevel::Disabled {
            return Ok(Vec::new());
        }
        let now = clock.now();
        let mut profile = store.get_autopilot(&workload.target)?.unwrap_or_else(|| {
            let mut profile = AutopilotProfile::new(workload.target.clone(), now);
            if !self.config.enable_learning_mode {
                profile.state = AutopilotState::Ready;
            }
            profile
        });

        let window_start = profile.learning_started_at;
        let aggregates = store.aggregates(&workload.target, window_start, now)?;
        profile.samples_collected = aggregates.count as u64;

        if profile.state == AutopilotState::Learning {
            let learning_ends =
                profile.learning_started_at + Duration::days(self.config.learning_days);
            if now >= learning_ends {
                profile.baseline_cpu_p95 = Some(aggregates.cpu_per_pod_p95_millis);
                profile.baseline_memory_p95 = Some(aggregates.memory_per_pod_p95_bytes);
                if self.config.auto_graduate {
                    profile.state = AutopilotState::Ready;
                    tracing::info!(
                        "Autopilot learning complete for {}, baselines cpu={:.0}m memory={:.0}Mi",
                        workload.target,
                        aggregates.cpu_per_pod_p95_millis,
                        aggregates.memory_per_pod_p95_bytes / (1 << 20) as f64
                    );
                }
            }
        }
        if profile.state != AutopilotState::Ready {
            store.put_autopilot(&profile)?;
            return Ok(Vec::new());
        }
        // Observe collects and graduates but emits nothing.
        if level == AutopilotLevel::Observe {
            store.put_autopilot(&profile)?;
            return Ok(Vec::new());
        }

        let observed_days = (now - profile.learning_started_at).num_days();
        let confidence = self.confidence(aggregates.count, observed_days);
        let recommendations =
            self.recommend(workload, deployment, &aggregates, confidence, now)?;
        for recommendation in &recommendations {
            store.append_recommendation(recommendation)?;
        }
        if recommendations.is_empty() || level != AutopilotLevel::Autopilot {
            store.put_autopilot(&profile)?;
            return Ok(Vec::new());
        }

        let anomalies = self
            .apply(
                workload,
                deployment,
                pods,
                prescale_state,
                &recommendations,
                &mut profile,
                observed_days,
                actuator,
                store,
                now,
            )
            .await?;
        store.put_autopilot(&profile)?;
        Ok(anomalies)
    }

    fn confidence(&self, samples: usize, observed_days: i64) -> f64 {
        let sufficiency = samples as f64
            / (self.config.min_observation_days as f64 * SAMPLES_PER_DAY_FULL);
        let window = observed_days as f64 / self.config.min_observation_days as f64;
        (sufficiency.min(1.0) * window.min(1.0)).clamp(0.0, 1.0)
    }

    /// `p95 × (1 + safety) + headroom` per resource, floored, emitted only
    /// when the relative change is large and confident enough.
    fn recommend(
        &self,
        workload: &Workload,
        deployment: &Deployment,
        aggregates: &crate::store::Aggregates,
        confidence: f64,
        now: NaiveDateTime,
    ) -> Result<Vec<Recommendation>> {
        if aggregates.count == 0 {
            return Ok(Vec::new());
        }
        let container = match deployment.spec.template.spec.containers.first() {
            Some(container) => container,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        let memory_floor = if self.config.strict_memory_floor {
            STRICT_MEMORY_FLOOR_BYTES
        } else {
            MEMORY_FLOOR_BYTES
        };

        let targets = [
            (
                ResourceKind::Cpu,
                ((aggregates.cpu_per_pod_p95_millis * (1.0 + self.config.cpu_safety_fraction))
                    as i64
                    + self.config.cpu_base_headroom_millis)
                    .max(CPU_FLOOR_MILLIS),
                container
                    .resources
                    .requests
                    .get("cpu")
                    .and_then(|q| parse_cpu_millis(q))
                    .unwrap_or(0),
            ),
            (
                ResourceKind::Memory,
                ((aggregates.memory_per_pod_p95_bytes
                    * (1.0 + self.config.memory_safety_fraction)) as i64
                    + self.config.memory_base_headroom_bytes)
                    .max(memory_floor),
                container
                    .resources
                    .requests
                    .get("memory")
                    .and_then(|q| parse_memory_bytes(q))
                    .unwrap_or(0),
            ),
        ];

        for (resource, target, current) in targets {
            if current == 0 {
                // No request to compare against; sizing from nothing is a
                // bigger change than a step guardrail can express.
                continue;
            }
            let change_percent = (target - current) as f64 / current as f64 * 100.0;
            if change_percent.abs() < self.config.min_change_percent {
                continue;
            }
            if confidence < self.config.min_confidence {
                tracing::debug!(
                    "Recommendation for {} {} suppressed, confidence {:.2} below {:.2}",
                    workload.target,
                    resource,
                    confidence,
                    self.config.min_confidence
                );
                continue;
            }
            let (current_str, target_str) = match resource {
                ResourceKind::Cpu => (format_cpu_millis(current), format_cpu_millis(target)),
                ResourceKind::Memory => {
                    (format_memory_bytes(current), format_memory_bytes(target))
                },
            };
            out.push(Recommendation {
                id: Uuid::new_v4(),
                workload: workload.target.clone(),
                created_at: now,
                container: container.name.clone(),
                resource,
                current: current_str,
                target: target_str,
                change_percent,
                confidence,
                reason: format!(
                    "p95 per-pod usage with {:.0}% safety margin",
                    match resource {
                        ResourceKind::Cpu => self.config.cpu_safety_fraction,
                        ResourceKind::Memory => self.config.memory_safety_fraction,
                    } * 100.0
                ),
            });
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        workload: &Workload,
        deployment: &Deployment,
        pods: &[Pod],
        prescale_state: PrescaleState,
        recommendations: &[Recommendation],
        profile: &mut AutopilotProfile,
        observed_days: i64,
        actuator: &Actuator,
        store: &MetricStore,
        now: NaiveDateTime,
    ) -> Result<Vec<Anomaly>> {
        let skip = |reason: SkipReason, detail: String| -> Result<()> {
            store.append_skip(&SkipRecord {
                workload: workload.target.clone(),
                timestamp: now,
                lever: "autopilot".to_string(),
                reason,
                detail,
            })?;
            Ok(())
        };

        if observed_days < self.config.min_observation_days {
            skip(
                SkipReason::ObservationWindow,
                format!(
                    "{} of {} observation days",
                    observed_days, self.config.min_observation_days
                ),
            )?;
            return Ok(Vec::new());
        }
        if let Some(last) = profile.last_action_at {
            let cooldown_ends = last + Duration::hours(self.config.cooldown_hours);
            if now < cooldown_ends {
                skip(
                    SkipReason::CooldownActive,
                    format!("cooldown until {}", cooldown_ends),
                )?;
                return Ok(Vec::new());
            }
        }
        if profile.pending.is_some() {
            skip(
                SkipReason::CooldownActive,
                "previous apply still under health monitoring".to_string(),
            )?;
            return Ok(Vec::new());
        }
        if prescale_state == PrescaleState::PreScaling {
            // The two levers conflict during a predicted spike.
            skip(
                SkipReason::PrescaleConflict,
                "workload is pre-scaling".to_string(),
            )?;
            return Ok(Vec::new());
        }

        let max_step = self.config.max_change_percent;
        let mut changes = Vec::new();
        for recommendation in recommendations {
            if matches!(workload.priority, Priority::Critical | Priority::High)
                && recommendation.change_percent.abs() > self.config.priority_degrade_percent
            {
                // A human confirms large moves on important workloads.
                skip(
                    SkipReason::PriorityDegrade,
                    format!(
                        "{:.0}% change on {} priority workload needs confirmation",
                        recommendation.change_percent, workload.priority
                    ),
                )?;
                continue;
            }

            // Larger targets are approached across multiple iterations.
            let stepped = step_toward(recommendation, max_step);
            changes.push(RequestChange {
                container: recommendation.container.clone(),
                resource: recommendation.resource,
                previous: recommendation.current.clone(),
                applied: stepped,
            });
        }
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let snapshot = health::snapshot(deployment, pods);
        for change in &changes {
            actuator
                .ensure_container_requests(
                    &workload.target,
                    deployment,
                    &change.container,
                    change.resource,
                    &change.applied,
                    "autopilot",
                )
                .await?;
        }
        profile.last_action_at = Some(now);
        if self.config.enable_auto_rollback {
            profile.pending = Some(PendingHealthCheck {
                applied_at: now,
                until: now + Duration::minutes(self.config.rollback_monitor_minutes),
                snapshot,
                changes: changes.clone(),
            });
        }

        let anomaly = Anomaly::new(
            Some(workload.target.clone()),
            now,
            AnomalyKind::AutopilotAction,
            Severity::Info,
            format!(
                "Autopilot adjusted requests of {}: {}",
                workload.target,
                changes
                    .iter()
                    .map(|c| format!("{} {} -> {}", c.resource, c.previous, c.applied))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            json!({ "changes": changes }),
        );
        store.append_anomaly(&anomaly)?;
        Ok(vec![anomaly])
    }
}

/// Clamp one apply step to `max_change_percent` toward the target.
fn step_toward(recommendation: &Recommendation, max_step_percent: f64) -> String {
    let clamped = recommendation
        .change_percent
        .clamp(-max_step_percent, max_step_percent);
    match recommendation.resource {
        ResourceKind::Cpu => {
            let current = parse_cpu_millis(&recommendation.current).unwrap_or(0);
            let applied = (current as f64 * (1.0 + clamped / 100.0)) as i64;
            format_cpu_millis(applied.max(CPU_FLOOR_MILLIS))
        },
        ResourceKind::Memory => {
            let current = parse_memory_bytes(&recommendation.current).unwrap_or(0);
            let applied = (current as f64 * (1.0 + clamped / 100.0)) as i64;
            format_memory_bytes(applied.max(MEMORY_FLOOR_BYTES))
        },
    }
}

#[cfg(test)]
mod tests;
