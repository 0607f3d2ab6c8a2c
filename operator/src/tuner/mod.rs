use anyhow::Result;
use chrono::{Datelike, NaiveDateTime, Timelike};
use rand::{Rng, SeedableRng};
use resources::{
    config::TunerConfig,
    learning::OptimalTarget,
    workload::Priority,
};

use crate::store::{Aggregates, MetricStore};

/// HPA target bounds.
pub const TARGET_MIN: f64 = 20.0;
pub const TARGET_MAX: f64 = 95.0;

/// Hour-of-week slot for per-hour optima, Monday 00:00 first.
pub fn hour_slot(now: NaiveDateTime) -> u16 {
    (now.weekday().num_days_from_monday() * 24 + now.hour()) as u16
}

#[derive(Debug, Clone)]
pub struct TunerOutcome {
    pub updated: OptimalTarget,
    /// New HPA target worth applying, if the proposal gate passed.
    pub proposal: Option<u32>,
    pub explored: bool,
}

/// Moves the HPA target toward a per-workload, per-hour optimum with
/// ε-greedy exploration around the learned value.
pub struct AutoTuner {
    config: TunerConfig,
    rng: rand::rngs::StdRng,
}

impl AutoTuner {
    pub fn new(config: TunerConfig) -> Self {
        Self {
            config,
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(config: TunerConfig, seed: u64) -> Self {
        Self {
            config,
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }

    /// One tuning step for one workload. Updates the stored optimum and
    /// answers a proposal when the change is large and confident enough.
    /// `prior_default` is the pattern default already shifted by the
    /// coordinator for this workload's tier and the current pressure.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &mut self,
        store: &MetricStore,
        prior_default: u32,
        priority: Priority,
        workload: &resources::workload::WorkloadRef,
        current_target: u32,
        aggregates: &Aggregates,
        events_last_hour: usize,
        now: NaiveDateTime,
    ) -> Result<TunerOutcome> {
        let slot = hour_slot(now);
        let prior = store.get_optimal(workload, slot)?;
        let t_opt = prior
            .as_ref()
            .map(|o| o.target)
            .unwrap_or(prior_default as f64);

        // Explore around the optimum or exploit it.
        let explored = self.rng.gen::<f64>() < self.config.epsilon;
        let candidate = if explored {
            let radius = self.config.exploration_radius;
            (t_opt + self.rng.gen_range(-radius..=radius)).clamp(TARGET_MIN, TARGET_MAX)
        } else {
            t_opt
        };

        let reward = self.reward(candidate, aggregates, events_last_hour);
        let new_target = (t_opt
            + self.config.learning_rate * reward.max(0.0) * (candidate - t_opt))
            .clamp(TARGET_MIN, TARGET_MAX);

        let samples = prior.as_ref().map(|o| o.samples_count).unwrap_or(0) + 1;
        let confidence = samples as f64 / (samples as f64 + 20.0);
        let updated = store.upsert_optimal(workload, slot, new_target, confidence, now)?;

        let proposal = if (new_target - current_target as f64).abs() >= self.config.min_step
            && confidence >= priority.tuner_confidence_floor()
        {
            Some(new_target.round().clamp(TARGET_MIN, TARGET_MAX) as u32)
        } else {
            None
        };

        Ok(TunerOutcome {
            updated,
            proposal,
            explored,
        })
    }

    /// Penalizes wasted headroom (target far above observed utilization)
    /// and thrashing (dense scaling events or sustained p95 overshoot).
    fn reward(&self, candidate: f64, aggregates: &Aggregates, events_last_hour: usize) -> f64 {
        let utilization = aggregates.cpu_percent_mean;
        let waste = (candidate - utilization).abs() / 100.0;
        let mut thrash = 0.0;
        if events_last_hour as f64 > self.config.thrash_event_density {
            thrash += 1.0;
        }
        if aggregates.cpu_percent_p95 > 90.0 {
            thrash += 1.0;
        }
        1.0 - self.config.waste_weight * waste - self.config.thrash_weight * thrash
    }
}

#[cfg(test)]
mod tests {
    use resources::workload::WorkloadRef;

    use super::*;

    fn base() -> NaiveDateTime {
        NaiveDateTime::from_timestamp(1_700_000_000, 0)
    }

    fn wl() -> WorkloadRef {
        WorkloadRef::new("demo", "demo-app")
    }

    fn aggregates(mean: f64, p95: f64) -> Aggregates {
        Aggregates {
            count: 100,
            cpu_percent_mean: mean,
            cpu_percent_std: 5.0,
            cpu_percent_p95: p95,
            cpu_per_pod_p95_millis: 200.0,
            memory_per_pod_p95_bytes: 100.0 * 1024.0 * 1024.0,
        }
    }

    #[test]
    fn no_proposal_until_confidence_builds() {
        let store = MetricStore::temporary().unwrap();
        let mut tuner = AutoTuner::with_seed(TunerConfig::default(), 7);
        let outcome = tuner
            .evaluate(
                &store,
                75,
                Priority::Medium,
                &wl(),
                50,
                &aggregates(70.0, 80.0),
                0,
                base(),
            )
            .unwrap();
        // One sample gives confidence 1/21, far below the medium floor.
        assert!(outcome.proposal.is_none());
        assert_eq!(outcome.updated.samples_count, 1);
    }

    #[test]
    fn small_changes_never_propose() {
        let store = MetricStore::temporary().unwrap();
        let mut tuner = AutoTuner::with_seed(TunerConfig::default(), 7);
        // Drive samples_count high enough that confidence clears the floor.
        for _ in 0..120 {
            store
                .upsert_optimal(&wl(), hour_slot(base()), 75.0, 0.9, base())
                .unwrap();
        }
        let outcome = tuner
            .evaluate(
                &store,
                75,
                Priority::Medium,
                &wl(),
                75,
                &aggregates(74.0, 80.0),
                0,
                base(),
            )
            .unwrap();
        // Optimum sits within 3 points of the current target.
        assert!(outcome.proposal.is_none());
    }

    #[test]
    fn confident_large_gap_proposes() {
        let store = MetricStore::temporary().unwrap();
        let mut tuner = AutoTuner::with_seed(TunerConfig::default(), 7);
        for _ in 0..120 {
            store
                .upsert_optimal(&wl(), hour_slot(base()), 80.0, 0.9, base())
                .unwrap();
        }
        let outcome = tuner
            .evaluate(
                &store,
                75,
                Priority::Medium,
                &wl(),
                60,
                &aggregates(78.0, 82.0),
                0,
                base(),
            )
            .unwrap();
        let proposal = outcome.proposal.expect("gap of 20 points should propose");
        assert!((proposal as f64 - 80.0).abs() <= TunerConfig::default().exploration_radius + 3.0);
    }

    #[test]
    fn thrashing_blocks_movement_toward_candidate() {
        let config = TunerConfig::default();
        let tuner = AutoTuner::with_seed(config, 7);
        // p95 overshoot and dense events push the reward negative.
        let reward = tuner.reward(75.0, &aggregates(74.0, 95.0), 10);
        assert!(reward < 0.0);
    }

    #[test]
    fn hour_slots_cover_the_week() {
        let monday_midnight = NaiveDateTime::parse_from_str(
            "2023-11-13 00:00:00",
            "%Y-%m-%d %H:%M:%S",
        )
        .unwrap();
        assert_eq!(hour_slot(monday_midnight), 0);
        assert_eq!(hour_slot(monday_midnight + chrono::Duration::hours(167)), 167);
    }
}
