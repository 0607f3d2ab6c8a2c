use std::path::Path;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use resources::{
    anomaly::Anomaly,
    learning::{OptimalTarget, PatternProfile, Prediction, PredictionModel, ValidatedPrediction},
    metrics::{MetricSample, ScalingEvent},
    notify::NotificationProvider,
    profiles::{AppliedAction, AutopilotProfile, PrescaleProfile, Recommendation, SkipRecord},
    workload::WorkloadRef,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod retention;

pub use retention::DiskPressure;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(#[from] sled::Error),
    #[error("corrupt row {key}: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
}

impl StoreError {
    /// I/O failures are retryable; the caller keeps its previous state and
    /// the loop advances. Corrupt rows are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Streamed aggregates over a sample window, startup rows excluded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregates {
    pub count: usize,
    pub cpu_percent_mean: f64,
    pub cpu_percent_std: f64,
    pub cpu_percent_p95: f64,
    pub cpu_per_pod_p95_millis: f64,
    pub memory_per_pod_p95_bytes: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeStats {
    pub name: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub trees: Vec<TreeStats>,
    pub size_on_disk_bytes: u64,
    pub last_cleanup: Option<NaiveDateTime>,
}

/// Durable, embedded, single-writer key-space. Reads are concurrent;
/// writes serialize on one guard.
pub struct MetricStore {
    db: sled::Db,
    pub(crate) samples: sled::Tree,
    pub(crate) events: sled::Tree,
    pub(crate) predictions: sled::Tree,
    pub(crate) validated: sled::Tree,
    pub(crate) anomalies: sled::Tree,
    pub(crate) optimal_targets: sled::Tree,
    pub(crate) patterns: sled::Tree,
    pub(crate) prescale: sled::Tree,
    pub(crate) autopilot: sled::Tree,
    pub(crate) actions: sled::Tree,
    pub(crate) recommendations: sled::Tree,
    pub(crate) skips: sled::Tree,
    pub(crate) notifiers: sled::Tree,
    pub(crate) quarantined: sled::Tree,
    pub(crate) meta: sled::Tree,
    write_guard: Mutex<()>,
}

fn ts_millis(ts: NaiveDateTime) -> i64 {
    ts.timestamp_millis().max(0)
}

pub(crate) fn time_key(prefix: &str, ts: NaiveDateTime) -> Vec<u8> {
    format!("{}|{:020}", prefix, ts_millis(ts)).into_bytes()
}

pub(crate) fn unique_time_key(prefix: &str, ts: NaiveDateTime, id: Uuid) -> Vec<u8> {
    format!("{}|{:020}|{}", prefix, ts_millis(ts), id).into_bytes()
}

impl MetricStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory store for tests.
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        Ok(Self {
            samples: db.open_tree("samples")?,
            events: db.open_tree("scaling_events")?,
            predictions: db.open_tree("predictions")?,
            validated: db.open_tree("validated_predictions")?,
            anomalies: db.open_tree("anomalies")?,
            optimal_targets: db.open_tree("optimal_targets")?,
            patterns: db.open_tree("pattern_profiles")?,
            prescale: db.open_tree("prescale_profiles")?,
            autopilot: db.open_tree("autopilot_profiles")?,
            actions: db.open_tree("applied_actions")?,
            recommendations: db.open_tree("recommendations")?,
            skips: db.open_tree("skips")?,
            notifiers: db.open_tree("notifiers")?,
            quarantined: db.open_tree("quarantined")?,
            meta: db.open_tree("meta")?,
            db,
            write_guard: Mutex::new(()),
        })
    }

    fn encode<T: Serialize>(key: &[u8], value: &T) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|source| StoreError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            source,
        })
    }

    fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> StoreResult<T> {
        serde_json::from_slice(bytes).map_err(|source| StoreError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            source,
        })
    }

    fn put<T: Serialize>(&self, tree: &sled::Tree, key: Vec<u8>, value: &T) -> StoreResult<()> {
        let bytes = Self::encode(&key, value)?;
        let _write = self.write_guard.lock();
        tree.insert(key, bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, tree: &sled::Tree, key: &[u8]) -> StoreResult<Option<T>> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(Self::decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_values<T: DeserializeOwned>(tree: &sled::Tree, prefix: &str) -> StoreResult<Vec<T>> {
        let mut rows = Vec::new();
        for entry in tree.scan_prefix(prefix.as_bytes()) {
            let (key, bytes) = entry?;
            rows.push(Self::decode(&key, &bytes)?);
        }
        Ok(rows)
    }

    fn range_values<T: DeserializeOwned>(
        tree: &sled::Tree,
        prefix: &str,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> StoreResult<Vec<T>> {
        let start = time_key(prefix, t0);
        // The end bound is exclusive of any suffix past t1 by appending the
        // highest possible separator.
        let end = format!("{}|{:020}~", prefix, ts_millis(t1)).into_bytes();
        let mut rows = Vec::new();
        for entry in tree.range(start..end) {
            let (key, bytes) = entry?;
            rows.push(Self::decode(&key, &bytes)?);
        }
        Ok(rows)
    }

    // ---- samples ----

    /// Idempotent by `(workload, timestamp)`, last-writer-wins.
    pub fn append_samples(&self, batch: &[MetricSample]) -> StoreResult<()> {
        let mut sled_batch = sled::Batch::default();
        for sample in batch {
            let key = time_key(&sample.workload.key(), sample.timestamp);
            let bytes = Self::encode(&key, sample)?;
            sled_batch.insert(key, bytes);
        }
        let _write = self.write_guard.lock();
        self.samples.apply_batch(sled_batch)?;
        Ok(())
    }

    /// Samples for a workload in `[t0, t1]`, ordered by time.
    pub fn range_samples(
        &self,
        workload: &WorkloadRef,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> StoreResult<Vec<MetricSample>> {
        Self::range_values(&self.samples, &workload.key(), t0, t1)
    }

    /// The `(timestamp, cpu_percent)` series learners consume; startup
    /// rows are excluded here so every learner applies the same filter.
    pub fn learning_series(
        &self,
        workload: &WorkloadRef,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> StoreResult<Vec<(NaiveDateTime, f64)>> {
        Ok(self
            .range_samples(workload, t0, t1)?
            .into_iter()
            .filter(|s| !s.startup)
            .map(|s| (s.timestamp, s.cpu_percent))
            .collect())
    }

    pub fn aggregates(
        &self,
        workload: &WorkloadRef,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> StoreResult<Aggregates> {
        let samples: Vec<MetricSample> = self
            .range_samples(workload, t0, t1)?
            .into_iter()
            .filter(|s| !s.startup)
            .collect();
        if samples.is_empty() {
            return Ok(Aggregates::default());
        }
        let mut cpu_pct: Vec<f64> = samples.iter().map(|s| s.cpu_percent).collect();
        let mut cpu_per_pod: Vec<f64> = samples.iter().map(|s| s.cpu_millis_per_pod()).collect();
        let mut mem_per_pod: Vec<f64> = samples.iter().map(|s| s.memory_bytes_per_pod()).collect();
        let count = cpu_pct.len();
        let mean = cpu_pct.iter().sum::<f64>() / count as f64;
        let var = cpu_pct.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        cpu_pct.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        cpu_per_pod.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        mem_per_pod.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Ok(Aggregates {
            count,
            cpu_percent_mean: mean,
            cpu_percent_std: var.sqrt(),
            cpu_percent_p95: percentile(&cpu_pct, 0.95),
            cpu_per_pod_p95_millis: percentile(&cpu_per_pod, 0.95),
            memory_per_pod_p95_bytes: percentile(&mem_per_pod, 0.95),
        })
    }

    // ---- scaling events ----

    pub fn append_event(&self, event: &ScalingEvent) -> StoreResult<()> {
        let key = unique_time_key(&event.workload.key(), event.timestamp, Uuid::new_v4());
        self.put(&self.events, key, event)
    }

    pub fn range_events(
        &self,
        workload: &WorkloadRef,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> StoreResult<Vec<ScalingEvent>> {
        Self::range_values(&self.events, &workload.key(), t0, t1)
    }

    // ---- predictions ----

    pub fn put_prediction(&self, prediction: &Prediction) -> StoreResult<()> {
        let key = prediction_key(prediction);
        self.put(&self.predictions, key, prediction)
    }

    pub fn unvalidated_predictions(&self) -> StoreResult<Vec<Prediction>> {
        let mut rows = Vec::new();
        for entry in self.predictions.iter() {
            let (key, bytes) = entry?;
            rows.push(Self::decode(&key, &bytes)?);
        }
        Ok(rows)
    }

    pub fn delete_prediction(&self, prediction: &Prediction) -> StoreResult<()> {
        let _write = self.write_guard.lock();
        self.predictions.remove(prediction_key(prediction))?;
        Ok(())
    }

    pub fn recent_predictions(
        &self,
        workload: &WorkloadRef,
        limit: usize,
    ) -> StoreResult<Vec<Prediction>> {
        let mut rows: Vec<Prediction> =
            Self::scan_values(&self.predictions, &format!("{}|", workload.key()))?;
        rows.sort_by_key(|p| std::cmp::Reverse(p.made_at));
        rows.truncate(limit);
        Ok(rows)
    }

    pub fn put_validated(&self, validated: &ValidatedPrediction) -> StoreResult<()> {
        let key = unique_time_key(&validated.workload.key(), validated.validated_at, validated.id);
        self.put(&self.validated, key, validated)
    }

    pub fn validated_in_window(
        &self,
        workload: &WorkloadRef,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> StoreResult<Vec<ValidatedPrediction>> {
        Self::range_values(&self.validated, &workload.key(), t0, t1)
    }

    pub fn all_validated(&self) -> StoreResult<Vec<ValidatedPrediction>> {
        Self::scan_values(&self.validated, "")
    }

    /// Rolling mean absolute percentage error for one model, used to weight
    /// the ensemble. `None` until a validated row exists.
    pub fn model_mape(
        &self,
        workload: &WorkloadRef,
        model: PredictionModel,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> StoreResult<Option<f64>> {
        let rows: Vec<ValidatedPrediction> = self
            .validated_in_window(workload, t0, t1)?
            .into_iter()
            .filter(|v| v.model_used == model)
            .collect();
        if rows.is_empty() {
            return Ok(None);
        }
        let mape = rows
            .iter()
            .map(|v| {
                (v.predicted_cpu_percent - v.actual_cpu_percent).abs()
                    / v.actual_cpu_percent.abs().max(1.0)
            })
            .sum::<f64>()
            / rows.len() as f64
            * 100.0;
        Ok(Some(mape))
    }

    // ---- optimal targets ----

    /// Read-modify-write that increments `samples_count`, verified by a
    /// read-after-write.
    pub fn upsert_optimal(
        &self,
        workload: &WorkloadRef,
        hour_slot: u16,
        target: f64,
        confidence: f64,
        now: NaiveDateTime,
    ) -> StoreResult<OptimalTarget> {
        let key = optimal_key(workload, hour_slot);
        let _write = self.write_guard.lock();
        let mut row: OptimalTarget = match self.optimal_targets.get(&key)? {
            Some(bytes) => Self::decode(&key, &bytes)?,
            None => OptimalTarget {
                workload: workload.clone(),
                hour_slot,
                target,
                confidence,
                samples_count: 0,
                updated_at: now,
            },
        };
        row.target = target;
        row.confidence = confidence;
        row.samples_count += 1;
        row.updated_at = now;
        let bytes = Self::encode(&key, &row)?;
        self.optimal_targets.insert(key.clone(), bytes)?;
        let read_back = self.optimal_targets.get(&key)?;
        match read_back {
            Some(bytes) => Self::decode::<OptimalTarget>(&key, &bytes),
            None => Err(StoreError::Io(sled::Error::ReportableBug(
                "optimal target vanished after write".to_string(),
            ))),
        }
    }

    pub fn get_optimal(
        &self,
        workload: &WorkloadRef,
        hour_slot: u16,
    ) -> StoreResult<Option<OptimalTarget>> {
        self.get(&self.optimal_targets, &optimal_key(workload, hour_slot))
    }

    // ---- profiles ----

    pub fn put_pattern(&self, profile: &PatternProfile) -> StoreResult<()> {
        self.put(
            &self.patterns,
            profile.workload.key().into_bytes(),
            profile,
        )
    }

    pub fn get_pattern(&self, workload: &WorkloadRef) -> StoreResult<Option<PatternProfile>> {
        self.get(&self.patterns, workload.key().as_bytes())
    }

    pub fn all_patterns(&self) -> StoreResult<Vec<PatternProfile>> {
        Self::scan_values(&self.patterns, "")
    }

    pub fn put_prescale(&self, profile: &PrescaleProfile) -> StoreResult<()> {
        self.put(
            &self.prescale,
            profile.workload.key().into_bytes(),
            profile,
        )
    }

    pub fn get_prescale(&self, workload: &WorkloadRef) -> StoreResult<Option<PrescaleProfile>> {
        self.get(&self.prescale, workload.key().as_bytes())
    }

    pub fn all_prescale(&self) -> StoreResult<Vec<PrescaleProfile>> {
        Self::scan_values(&self.prescale, "")
    }

    pub fn put_autopilot(&self, profile: &AutopilotProfile) -> StoreResult<()> {
        self.put(
            &self.autopilot,
            profile.workload.key().into_bytes(),
            profile,
        )
    }

    pub fn get_autopilot(&self, workload: &WorkloadRef) -> StoreResult<Option<AutopilotProfile>> {
        self.get(&self.autopilot, workload.key().as_bytes())
    }

    pub fn all_autopilot(&self) -> StoreResult<Vec<AutopilotProfile>> {
        Self::scan_values(&self.autopilot, "")
    }

    // ---- audit, recommendations, skips, anomalies ----

    pub fn append_action(&self, action: &AppliedAction) -> StoreResult<()> {
        let key = unique_time_key(&action.workload.key(), action.timestamp, action.id);
        self.put(&self.actions, key, action)
    }

    pub fn actions_for(&self, workload: &WorkloadRef) -> StoreResult<Vec<AppliedAction>> {
        Self::scan_values(&self.actions, &format!("{}|", workload.key()))
    }

    pub fn recent_actions(&self, limit: usize) -> StoreResult<Vec<AppliedAction>> {
        let mut rows: Vec<AppliedAction> = Self::scan_values(&self.actions, "")?;
        rows.sort_by_key(|a| std::cmp::Reverse(a.timestamp));
        rows.truncate(limit);
        Ok(rows)
    }

    pub fn append_recommendation(&self, rec: &Recommendation) -> StoreResult<()> {
        let key = unique_time_key(&rec.workload.key(), rec.created_at, rec.id);
        self.put(&self.recommendations, key, rec)
    }

    pub fn recent_recommendations(&self, limit: usize) -> StoreResult<Vec<Recommendation>> {
        let mut rows: Vec<Recommendation> = Self::scan_values(&self.recommendations, "")?;
        rows.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    pub fn append_skip(&self, skip: &SkipRecord) -> StoreResult<()> {
        let key = unique_time_key(&skip.workload.key(), skip.timestamp, Uuid::new_v4());
        self.put(&self.skips, key, skip)
    }

    pub fn recent_skips(&self, limit: usize) -> StoreResult<Vec<SkipRecord>> {
        let mut rows: Vec<SkipRecord> = Self::scan_values(&self.skips, "")?;
        rows.sort_by_key(|s| std::cmp::Reverse(s.timestamp));
        rows.truncate(limit);
        Ok(rows)
    }

    pub fn append_anomaly(&self, anomaly: &Anomaly) -> StoreResult<()> {
        let key = unique_time_key("", anomaly.timestamp, anomaly.id);
        self.put(&self.anomalies, key, anomaly)
    }

    pub fn recent_anomalies(&self, limit: usize) -> StoreResult<Vec<Anomaly>> {
        let mut rows: Vec<Anomaly> = Self::scan_values(&self.anomalies, "")?;
        rows.sort_by_key(|a| std::cmp::Reverse(a.timestamp));
        rows.truncate(limit);
        Ok(rows)
    }

    // ---- notification providers ----

    pub fn put_notifier(&self, provider: &NotificationProvider) -> StoreResult<()> {
        self.put(
            &self.notifiers,
            provider.id.to_string().into_bytes(),
            provider,
        )
    }

    pub fn get_notifier(&self, id: Uuid) -> StoreResult<Option<NotificationProvider>> {
        self.get(&self.notifiers, id.to_string().as_bytes())
    }

    pub fn delete_notifier(&self, id: Uuid) -> StoreResult<bool> {
        let _write = self.write_guard.lock();
        Ok(self.notifiers.remove(id.to_string().as_bytes())?.is_some())
    }

    pub fn list_notifiers(&self) -> StoreResult<Vec<NotificationProvider>> {
        Self::scan_values(&self.notifiers, "")
    }

    // ---- quarantine ----

    pub fn quarantine(
        &self,
        workload: &WorkloadRef,
        reason: &str,
        now: NaiveDateTime,
    ) -> StoreResult<()> {
        self.put(
            &self.quarantined,
            workload.key().into_bytes(),
            &serde_json::json!({ "reason": reason, "since": now }),
        )
    }

    pub fn is_quarantined(&self, workload: &WorkloadRef) -> StoreResult<bool> {
        Ok(self.quarantined.contains_key(workload.key().as_bytes())?)
    }

    pub fn clear_quarantine(&self, workload: &WorkloadRef) -> StoreResult<bool> {
        let _write = self.write_guard.lock();
        Ok(self
            .quarantined
            .remove(workload.key().as_bytes())?
            .is_some())
    }

    pub fn list_quarantined(&self) -> StoreResult<Vec<(String, serde_json::Value)>> {
        let mut rows = Vec::new();
        for entry in self.quarantined.iter() {
            let (key, bytes) = entry?;
            rows.push((
                String::from_utf8_lossy(&key).into_owned(),
                Self::decode(&key, &bytes)?,
            ));
        }
        Ok(rows)
    }

    // ---- meta & operational ----

    pub fn last_cleanup(&self) -> StoreResult<Option<NaiveDateTime>> {
        self.get(&self.meta, b"last_cleanup")
    }

    pub fn set_last_cleanup(&self, at: NaiveDateTime) -> StoreResult<()> {
        self.put(&self.meta, b"last_cleanup".to_vec(), &at)
    }

    pub fn vacuum(&self) -> StoreResult<u64> {
        self.db.flush()?;
        Ok(self.db.size_on_disk()?)
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let trees: Vec<(&str, &sled::Tree)> = vec![
            ("samples", &self.samples),
            ("scaling_events", &self.events),
            ("predictions", &self.predictions),
            ("validated_predictions", &self.validated),
            ("anomalies", &self.anomalies),
            ("optimal_targets", &self.optimal_targets),
            ("pattern_profiles", &self.patterns),
            ("prescale_profiles", &self.prescale),
            ("autopilot_profiles", &self.autopilot),
            ("applied_actions", &self.actions),
            ("recommendations", &self.recommendations),
            ("skips", &self.skips),
            ("notifiers", &self.notifiers),
            ("quarantined", &self.quarantined),
        ];
        Ok(StoreStats {
            trees: trees
                .into_iter()
                .map(|(name, tree)| TreeStats {
                    name: name.to_string(),
                    rows: tree.len(),
                })
                .collect(),
            size_on_disk_bytes: self.db.size_on_disk()?,
            last_cleanup: self.last_cleanup()?,
        })
    }

    pub(crate) fn write_guard(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.write_guard.lock()
    }
}

fn prediction_key(prediction: &Prediction) -> Vec<u8> {
    format!(
        "{}|{:020}|{:05}",
        prediction.workload.key(),
        ts_millis(prediction.made_at),
        prediction.horizon.minutes()
    )
    .into_bytes()
}

fn optimal_key(workload: &WorkloadRef, hour_slot: u16) -> Vec<u8> {
    format!("{}|{:03}", workload.key(), hour_slot).into_bytes()
}

pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
