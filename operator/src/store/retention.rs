use std::collections::{HashMap, HashSet};

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use resources::{config::RetentionConfig, metrics::MetricSample, learning::Prediction};
use serde::Serialize;

use super::{time_key, MetricStore, StoreResult};

/// Disk-pressure ladder rung, measured as used/total of the backing volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiskPressure {
    Normal,
    Warning,
    Downsample,
    Emergency,
}

impl DiskPressure {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 0.95 {
            DiskPressure::Emergency
        } else if ratio >= 0.90 {
            DiskPressure::Downsample
        } else if ratio >= 0.80 {
            DiskPressure::Warning
        } else {
            DiskPressure::Normal
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CleanupReport {
    pub samples_deleted: usize,
    pub events_deleted: usize,
    pub predictions_deleted: usize,
    pub validated_deleted: usize,
    pub anomalies_deleted: usize,
    pub downsampled: usize,
    pub emergency_deleted: usize,
}

/// Milliseconds embedded in a time key, if any.
fn key_millis(key: &[u8]) -> Option<i64> {
    let key = std::str::from_utf8(key).ok()?;
    key.split('|')
        .find(|segment| segment.len() == 20 && segment.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|segment| segment.parse::<i64>().ok())
}

fn key_prefix(key: &[u8]) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    key.split_once('|').map(|(prefix, _)| prefix.to_owned())
}

impl MetricStore {
    /// Periodic cleanup: delete rows older than their table's retention.
    pub fn run_cleanup(
        &self,
        retention: &RetentionConfig,
        now: NaiveDateTime,
    ) -> StoreResult<CleanupReport> {
        let mut report = CleanupReport::default();
        report.samples_deleted = self.sweep_older_than(
            &self.samples,
            now - Duration::days(retention.samples_days),
        )?;
        report.events_deleted =
            self.sweep_older_than(&self.events, now - Duration::days(retention.events_days))?;
        let prediction_cutoff = now - Duration::days(retention.predictions_days);
        report.predictions_deleted =
            self.sweep_older_than(&self.predictions, prediction_cutoff)?;
        report.validated_deleted = self.sweep_older_than(&self.validated, prediction_cutoff)?;
        report.anomalies_deleted = self.sweep_older_than(
            &self.anomalies,
            now - Duration::days(retention.anomalies_days),
        )?;
        self.set_last_cleanup(now)?;
        Ok(report)
    }

    /// Apply the disk-pressure ladder for the given used/total ratio and
    /// report what ran.
    pub fn run_pressure_ladder(
        &self,
        ratio: f64,
        now: NaiveDateTime,
    ) -> StoreResult<(DiskPressure, CleanupReport)> {
        let mut report = CleanupReport::default();
        let pressure = DiskPressure::from_ratio(ratio);
        match pressure {
            DiskPressure::Normal => {},
            DiskPressure::Warning => {
                tracing::warn!("Store volume at {:.0}% used", ratio * 100.0);
            },
            DiskPressure::Downsample => {
                tracing::warn!(
                    "Store volume at {:.0}% used, smart downsample engaged",
                    ratio * 100.0
                );
                report.downsampled = self.smart_downsample(now)?;
                report.predictions_deleted = self.prune_redundant_predictions()?;
            },
            DiskPressure::Emergency => {
                tracing::error!(
                    "Store volume at {:.0}% used, aggressive cleanup engaged",
                    ratio * 100.0
                );
                report.downsampled = self.smart_downsample(now)?;
                report.predictions_deleted = self.prune_redundant_predictions()?;
                report.emergency_deleted = self.emergency_cleanup(now)?;
            },
        }
        if pressure != DiskPressure::Normal {
            self.vacuum()?;
        }
        Ok((pressure, report))
    }

    fn sweep_older_than(&self, tree: &sled::Tree, cutoff: NaiveDateTime) -> StoreResult<usize> {
        let cutoff_millis = cutoff.timestamp_millis().max(0);
        let mut doomed = Vec::new();
        for entry in tree.iter() {
            let (key, _) = entry?;
            if let Some(millis) = key_millis(&key) {
                if millis < cutoff_millis {
                    doomed.push(key);
                }
            }
        }
        let _write = self.write_guard();
        let mut batch = sled::Batch::default();
        for key in &doomed {
            batch.remove(key.clone());
        }
        tree.apply_batch(batch)?;
        Ok(doomed.len())
    }

    /// Replace samples older than 14 days with 2-hour averages per workload.
    pub fn smart_downsample(&self, now: NaiveDateTime) -> StoreResult<usize> {
        const BUCKET_MILLIS: i64 = 2 * 60 * 60 * 1000;
        let cutoff = (now - Duration::days(14)).timestamp_millis().max(0);

        struct Bucket {
            cpu: i64,
            memory: i64,
            replicas: u64,
            percent: f64,
            count: u32,
        }
        let mut buckets: HashMap<(String, i64), Bucket> = HashMap::new();
        let mut doomed = Vec::new();
        for entry in self.samples.iter() {
            let (key, bytes) = entry?;
            let millis = match key_millis(&key) {
                Some(millis) if millis < cutoff => millis,
                _ => continue,
            };
            let sample: MetricSample = Self::decode(&key, &bytes)?;
            let prefix = match key_prefix(&key) {
                Some(prefix) => prefix,
                None => continue,
            };
            let bucket = buckets
                .entry((prefix, millis - millis % BUCKET_MILLIS))
                .or_insert(Bucket {
                    cpu: 0,
                    memory: 0,
                    replicas: 0,
                    percent: 0.0,
                    count: 0,
                });
            bucket.cpu += sample.cpu_millicores;
            bucket.memory += sample.memory_bytes;
            bucket.replicas += sample.replica_count as u64;
            bucket.percent += sample.cpu_percent;
            bucket.count += 1;
            doomed.push(key);
        }
        if doomed.is_empty() {
            return Ok(0);
        }

        let replaced = doomed.len();
        let _write = self.write_guard();
        let mut batch = sled::Batch::default();
        for key in doomed {
            batch.remove(key);
        }
        for ((prefix, bucket_start), bucket) in buckets {
            let workload = match resources::workload::WorkloadRef::parse(&prefix) {
                Some(workload) => workload,
                None => continue,
            };
            let n = bucket.count.max(1) as i64;
            let timestamp = NaiveDateTime::from_timestamp(
                bucket_start / 1000,
                ((bucket_start % 1000) * 1_000_000) as u32,
            );
            let averaged = MetricSample {
                workload,
                timestamp,
                cpu_millicores: bucket.cpu / n,
                memory_bytes: bucket.memory / n,
                replica_count: (bucket.replicas / n as u64) as u32,
                cpu_percent: bucket.percent / n as f64,
                startup: false,
            };
            let key = time_key(&prefix, timestamp);
            let bytes = Self::encode(&key, &averaged)?;
            batch.insert(key, bytes);
        }
        self.samples.apply_batch(batch)?;
        Ok(replaced)
    }

    /// Delete non-validated predictions beyond one per hour per workload.
    pub fn prune_redundant_predictions(&self) -> StoreResult<usize> {
        let mut kept: HashSet<(String, i64)> = HashSet::new();
        let mut doomed = Vec::new();
        for entry in self.predictions.iter() {
            let (key, bytes) = entry?;
            let prediction: Prediction = Self::decode(&key, &bytes)?;
            let hour = prediction.made_at.timestamp() / 3600;
            if !kept.insert((prediction.workload.key(), hour)) {
                doomed.push(key);
            }
        }
        let removed = doomed.len();
        let _write = self.write_guard();
        let mut batch = sled::Batch::default();
        for key in doomed {
            batch.remove(key);
        }
        self.predictions.apply_batch(batch)?;
        Ok(removed)
    }

    /// Keep the last 3 days at full fidelity; for older data keep at least
    /// four representative samples per `(day_of_week, hour)` slot per
    /// workload.
    pub fn emergency_cleanup(&self, now: NaiveDateTime) -> StoreResult<usize> {
        const KEEP_PER_SLOT: usize = 4;
        let cutoff = (now - Duration::days(3)).timestamp_millis().max(0);
        let mut slot_counts: HashMap<(String, u32, u32), usize> = HashMap::new();
        let mut doomed = Vec::new();
        for entry in self.samples.iter() {
            let (key, bytes) = entry?;
            let millis = match key_millis(&key) {
                Some(millis) => millis,
                None => continue,
            };
            if millis >= cutoff {
                continue;
            }
            let sample: MetricSample = Self::decode(&key, &bytes)?;
            let slot = (
                sample.workload.key(),
                sample.timestamp.weekday().num_days_from_monday(),
                sample.timestamp.hour(),
            );
            let count = slot_counts.entry(slot).or_insert(0);
            if *count < KEEP_PER_SLOT {
                *count += 1;
            } else {
                doomed.push(key);
            }
        }
        let removed = doomed.len();
        let _write = self.write_guard();
        let mut batch = sled::Batch::default();
        for key in doomed {
            batch.remove(key);
        }
        self.samples.apply_batch(batch)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDateTime};
    use resources::{
        config::RetentionConfig,
        metrics::MetricSample,
        workload::WorkloadRef,
    };

    use super::*;

    fn base() -> NaiveDateTime {
        NaiveDateTime::from_timestamp(1_700_000_000, 0)
    }

    fn sample_at(wl: &WorkloadRef, at: NaiveDateTime) -> MetricSample {
        MetricSample {
            workload: wl.clone(),
            timestamp: at,
            cpu_millicores: 100,
            memory_bytes: 64 << 20,
            replica_count: 2,
            cpu_percent: 40.0,
            startup: false,
        }
    }

    #[test]
    fn cleanup_removes_expired_samples_only() {
        let store = MetricStore::temporary().unwrap();
        let wl = WorkloadRef::new("demo", "demo-app");
        let now = base();
        let old = sample_at(&wl, now - Duration::days(40));
        let fresh = sample_at(&wl, now - Duration::days(1));
        store.append_samples(&[old, fresh.clone()]).unwrap();

        let report = store
            .run_cleanup(&RetentionConfig::default(), now)
            .unwrap();
        assert_eq!(report.samples_deleted, 1);
        let remaining = store
            .range_samples(&wl, now - Duration::days(60), now)
            .unwrap();
        assert_eq!(remaining, vec![fresh]);
        assert_eq!(store.last_cleanup().unwrap(), Some(now));
    }

    #[test]
    fn downsample_replaces_old_rows_with_bucket_averages() {
        let store = MetricStore::temporary().unwrap();
        let wl = WorkloadRef::new("demo", "demo-app");
        let now = base();
        let old_base = now - Duration::days(20);
        for i in 0..8 {
            let mut s = sample_at(&wl, old_base + Duration::minutes(i * 15));
            s.cpu_percent = 10.0 * (i + 1) as f64;
            store.append_samples(&[s]).unwrap();
        }
        let replaced = store.smart_downsample(now).unwrap();
        assert_eq!(replaced, 8);
        let remaining = store
            .range_samples(&wl, old_base - Duration::hours(4), old_base + Duration::hours(4))
            .unwrap();
        // 8 quarter-hour rows span at most two 2-hour buckets.
        assert!(remaining.len() <= 2);
        assert!(!remaining.is_empty());
    }

    #[test]
    fn emergency_cleanup_keeps_representative_slots() {
        let store = MetricStore::temporary().unwrap();
        let wl = WorkloadRef::new("demo", "demo-app");
        let now = base();
        // 10 samples in the same (dow, hour) slot, 10 days back.
        let old = now - Duration::days(10);
        for i in 0..10 {
            store
                .append_samples(&[sample_at(&wl, old + Duration::seconds(i * 60))])
                .unwrap();
        }
        let removed = store.emergency_cleanup(now).unwrap();
        assert_eq!(removed, 6);
        let remaining = store
            .range_samples(&wl, old - Duration::hours(1), old + Duration::hours(1))
            .unwrap();
        assert_eq!(remaining.len(), 4);
    }

    #[test]
    fn ladder_maps_ratios_to_rungs() {
        assert_eq!(DiskPressure::from_ratio(0.50), DiskPressure::Normal);
        assert_eq!(DiskPressure::from_ratio(0.82), DiskPressure::Warning);
        assert_eq!(DiskPressure::from_ratio(0.91), DiskPressure::Downsample);
        assert_eq!(DiskPressure::from_ratio(0.96), DiskPressure::Emergency);
    }
}
