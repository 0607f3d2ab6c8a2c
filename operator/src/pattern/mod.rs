use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDateTime};
use resources::{
    learning::{LoadPattern, PatternFeatures, PatternProfile},
    workload::WorkloadRef,
};

/// Minimum samples before attempting classification. Lowered from 100 so
/// detection completes in about half an hour at the default interval.
pub const MIN_SAMPLES: usize = 20;

const CV_STEADY: f64 = 0.15;
const SLOPE_NEGLIGIBLE_PER_DAY: f64 = 0.5;
const SLOPE_TREND_PER_DAY: f64 = 2.0;
const AUTOCORR_THRESHOLD: f64 = 0.5;
const KURTOSIS_THRESHOLD: f64 = 4.0;
/// Mean above-threshold run length at or below which spikes count as
/// short-lived.
const SHORT_SPIKE_RUN: f64 = 2.0;
const MONTHLY_PEAK_RATIO: f64 = 1.3;

/// Classifies a workload's load shape from its learning series.
pub struct PatternRecognizer;

impl PatternRecognizer {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(
        &self,
        workload: &WorkloadRef,
        series: &[(NaiveDateTime, f64)],
        now: NaiveDateTime,
    ) -> PatternProfile {
        let confidence = sample_confidence(series.len());
        if series.len() < MIN_SAMPLES {
            return PatternProfile {
                workload: workload.clone(),
                pattern: LoadPattern::Unknown,
                confidence,
                last_updated: now,
                features: PatternFeatures::default(),
            };
        }

        let features = extract_features(series);
        let pattern = classify_features(&features, series);
        PatternProfile {
            workload: workload.clone(),
            pattern,
            confidence,
            last_updated: now,
            features,
        }
    }
}

fn sample_confidence(count: usize) -> f64 {
    if count < 20 {
        0.30
    } else if count < 50 {
        0.60
    } else if count < 100 {
        0.80
    } else {
        0.95
    }
}

/// First matching rule wins.
fn classify_features(features: &PatternFeatures, series: &[(NaiveDateTime, f64)]) -> LoadPattern {
    if features.cv < CV_STEADY && features.slope_per_day.abs() < SLOPE_NEGLIGIBLE_PER_DAY {
        return LoadPattern::Steady;
    }
    if features.slope_per_day > SLOPE_TREND_PER_DAY {
        return LoadPattern::Growing;
    }
    if features.slope_per_day < -SLOPE_TREND_PER_DAY {
        return LoadPattern::Declining;
    }
    if features.autocorr_24h > AUTOCORR_THRESHOLD {
        return LoadPattern::Periodic;
    }
    if features.autocorr_7d > AUTOCORR_THRESHOLD {
        return LoadPattern::WeeklySeasonal;
    }
    if month_boundary_peaks(series) {
        return LoadPattern::MonthlySeasonal;
    }
    if features.kurtosis > KURTOSIS_THRESHOLD && features.spike_score > 0.0 {
        // Short spike-decay signature separates one-off events from
        // sustained burstiness; both share the same HPA target prior.
        return if mean_spike_run(series) <= SHORT_SPIKE_RUN {
            LoadPattern::EventDriven
        } else {
            LoadPattern::Bursty
        };
    }
    LoadPattern::Unknown
}

fn extract_features(series: &[(NaiveDateTime, f64)]) -> PatternFeatures {
    let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = var.sqrt();
    let cv = if mean.abs() > f64::EPSILON {
        std / mean
    } else {
        0.0
    };

    let hourly = hourly_buckets(series);
    let kurtosis = if std > f64::EPSILON {
        values.iter().map(|v| ((v - mean) / std).powi(4)).sum::<f64>() / n
    } else {
        0.0
    };

    PatternFeatures {
        mean,
        std,
        cv,
        autocorr_24h: autocorrelation(&hourly, 24),
        autocorr_7d: autocorrelation(&hourly, 168),
        slope_per_day: slope_per_day(series),
        kurtosis,
        spike_score: spike_score(&values, mean, std),
    }
}

/// Average the series into contiguous hourly buckets, ordered by hour.
fn hourly_buckets(series: &[(NaiveDateTime, f64)]) -> Vec<f64> {
    let mut buckets: BTreeMap<i64, (f64, u32)> = BTreeMap::new();
    for (ts, value) in series {
        let entry = buckets.entry(ts.timestamp() / 3600).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }
    buckets
        .into_values()
        .map(|(sum, count)| sum / count as f64)
        .collect()
}

fn autocorrelation(values: &[f64], lag: usize) -> f64 {
    if values.len() < lag + 2 {
        return 0.0;
    }
    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;
    let denom: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    if denom < f64::EPSILON {
        return 0.0;
    }
    let num: f64 = (0..n - lag)
        .map(|i| (values[i] - mean) * (values[i + lag] - mean))
        .sum();
    num / denom
}

/// Slope of a linear fit over the last 7 days, in percent per day.
fn slope_per_day(series: &[(NaiveDateTime, f64)]) -> f64 {
    let last = match series.last() {
        Some((ts, _)) => *ts,
        None => return 0.0,
    };
    let window_start = last - chrono::Duration::days(7);
    let points: Vec<(f64, f64)> = series
        .iter()
        .filter(|(ts, _)| *ts >= window_start)
        .map(|(ts, v)| ((last - *ts).num_seconds() as f64 / -86_400.0, *v))
        .collect();
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let num: f64 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let denom: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if denom < f64::EPSILON {
        0.0
    } else {
        num / denom
    }
}

/// Fraction of points more than two standard deviations above the mean.
fn spike_score(values: &[f64], mean: f64, std: f64) -> f64 {
    if std < f64::EPSILON {
        return 0.0;
    }
    let threshold = mean + 2.0 * std;
    values.iter().filter(|v| **v > threshold).count() as f64 / values.len() as f64
}

/// Mean length of consecutive above-threshold runs, in samples.
fn mean_spike_run(series: &[(NaiveDateTime, f64)]) -> f64 {
    let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    let threshold = mean + 2.0 * std;
    let mut runs = Vec::new();
    let mut current = 0u32;
    for value in &values {
        if *value > threshold {
            current += 1;
        } else if current > 0 {
            runs.push(current);
            current = 0;
        }
    }
    if current > 0 {
        runs.push(current);
    }
    if runs.is_empty() {
        return 0.0;
    }
    runs.iter().sum::<u32>() as f64 / runs.len() as f64
}

/// Peaks clustered at month boundaries across at least a month of data.
fn month_boundary_peaks(series: &[(NaiveDateTime, f64)]) -> bool {
    let (first, last) = match (series.first(), series.last()) {
        (Some((first, _)), Some((last, _))) => (*first, *last),
        _ => return false,
    };
    if (last - first).num_days() < 35 {
        return false;
    }
    let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
    let overall = values.iter().sum::<f64>() / values.len() as f64;
    let boundary: Vec<f64> = series
        .iter()
        .filter(|(ts, _)| {
            let day = ts.day();
            day <= 2 || day >= 28
        })
        .map(|(_, v)| *v)
        .collect();
    if boundary.is_empty() || overall < f64::EPSILON {
        return false;
    }
    let boundary_mean = boundary.iter().sum::<f64>() / boundary.len() as f64;
    boundary_mean / overall > MONTHLY_PEAK_RATIO
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDateTime};

    use super::*;

    fn base() -> NaiveDateTime {
        NaiveDateTime::from_timestamp(1_700_000_000, 0)
    }

    fn wl() -> WorkloadRef {
        WorkloadRef::new("demo", "demo-app")
    }

    fn hourly_series(hours: usize, f: impl Fn(usize) -> f64) -> Vec<(NaiveDateTime, f64)> {
        (0..hours)
            .map(|h| (base() + Duration::hours(h as i64), f(h)))
            .collect()
    }

    #[test]
    fn too_few_samples_is_unknown_with_tiered_confidence() {
        let recognizer = PatternRecognizer::new();
        let series = hourly_series(5, |_| 50.0);
        let profile = recognizer.classify(&wl(), &series, base());
        assert_eq!(profile.pattern, LoadPattern::Unknown);
        assert_eq!(profile.confidence, 0.30);
    }

    #[test]
    fn flat_series_is_steady() {
        let recognizer = PatternRecognizer::new();
        let series = hourly_series(48, |h| 50.0 + 0.5 * ((h % 3) as f64));
        let profile = recognizer.classify(&wl(), &series, base());
        assert_eq!(profile.pattern, LoadPattern::Steady);
        assert_eq!(profile.confidence, 0.60);
    }

    #[test]
    fn ramping_series_is_growing() {
        let recognizer = PatternRecognizer::new();
        // +10 percent per day over four days.
        let series = hourly_series(96, |h| 30.0 + 10.0 * (h as f64 / 24.0));
        let profile = recognizer.classify(&wl(), &series, base());
        assert_eq!(profile.pattern, LoadPattern::Growing);
    }

    #[test]
    fn daily_sine_is_periodic() {
        let recognizer = PatternRecognizer::new();
        let series = hourly_series(24 * 7, |h| {
            50.0 + 30.0 * ((h as f64) * std::f64::consts::TAU / 24.0).sin()
        });
        let profile = recognizer.classify(&wl(), &series, base());
        assert_eq!(profile.pattern, LoadPattern::Periodic);
        assert_eq!(profile.confidence, 0.95);
    }

    #[test]
    fn confidence_tiers_follow_sample_count() {
        assert_eq!(sample_confidence(10), 0.30);
        assert_eq!(sample_confidence(30), 0.60);
        assert_eq!(sample_confidence(70), 0.80);
        assert_eq!(sample_confidence(150), 0.95);
    }

    #[test]
    fn pattern_defaults_feed_the_tuner() {
        assert_eq!(LoadPattern::Steady.default_target(), 75);
        assert_eq!(LoadPattern::Bursty.default_target(), 70);
        assert_eq!(LoadPattern::EventDriven.default_target(), 70);
        assert_eq!(LoadPattern::Declining.default_target(), 80);
    }
}
