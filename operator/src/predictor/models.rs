//! The individual forecast models. Each takes the learning series and
//! answers a point forecast, or `None` when it cannot say anything.

use chrono::{Datelike, NaiveDateTime, Timelike};

/// Window average.
pub fn mean_forecast(series: &[(NaiveDateTime, f64)]) -> Option<f64> {
    if series.is_empty() {
        return None;
    }
    let tail = &series[series.len().saturating_sub(48)..];
    Some(tail.iter().map(|(_, v)| v).sum::<f64>() / tail.len() as f64)
}

/// Linear extrapolation of the recent trend.
pub fn trend_forecast(series: &[(NaiveDateTime, f64)], horizon_minutes: i64) -> Option<f64> {
    if series.len() < 3 {
        return None;
    }
    let (last_ts, _) = series[series.len() - 1];
    let points: Vec<(f64, f64)> = series
        .iter()
        .map(|(ts, v)| ((*ts - last_ts).num_seconds() as f64 / 60.0, *v))
        .collect();
    let (slope, intercept) = linear_fit(&points)?;
    Some(intercept + slope * horizon_minutes as f64)
}

/// Hour-of-day / day-of-week averaging.
pub fn seasonal_forecast(series: &[(NaiveDateTime, f64)], target: NaiveDateTime) -> Option<f64> {
    if series.is_empty() {
        return None;
    }
    let same_slot: Vec<f64> = series
        .iter()
        .filter(|(ts, _)| {
            ts.hour() == target.hour() && ts.weekday() == target.weekday()
        })
        .map(|(_, v)| *v)
        .collect();
    if !same_slot.is_empty() {
        return Some(same_slot.iter().sum::<f64>() / same_slot.len() as f64);
    }
    let same_hour: Vec<f64> = series
        .iter()
        .filter(|(ts, _)| ts.hour() == target.hour())
        .map(|(_, v)| *v)
        .collect();
    if same_hour.is_empty() {
        mean_forecast(series)
    } else {
        Some(same_hour.iter().sum::<f64>() / same_hour.len() as f64)
    }
}

/// Holt's double exponential smoothing: level plus trend.
pub fn holt_winters_forecast(
    series: &[(NaiveDateTime, f64)],
    horizon_minutes: i64,
) -> Option<f64> {
    if series.len() < 4 {
        return None;
    }
    const ALPHA: f64 = 0.3;
    const BETA: f64 = 0.1;
    let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
    let mut level = values[0];
    let mut trend = values[1] - values[0];
    for value in &values[1..] {
        let prev_level = level;
        level = ALPHA * value + (1.0 - ALPHA) * (level + trend);
        trend = BETA * (level - prev_level) + (1.0 - BETA) * trend;
    }
    let step = median_step_minutes(series);
    let steps_ahead = if step > 0.0 {
        horizon_minutes as f64 / step
    } else {
        1.0
    };
    Some(level + trend * steps_ahead)
}

/// ARIMA(1,1,1) with the AR coefficient estimated from the differenced
/// series and a small fixed MA coefficient.
pub fn arima_forecast(series: &[(NaiveDateTime, f64)], horizon_minutes: i64) -> Option<f64> {
    if series.len() < 5 {
        return None;
    }
    const THETA: f64 = 0.1;
    let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let phi = lag1_autocorr(&diffs).clamp(-0.9, 0.9);

    // One pass to obtain the last innovation.
    let mut err = 0.0;
    let mut prev_diff = diffs[0];
    for diff in &diffs[1..] {
        let fitted = phi * prev_diff + THETA * err;
        err = diff - fitted;
        prev_diff = *diff;
    }

    let step = median_step_minutes(series);
    let steps_ahead = if step > 0.0 {
        (horizon_minutes as f64 / step).max(1.0)
    } else {
        1.0
    };
    // The AR component decays geometrically over the forecast path.
    let mut forecast = *values.last()?;
    let mut diff = phi * prev_diff + THETA * err;
    for _ in 0..(steps_ahead.round() as usize).min(1000) {
        forecast += diff;
        diff *= phi;
    }
    Some(forecast)
}

/// Additive decomposition: linear trend plus weekly and daily effects.
pub fn prophet_forecast(series: &[(NaiveDateTime, f64)], target: NaiveDateTime) -> Option<f64> {
    if series.len() < 8 {
        return None;
    }
    let (last_ts, _) = series[series.len() - 1];
    let points: Vec<(f64, f64)> = series
        .iter()
        .map(|(ts, v)| ((*ts - last_ts).num_seconds() as f64 / 60.0, *v))
        .collect();
    let (slope, intercept) = linear_fit(&points)?;
    let trend_at = |ts: NaiveDateTime| {
        intercept + slope * ((ts - last_ts).num_seconds() as f64 / 60.0)
    };

    let mut daily = [0.0f64; 24];
    let mut daily_n = [0u32; 24];
    let mut weekly = [0.0f64; 7];
    let mut weekly_n = [0u32; 7];
    for (ts, value) in series {
        let residual = value - trend_at(*ts);
        let hour = ts.hour() as usize;
        daily[hour] += residual;
        daily_n[hour] += 1;
        let dow = ts.weekday().num_days_from_monday() as usize;
        weekly[dow] += residual;
        weekly_n[dow] += 1;
    }
    let daily_effect = |hour: usize| {
        if daily_n[hour] > 0 {
            daily[hour] / daily_n[hour] as f64
        } else {
            0.0
        }
    };
    let weekly_effect = |dow: usize| {
        if weekly_n[dow] > 0 {
            weekly[dow] / weekly_n[dow] as f64
        } else {
            0.0
        }
    };
    Some(
        trend_at(target)
            + daily_effect(target.hour() as usize)
            + weekly_effect(target.weekday().num_days_from_monday() as usize),
    )
}

/// Standard deviation of the series tail, used to widen the interval.
pub fn residual_std(series: &[(NaiveDateTime, f64)]) -> f64 {
    let tail: Vec<f64> = series
        .iter()
        .rev()
        .take(96)
        .map(|(_, v)| *v)
        .collect();
    if tail.len() < 2 {
        return 0.0;
    }
    let mean = tail.iter().sum::<f64>() / tail.len() as f64;
    (tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / tail.len() as f64).sqrt()
}

fn linear_fit(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
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
        return None;
    }
    let slope = num / denom;
    Some((slope, mean_y - slope * mean_x))
}

fn lag1_autocorr(values: &[f64]) -> f64 {
    if values.len() < 3 {
        return 0.0;
    }
    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;
    let denom: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    if denom < f64::EPSILON {
        return 0.0;
    }
    let num: f64 = (0..n - 1)
        .map(|i| (values[i] - mean) * (values[i + 1] - mean))
        .sum();
    num / denom
}

fn median_step_minutes(series: &[(NaiveDateTime, f64)]) -> f64 {
    let mut steps: Vec<f64> = series
        .windows(2)
        .map(|w| (w[1].0 - w[0].0).num_seconds() as f64 / 60.0)
        .filter(|s| *s > 0.0)
        .collect();
    if steps.is_empty() {
        return 0.0;
    }
    steps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    steps[steps.len() / 2]
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn base() -> NaiveDateTime {
        NaiveDateTime::from_timestamp(1_700_000_000, 0)
    }

    fn series(minutes_step: i64, f: impl Fn(usize) -> f64, n: usize) -> Vec<(NaiveDateTime, f64)> {
        (0..n)
            .map(|i| (base() + Duration::minutes(minutes_step * i as i64), f(i)))
            .collect()
    }

    #[test]
    fn mean_of_flat_series() {
        let s = series(30, |_| 40.0, 20);
        assert_eq!(mean_forecast(&s), Some(40.0));
    }

    #[test]
    fn trend_extrapolates_a_ramp() {
        // +1 percent per 30-minute step.
        let s = series(30, |i| i as f64, 20);
        let forecast = trend_forecast(&s, 60).unwrap();
        let last = s.last().unwrap().1;
        assert!((forecast - (last + 2.0)).abs() < 0.1);
    }

    #[test]
    fn seasonal_prefers_matching_slot() {
        // One week of hourly data: 80 at 12:00, 20 otherwise.
        let s = series(60, |i| if i % 24 == 12 { 80.0 } else { 20.0 }, 24 * 7);
        let target_noon = base() + Duration::hours(12) + Duration::days(7);
        let forecast = seasonal_forecast(&s, target_noon).unwrap();
        assert!((forecast - 80.0).abs() < 1e-9);
    }

    #[test]
    fn holt_winters_follows_level_and_trend() {
        let s = series(30, |i| 10.0 + i as f64, 20);
        let forecast = holt_winters_forecast(&s, 30).unwrap();
        assert!(forecast > s.last().unwrap().1);
    }

    #[test]
    fn arima_on_flat_series_stays_flat() {
        let s = series(30, |_| 55.0, 20);
        let forecast = arima_forecast(&s, 60).unwrap();
        assert!((forecast - 55.0).abs() < 1.0);
    }
}
