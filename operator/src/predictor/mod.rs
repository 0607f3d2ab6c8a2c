use std::collections::HashMap;

use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use resources::{
    learning::{Horizon, LoadPattern, Prediction, PredictionModel, ValidatedPrediction},
    workload::WorkloadRef,
};
use uuid::Uuid;

use crate::store::MetricStore;

pub mod models;

/// Below this many learning samples no forecast is attempted.
const MIN_PREDICTION_SAMPLES: usize = 10;
/// Assumed error for a model with no validated history yet.
const DEFAULT_MAPE: f64 = 20.0;
/// z-score for the reported interval.
const CI_Z: f64 = 1.28;

#[derive(Debug, Default, Clone, Copy)]
pub struct ValidationReport {
    pub validated: usize,
    pub lost: usize,
}

/// Point forecasts with confidence intervals for each horizon, chosen by
/// the workload's current pattern with the ensemble as fallback.
pub struct Predictor;

impl Predictor {
    pub fn new() -> Self {
        Self
    }

    pub fn choose_model(pattern: LoadPattern) -> PredictionModel {
        match pattern {
            LoadPattern::Steady => PredictionModel::Mean,
            LoadPattern::Growing | LoadPattern::Declining => PredictionModel::Trend,
            LoadPattern::Periodic => PredictionModel::Seasonal,
            LoadPattern::WeeklySeasonal | LoadPattern::MonthlySeasonal => {
                PredictionModel::Prophet
            },
            LoadPattern::Bursty | LoadPattern::EventDriven => PredictionModel::HoltWinters,
            LoadPattern::Unknown => PredictionModel::Ensemble,
        }
    }

    /// Single dispatch point over the model menu.
    pub fn forecast(
        model: PredictionModel,
        series: &[(NaiveDateTime, f64)],
        horizon: Horizon,
        target: NaiveDateTime,
        mapes: &HashMap<PredictionModel, f64>,
    ) -> Option<f64> {
        match model {
            PredictionModel::Mean => models::mean_forecast(series),
            PredictionModel::Trend => models::trend_forecast(series, horizon.minutes()),
            PredictionModel::Seasonal => models::seasonal_forecast(series, target),
            PredictionModel::HoltWinters => {
                models::holt_winters_forecast(series, horizon.minutes())
            },
            PredictionModel::Arima => models::arima_forecast(series, horizon.minutes()),
            PredictionModel::Prophet => models::prophet_forecast(series, target),
            PredictionModel::Ensemble => Self::ensemble(series, horizon, target, mapes),
        }
    }

    /// Weight the base models by their rolling validated accuracy.
    fn ensemble(
        series: &[(NaiveDateTime, f64)],
        horizon: Horizon,
        target: NaiveDateTime,
        mapes: &HashMap<PredictionModel, f64>,
    ) -> Option<f64> {
        let members = [
            PredictionModel::Mean,
            PredictionModel::Trend,
            PredictionModel::Seasonal,
            PredictionModel::HoltWinters,
            PredictionModel::Arima,
            PredictionModel::Prophet,
        ];
        let mut weighted = 0.0;
        let mut weights = 0.0;
        for member in members {
            let point = match Self::forecast(member, series, horizon, target, mapes) {
                Some(point) => point,
                None => continue,
            };
            let mape = mapes.get(&member).copied().unwrap_or(DEFAULT_MAPE);
            let weight = 1.0 / (mape + 5.0);
            weighted += weight * point;
            weights += weight;
        }
        if weights > 0.0 {
            Some(weighted / weights)
        } else {
            None
        }
    }

    pub fn predict(
        &self,
        workload: &WorkloadRef,
        pattern: LoadPattern,
        series: &[(NaiveDateTime, f64)],
        horizon: Horizon,
        mapes: &HashMap<PredictionModel, f64>,
        now: NaiveDateTime,
    ) -> Option<Prediction> {
        if series.len() < MIN_PREDICTION_SAMPLES {
            return None;
        }
        let model = Self::choose_model(pattern);
        let target = now + Duration::minutes(horizon.minutes());
        let point = Self::forecast(model, series, horizon, target, mapes)?;
        let point = point.clamp(0.0, 200.0);

        let sigma = models::residual_std(series);
        let mape = mapes.get(&model).copied().unwrap_or(DEFAULT_MAPE);
        let sufficiency = (series.len() as f64 / 200.0).min(1.0);
        let accuracy_factor = (1.0 - mape / 100.0).clamp(0.2, 1.0);
        let confidence = (sufficiency * accuracy_factor).clamp(0.0, 1.0);

        Some(Prediction {
            id: Uuid::new_v4(),
            workload: workload.clone(),
            made_at: now,
            horizon,
            predicted_cpu_percent: point,
            confidence,
            ci_low: (point - CI_Z * sigma).clamp(0.0, 200.0),
            ci_high: (point + CI_Z * sigma).clamp(0.0, 200.0),
            model_used: model,
            reasoning: format!(
                "{} forecast for {} pattern from {} samples",
                model,
                pattern,
                series.len()
            ),
        })
    }

    /// Join elapsed predictions with actuals. Every prediction reaches
    /// Validated, or is discarded as lost once it is older than
    /// `horizon + 2 * interval` with no actual to join.
    pub fn validate_pending(
        &self,
        store: &MetricStore,
        now: NaiveDateTime,
        interval_secs: u64,
    ) -> Result<ValidationReport> {
        let interval = Duration::seconds(interval_secs as i64);
        let mut report = ValidationReport::default();
        for prediction in store.unvalidated_predictions()? {
            let target = prediction.made_at + Duration::minutes(prediction.horizon.minutes());
            if target > now {
                continue;
            }
            let actuals =
                store.learning_series(&prediction.workload, target - interval, target + interval)?;
            if !actuals.is_empty() {
                let actual =
                    actuals.iter().map(|(_, v)| v).sum::<f64>() / actuals.len() as f64;
                let accuracy = (1.0
                    - (prediction.predicted_cpu_percent - actual).abs() / actual.abs().max(1.0))
                .clamp(0.0, 1.0);
                store.put_validated(&ValidatedPrediction {
                    id: prediction.id,
                    workload: prediction.workload.clone(),
                    made_at: prediction.made_at,
                    horizon: prediction.horizon,
                    predicted_cpu_percent: prediction.predicted_cpu_percent,
                    actual_cpu_percent: actual,
                    accuracy,
                    model_used: prediction.model_used,
                    validated_at: now,
                })?;
                store.delete_prediction(&prediction)?;
                report.validated += 1;
            } else if now > target + interval + interval {
                // No accuracy credit either way.
                store.delete_prediction(&prediction)?;
                report.lost += 1;
                tracing::debug!(
                    "Prediction for {} at {} lost, no actuals to join",
                    prediction.workload,
                    target
                );
            }
        }
        Ok(report)
    }

    /// Rolling per-model error feeding the ensemble weights.
    pub fn model_mapes(
        &self,
        store: &MetricStore,
        workload: &WorkloadRef,
        now: NaiveDateTime,
    ) -> Result<HashMap<PredictionModel, f64>> {
        let window_start = now - Duration::hours(24);
        let mut mapes = HashMap::new();
        for model in [
            PredictionModel::Mean,
            PredictionModel::Trend,
            PredictionModel::Seasonal,
            PredictionModel::HoltWinters,
            PredictionModel::Arima,
            PredictionModel::Prophet,
            PredictionModel::Ensemble,
        ] {
            if let Some(mape) = store.model_mape(workload, model, window_start, now)? {
                mapes.insert(model, mape);
            }
        }
        Ok(mapes)
    }
}

#[cfg(test)]
mod tests {
    use resources::metrics::MetricSample;

    use super::*;

    fn base() -> NaiveDateTime {
        NaiveDateTime::from_timestamp(1_700_000_000, 0)
    }

    fn wl() -> WorkloadRef {
        WorkloadRef::new("demo", "demo-app")
    }

    fn flat_series(n: usize, value: f64) -> Vec<(NaiveDateTime, f64)> {
        (0..n)
            .map(|i| (base() + Duration::minutes(30 * i as i64), value))
            .collect()
    }

    fn sample_at(at: NaiveDateTime, cpu_percent: f64) -> MetricSample {
        MetricSample {
            workload: wl(),
            timestamp: at,
            cpu_millicores: 100,
            memory_bytes: 64 << 20,
            replica_count: 2,
            cpu_percent,
            startup: false,
        }
    }

    #[test]
    fn pattern_drives_model_selection() {
        assert_eq!(
            Predictor::choose_model(LoadPattern::Steady),
            PredictionModel::Mean
        );
        assert_eq!(
            Predictor::choose_model(LoadPattern::WeeklySeasonal),
            PredictionModel::Prophet
        );
        assert_eq!(
            Predictor::choose_model(LoadPattern::Unknown),
            PredictionModel::Ensemble
        );
    }

    #[test]
    fn no_prediction_below_minimum_samples() {
        let predictor = Predictor::new();
        let series = flat_series(5, 50.0);
        let now = base() + Duration::hours(3);
        assert!(predictor
            .predict(&wl(), LoadPattern::Steady, &series, Horizon::M30, &HashMap::new(), now)
            .is_none());
    }

    #[test]
    fn prediction_carries_bounds_and_confidence() {
        let predictor = Predictor::new();
        let series = flat_series(60, 50.0);
        let now = base() + Duration::hours(30);
        let prediction = predictor
            .predict(&wl(), LoadPattern::Steady, &series, Horizon::M30, &HashMap::new(), now)
            .unwrap();
        assert_eq!(prediction.model_used, PredictionModel::Mean);
        assert!((prediction.predicted_cpu_percent - 50.0).abs() < 1e-9);
        assert!(prediction.ci_low <= prediction.predicted_cpu_percent);
        assert!(prediction.ci_high >= prediction.predicted_cpu_percent);
        assert!(prediction.confidence > 0.0 && prediction.confidence <= 1.0);
    }

    #[test]
    fn elapsed_prediction_joins_actuals() {
        let predictor = Predictor::new();
        let store = MetricStore::temporary().unwrap();
        let made_at = base();
        let prediction = Prediction {
            id: Uuid::new_v4(),
            workload: wl(),
            made_at,
            horizon: Horizon::M30,
            predicted_cpu_percent: 60.0,
            confidence: 0.8,
            ci_low: 50.0,
            ci_high: 70.0,
            model_used: PredictionModel::Mean,
            reasoning: String::new(),
        };
        store.put_prediction(&prediction).unwrap();
        let target = made_at + Duration::minutes(30);
        store.append_samples(&[sample_at(target, 58.0)]).unwrap();

        let report = predictor
            .validate_pending(&store, target + Duration::seconds(30), 30)
            .unwrap();
        assert_eq!(report.validated, 1);
        assert_eq!(report.lost, 0);
        assert!(store.unvalidated_predictions().unwrap().is_empty());
        let validated = store
            .validated_in_window(&wl(), target, target + Duration::minutes(5))
            .unwrap();
        assert_eq!(validated.len(), 1);
        assert!(validated[0].accuracy > 0.9);
    }

    #[test]
    fn stale_prediction_without_actuals_is_lost() {
        let predictor = Predictor::new();
        let store = MetricStore::temporary().unwrap();
        let made_at = base();
        let prediction = Prediction {
            id: Uuid::new_v4(),
            workload: wl(),
            made_at,
            horizon: Horizon::M15,
            predicted_cpu_percent: 60.0,
            confidence: 0.8,
            ci_low: 50.0,
            ci_high: 70.0,
            model_used: PredictionModel::Mean,
            reasoning: String::new(),
        };
        store.put_prediction(&prediction).unwrap();

        // Two collection intervals past the horizon, still no actuals.
        let now = made_at + Duration::minutes(15) + Duration::seconds(61);
        let report = predictor.validate_pending(&store, now, 30).unwrap();
        assert_eq!(report.validated, 0);
        assert_eq!(report.lost, 1);
        assert!(store.unvalidated_predictions().unwrap().is_empty());
    }
}
