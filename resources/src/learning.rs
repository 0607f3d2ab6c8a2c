use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::workload::WorkloadRef;

/// Qualitative classification of a workload's load shape.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoadPattern {
    Steady,
    Periodic,
    Bursty,
    Growing,
    Declining,
    WeeklySeasonal,
    MonthlySeasonal,
    EventDriven,
    Unknown,
}

impl LoadPattern {
    /// Pattern-aware default HPA target, the prior for the auto-tuner.
    pub fn default_target(&self) -> u32 {
        match self {
            LoadPattern::Steady | LoadPattern::Periodic | LoadPattern::Unknown => 75,
            LoadPattern::Bursty | LoadPattern::EventDriven => 70,
            LoadPattern::Growing
            | LoadPattern::WeeklySeasonal
            | LoadPattern::MonthlySeasonal => 75,
            LoadPattern::Declining => 80,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PatternFeatures {
    pub mean: f64,
    pub std: f64,
    pub cv: f64,
    pub autocorr_24h: f64,
    pub autocorr_7d: f64,
    pub slope_per_day: f64,
    pub kurtosis: f64,
    pub spike_score: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PatternProfile {
    pub workload: WorkloadRef,
    pub pattern: LoadPattern,
    pub confidence: f64,
    pub last_updated: NaiveDateTime,
    pub features: PatternFeatures,
}

/// Forecast horizons the predictor emits each cycle.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Horizon {
    M15,
    M30,
    H1,
    H2,
    H4,
}

impl Horizon {
    pub fn all() -> [Horizon; 5] {
        [
            Horizon::M15,
            Horizon::M30,
            Horizon::H1,
            Horizon::H2,
            Horizon::H4,
        ]
    }

    pub fn minutes(&self) -> i64 {
        match self {
            Horizon::M15 => 15,
            Horizon::M30 => 30,
            Horizon::H1 => 60,
            Horizon::H2 => 120,
            Horizon::H4 => 240,
        }
    }
}

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}min", self.minutes())
    }
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PredictionModel {
    Mean,
    Trend,
    Seasonal,
    HoltWinters,
    Arima,
    Prophet,
    Ensemble,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Prediction {
    pub id: Uuid,
    pub workload: WorkloadRef,
    pub made_at: NaiveDateTime,
    pub horizon: Horizon,
    pub predicted_cpu_percent: f64,
    pub confidence: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub model_used: PredictionModel,
    pub reasoning: String,
}

/// A prediction joined with actuals after its horizon elapsed.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ValidatedPrediction {
    pub id: Uuid,
    pub workload: WorkloadRef,
    pub made_at: NaiveDateTime,
    pub horizon: Horizon,
    pub predicted_cpu_percent: f64,
    pub actual_cpu_percent: f64,
    pub accuracy: f64,
    pub model_used: PredictionModel,
    pub validated_at: NaiveDateTime,
}

/// Per-workload, per-hour-of-week best known HPA target.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OptimalTarget {
    pub workload: WorkloadRef,
    /// Hour-of-week slot, 0..168, Monday 00:00 first.
    pub hour_slot: u16,
    pub target: f64,
    pub confidence: f64,
    pub samples_count: u64,
    pub updated_at: NaiveDateTime,
}
