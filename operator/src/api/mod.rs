//! Read API consumed by the external dashboard. JSON in the shared
//! `Response`/`ErrResponse` envelope; the loop's state is served straight
//! from the store.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Extension, Path},
    routing::{delete, get, post},
    Json, Router,
};
use parking_lot::RwLock;
use resources::{
    anomaly::{Anomaly, AnomalyKind},
    config::CostConfig,
    learning::{PatternProfile, Prediction, PredictionModel},
    metrics::ClusterSnapshot,
    models::{ErrResponse, Response},
    notify::{NotificationProvider, ProviderKind},
    profiles::{
        AppliedAction, AutopilotProfile, PrescaleProfile, Recommendation, SkipRecord,
    },
    workload::WorkloadRef,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{notify::Notifier, store::MetricStore};

pub type HandlerResult<T> = Result<Json<Response<T>>, ErrResponse>;

pub struct AppState {
    pub store: Arc<MetricStore>,
    pub notifier: Notifier,
    pub costs: CostConfig,
    pub latest_snapshot: Arc<RwLock<Option<ClusterSnapshot>>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/workloads", get(list_workloads))
        .route("/api/v1/workloads/:namespace/:name", get(get_workload))
        .route("/api/v1/predictions/accuracy", get(prediction_accuracy))
        .route("/api/v1/recommendations", get(list_recommendations))
        .route("/api/v1/actions", get(list_actions))
        .route("/api/v1/skips", get(list_skips))
        .route("/api/v1/prescale", get(list_prescale))
        .route("/api/v1/anomalies", get(list_anomalies))
        .route("/api/v1/nodes/efficiency", get(node_efficiency))
        .route("/api/v1/store/stats", get(store_stats))
        .route("/api/v1/store/vacuum", post(vacuum))
        .route(
            "/api/v1/notifiers",
            get(list_notifiers).post(create_notifier),
        )
        .route("/api/v1/notifiers/:id", delete(delete_notifier))
        .route("/api/v1/notifiers/:id/test", post(test_notifier))
        .route(
            "/api/v1/quarantine/:namespace/:name",
            delete(clear_quarantine),
        )
        .layer(Extension(state))
}

fn store_err(err: crate::store::StoreError) -> ErrResponse {
    ErrResponse::new("Store read failed".to_string(), Some(err.to_string()))
}

#[derive(Debug, Serialize)]
pub struct WorkloadSummary {
    pub workload: WorkloadRef,
    pub pattern: Option<PatternProfile>,
    pub prescale: Option<PrescaleProfile>,
    pub autopilot: Option<AutopilotProfile>,
    pub quarantined: bool,
}

fn new_summary(workload: &WorkloadRef) -> WorkloadSummary {
    WorkloadSummary {
        workload: workload.clone(),
        pattern: None,
        prescale: None,
        autopilot: None,
        quarantined: false,
    }
}

async fn list_workloads(
    Extension(state): Extension<Arc<AppState>>,
) -> HandlerResult<Vec<WorkloadSummary>> {
    let store = &state.store;
    let mut by_workload: HashMap<String, WorkloadSummary> = HashMap::new();
    for pattern in store.all_patterns().map_err(store_err)? {
        by_workload
            .entry(pattern.workload.key())
            .or_insert_with(|| new_summary(&pattern.workload))
            .pattern = Some(pattern.clone());
    }
    for prescale in store.all_prescale().map_err(store_err)? {
        by_workload
            .entry(prescale.workload.key())
            .or_insert_with(|| new_summary(&prescale.workload))
            .prescale = Some(prescale.clone());
    }
    for autopilot in store.all_autopilot().map_err(store_err)? {
        by_workload
            .entry(autopilot.workload.key())
            .or_insert_with(|| new_summary(&autopilot.workload))
            .autopilot = Some(autopilot.clone());
    }
    for (key, _) in store.list_quarantined().map_err(store_err)? {
        if let Some(workload) = WorkloadRef::parse(&key) {
            by_workload
                .entry(key)
                .or_insert_with(|| new_summary(&workload))
                .quarantined = true;
        }
    }
    let mut rows: Vec<WorkloadSummary> = by_workload.into_values().collect();
    rows.sort_by(|a, b| a.workload.cmp(&b.workload));
    Ok(Json(Response::new(None, Some(rows))))
}

#[derive(Debug, Serialize)]
pub struct WorkloadDetail {
    pub workload: WorkloadRef,
    pub pattern: Option<PatternProfile>,
    pub prescale: Option<PrescaleProfile>,
    pub autopilot: Option<AutopilotProfile>,
    pub predictions: Vec<Prediction>,
    pub actions: Vec<AppliedAction>,
    pub quarantined: bool,
}

async fn get_workload(
    Extension(state): Extension<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> HandlerResult<WorkloadDetail> {
    let workload = WorkloadRef::new(&namespace, &name);
    let store = &state.store;
    let detail = WorkloadDetail {
        pattern: store.get_pattern(&workload).map_err(store_err)?,
        prescale: store.get_prescale(&workload).map_err(store_err)?,
        autopilot: store.get_autopilot(&workload).map_err(store_err)?,
        predictions: store.recent_predictions(&workload, 20).map_err(store_err)?,
        actions: {
            let mut actions = store.actions_for(&workload).map_err(store_err)?;
            actions.sort_by_key(|a| std::cmp::Reverse(a.timestamp));
            actions.truncate(20);
            actions
        },
        quarantined: store.is_quarantined(&workload).map_err(store_err)?,
        workload,
    };
    Ok(Json(Response::new(None, Some(detail))))
}

#[derive(Debug, Serialize)]
pub struct ModelAccuracy {
    pub model: PredictionModel,
    pub samples: usize,
    pub mean_accuracy: f64,
}

async fn prediction_accuracy(
    Extension(state): Extension<Arc<AppState>>,
) -> HandlerResult<Vec<ModelAccuracy>> {
    let mut grouped: HashMap<PredictionModel, (usize, f64)> = HashMap::new();
    for validated in state.store.all_validated().map_err(store_err)? {
        let entry = grouped.entry(validated.model_used).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += validated.accuracy;
    }
    let mut rows: Vec<ModelAccuracy> = grouped
        .into_iter()
        .map(|(model, (samples, sum))| ModelAccuracy {
            model,
            samples,
            mean_accuracy: sum / samples as f64,
        })
        .collect();
    rows.sort_by(|a, b| {
        b.mean_accuracy
            .partial_cmp(&a.mean_accuracy)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(Json(Response::new(None, Some(rows))))
}

async fn list_recommendations(
    Extension(state): Extension<Arc<AppState>>,
) -> HandlerResult<Vec<Recommendation>> {
    let rows = state
        .store
        .recent_recommendations(100)
        .map_err(store_err)?;
    Ok(Json(Response::new(None, Some(rows))))
}

async fn list_actions(
    Extension(state): Extension<Arc<AppState>>,
) -> HandlerResult<Vec<AppliedAction>> {
    let rows = state.store.recent_actions(100).map_err(store_err)?;
    Ok(Json(Response::new(None, Some(rows))))
}

async fn list_skips(
    Extension(state): Extension<Arc<AppState>>,
) -> HandlerResult<Vec<SkipRecord>> {
    let rows = state.store.recent_skips(100).map_err(store_err)?;
    Ok(Json(Response::new(None, Some(rows))))
}

async fn list_prescale(
    Extension(state): Extension<Arc<AppState>>,
) -> HandlerResult<Vec<PrescaleProfile>> {
    let rows = state.store.all_prescale().map_err(store_err)?;
    Ok(Json(Response::new(None, Some(rows))))
}

async fn list_anomalies(
    Extension(state): Extension<Arc<AppState>>,
) -> HandlerResult<Vec<Anomaly>> {
    let rows = state.store.recent_anomalies(100).map_err(store_err)?;
    Ok(Json(Response::new(None, Some(rows))))
}

#[derive(Debug, Serialize)]
pub struct NodeEfficiency {
    pub node: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub wasted_cpu_millis: i64,
    pub wasted_memory_bytes: i64,
    pub waste_cost_per_hour: f64,
}

async fn node_efficiency(
    Extension(state): Extension<Arc<AppState>>,
) -> HandlerResult<Vec<NodeEfficiency>> {
    let snapshot = state.latest_snapshot.read().clone();
    let snapshot = match snapshot {
        Some(snapshot) => snapshot,
        None => {
            return Err(ErrResponse::not_found(
                "No cluster snapshot yet".to_string(),
                Some("the collector has not completed a cycle".to_string()),
            ))
        },
    };
    let rows = snapshot
        .nodes
        .iter()
        .map(|node| {
            let wasted_cpu =
                (node.allocatable_cpu_millis as f64 * (1.0 - node.cpu_percent / 100.0)) as i64;
            let wasted_memory = (node.allocatable_memory_bytes as f64
                * (1.0 - node.memory_percent / 100.0)) as i64;
            let waste_cost = wasted_cpu as f64 / 1000.0 * state.costs.per_vcpu_hour
                + wasted_memory as f64 / (1024.0 * 1024.0 * 1024.0)
                    * state.costs.per_gb_memory_hour;
            NodeEfficiency {
                node: node.node.clone(),
                cpu_percent: node.cpu_percent,
                memory_percent: node.memory_percent,
                wasted_cpu_millis: wasted_cpu.max(0),
                wasted_memory_bytes: wasted_memory.max(0),
                waste_cost_per_hour: waste_cost.max(0.0),
            }
        })
        .collect();
    Ok(Json(Response::new(None, Some(rows))))
}

async fn store_stats(
    Extension(state): Extension<Arc<AppState>>,
) -> HandlerResult<crate::store::StoreStats> {
    let stats = state.store.stats().map_err(store_err)?;
    Ok(Json(Response::new(None, Some(stats))))
}

async fn vacuum(Extension(state): Extension<Arc<AppState>>) -> HandlerResult<u64> {
    let size = state.store.vacuum().map_err(store_err)?;
    Ok(Json(Response::new(
        Some("Vacuum complete".to_string()),
        Some(size),
    )))
}

async fn list_notifiers(
    Extension(state): Extension<Arc<AppState>>,
) -> HandlerResult<Vec<NotificationProvider>> {
    let rows = state.store.list_notifiers().map_err(store_err)?;
    Ok(Json(Response::new(None, Some(rows))))
}

#[derive(Debug, Deserialize)]
pub struct CreateProvider {
    pub kind: ProviderKind,
    pub webhook_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub subscribed_alert_kinds: Vec<AnomalyKind>,
}

fn default_enabled() -> bool {
    true
}

async fn create_notifier(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<CreateProvider>,
) -> HandlerResult<NotificationProvider> {
    if body.webhook_url.is_empty() {
        return Err(ErrResponse::bad_request(
            "Invalid provider".to_string(),
            Some("webhook_url must not be empty".to_string()),
        ));
    }
    let provider = NotificationProvider {
        id: Uuid::new_v4(),
        kind: body.kind,
        webhook_url: body.webhook_url,
        enabled: body.enabled,
        subscribed_alert_kinds: body.subscribed_alert_kinds,
    };
    state.store.put_notifier(&provider).map_err(store_err)?;
    Ok(Json(Response::new(
        Some("Provider created".to_string()),
        Some(provider),
    )))
}

fn parse_provider_id(id: &str) -> Result<Uuid, ErrResponse> {
    Uuid::parse_str(id).map_err(|_| {
        ErrResponse::bad_request(
            "Invalid provider id".to_string(),
            Some(format!("{} is not a UUID", id)),
        )
    })
}

async fn delete_notifier(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<()> {
    let id = parse_provider_id(&id)?;
    if state.store.delete_notifier(id).map_err(store_err)? {
        Ok(Json(Response::new(
            Some("Provider deleted".to_string()),
            None,
        )))
    } else {
        Err(ErrResponse::not_found(
            "Provider not found".to_string(),
            None,
        ))
    }
}

async fn test_notifier(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<()> {
    let id = parse_provider_id(&id)?;
    let provider = state
        .store
        .get_notifier(id)
        .map_err(store_err)?
        .ok_or_else(|| ErrResponse::not_found("Provider not found".to_string(), None))?;
    state.notifier.send_test(&provider).await.map_err(|err| {
        ErrResponse::new(
            "Test notification failed".to_string(),
            Some(format!("{:#}", err)),
        )
    })?;
    Ok(Json(Response::new(
        Some("Test notification sent".to_string()),
        None,
    )))
}

async fn clear_quarantine(
    Extension(state): Extension<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> HandlerResult<()> {
    let workload = WorkloadRef::new(&namespace, &name);
    if state.store.clear_quarantine(&workload).map_err(store_err)? {
        Ok(Json(Response::new(
            Some(format!("{} released from quarantine", workload)),
            None,
        )))
    } else {
        Err(ErrResponse::not_found(
            format!("{} is not quarantined", workload),
            None,
        ))
    }
}
