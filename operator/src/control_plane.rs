//! The fixed-order control loop. One object holds every component by
//! value and invokes them in the same order each cycle; the store and the
//! clock are passed explicitly. No component keeps a back-pointer.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use dashmap::DashMap;
use parking_lot::RwLock;
use resources::{
    anomaly::{Anomaly, AnomalyKind, Severity},
    config::OperatorConfig,
    learning::Horizon,
    metrics::{ClusterSnapshot, MetricSample},
    objects::{deployment::Deployment, hpa::HorizontalPodAutoscaler, pod::Pod},
    profiles::PrescaleState,
    workload::{Priority, Workload},
};
use serde_json::json;
use tokio::sync::watch;

use crate::{
    actuator::Actuator,
    autopilot::{health::HealthMonitor, Autopilot},
    clock::Clock,
    collector::Collector,
    coordinator::{Coordinator, PREEMPTION_PRESSURE},
    discovery,
    kube::ClusterApi,
    notify::Notifier,
    pattern::PatternRecognizer,
    predictor::Predictor,
    prescale::{ContractViolation, PrescaleManager},
    store::MetricStore,
    tuner::AutoTuner,
};

/// Re-emit window for the periodic anomaly sweeps.
const ANOMALY_DEBOUNCE_MINUTES: i64 = 60;

struct WorkloadCtx {
    workload: Workload,
    hpa: Option<HorizontalPodAutoscaler>,
    deployment: Deployment,
    pods: Vec<Pod>,
}

pub struct ControlPlane {
    config: OperatorConfig,
    store: Arc<MetricStore>,
    cluster: Arc<dyn ClusterApi>,
    actuator: Actuator,
    collector: Collector,
    recognizer: PatternRecognizer,
    predictor: Predictor,
    tuner: AutoTuner,
    autopilot: Autopilot,
    health_monitor: HealthMonitor,
    coordinator: Coordinator,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    latest_snapshot: Arc<RwLock<Option<ClusterSnapshot>>>,
    /// Debounce state for the anomaly sweeps; reset on restart by design.
    anomaly_emitted: DashMap<(String, AnomalyKind), NaiveDateTime>,
}

impl ControlPlane {
    pub fn new(
        config: OperatorConfig,
        store: Arc<MetricStore>,
        cluster: Arc<dyn ClusterApi>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        latest_snapshot: Arc<RwLock<Option<ClusterSnapshot>>>,
    ) -> Result<Self> {
        Ok(Self {
            actuator: Actuator::new(
                cluster.clone(),
                store.clone(),
                clock.clone(),
                config.dry_run,
            ),
            collector: Collector::new(&config)?,
            recognizer: PatternRecognizer::new(),
            predictor: Predictor::new(),
            tuner: AutoTuner::new(config.tuner.clone()),
            autopilot: Autopilot::new(config.autopilot.clone()),
            health_monitor: HealthMonitor::new(config.autopilot.clone()),
            coordinator: Coordinator::new(),
            notifier,
            store,
            cluster,
            clock,
            latest_snapshot,
            anomaly_emitted: DashMap::new(),
            config,
        })
    }

    /// Advance every `check_interval` seconds until shutdown. In-flight
    /// work finishes before the store is closed; scheduled rollbacks are
    /// persisted rows and survive the restart.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            self.config.check_interval_secs.max(1),
        ));
        tracing::info!(
            "Control loop started, interval {}s, dry_run={}",
            self.config.check_interval_secs,
            self.config.dry_run
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.cycle().await {
                        tracing::error!("Cycle failed: {:#}", err);
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        self.store.flush()?;
        tracing::info!("Control loop exited");
        Ok(())
    }

    pub async fn cycle(&mut self) -> Result<()> {
        let now = self.clock.now();

        let hpas = match self.cluster.list_hpas().await {
            Ok(hpas) => hpas,
            Err(err) => {
                tracing::warn!("HPA listing failed, keeping previous view: {:#}", err);
                Vec::new()
            },
        };
        let mut workloads = discovery::discover(&self.config, &hpas);
        self.coordinator.order(&mut workloads);

        let nodes = self.cluster.list_nodes().await.unwrap_or_else(|err| {
            tracing::warn!("Node listing failed: {:#}", err);
            Vec::new()
        });
        let mut anomalies: Vec<Anomaly> = Vec::new();
        if !nodes.is_empty() {
            match self.collector.collect_cluster(&nodes, now).await {
                Ok(snapshot) => {
                    *self.latest_snapshot.write() = Some(snapshot);
                },
                Err(err) => {
                    tracing::warn!(
                        "Cluster metrics degraded, using last-good snapshot: {:#}",
                        err
                    );
                    if let Some(anomaly) = self.debounced(
                        "cluster",
                        AnomalyKind::LowEfficiency,
                        Severity::Warning,
                        format!("Cluster metrics collection degraded: {:#}", err),
                        json!({}),
                        now,
                    )? {
                        anomalies.push(anomaly);
                    }
                },
            }
        }
        let pressure = self
            .latest_snapshot
            .read()
            .as_ref()
            .map(ClusterSnapshot::cpu_pressure)
            .unwrap_or(0.0);

        let mut contexts = Vec::new();
        for workload in workloads {
            if self.store.is_quarantined(&workload.target)? {
                tracing::debug!("{} is quarantined, skipping", workload.target);
                continue;
            }
            match self.fetch_context(workload).await {
                Ok(ctx) => contexts.push(ctx),
                Err(err) => tracing::warn!("Context fetch failed: {:#}", err),
            }
        }

        // Preemption candidates are the low tiers seen this cycle.
        let candidates: Vec<(Workload, HorizontalPodAutoscaler, Deployment)> = contexts
            .iter()
            .filter(|ctx| ctx.workload.priority.preemptible())
            .filter_map(|ctx| {
                ctx.hpa
                    .as_ref()
                    .map(|hpa| (ctx.workload.clone(), hpa.clone(), ctx.deployment.clone()))
            })
            .collect();

        for ctx in &contexts {
            match self.process_workload(ctx, pressure, &candidates, now).await {
                Ok(mut produced) => anomalies.append(&mut produced),
                Err(err) => {
                    if let Some(violation) = err.downcast_ref::<ContractViolation>() {
                        tracing::error!("{}, quarantining workload", violation);
                        self.store
                            .quarantine(&ctx.workload.target, &violation.detail, now)?;
                        let anomaly = Anomaly::new(
                            Some(ctx.workload.target.clone()),
                            now,
                            AnomalyKind::PrescaleEvent,
                            Severity::Critical,
                            format!("{}", violation),
                            json!({ "quarantined": true }),
                        );
                        self.store.append_anomaly(&anomaly)?;
                        anomalies.push(anomaly);
                    } else {
                        tracing::error!(
                            "Processing {} failed: {:#}",
                            ctx.workload.target,
                            err
                        );
                    }
                },
            }
        }

        if self.config.enable_predictive {
            let report =
                self.predictor
                    .validate_pending(&self.store, now, self.config.check_interval_secs)?;
            if report.validated + report.lost > 0 {
                tracing::debug!(
                    "Validated {} predictions, {} lost",
                    report.validated,
                    report.lost
                );
            }
        }

        if self.config.enable_autopilot && self.config.autopilot.enable_auto_rollback {
            let mut produced = self
                .health_monitor
                .run(&self.store, &self.cluster, &self.actuator, self.clock.as_ref())
                .await?;
            anomalies.append(&mut produced);
        }

        // Undo preemptions once the pressure clears.
        for ctx in &contexts {
            if let (true, Some(hpa)) = (ctx.workload.priority.preemptible(), ctx.hpa.as_ref()) {
                self.coordinator
                    .restore_preempted(pressure, &ctx.workload, hpa, &self.actuator, &self.store)
                    .await?;
            }
        }

        self.maybe_run_retention(now)?;

        for anomaly in &anomalies {
            self.notifier.broadcast(&self.store, anomaly).await;
        }
        Ok(())
    }

    async fn fetch_context(&self, workload: Workload) -> Result<WorkloadCtx> {
        let hpa = match &workload.hpa_name {
            Some(hpa_name) => {
                match self
                    .cluster
                    .get_hpa(&workload.target.namespace, hpa_name)
                    .await
                {
                    Ok(hpa) => Some(hpa),
                    Err(err) => {
                        tracing::warn!("HPA {} unavailable: {:#}", hpa_name, err);
                        None
                    },
                }
            },
            None => None,
        };
        let deployment_name = hpa
            .as_ref()
            .map(|h| h.spec.scale_target_ref.name.clone())
            .unwrap_or_else(|| workload.target.name.clone());
        let deployment = self
            .cluster
            .get_deployment(&workload.target.namespace, &deployment_name)
            .await?;
        let pods = self
            .cluster
            .list_pods(
                &workload.target.namespace,
                &deployment.spec.selector.match_labels,
            )
            .await
            .unwrap_or_default();
        Ok(WorkloadCtx {
            workload,
            hpa,
            deployment,
            pods,
        })
    }

    async fn process_workload(
        &mut self,
        ctx: &WorkloadCtx,
        pressure: f64,
        candidates: &[(Workload, HorizontalPodAutoscaler, Deployment)],
        now: NaiveDateTime,
    ) -> Result<Vec<Anomaly>> {
        let workload = &ctx.workload;
        let mut anomalies = Vec::new();

        let sample = match self
            .collector
            .collect_workload(workload, &ctx.deployment, &ctx.pods, now)
            .await
        {
            Ok(sample) => {
                self.store.append_samples(&[sample.clone()])?;
                Some(sample)
            },
            Err(err) => {
                tracing::warn!("Metrics for {} unavailable: {:#}", workload.target, err);
                None
            },
        };

        let series =
            self.store
                .learning_series(&workload.target, now - Duration::days(7), now)?;
        let profile = self.recognizer.classify(&workload.target, &series, now);
        self.store.put_pattern(&profile)?;

        let mut predictions = Vec::new();
        if self.config.enable_predictive {
            let mapes = self
                .predictor
                .model_mapes(&self.store, &workload.target, now)?;
            for horizon in Horizon::all() {
                if let Some(prediction) = self.predictor.predict(
                    &workload.target,
                    profile.pattern,
                    &series,
                    horizon,
                    &mapes,
                    now,
                ) {
                    self.store.put_prediction(&prediction)?;
                    predictions.push(prediction);
                }
            }
        }

        if let Some(sample) = &sample {
            anomalies.extend(self.sweep_anomalies(ctx, sample, pressure, now).await?);
        }

        if let Some(hpa) = &ctx.hpa {
            let effective = self.coordinator.effective_target(
                profile.pattern.default_target(),
                workload.priority,
                pressure,
            );

            if self.config.enable_autotuning {
                let aggregates =
                    self.store
                        .aggregates(&workload.target, now - Duration::hours(1), now)?;
                if aggregates.count > 0 {
                    let events = self
                        .store
                        .range_events(&workload.target, now - Duration::hours(1), now)?
                        .len();
                    let current = hpa.target_utilization().unwrap_or(effective);
                    let outcome = self.tuner.evaluate(
                        &self.store,
                        effective,
                        workload.priority,
                        &workload.target,
                        current,
                        &aggregates,
                        events,
                        now,
                    )?;
                    if let Some(proposal) = outcome.proposal {
                        self.actuator
                            .ensure_hpa_target(&workload.target, hpa, proposal, "auto-tune")
                            .await?;
                    }
                }
            }

            if self.config.enable_prescale {
                let prescale_config = self
                    .coordinator
                    .prescale_config_for(&self.config.prescale, workload.priority);
                let manager = PrescaleManager::new(prescale_config);
                let current_cpu = sample
                    .as_ref()
                    .map(|s| s.cpu_percent)
                    .unwrap_or(50.0);
                let mut produced = manager
                    .reconcile(
                        workload,
                        hpa,
                        &ctx.deployment,
                        &predictions,
                        current_cpu,
                        &self.actuator,
                        &self.store,
                        self.clock.as_ref(),
                    )
                    .await?;
                anomalies.append(&mut produced);
            }

            if pressure >= PREEMPTION_PRESSURE
                && matches!(workload.priority, Priority::Critical | Priority::High)
                && Coordinator::is_saturated(hpa, &ctx.deployment)
            {
                self.coordinator
                    .preempt(
                        pressure,
                        workload,
                        candidates,
                        &self.actuator,
                        &self.store,
                        self.clock.as_ref(),
                    )
                    .await?;
            }
        }

        if self.config.enable_autopilot {
            let prescale_state = self
                .store
                .get_prescale(&workload.target)?
                .map(|p| p.state)
                .unwrap_or(PrescaleState::Idle);
            let mut produced = self
                .autopilot
                .reconcile(
                    workload,
                    &ctx.deployment,
                    &ctx.pods,
                    prescale_state,
                    &self.actuator,
                    &self.store,
                    self.clock.as_ref(),
                )
                .await?;
            anomalies.append(&mut produced);
        }

        Ok(anomalies)
    }

    /// Threshold sweeps over the fresh sample. Each `(workload, kind)` is
    /// re-emitted at most once per debounce window.
    async fn sweep_anomalies(
        &self,
        ctx: &WorkloadCtx,
        sample: &MetricSample,
        pressure: f64,
        now: NaiveDateTime,
    ) -> Result<Vec<Anomaly>> {
        let workload = &ctx.workload;
        let mut out = Vec::new();
        let key = workload.target.key();

        if sample.cpu_percent >= 150.0 {
            if let Some(anomaly) = self.debounced(
                &key,
                AnomalyKind::CpuSpike,
                Severity::Warning,
                format!(
                    "{} CPU at {:.0}% of requests",
                    workload.target, sample.cpu_percent
                ),
                json!({ "cpu_percent": sample.cpu_percent }),
                now,
            )? {
                out.push(anomaly);
            }
        }

        let memory_request = ctx.deployment.memory_request_bytes();
        if memory_request > 0
            && sample.memory_bytes_per_pod() > memory_request as f64 * 0.9
        {
            if let Some(anomaly) = self.debounced(
                &key,
                AnomalyKind::HighMemory,
                Severity::Warning,
                format!(
                    "{} memory within 10% of its request",
                    workload.target
                ),
                json!({
                    "memory_per_pod": sample.memory_bytes_per_pod(),
                    "memory_request": memory_request,
                }),
                now,
            )? {
                out.push(anomaly);
            }
        }

        let events = self
            .store
            .range_events(&workload.target, now - Duration::hours(1), now)?;
        if events.len() > 6 {
            if let Some(anomaly) = self.debounced(
                &key,
                AnomalyKind::ScalingThrashing,
                Severity::Warning,
                format!("{} scaled {} times in an hour", workload.target, events.len()),
                json!({ "events_last_hour": events.len() }),
                now,
            )? {
                out.push(anomaly);
            }
        }
        let direction_changes = events
            .windows(2)
            .filter(|w| {
                (w[0].new_replicas > w[0].old_replicas) != (w[1].new_replicas > w[1].old_replicas)
            })
            .count();
        if direction_changes >= 4 {
            if let Some(anomaly) = self.debounced(
                &key,
                AnomalyKind::HpaFlapping,
                Severity::Warning,
                format!(
                    "{} reversed scaling direction {} times in an hour",
                    workload.target, direction_changes
                ),
                json!({ "direction_changes": direction_changes }),
                now,
            )? {
                out.push(anomaly);
            }
        }

        if let Some(anomaly) = self.sweep_memory_leak(ctx, now)? {
            out.push(anomaly);
        }

        if pressure < 0.40 && workload.priority.preemptible() {
            let aggregates =
                self.store
                    .aggregates(&workload.target, now - Duration::hours(1), now)?;
            if aggregates.count >= 10 && aggregates.cpu_percent_mean < 20.0 {
                if let Some(anomaly) = self.debounced(
                    &key,
                    AnomalyKind::CostOptimization,
                    Severity::Info,
                    format!(
                        "{} runs at {:.0}% of requests on a cold cluster; requests look oversized",
                        workload.target, aggregates.cpu_percent_mean
                    ),
                    json!({ "cpu_percent_mean": aggregates.cpu_percent_mean }),
                    now,
                )? {
                    out.push(anomaly);
                }
            }
        }

        Ok(out)
    }

    /// Monotone per-pod memory growth over the last day.
    fn sweep_memory_leak(&self, ctx: &WorkloadCtx, now: NaiveDateTime) -> Result<Option<Anomaly>> {
        let samples = self
            .store
            .range_samples(&ctx.workload.target, now - Duration::hours(24), now)?;
        if samples.len() < 20 {
            return Ok(None);
        }
        let points: Vec<(f64, f64)> = samples
            .iter()
            .filter(|s| !s.startup)
            .map(|s| {
                (
                    (now - s.timestamp).num_seconds() as f64 / -3600.0,
                    s.memory_bytes_per_pod(),
                )
            })
            .collect();
        if points.len() < 20 {
            return Ok(None);
        }
        let n = points.len() as f64;
        let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
        let num: f64 = points
            .iter()
            .map(|(x, y)| (x - mean_x) * (y - mean_y))
            .sum();
        let denom: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
        if denom < f64::EPSILON || mean_y < f64::EPSILON {
            return Ok(None);
        }
        let growth_per_hour = num / denom / mean_y;
        if growth_per_hour > 0.02 {
            return self.debounced(
                &ctx.workload.target.key(),
                AnomalyKind::MemoryLeak,
                Severity::Warning,
                format!(
                    "{} per-pod memory grows {:.1}% per hour over the last day",
                    ctx.workload.target,
                    growth_per_hour * 100.0
                ),
                json!({ "growth_per_hour": growth_per_hour }),
                now,
            );
        }
        Ok(None)
    }

    fn debounced(
        &self,
        key: &str,
        kind: AnomalyKind,
        severity: Severity,
        description: String,
        snapshot: serde_json::Value,
        now: NaiveDateTime,
    ) -> Result<Option<Anomaly>> {
        let map_key = (key.to_owned(), kind);
        if let Some(last) = self.anomaly_emitted.get(&map_key) {
            if now - *last < Duration::minutes(ANOMALY_DEBOUNCE_MINUTES) {
                return Ok(None);
            }
        }
        self.anomaly_emitted.insert(map_key, now);
        let workload = resources::workload::WorkloadRef::parse(key);
        let anomaly = Anomaly::new(workload, now, kind, severity, description, snapshot);
        self.store.append_anomaly(&anomaly)?;
        Ok(Some(anomaly))
    }

    fn maybe_run_retention(&self, now: NaiveDateTime) -> Result<()> {
        let due = match self.store.last_cleanup()? {
            None => true,
            Some(at) => {
                now - at >= Duration::hours(self.config.retention.cleanup_interval_hours)
            },
        };
        if !due {
            return Ok(());
        }
        let report = self.store.run_cleanup(&self.config.retention, now)?;
        tracing::info!(
            "Retention cleanup: {} samples, {} events, {} predictions removed",
            report.samples_deleted,
            report.events_deleted,
            report.predictions_deleted + report.validated_deleted
        );
        if let Some(ratio) = disk_ratio(&self.config.data_dir) {
            let (pressure, ladder) = self.store.run_pressure_ladder(ratio, now)?;
            if ladder.downsampled + ladder.emergency_deleted > 0 {
                tracing::info!(
                    "Disk ladder at {:?}: {} rows downsampled, {} removed",
                    pressure,
                    ladder.downsampled,
                    ladder.emergency_deleted
                );
            }
        }
        Ok(())
    }
}

/// Used/total ratio of the volume backing the store path.
fn disk_ratio(data_dir: &str) -> Option<f64> {
    use sysinfo::{DiskExt, System, SystemExt};

    let mut system = System::new();
    system.refresh_disks_list();
    let path = std::path::Path::new(data_dir);
    system
        .disks()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| {
            let total = disk.total_space().max(1);
            1.0 - disk.available_space() as f64 / total as f64
        })
}
