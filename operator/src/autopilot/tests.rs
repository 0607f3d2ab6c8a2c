use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use resources::{
    metrics::MetricSample,
    objects::{
        pod::{ContainerState, ContainerStatus, Pod, PodCondition, PodStatus, TerminatedState},
        Metadata,
    },
    workload::{Priority, Workload, WorkloadRef},
};

use super::{health::HealthMonitor, *};
use crate::{
    actuator::tests::{base, demo_deployment, demo_hpa},
    clock::test::ManualClock,
    kube::mock::MockCluster,
    kube::ClusterApi,
    store::MetricStore,
};

fn demo_workload(priority: Priority) -> Workload {
    Workload {
        target: WorkloadRef::new("demo", "demo-app"),
        hpa_name: Some("demo-app-hpa".to_string()),
        priority,
        startup_filter_minutes: 5,
        auto_discovered: false,
    }
}

fn make_pod(name: &str, restarts: u32, ooms: u32) -> Pod {
    let mut statuses = vec![ContainerStatus {
        name: "app".to_string(),
        restart_count: restarts,
        last_state: None,
    }];
    for i in 0..ooms {
        statuses.push(ContainerStatus {
            name: format!("app-oom-{}", i),
            restart_count: 0,
            last_state: Some(ContainerState {
                terminated: Some(TerminatedState {
                    reason: Some("OOMKilled".to_string()),
                    exit_code: 137,
                }),
            }),
        });
    }
    Pod {
        metadata: Metadata {
            name: name.to_string(),
            namespace: "demo".to_string(),
            ..Metadata::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            start_time: None,
            conditions: vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
            }],
            container_statuses: statuses,
        }),
    }
}

struct Harness {
    cluster: Arc<MockCluster>,
    store: Arc<MetricStore>,
    clock: Arc<ManualClock>,
    actuator: Actuator,
    autopilot: Autopilot,
    monitor: HealthMonitor,
}

fn harness(level: AutopilotLevel) -> Harness {
    let cluster = Arc::new(MockCluster::new());
    cluster.insert_hpa(demo_hpa(2, 10, 75));
    cluster.insert_deployment(demo_deployment(2, "250m", "256Mi"));
    let store = Arc::new(MetricStore::temporary().unwrap());
    let clock = Arc::new(ManualClock::at(base()));
    let actuator = Actuator::new(cluster.clone(), store.clone(), clock.clone(), false);
    let config = AutopilotConfig {
        level,
        ..AutopilotConfig::default()
    };
    Harness {
        cluster,
        store,
        clock,
        actuator,
        autopilot: Autopilot::new(config.clone()),
        monitor: HealthMonitor::new(config),
    }
}

/// Eight days of 15-minute samples: per-pod cpu 400m, per-pod memory 100Mi.
fn seed_samples(store: &MetricStore, from: NaiveDateTime) {
    let wl = WorkloadRef::new("demo", "demo-app");
    let mut batch = Vec::new();
    for i in 0..(8 * 96) {
        batch.push(MetricSample {
            workload: wl.clone(),
            timestamp: from + Duration::minutes(15 * i),
            cpu_millicores: 800,
            memory_bytes: 200 << 20,
            replica_count: 2,
            cpu_percent: 60.0,
            startup: false,
        });
    }
    store.append_samples(&batch).unwrap();
}

fn ready_profile(store: &MetricStore, started: NaiveDateTime) {
    let mut profile = AutopilotProfile::new(WorkloadRef::new("demo", "demo-app"), started);
    profile.state = AutopilotState::Ready;
    store.put_autopilot(&profile).unwrap();
}

async fn reconcile(h: &Harness, workload: &Workload) -> Vec<Anomaly> {
    let deployment = h.cluster.get_deployment("demo", "demo-app").await.unwrap();
    let pods = vec![make_pod("demo-app-1", 0, 0), make_pod("demo-app-2", 0, 0)];
    h.autopilot
        .reconcile(
            workload,
            &deployment,
            &pods,
            PrescaleState::Idle,
            &h.actuator,
            &h.store,
            h.clock.as_ref(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn no_recommendation_while_learning() {
    let h = harness(AutopilotLevel::Recommend);
    seed_samples(&h.store, base());
    // A fresh profile starts in Learning; nothing may be emitted.
    reconcile(&h, &demo_workload(Priority::Medium)).await;
    assert!(h.store.recent_recommendations(10).unwrap().is_empty());
    let profile = h
        .store
        .get_autopilot(&WorkloadRef::new("demo", "demo-app"))
        .unwrap()
        .unwrap();
    assert_eq!(profile.state, AutopilotState::Learning);
}

#[tokio::test]
async fn learning_graduates_with_baselines() {
    let h = harness(AutopilotLevel::Observe);
    seed_samples(&h.store, base());
    let mut profile = AutopilotProfile::new(WorkloadRef::new("demo", "demo-app"), base());
    profile.state = AutopilotState::Learning;
    h.store.put_autopilot(&profile).unwrap();

    h.clock.advance_minutes(8 * 24 * 60);
    reconcile(&h, &demo_workload(Priority::Medium)).await;
    let profile = h
        .store
        .get_autopilot(&WorkloadRef::new("demo", "demo-app"))
        .unwrap()
        .unwrap();
    assert_eq!(profile.state, AutopilotState::Ready);
    assert!(profile.baseline_cpu_p95.unwrap() > 390.0);
    assert!(profile.baseline_memory_p95.unwrap() > 90.0 * 1024.0 * 1024.0);
}

#[tokio::test]
async fn recommend_level_emits_but_never_applies() {
    let h = harness(AutopilotLevel::Recommend);
    seed_samples(&h.store, base());
    ready_profile(&h.store, base());
    h.clock.advance_minutes(8 * 24 * 60);

    reconcile(&h, &demo_workload(Priority::Medium)).await;
    let recommendations = h.store.recent_recommendations(10).unwrap();
    assert!(!recommendations.is_empty());
    assert!(h.cluster.patch_log().is_empty());
}

#[tokio::test]
async fn apply_is_stepped_and_monitored() {
    let h = harness(AutopilotLevel::Autopilot);
    seed_samples(&h.store, base());
    ready_profile(&h.store, base());
    h.clock.advance_minutes(8 * 24 * 60);

    let anomalies = reconcile(&h, &demo_workload(Priority::Medium)).await;
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, AnomalyKind::AutopilotAction);

    let deployment = h.cluster.get_deployment("demo", "demo-app").await.unwrap();
    let cpu = deployment.spec.template.spec.containers[0]
        .resources
        .requests
        .get("cpu")
        .cloned()
        .unwrap();
    // Target is ~470m but a single step is bounded to +30% of 250m.
    assert_eq!(cpu, "325m");

    let profile = h
        .store
        .get_autopilot(&WorkloadRef::new("demo", "demo-app"))
        .unwrap()
        .unwrap();
    assert!(profile.pending.is_some());
    assert_eq!(profile.last_action_at, Some(h.clock.now()));
}

#[tokio::test]
async fn cooldown_blocks_apply_but_keeps_recommendation() {
    let h = harness(AutopilotLevel::Autopilot);
    seed_samples(&h.store, base());
    let started = base();
    let mut profile = AutopilotProfile::new(WorkloadRef::new("demo", "demo-app"), started);
    profile.state = AutopilotState::Ready;
    h.clock.advance_minutes(8 * 24 * 60);
    // Applied six hours ago with a 24 hour cooldown.
    profile.last_action_at = Some(h.clock.now() - Duration::hours(6));
    h.store.put_autopilot(&profile).unwrap();

    reconcile(&h, &demo_workload(Priority::Medium)).await;

    assert!(h.cluster.patch_log().is_empty());
    let skips = h.store.recent_skips(10).unwrap();
    assert_eq!(skips.len(), 1);
    assert_eq!(skips[0].reason, SkipReason::CooldownActive);
    assert!(!h.store.recent_recommendations(10).unwrap().is_empty());
}

#[tokio::test]
async fn prescale_conflict_blocks_apply() {
    let h = harness(AutopilotLevel::Autopilot);
    seed_samples(&h.store, base());
    ready_profile(&h.store, base());
    h.clock.advance_minutes(8 * 24 * 60);

    let deployment = h.cluster.get_deployment("demo", "demo-app").await.unwrap();
    let pods = vec![make_pod("demo-app-1", 0, 0)];
    h.autopilot
        .reconcile(
            &demo_workload(Priority::Medium),
            &deployment,
            &pods,
            PrescaleState::PreScaling,
            &h.actuator,
            &h.store,
            h.clock.as_ref(),
        )
        .await
        .unwrap();

    assert!(h.cluster.patch_log().is_empty());
    let skips = h.store.recent_skips(10).unwrap();
    assert_eq!(skips[0].reason, SkipReason::PrescaleConflict);
}

#[tokio::test]
async fn large_changes_on_critical_workloads_degrade_to_recommend() {
    let h = harness(AutopilotLevel::Autopilot);
    seed_samples(&h.store, base());
    ready_profile(&h.store, base());
    h.clock.advance_minutes(8 * 24 * 60);

    reconcile(&h, &demo_workload(Priority::Critical)).await;

    assert!(h.cluster.patch_log().is_empty());
    let skips = h.store.recent_skips(10).unwrap();
    assert!(skips
        .iter()
        .all(|s| s.reason == SkipReason::PriorityDegrade));
    assert!(!skips.is_empty());
}

#[tokio::test]
async fn oom_burst_triggers_auto_rollback() {
    let h = harness(AutopilotLevel::Autopilot);
    seed_samples(&h.store, base());
    ready_profile(&h.store, base());
    h.clock.advance_minutes(8 * 24 * 60);

    reconcile(&h, &demo_workload(Priority::Medium)).await;
    let deployment = h.cluster.get_deployment("demo", "demo-app").await.unwrap();
    assert_ne!(
        deployment.spec.template.spec.containers[0]
            .resources
            .requests
            .get("memory")
            .cloned()
            .unwrap(),
        "256Mi"
    );

    // Two OOM kills inside the monitor window exceed the allowed one.
    h.cluster.set_pods(
        "demo",
        vec![make_pod("demo-app-1", 0, 1), make_pod("demo-app-2", 0, 1)],
    );
    h.clock.advance_minutes(2);
    let cluster: Arc<dyn crate::kube::ClusterApi> = h.cluster.clone();
    let anomalies = h
        .monitor
        .run(&h.store, &cluster, &h.actuator, h.clock.as_ref())
        .await
        .unwrap();

    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].severity, resources::anomaly::Severity::Warning);
    let deployment = h.cluster.get_deployment("demo", "demo-app").await.unwrap();
    assert_eq!(
        deployment.spec.template.spec.containers[0]
            .resources
            .requests
            .get("memory")
            .cloned()
            .unwrap(),
        "256Mi"
    );
    assert_eq!(
        deployment.spec.template.spec.containers[0]
            .resources
            .requests
            .get("cpu")
            .cloned()
            .unwrap(),
        "250m"
    );
    let profile = h
        .store
        .get_autopilot(&WorkloadRef::new("demo", "demo-app"))
        .unwrap()
        .unwrap();
    assert!(profile.pending.is_none());
    assert_eq!(profile.auto_rollbacks, 1);
}

#[tokio::test]
async fn low_confidence_suppresses_recommendations() {
    let h = harness(AutopilotLevel::Recommend);
    // Only a handful of samples.
    let wl = WorkloadRef::new("demo", "demo-app");
    for i in 0..10 {
        h.store
            .append_samples(&[MetricSample {
                workload: wl.clone(),
                timestamp: base() + Duration::minutes(15 * i),
                cpu_millicores: 800,
                memory_bytes: 200 << 20,
                replica_count: 2,
                cpu_percent: 60.0,
                startup: false,
            }])
            .unwrap();
    }
    ready_profile(&h.store, base());
    h.clock.advance_minutes(8 * 24 * 60);

    reconcile(&h, &demo_workload(Priority::Medium)).await;
    assert!(h.store.recent_recommendations(10).unwrap().is_empty());
}
