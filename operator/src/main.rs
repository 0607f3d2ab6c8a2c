use std::{net::SocketAddr, path::Path, sync::Arc};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use parking_lot::RwLock;
use resources::config::OperatorConfig;
use tokio::sync::watch;

use crate::{
    api::AppState,
    clock::{Clock, SystemClock},
    control_plane::ControlPlane,
    kube::{ClusterApi, KubeClient},
    notify::Notifier,
    store::MetricStore,
};

mod actuator;
mod api;
mod autopilot;
mod clock;
mod collector;
mod control_plane;
mod coordinator;
mod discovery;
mod guard;
mod kube;
mod notify;
mod pattern;
mod predictor;
mod prescale;
mod store;
mod tuner;

fn load_config() -> Result<OperatorConfig> {
    let path = std::env::var("SMART_AUTOSCALER_CONFIG")
        .unwrap_or_else(|_| "/etc/smart-autoscaler/config.yaml".to_string());
    Config::builder()
        .add_source(File::with_name(&path).required(false))
        .add_source(Environment::default().separator("__"))
        .build()?
        .try_deserialize::<OperatorConfig>()
        .with_context(|| "Failed to parse config".to_string())
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

/// Exit code 0 on clean shutdown, 1 on fatal config error, 2 on
/// irrecoverable store failure.
async fn run() -> i32 {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Fatal config error: {:#}", err);
            return 1;
        },
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    let listen_addr: SocketAddr = match config.listen_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!("Invalid listen_addr {}: {}", config.listen_addr, err);
            return 1;
        },
    };
    let store = match MetricStore::open(Path::new(&config.data_dir)) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!("Irrecoverable store failure: {}", err);
            return 2;
        },
    };
    let cluster: Arc<dyn ClusterApi> = match KubeClient::new(&config) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            tracing::error!("Fatal config error: {:#}", err);
            return 1;
        },
    };
    let notifier = match Notifier::new(&config) {
        Ok(notifier) => notifier,
        Err(err) => {
            tracing::error!("Fatal config error: {:#}", err);
            return 1;
        },
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let latest_snapshot = Arc::new(RwLock::new(None));

    let control_plane = match ControlPlane::new(
        config.clone(),
        store.clone(),
        cluster,
        clock,
        notifier.clone(),
        latest_snapshot.clone(),
    ) {
        Ok(control_plane) => control_plane,
        Err(err) => {
            tracing::error!("Fatal config error: {:#}", err);
            return 1;
        },
    };

    let app_state = Arc::new(AppState {
        store: store.clone(),
        notifier,
        costs: config.costs.clone(),
        latest_snapshot,
    });
    let app = api::router(app_state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::Server::bind(&listen_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        });
    tracing::info!("Read API listening at {}", listen_addr);
    let server_handle = tokio::spawn(server);

    let loop_handle = tokio::spawn(control_plane.run(shutdown_rx));

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutting down"),
        Err(err) => tracing::error!("Signal handler failed: {}", err),
    }
    let _ = shutdown_tx.send(true);

    let code = match loop_handle.await {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            tracing::error!("Control loop failed during shutdown: {:#}", err);
            2
        },
        Err(err) => {
            tracing::error!("Control loop panicked: {}", err);
            2
        },
    };
    if let Err(err) = server_handle.await {
        tracing::warn!("API server task failed: {}", err);
    }
    if let Err(err) = store.flush() {
        tracing::error!("Final store flush failed: {}", err);
        return 2;
    }
    code
}
