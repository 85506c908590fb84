/**
 * VIGIL KERNEL - Entry point of the recovery controller
 *
 * ROLE: wires config, topology, MQTT, the recovery pipeline and the HTTP API,
 * then serves until killed.
 */

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vigil_kernel::compute::MqttComputeClient;
use vigil_kernel::config::load_config;
use vigil_kernel::coordinator::LockCoordinator;
use vigil_kernel::dispatcher::Dispatcher;
use vigil_kernel::engine::WorkflowEngine;
use vigil_kernel::events::MqttEventSink;
use vigil_kernel::health::HealthTracker;
use vigil_kernel::http::{self, AppState};
use vigil_kernel::mqtt;
use vigil_kernel::notifications::{NotificationStore, StoreError};
use vigil_kernel::selector::WorkflowSelector;
use vigil_kernel::topology::{MemoryTopologyStore, TopologyStore};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil_kernel=info")))
        .init();

    let cfg = load_config().await.context("failed to load kernel config")?;

    let topology = MemoryTopologyStore::from_config(&cfg.segments).context("invalid segment topology")?;
    info!("loaded {} segments, {} hosts", topology.segment_count(), topology.host_count());

    let store = NotificationStore::with_file(cfg.data_dir.notifications_file());
    match store.load().await {
        Ok(_) => {}
        Err(e @ StoreError::Corrupt { .. }) => warn!("{e}; starting with no notifications"),
        Err(e) => return Err(e).context("failed to load notification snapshot"),
    }

    let (mqtt_client, eventloop) = mqtt::create_mqtt_client(&cfg.mqtt);
    let compute = Arc::new(MqttComputeClient::new(mqtt_client.clone(), cfg.recovery.compute_timeout()));
    let selector = WorkflowSelector::new(compute.clone(), cfg.recovery.retry_policy());
    let engine = WorkflowEngine::new(Arc::new(MqttEventSink::new(mqtt_client.clone())));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(store),
        Arc::new(topology),
        Arc::new(selector),
        engine,
        LockCoordinator::new(),
        cfg.recovery.max_concurrent,
    ));

    let health_tracker = HealthTracker::new();
    mqtt::spawn_mqtt_listener(
        mqtt_client.clone(),
        eventloop,
        dispatcher.clone(),
        compute,
        health_tracker.clone(),
    );
    health_tracker.spawn_health_publisher(
        mqtt_client,
        dispatcher.clone(),
        std::time::Duration::from_secs(cfg.recovery.health_interval_secs.max(1)),
    );

    let resumed = dispatcher.resume().await;
    if !resumed.is_empty() {
        info!("re-dispatching {} pending notifications", resumed.len());
    }

    let app = http::build_router(AppState { dispatcher, health_tracker });

    let addr: SocketAddr = cfg.http.bind.parse().with_context(|| format!("invalid http.bind '{}'", cfg.http.bind))?;
    let listener = TcpListener::bind(addr).await.with_context(|| format!("cannot bind {addr}"))?;
    info!("listening on http://{addr}");
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
