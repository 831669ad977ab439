/**
 * FLEETWATCH KERNEL - Main entry point
 *
 * ROLE: Wires config, state store, client fan-out, MQTT ingestion and the
 * HTTP/WebSocket surface together, then serves until Ctrl-C.
 *
 * ARCHITECTURE: MQTT -> bounded ingest queue -> single ingest loop -> store
 * + fan-out; HTTP reads snapshots; background tasks for heartbeat and pruning.
 */

use anyhow::Context;
use fleetwatch_kernel::config::load_config;
use fleetwatch_kernel::contracts::TopicScheme;
use fleetwatch_kernel::fanout::{spawn_heartbeat, BroadcastFanout};
use fleetwatch_kernel::health::HealthTracker;
use fleetwatch_kernel::http::{build_router, AppState};
use fleetwatch_kernel::mqtt::{create_mqtt_client, ingest_queue, spawn_bus_listener, BusPublisher, IngestGateway};
use fleetwatch_kernel::state::{spawn_advisory_pruner, StateStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetwatch_kernel=info")),
        )
        .init();

    let cfg = load_config().await;
    tracing::info!(
        broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        bind = %cfg.http.bind,
        "starting fleetwatch kernel"
    );

    let store = Arc::new(StateStore::with_metadata(cfg.history, cfg.machines.clone()));
    let fanout = Arc::new(BroadcastFanout::new(cfg.fanout.client_queue_capacity));
    let health = HealthTracker::new();
    let scheme = TopicScheme::from_conf(&cfg.mqtt);

    // MQTT: transport task feeds the ingest queue, one loop drains it
    let (client, eventloop) = create_mqtt_client(&cfg.mqtt);
    let (queue_tx, queue_rx) = ingest_queue(cfg.ingest.queue_capacity);
    let publisher: Arc<dyn BusPublisher> = Arc::new(client.clone());
    let gateway = Arc::new(IngestGateway::new(
        store.clone(),
        fanout.clone(),
        health.clone(),
        publisher,
        scheme.clone(),
        cfg.mqtt.publish_timeout(),
    ));

    spawn_bus_listener(eventloop, client, scheme, health.clone(), queue_tx, cfg.mqtt.reconnect_delay());
    let ingest = gateway.clone();
    tokio::spawn(async move { ingest.run(queue_rx).await });

    spawn_heartbeat(fanout.clone(), cfg.fanout.heartbeat_interval(), cfg.fanout.idle_timeout());
    spawn_advisory_pruner(store.clone(), cfg.retention.prune_interval(), cfg.retention.advisory_max_age());

    let app_state = AppState {
        store,
        fanout: fanout.clone(),
        health,
        gateway,
        client_send_timeout: cfg.fanout.send_timeout(),
    };
    let app = build_router(app_state, &cfg.http);

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    tracing::info!(addr = %cfg.http.bind, "listening");
    fanout.notify_system("startup", "FleetWatch kernel started", "info");

    let shutdown_fanout = fanout.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
            shutdown_fanout.shutdown_all();
        })
        .await
        .context("http server failed")?;

    tracing::info!("kernel stopped");
    Ok(())
}
