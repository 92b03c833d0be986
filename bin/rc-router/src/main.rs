//! RelayCore message router process entry point.
//!
//! Wires the `Router` engine to its broker consumers and a declarative
//! configuration source, serves a liveness/`/metrics` surface for the
//! process itself, and drains on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::extract::State;
use axum::routing::get;
use axum::Router as AxumRouter;
use rc_common::{BrokerKind, QueueMapping};
use rc_queue::QueueConsumer;
use rc_router::{ConfigSourceSettings, Router, RouterConfigSource, WarningService};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

const STALL_SCAN_INTERVAL: Duration = Duration::from_secs(30);
const STALL_WARN_THRESHOLD_SECONDS: u64 = 120;
const STALL_FORCE_RELEASE_SECONDS: u64 = 600;
const VISIBILITY_EXTENSION_INTERVAL: Duration = Duration::from_secs(20);
const VISIBILITY_EXTENSION_THRESHOLD_SECONDS: u64 = 50;
const VISIBILITY_EXTENSION_SECONDS: u32 = 120;
const DRAIN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    rc_common::logging::init_logging("rc-router");

    info!("starting relaycore message router");

    let warnings = Arc::new(WarningService::new());
    let router = Arc::new(Router::new(warnings.clone()).map_err(|e| anyhow!("failed to build mediator: {e}"))?);

    let config_settings = ConfigSourceSettings::from_env();
    let config_source = Arc::new(RouterConfigSource::new(config_settings, router.clone(), warnings.clone()));

    let bootstrap_config = config_source.bootstrap_from_file().await.map_err(|e| anyhow!(e))?;
    let fetched_config = config_source.initial_sync().await.map_err(|e| anyhow!(e))?;
    let active_config = fetched_config.or(bootstrap_config).ok_or_else(|| anyhow!("no configuration available: set ROUTER_CONFIG_PATH and/or ROUTER_CONFIG_URL"))?;

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let sqs_client = aws_sdk_sqs::Client::new(&aws_config);

    for queue in &active_config.queues {
        let consumer: Arc<dyn QueueConsumer> = match build_consumer(&sqs_client, queue).await {
            Ok(c) => c,
            Err(e) => {
                error!(queue = %queue.queue_id, error = %e, "failed to build consumer, skipping");
                continue;
            }
        };
        router.register_consumer(consumer).await;
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let config_sync_handle = rc_router::config::spawn_sync_task(config_source.clone(), shutdown_rx);

    let background_router = router.clone();
    let background_shutdown = shutdown_tx.subscribe();
    let background_handle = tokio::spawn(run_background_maintenance(background_router, background_shutdown));

    let api_port: u16 = std::env::var("API_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
    let app_state = AppState { router: router.clone(), warnings: warnings.clone() };
    let app = AxumRouter::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{api_port}")).await?;
    info!(port = api_port, "liveness/metrics endpoint listening");
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "http server exited with error");
        }
    });

    info!("relaycore message router started, awaiting shutdown signal");
    shutdown_signal().await;
    info!("shutdown signal received, draining");

    let _ = shutdown_tx.send(());
    router.drain_all(DRAIN_GRACE_PERIOD).await;

    server_handle.abort();
    background_handle.abort();
    config_sync_handle.abort();

    info!("relaycore message router shutdown complete");
    Ok(())
}

async fn build_consumer(sqs_client: &aws_sdk_sqs::Client, queue: &QueueMapping) -> Result<Arc<dyn QueueConsumer>> {
    match queue.kind {
        BrokerKind::Fifo => {
            let consumer = rc_queue::fifo::FifoQueueConsumer::new(sqs_client.clone(), queue.url.clone(), queue.queue_id.clone(), 120);
            Ok(Arc::new(consumer))
        }
        BrokerKind::Jms => {
            let amqp_url = std::env::var("JMS_AMQP_URL").map_err(|_| anyhow!("JMS_AMQP_URL is required for JMS queue mappings"))?;
            let consumer = rc_queue::jms::JmsQueueConsumer::new(amqp_url, queue.url.clone(), queue.queue_id.clone());
            Ok(Arc::new(consumer))
        }
    }
}

async fn run_background_maintenance(router: Arc<Router>, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
    let mut stall_ticker = tokio::time::interval(STALL_SCAN_INTERVAL);
    let mut visibility_ticker = tokio::time::interval(VISIBILITY_EXTENSION_INTERVAL);

    loop {
        tokio::select! {
            _ = stall_ticker.tick() => {
                router.detect_stalled_messages(STALL_WARN_THRESHOLD_SECONDS, Some(STALL_FORCE_RELEASE_SECONDS)).await;
            }
            _ = visibility_ticker.tick() => {
                router.extend_visibility_for_long_running(VISIBILITY_EXTENSION_THRESHOLD_SECONDS, VISIBILITY_EXTENSION_SECONDS).await;
            }
            _ = shutdown_rx.recv() => {
                warn!("background maintenance task shutting down");
                break;
            }
        }
    }
}

#[derive(Clone)]
struct AppState {
    router: Arc<Router>,
    warnings: Arc<WarningService>,
}

async fn healthz(State(state): State<AppState>) -> String {
    let pools = state.router.pool_codes().len();
    let queues = state.router.queue_ids().len();
    let unacknowledged = state.warnings.unacknowledged_count();
    format!("ok pools={pools} queues={queues} unacknowledged_warnings={unacknowledged}\n")
}

async fn metrics(State(state): State<AppState>) -> String {
    let mut out = String::new();
    out.push_str("# HELP rc_router_pools_total Number of configured pools.\n");
    out.push_str("# TYPE rc_router_pools_total gauge\n");
    out.push_str(&format!("rc_router_pools_total {}\n", state.router.pool_codes().len()));

    out.push_str("# HELP rc_router_queues_total Number of active queue consumers.\n");
    out.push_str("# TYPE rc_router_queues_total gauge\n");
    out.push_str(&format!("rc_router_queues_total {}\n", state.router.queue_ids().len()));

    out.push_str("# HELP rc_router_in_flight_total Messages currently tracked in flight.\n");
    out.push_str("# TYPE rc_router_in_flight_total gauge\n");
    out.push_str(&format!("rc_router_in_flight_total {}\n", state.router.tracker().size()));

    for metric in state.router.queue_metrics().await {
        out.push_str(&format!(
            "rc_router_queue_pending_messages{{queue=\"{}\"}} {}\n",
            metric.queue_identifier, metric.pending_messages
        ));
        out.push_str(&format!(
            "rc_router_queue_in_flight_messages{{queue=\"{}\"}} {}\n",
            metric.queue_identifier, metric.in_flight_messages
        ));
    }

    out
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
