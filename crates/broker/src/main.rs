use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;

use agentbridge_broker::config;
use agentbridge_broker::dispatcher::Dispatcher;
use agentbridge_broker::http::{self, AppState};
use agentbridge_broker::registry::WorkerRegistry;
use agentbridge_broker::rendezvous::RendezvousTable;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("agentbridge broker starting");

    let config_path = config::default_config_path();
    let broker_config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration — refusing to start");
            std::process::exit(1);
        }
    };

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus metrics recorder");

    let registry = Arc::new(WorkerRegistry::new(
        broker_config.max_workers as usize,
        broker_config.liveness_window(),
    ));
    let rendezvous = Arc::new(RendezvousTable::new());
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&rendezvous),
        broker_config.response_wait(),
        broker_config.acquire_wait(),
    );

    // Periodic sweep: evict workers that have missed too many heartbeats,
    // then fail any rendezvous slots still assigned to them. Kept as two
    // steps across the two locks deliberately — see the registry's
    // `evict_stale` doc comment.
    {
        let registry = Arc::clone(&registry);
        let rendezvous = Arc::clone(&rendezvous);
        let period = broker_config.liveness_window() / 2;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                for worker_id in registry.evict_stale() {
                    rendezvous.cancel_for_worker(worker_id);
                }
            }
        });
    }

    let state = Arc::new(AppState {
        registry,
        rendezvous,
        dispatcher,
        heartbeat_interval: broker_config.heartbeat_interval(),
        metrics_handle,
    });

    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&broker_config.listen_address)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, address = %broker_config.listen_address, "failed to bind listener");
            std::process::exit(1);
        });

    tracing::info!(address = %broker_config.listen_address, "agentbridge broker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("HTTP server error");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
