use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context as _;
use typed_builder::TypedBuilder;

use crate::{
    CONFIG, CancellationToken,
    api::{
        ApiContext,
        router::{RouterArgs, new_full_router, serve as service_serve},
    },
    service::{BindingSettings, BindingStore, Gateways, State, jobs::run_workers},
};

#[derive(Debug, TypedBuilder)]
pub struct ServeConfiguration<B: BindingStore> {
    /// The address to bind the service to
    pub bind_addr: SocketAddr,
    /// The state of the binding store
    pub store_state: B::State,
    /// Clients of the warehouse, identity provider, BI tool and catalog
    pub gateways: Gateways,
    pub settings: BindingSettings,
    #[builder(default = CONFIG.worker_count)]
    pub worker_count: usize,
    #[builder(default = CONFIG.task_poll_interval())]
    pub poll_interval: Duration,
    /// Hook to add routes or layers to the router before it is served
    #[builder(default)]
    pub modify_router_fn: Option<fn(axum::Router) -> axum::Router>,
}

/// Serve the HTTP API and run the workflow workers until SIGINT or SIGTERM.
///
/// # Errors
/// Fails if the listener cannot be bound or the server exits with an error.
pub async fn serve<B: BindingStore>(config: ServeConfiguration<B>) -> anyhow::Result<()> {
    let ServeConfiguration {
        bind_addr,
        store_state,
        gateways,
        settings,
        worker_count,
        poll_interval,
        modify_router_fn,
    } = config;

    let state = State::<B> {
        store: store_state,
        gateways,
        settings: Arc::new(settings),
    };

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    let cancellation_token = CancellationToken::new();

    let workers = tokio::spawn(run_workers::<B>(
        state.clone(),
        worker_count,
        poll_interval,
        cancellation_token.clone(),
    ));

    let signal_token = cancellation_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let router = new_full_router::<B>(RouterArgs {
        state: ApiContext { v1_state: state },
    });
    let router = match modify_router_fn {
        Some(modify) => modify(router),
        None => router,
    };

    tracing::info!("Dataport listening on {bind_addr} with {worker_count} workflow workers");
    let result = service_serve(listener, router, cancellation_token.clone()).await;

    // The server may also exit on its own. Workers must follow in either case.
    cancellation_token.cancel();
    if let Err(e) = workers.await {
        tracing::error!("Workflow workers did not shut down cleanly: {e}");
    }
    tracing::info!("Graceful shutdown complete");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
