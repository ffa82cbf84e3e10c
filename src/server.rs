use anyhow::{Context, Result};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{middleware, Router};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::auth::{basic_auth_middleware, Credentials};
use crate::api::graphql::{self, WardenSchema};
use crate::api::rest::{self, AppState};
use crate::config::Config;
use crate::domain::hypervisor::ProxmoxClient;
use crate::domain::store::Database;
use crate::domain::Services;

pub async fn run(config: Config) -> Result<()> {
    // Init tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "warden daemon starting");

    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path.display()))?;
    let hypervisor = Arc::new(ProxmoxClient::new(&config.hypervisor).context("building hypervisor client")?);
    let services = Services::new(db, hypervisor, &config);

    // Entries left pending by a previous process would block their targets forever
    services
        .audit
        .recover_orphans()
        .context("recovering orphaned log entries")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = Vec::new();

    // Registry sync loop (first tick fires immediately)
    if config.registry.sync_interval_secs > 0 {
        let services = services.clone();
        let period = Duration::from_secs(config.registry.sync_interval_secs);
        let mut shutdown = shutdown_rx.clone();
        loops.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match services.registry.sync().await {
                            Ok(diff) => info!(
                                nodes = diff.upserted_nodes,
                                resources = diff.upserted_resources,
                                "registry synced"
                            ),
                            Err(e) => warn!(error = %e, "registry sync failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    } else {
        info!("periodic registry sync disabled");
    }

    if config.scheduler.enabled {
        let scheduler = services.scheduler.clone();
        let period = Duration::from_secs(config.scheduler.tick_secs);
        loops.push(tokio::spawn(scheduler.run(period, shutdown_rx.clone())));
    } else {
        info!("restart scheduler disabled");
    }

    let credentials = Arc::new(Credentials::new(&config.auth));
    let app_state = AppState {
        services: services.clone(),
        started_at: Instant::now(),
    };

    // Build GraphQL schema
    let schema = graphql::build_schema(services.clone());

    // GraphQL sub-router with its own state, behind the same credentials
    let graphql_router = Router::new()
        .route("/graphql", get(graphql_playground).post(graphql_handler))
        .route_layer(middleware::from_fn_with_state(
            credentials.clone(),
            basic_auth_middleware,
        ))
        .with_state(schema);

    let app = rest::router(app_state, credentials)
        .merge(graphql_router)
        .layer(TraceLayer::new_for_http());

    // Bind HTTP listener
    let http_addr = &config.http_addr;
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding to {}", http_addr))?;

    info!(addr = %http_addr, "HTTP server listening");

    // Run HTTP server with graceful shutdown
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // Stop the loops, then let in-flight operations write their outcome
    let _ = shutdown_tx.send(true);
    for handle in loops {
        if let Err(e) = handle.await {
            warn!(error = %e, "background loop ended abnormally");
        }
    }
    let in_flight = services.executor.in_flight();
    if !in_flight.is_empty() {
        info!(count = in_flight.len(), "draining in-flight operations");
    }
    services.executor.drain().await;

    match services.status.status(Utc::now()) {
        Ok(s) => info!(
            total_restarts = s.total_restarts,
            failed_restarts = s.failed_restarts,
            "warden daemon stopped"
        ),
        Err(_) => info!("warden daemon stopped"),
    }
    Ok(())
}

async fn graphql_playground() -> Html<String> {
    Html(
        async_graphql::http::playground_source(
            async_graphql::http::GraphQLPlaygroundConfig::new("/graphql"),
        ),
    )
}

async fn graphql_handler(
    State(schema): State<WardenSchema>,
    req: GraphQLRequest,
) -> GraphQLResponse {
    schema.execute(req.into_inner()).await.into()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received SIGTERM, shutting down"); },
    }
}
