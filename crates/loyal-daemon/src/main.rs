//! loyal-daemon entry point.
//!
//! This file is intentionally thin: it resolves settings, picks the storage
//! backend, starts the reconciler, wires middleware and serves HTTP until a
//! shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use loyal_accrual::{GatewayConfig, HttpAccrualGateway};
use loyal_config::{Overrides, Settings};
use loyal_daemon::{routes, state};
use loyal_db::{MemStorage, PgStorage, Storage};
use loyal_reconcile::{shutdown_channel, ReconcileConfig, Reconciler, ShutdownTrigger};
use tokio::sync::broadcast;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "loyal-daemon", version, about = "Loyalty points service")]
struct Args {
    /// Listen address, e.g. 127.0.0.1:8080 or :8080
    #[arg(short = 'a', long = "run-address")]
    run_address: Option<String>,

    /// Postgres URL; without one state is kept in memory
    #[arg(short = 'd', long = "database-uri")]
    database_uri: Option<String>,

    /// Accrual authority base URL
    #[arg(short = 'r', long = "accrual-address")]
    accrual_address: Option<String>,

    /// YAML settings files, merged in order
    #[arg(long = "config")]
    config: Vec<String>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            run_address: self.run_address.clone(),
            database_url: self.database_uri.clone(),
            accrual_address: self.accrual_address.clone(),
            poll_interval_secs: None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience).
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let args = Args::parse();
    let env = Overrides::from_process_env()?;
    let paths: Vec<&str> = args.config.iter().map(String::as_str).collect();
    let settings = loyal_config::load(&paths, &env, &args.overrides()).context("config")?;

    info!(
        run_address = %settings.run_address,
        accrual = %settings.accrual_address,
        database = settings.database_url_redacted().as_deref().unwrap_or("<memory>"),
        poll_interval_secs = settings.reconcile.poll_interval_secs,
        "settings resolved"
    );

    let storage = open_storage(&settings).await?;
    let shared = Arc::new(state::AppState::new(Arc::clone(&storage)));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    let (events_tx, events_rx) = broadcast::channel(1024);
    state::spawn_event_forwarder(events_rx, shared.bus.clone());

    let gateway = HttpAccrualGateway::new(GatewayConfig {
        base_url: settings.accrual_address.clone(),
        timeout: settings.accrual_timeout(),
    })?;
    let (trigger, shutdown) = shutdown_channel();
    let reconciler = Reconciler::new(
        storage,
        Arc::new(gateway),
        ReconcileConfig {
            poll_interval: settings.poll_interval(),
            max_in_flight: settings.reconcile.max_in_flight,
        },
    )
    .with_events(events_tx)
    .start(shutdown);

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = settings.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("bind {addr}"))?;
    let local = listener.local_addr().context("listener address")?;
    info!("loyal-daemon listening on http://{}", local);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_on_signal(trigger))
        .await
        .context("server crashed")?;

    reconciler.stop().await;
    info!("loyal-daemon stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn open_storage(settings: &Settings) -> anyhow::Result<Arc<dyn Storage>> {
    match settings.database_url.as_deref() {
        Some(url) => {
            let pool = loyal_db::connect(url, 10).await?;
            loyal_db::migrate(&pool).await?;
            Ok(Arc::new(PgStorage::new(pool)))
        }
        None => {
            warn!("no database configured; orders and balances are kept in memory and lost on exit");
            Ok(Arc::new(MemStorage::new()))
        }
    }
}

/// Resolve on SIGINT/SIGTERM and fire the reconciler shutdown.
async fn shutdown_on_signal(trigger: ShutdownTrigger) {
    wait_for_signal().await;
    info!("shutdown signal received");
    trigger.trigger();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable; waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
