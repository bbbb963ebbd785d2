// =============================================================================
// Meridian FX Nexus — Main Entry Point
// =============================================================================
//
// Singletons come up in dependency order: broker session -> symbol catalog ->
// subscription multiplexer -> client gateway; teardown runs in reverse on
// SIGTERM/SIGINT. Exit codes: 0 normal shutdown, 1 configuration error,
// 2 unrecoverable broker auth failure.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod app_state;
mod broker;
mod catalog;
mod codec;
mod error;
mod gateway;
mod multiplexer;
mod runtime_config;
mod types;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, Counters};
use crate::broker::BrokerSession;
use crate::catalog::SymbolCatalog;
use crate::codec::registry::SPOT_EVENT;
use crate::codec::Envelope;
use crate::multiplexer::SpotMultiplexer;
use crate::runtime_config::RuntimeConfig;
use crate::types::BrokerStatus;

/// How long writers get to drain after the shutdown signal.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "meridian", about = "Real-time FX tick distribution backend")]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "meridian.json")]
    config: String,

    /// Override the gateway bind address (host:port).
    #[arg(long)]
    bind_addr: Option<String>,

    /// Log filter, e.g. `info` or `meridian=debug`.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level.clone()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Meridian FX Nexus starting up");

    // ── 2. Configuration (fatal on error: exit 1) ────────────────────────
    let mut config = match RuntimeConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.apply_env() {
        error!(error = %e, "configuration error");
        std::process::exit(1);
    }
    if let Some(bind) = cli.bind_addr {
        config.bind_addr = bind;
    }
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration error");
        std::process::exit(1);
    }

    info!(
        broker_host = %config.broker.host,
        broker_port = config.broker.port,
        account_id = config.broker.account_id,
        bind_addr = %config.bind_addr,
        symbols = ?config.symbols,
        "configuration loaded"
    );

    // ── 3. Singletons in dependency order ────────────────────────────────
    let counters = Arc::new(Counters::default());
    let (session, status_rx) = BrokerSession::new(config.broker.clone(), counters.clone());
    let catalog = Arc::new(SymbolCatalog::new(session.clone()));
    let multiplexer = Arc::new(SpotMultiplexer::new(
        session.clone(),
        catalog.clone(),
        config.aggregator.clone(),
        counters.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(1);

    // ── 4. Broker session supervisor ─────────────────────────────────────
    tokio::spawn(session.clone().run(shutdown_rx.clone(), fatal_tx));

    // ── 5. Broker event dispatch (spot events -> aggregators) ───────────
    let (spot_tx, spot_rx) = mpsc::channel::<Envelope>(1024);
    session.register_handler(SPOT_EVENT, spot_tx);
    tokio::spawn(dispatch_spot_events(spot_rx, multiplexer.clone()));

    // ── 6. Broker status supervisor (catalog + reconnect replay) ────────
    tokio::spawn(supervise_broker_status(
        status_rx.clone(),
        catalog.clone(),
        multiplexer.clone(),
        config.symbols.clone(),
    ));

    // ── 7. Gateway ───────────────────────────────────────────────────────
    let state = Arc::new(AppState::new(
        config.clone(),
        session.clone(),
        catalog.clone(),
        multiplexer.clone(),
        counters.clone(),
        status_rx,
        shutdown_rx.clone(),
    ));

    tokio::spawn(log_counters(state.clone()));

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.bind_addr, error = %e, "failed to bind gateway address");
            std::process::exit(1);
        }
    };
    info!(addr = %config.bind_addr, "gateway listening on /ws");

    let app = gateway::server::router(state.clone());
    let mut serve_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = serve_shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "gateway server failed");
        }
    });

    info!("all subsystems running");

    // ── 8. Wait for shutdown signal or fatal broker failure ─────────────
    let exit_code = wait_for_exit(&mut fatal_rx).await;

    // ── 9. Graceful teardown: gateway first, broker last ─────────────────
    warn!("shutting down");
    let _ = shutdown_tx.send(true);

    let drain_deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while state.counters.clients_connected.load(Ordering::Relaxed) > 0
        && tokio::time::Instant::now() < drain_deadline
    {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), server).await;

    info!("Meridian shut down complete");
    std::process::exit(exit_code);
}

/// Block until SIGINT/SIGTERM (exit 0) or an unrecoverable broker auth
/// failure (exit 2).
async fn wait_for_exit(fatal_rx: &mut mpsc::Receiver<String>) -> i32 {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received");
                0
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                0
            }
            reason = fatal_rx.recv() => {
                error!(reason = %reason.unwrap_or_default(), "fatal broker failure");
                2
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received");
                0
            }
            reason = fatal_rx.recv() => {
                error!(reason = %reason.unwrap_or_default(), "fatal broker failure");
                2
            }
        }
    }
}

/// Decode spot events off the session's event channel and route them to the
/// owning aggregators.
async fn dispatch_spot_events(
    mut rx: mpsc::Receiver<Envelope>,
    multiplexer: Arc<SpotMultiplexer>,
) {
    while let Some(envelope) = rx.recv().await {
        match envelope.decode_as::<codec::messages::ProtoOaSpotEvent>() {
            Ok(event) => multiplexer.route_spot(&event),
            Err(e) => warn!(error = %e, "undecodable spot event"),
        }
    }
}

/// React to broker link transitions: invalidate the catalog when the link
/// drops; replay subscriptions and re-warm the watchlist when it returns.
async fn supervise_broker_status(
    mut status: watch::Receiver<BrokerStatus>,
    catalog: Arc<SymbolCatalog>,
    multiplexer: Arc<SpotMultiplexer>,
    watchlist: Vec<String>,
) {
    loop {
        if status.changed().await.is_err() {
            return;
        }
        let current_status = *status.borrow_and_update();
        match current_status {
            BrokerStatus::Down => {
                warn!("broker link down");
                catalog.invalidate();
            }
            BrokerStatus::Up => {
                info!("broker link up");
                multiplexer.resubscribe_all().await;
                for symbol in &watchlist {
                    if let Err(e) = catalog.ensure_metadata(symbol).await {
                        warn!(symbol = %symbol, error = %e, "watchlist warm-up failed");
                    }
                }
            }
        }
    }
}

/// Periodic operational log line; only written when something moved.
async fn log_counters(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
    let mut last_total = 0u64;
    loop {
        interval.tick().await;
        let snap = state.counters.snapshot();
        let total = snap.dropped_ticks
            + snap.rejected_ticks
            + snap.coalesced_ticks
            + snap.protocol_errors
            + snap.broker_reconnects
            + snap.slow_consumer_disconnects;
        if total != last_total {
            info!(
                clients = snap.clients_connected,
                active_symbols = state.multiplexer.active_count(),
                dropped_ticks = snap.dropped_ticks,
                rejected_ticks = snap.rejected_ticks,
                coalesced_ticks = snap.coalesced_ticks,
                protocol_errors = snap.protocol_errors,
                broker_reconnects = snap.broker_reconnects,
                slow_consumers = snap.slow_consumer_disconnects,
                "data-plane counters"
            );
            last_total = total;
        }
    }
}
