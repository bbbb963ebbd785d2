// =============================================================================
// Central Application State — Meridian FX Nexus
// =============================================================================
//
// Wires the singletons together in dependency order (session -> catalog ->
// multiplexer) and carries the process-wide data-plane counters. Everything
// here is either immutable after startup or atomic; per-symbol state lives
// exclusively inside its aggregator task.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;

use crate::broker::BrokerSession;
use crate::catalog::SymbolCatalog;
use crate::gateway::protocol::SymbolListEntry;
use crate::multiplexer::SpotMultiplexer;
use crate::runtime_config::RuntimeConfig;
use crate::types::BrokerStatus;

// =============================================================================
// Counters
// =============================================================================

/// Process-wide data-plane counters. Data-plane errors never crash the
/// process; they land here and in the logs.
#[derive(Debug, Default)]
pub struct Counters {
    /// Ticks displaced from aggregator rings under load.
    pub dropped_ticks: AtomicU64,
    /// Ticks rejected as malformed or stale.
    pub rejected_ticks: AtomicU64,
    /// Client-side tick frames replaced by a newer tick before emission.
    pub coalesced_ticks: AtomicU64,
    /// Broker events dropped at the dispatch seam (full handler channel).
    pub dropped_events: AtomicU64,
    /// Malformed broker frames dropped without killing the session.
    pub protocol_errors: AtomicU64,
    /// Responses that arrived after their waiter gave up.
    pub orphan_responses: AtomicU64,
    /// Broker payload types the registry does not know.
    pub unknown_messages: AtomicU64,
    /// Completed broker connection attempts that ended in reconnect.
    pub broker_reconnects: AtomicU64,
    /// Clients disconnected for not draining their queue.
    pub slow_consumer_disconnects: AtomicU64,
    /// Client frames that failed JSON parsing.
    pub bad_client_frames: AtomicU64,
    /// Currently connected WebSocket clients.
    pub clients_connected: AtomicU64,
}

/// Point-in-time copy of [`Counters`] for the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    pub dropped_ticks: u64,
    pub rejected_ticks: u64,
    pub coalesced_ticks: u64,
    pub dropped_events: u64,
    pub protocol_errors: u64,
    pub orphan_responses: u64,
    pub unknown_messages: u64,
    pub broker_reconnects: u64,
    pub slow_consumer_disconnects: u64,
    pub bad_client_frames: u64,
    pub clients_connected: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            dropped_ticks: self.dropped_ticks.load(Ordering::Relaxed),
            rejected_ticks: self.rejected_ticks.load(Ordering::Relaxed),
            coalesced_ticks: self.coalesced_ticks.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            orphan_responses: self.orphan_responses.load(Ordering::Relaxed),
            unknown_messages: self.unknown_messages.load(Ordering::Relaxed),
            broker_reconnects: self.broker_reconnects.load(Ordering::Relaxed),
            slow_consumer_disconnects: self.slow_consumer_disconnects.load(Ordering::Relaxed),
            bad_client_frames: self.bad_client_frames.load(Ordering::Relaxed),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: RuntimeConfig,
    pub session: Arc<BrokerSession>,
    pub catalog: Arc<SymbolCatalog>,
    pub multiplexer: Arc<SpotMultiplexer>,
    pub counters: Arc<Counters>,

    /// Broker link status observed by every client connection.
    pub broker_status: watch::Receiver<BrokerStatus>,
    /// Flipped once at graceful shutdown; connections close with 1001.
    pub shutdown: watch::Receiver<bool>,

    pub start_time: Instant,
    next_listener_id: AtomicU64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        session: Arc<BrokerSession>,
        catalog: Arc<SymbolCatalog>,
        multiplexer: Arc<SpotMultiplexer>,
        counters: Arc<Counters>,
        broker_status: watch::Receiver<BrokerStatus>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            session,
            catalog,
            multiplexer,
            counters,
            broker_status,
            shutdown,
            start_time: Instant::now(),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Unique id for a client connection's listener registrations.
    pub fn next_listener_id(&self) -> u64 {
        self.next_listener_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Entries for the `symbolList` hello and the REST mirror: every symbol
    /// with resolved metadata.
    pub fn symbol_entries(&self) -> Vec<SymbolListEntry> {
        self.catalog
            .known_symbols()
            .into_iter()
            .map(|s| SymbolListEntry {
                name: s.name.clone(),
                digits: s.digits,
                pip_position: s.pip_position,
            })
            .collect()
    }

    pub fn health_snapshot(&self) -> HealthResponse {
        HealthResponse {
            status: "ok",
            broker: *self.broker_status.borrow(),
            broker_session_state: format!("{:?}", self.session.state()),
            active_symbols: self.multiplexer.active_count(),
            watchlist: self.config.symbols.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time_ms: chrono::Utc::now().timestamp_millis(),
            counters: self.counters.snapshot(),
        }
    }
}

/// Payload of `GET /healthz`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker: BrokerStatus,
    pub broker_session_state: String,
    pub active_symbols: usize,
    pub watchlist: Vec<String>,
    pub uptime_secs: u64,
    pub server_time_ms: i64,
    pub counters: CountersSnapshot,
}
