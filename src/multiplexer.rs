// =============================================================================
// Subscription Multiplexer — refcounted broker spot subscriptions
// =============================================================================
//
// Guarantees at most one broker SUBSCRIBE_SPOTS per symbol no matter how many
// clients ask for it. The first acquire creates a pending slot, performs the
// broker subscribe exactly once, spawns the aggregator, and kicks off the
// priming fetch; concurrent acquirers of the same symbol park on the pending
// slot and converge on the same aggregator. Refcount zero tears everything
// down and unsubscribes at the broker.
//
// The registry mutex guards only map lookups and refcount edits, never a
// broker round trip.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregator::task::{spawn_aggregator, AggregatorHandle};
use crate::app_state::Counters;
use crate::broker::BrokerSession;
use crate::catalog::SymbolCatalog;
use crate::codec::messages::{
    price_from_wire, ProtoOaGetTrendbarsReq, ProtoOaGetTrendbarsRes, ProtoOaSpotEvent,
    ProtoOaSubscribeLiveTrendbarReq, ProtoOaSubscribeLiveTrendbarRes, ProtoOaSubscribeSpotsReq,
    ProtoOaSubscribeSpotsRes, ProtoOaUnsubscribeLiveTrendbarReq, ProtoOaUnsubscribeLiveTrendbarRes,
    ProtoOaUnsubscribeSpotsReq, ProtoOaUnsubscribeSpotsRes, TrendbarPeriod,
};
use crate::error::{CatalogError, SessionError};
use crate::runtime_config::AggregatorSettings;
use crate::types::{Bar, SpotTick, SymbolInfo};

/// Delay between priming attempts after a failed trend-bar fetch.
const PRIMING_RETRY: Duration = Duration::from_secs(5);

/// Why an acquire failed. `UnknownSymbol` maps to the gateway's
/// `unknown_symbol` error; the rest surface as `subscribe_failed`.
#[derive(Debug, Clone, Error)]
pub enum AcquireError {
    #[error("symbol {0:?} is not offered by the broker")]
    UnknownSymbol(String),

    #[error("broker subscribe failed: {0}")]
    Subscribe(SessionError),
}

impl From<CatalogError> for AcquireError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound(name) => Self::UnknownSymbol(name),
            CatalogError::Session(s) => Self::Subscribe(s),
        }
    }
}

#[derive(Clone)]
enum PendingOutcome {
    InFlight,
    Success,
    Failed(AcquireError),
}

struct PendingSlot {
    outcome_tx: watch::Sender<PendingOutcome>,
    /// Acquirers that arrived while the creator was subscribing; folded into
    /// the live refcount on success.
    extra_refs: AtomicUsize,
}

struct LiveSlot {
    refcount: usize,
    symbol: Arc<SymbolInfo>,
    handle: AggregatorHandle,
    task: JoinHandle<()>,
}

enum Slot {
    Pending(Arc<PendingSlot>),
    Live(LiveSlot),
}

pub struct SpotMultiplexer {
    session: Arc<BrokerSession>,
    catalog: Arc<SymbolCatalog>,
    settings: AggregatorSettings,
    counters: Arc<Counters>,

    slots: Mutex<HashMap<String, Slot>>,
    /// Symbol-id routing table for the broker event path.
    by_id: Mutex<HashMap<i64, AggregatorHandle>>,
}

impl SpotMultiplexer {
    pub fn new(
        session: Arc<BrokerSession>,
        catalog: Arc<SymbolCatalog>,
        settings: AggregatorSettings,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            session,
            catalog,
            settings,
            counters,
            slots: Mutex::new(HashMap::new()),
            by_id: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live symbol subscriptions.
    pub fn active_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| matches!(s, Slot::Live(_)))
            .count()
    }

    /// Names and ids of every live subscription; drives the reconnect replay.
    pub fn snapshot_active_set(&self) -> Vec<(String, i64)> {
        self.slots
            .lock()
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Live(live) => Some((name.clone(), live.symbol.id)),
                Slot::Pending(_) => None,
            })
            .collect()
    }

    /// Current refcount for a symbol; zero when absent.
    pub fn refcount(&self, name: &str) -> usize {
        match self.slots.lock().get(&canonical(name)) {
            Some(Slot::Live(live)) => live.refcount,
            Some(Slot::Pending(p)) => 1 + p.extra_refs.load(Ordering::Relaxed),
            None => 0,
        }
    }

    // ── Acquire / release ───────────────────────────────────────────────

    pub async fn acquire(&self, name: &str) -> Result<AggregatorHandle, AcquireError> {
        let name = canonical(name);

        enum Entry {
            Existing(AggregatorHandle),
            Wait(watch::Receiver<PendingOutcome>),
            Create(Arc<PendingSlot>),
        }

        let entry = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&name) {
                Some(Slot::Live(live)) => {
                    live.refcount += 1;
                    Entry::Existing(live.handle.clone())
                }
                Some(Slot::Pending(pending)) => {
                    pending.extra_refs.fetch_add(1, Ordering::Relaxed);
                    Entry::Wait(pending.outcome_tx.subscribe())
                }
                None => {
                    let (outcome_tx, _) = watch::channel(PendingOutcome::InFlight);
                    let pending = Arc::new(PendingSlot {
                        outcome_tx,
                        extra_refs: AtomicUsize::new(0),
                    });
                    slots.insert(name.clone(), Slot::Pending(pending.clone()));
                    Entry::Create(pending)
                }
            }
        };

        match entry {
            Entry::Existing(handle) => {
                debug!(symbol = %name, "joined existing subscription");
                Ok(handle)
            }
            Entry::Wait(rx) => self.await_pending(&name, rx).await,
            Entry::Create(pending) => self.create_slot(&name, pending).await,
        }
    }

    async fn await_pending(
        &self,
        name: &str,
        mut rx: watch::Receiver<PendingOutcome>,
    ) -> Result<AggregatorHandle, AcquireError> {
        loop {
            let outcome = rx.borrow().clone();
            match outcome {
                PendingOutcome::InFlight => {
                    if rx.changed().await.is_err() {
                        return Err(AcquireError::Subscribe(SessionError::Disconnected));
                    }
                }
                PendingOutcome::Success => {
                    let slots = self.slots.lock();
                    return match slots.get(name) {
                        Some(Slot::Live(live)) => Ok(live.handle.clone()),
                        _ => Err(AcquireError::Subscribe(SessionError::Disconnected)),
                    };
                }
                PendingOutcome::Failed(e) => return Err(e),
            }
        }
    }

    /// First-acquirer path: resolve metadata, subscribe at the broker once,
    /// spawn the aggregator and its priming fetch.
    async fn create_slot(
        &self,
        name: &str,
        pending: Arc<PendingSlot>,
    ) -> Result<AggregatorHandle, AcquireError> {
        let result = self.subscribe_at_broker(name).await;

        match result {
            Ok(info) => {
                let (handle, task) =
                    spawn_aggregator(info.clone(), self.settings.clone(), self.counters.clone());

                {
                    let mut slots = self.slots.lock();
                    let refcount = 1 + pending.extra_refs.load(Ordering::Relaxed);
                    slots.insert(
                        name.to_string(),
                        Slot::Live(LiveSlot {
                            refcount,
                            symbol: info.clone(),
                            handle: handle.clone(),
                            task,
                        }),
                    );
                    self.by_id.lock().insert(info.id, handle.clone());
                }
                let _ = pending.outcome_tx.send(PendingOutcome::Success);

                info!(symbol = %info.name, id = info.id, "spot subscription established");
                tokio::spawn(run_priming(
                    self.session.clone(),
                    info,
                    self.settings.clone(),
                    handle.clone(),
                ));
                Ok(handle)
            }
            Err(e) => {
                self.slots.lock().remove(name);
                let _ = pending.outcome_tx.send(PendingOutcome::Failed(e.clone()));
                warn!(symbol = %name, error = %e, "spot subscription failed");
                Err(e)
            }
        }
    }

    async fn subscribe_at_broker(&self, name: &str) -> Result<Arc<SymbolInfo>, AcquireError> {
        let info = self.catalog.ensure_metadata(name).await?;

        let req = ProtoOaSubscribeSpotsReq {
            ctid_trader_account_id: self.session.account_id(),
            symbol_id: vec![info.id],
            subscribe_to_spot_timestamp: Some(true),
        };
        let _: ProtoOaSubscribeSpotsRes = self
            .session
            .request(&req)
            .await
            .map_err(AcquireError::Subscribe)?;

        // Live bars drive session rollover. Losing them degrades rollover to
        // the next reconnect, so failures are logged, not fatal.
        for period in [TrendbarPeriod::D1, TrendbarPeriod::M1] {
            let req = ProtoOaSubscribeLiveTrendbarReq {
                ctid_trader_account_id: self.session.account_id(),
                period: period as i32,
                symbol_id: info.id,
            };
            if let Err(e) = self
                .session
                .request::<_, ProtoOaSubscribeLiveTrendbarRes>(&req)
                .await
            {
                warn!(symbol = %info.name, period = ?period, error = %e, "live trendbar subscribe failed");
            }
        }

        Ok(info)
    }

    /// Decrement a symbol's refcount; on zero, cancel the aggregator and
    /// unsubscribe at the broker. Bookkeeping completes before the broker
    /// ack: the caller's reply never waits on the wire.
    pub async fn release(&self, name: &str) {
        let name = canonical(name);
        let teardown = {
            let mut slots = self.slots.lock();
            let emptied = match slots.get_mut(&name) {
                Some(Slot::Live(live)) => {
                    live.refcount = live.refcount.saturating_sub(1);
                    live.refcount == 0
                }
                _ => {
                    warn!(symbol = %name, "release for a symbol with no live subscription");
                    false
                }
            };
            if emptied {
                match slots.remove(&name) {
                    Some(Slot::Live(live)) => {
                        self.by_id.lock().remove(&live.symbol.id);
                        Some(live)
                    }
                    _ => None,
                }
            } else {
                None
            }
        };

        if let Some(live) = teardown {
            live.task.abort();
            info!(symbol = %live.symbol.name, "spot subscription released");

            let session = self.session.clone();
            let symbol = live.symbol.clone();
            tokio::spawn(async move {
                for period in [TrendbarPeriod::D1, TrendbarPeriod::M1] {
                    let req = ProtoOaUnsubscribeLiveTrendbarReq {
                        ctid_trader_account_id: session.account_id(),
                        period: period as i32,
                        symbol_id: symbol.id,
                    };
                    if let Err(e) = session
                        .request::<_, ProtoOaUnsubscribeLiveTrendbarRes>(&req)
                        .await
                    {
                        debug!(symbol = %symbol.name, error = %e, "live trendbar unsubscribe failed");
                    }
                }
                let req = ProtoOaUnsubscribeSpotsReq {
                    ctid_trader_account_id: session.account_id(),
                    symbol_id: vec![symbol.id],
                };
                match session.request::<_, ProtoOaUnsubscribeSpotsRes>(&req).await {
                    Ok(_) => debug!(symbol = %symbol.name, "broker unsubscribe acked"),
                    Err(e) => warn!(symbol = %symbol.name, error = %e, "broker unsubscribe failed"),
                }
            });
        }
    }

    // ── Broker event routing ────────────────────────────────────────────

    /// Route a decoded spot event to its aggregator: the quote becomes a
    /// ring tick, embedded trend bars become bar commands.
    pub fn route_spot(&self, event: &ProtoOaSpotEvent) {
        let handle = self.by_id.lock().get(&event.symbol_id).cloned();
        let Some(handle) = handle else {
            // Late events after release are expected during unsubscribe.
            debug!(symbol_id = event.symbol_id, "spot event for inactive symbol");
            return;
        };

        if event.bid.is_some() || event.ask.is_some() {
            handle.push_tick(SpotTick {
                bid: event.bid.map(price_from_wire),
                ask: event.ask.map(price_from_wire),
                timestamp_ms: event
                    .timestamp
                    .unwrap_or_else(|| Utc::now().timestamp_millis()),
            });
        }

        for tb in &event.trendbar {
            if let Some(bar) = tb.to_bar() {
                match tb.period_value() {
                    TrendbarPeriod::D1 => handle.push_bar(bar, true),
                    TrendbarPeriod::M1 => handle.push_bar(bar, false),
                    _ => {}
                }
            }
        }
    }

    /// Re-issue every live subscription after a broker reconnect, exactly
    /// once per symbol.
    pub async fn resubscribe_all(&self) {
        let active = self.snapshot_active_set();
        if active.is_empty() {
            return;
        }
        info!(count = active.len(), "replaying spot subscriptions after reconnect");

        for (name, id) in active {
            let req = ProtoOaSubscribeSpotsReq {
                ctid_trader_account_id: self.session.account_id(),
                symbol_id: vec![id],
                subscribe_to_spot_timestamp: Some(true),
            };
            match self
                .session
                .request::<_, ProtoOaSubscribeSpotsRes>(&req)
                .await
            {
                Ok(_) => debug!(symbol = %name, "re-subscribed"),
                Err(e) => error!(symbol = %name, error = %e, "re-subscribe failed"),
            }
            for period in [TrendbarPeriod::D1, TrendbarPeriod::M1] {
                let req = ProtoOaSubscribeLiveTrendbarReq {
                    ctid_trader_account_id: self.session.account_id(),
                    period: period as i32,
                    symbol_id: id,
                };
                if let Err(e) = self
                    .session
                    .request::<_, ProtoOaSubscribeLiveTrendbarRes>(&req)
                    .await
                {
                    debug!(symbol = %name, period = ?period, error = %e, "live trendbar re-subscribe failed");
                }
            }
        }
    }
}

// =============================================================================
// Priming fetch
// =============================================================================

/// Fetch the seed bars for a fresh aggregator and deliver them as a Prime
/// command. Retries every five seconds until the fetch succeeds or the
/// aggregator is released; subscribers keep their connections and wait.
async fn run_priming(
    session: Arc<BrokerSession>,
    symbol: Arc<SymbolInfo>,
    settings: AggregatorSettings,
    handle: AggregatorHandle,
) {
    let mut attempt: u32 = 0;
    loop {
        if handle.is_closed() {
            return;
        }
        attempt += 1;
        match fetch_priming_bars(&session, &symbol, &settings).await {
            Ok((daily, minute)) => {
                debug!(
                    symbol = %symbol.name,
                    daily = daily.len(),
                    minute = minute.len(),
                    "priming bars fetched"
                );
                handle.prime(daily, minute).await;
                return;
            }
            Err(e) => {
                warn!(symbol = %symbol.name, attempt, error = %e, "priming fetch failed; retrying");
                tokio::time::sleep(PRIMING_RETRY).await;
            }
        }
    }
}

async fn fetch_priming_bars(
    session: &Arc<BrokerSession>,
    symbol: &Arc<SymbolInfo>,
    settings: &AggregatorSettings,
) -> Result<(Vec<Bar>, Vec<Bar>), SessionError> {
    let now_ms = Utc::now().timestamp_millis();

    // Daily window: enough calendar days to cover the ADR window across
    // weekends and holidays, plus the current session.
    let lookback_days = (settings.adr_window_days as i64 + 1) * 2 + 3;
    let daily_req = ProtoOaGetTrendbarsReq {
        ctid_trader_account_id: session.account_id(),
        from_timestamp: now_ms - lookback_days * 86_400_000,
        to_timestamp: now_ms,
        period: TrendbarPeriod::D1 as i32,
        symbol_id: symbol.id,
        count: Some(settings.adr_window_days as u32 + 1),
    };
    let daily_res: ProtoOaGetTrendbarsRes = session.request(&daily_req).await?;
    let mut daily: Vec<Bar> = daily_res.trendbar.iter().filter_map(|tb| tb.to_bar()).collect();
    daily.sort_by_key(|b| b.timestamp_ms);

    // Minute bars from the current session's open onward.
    let session_open_ms = daily.last().map_or(now_ms - 86_400_000, |b| b.timestamp_ms);
    let minute_req = ProtoOaGetTrendbarsReq {
        ctid_trader_account_id: session.account_id(),
        from_timestamp: session_open_ms,
        to_timestamp: now_ms,
        period: TrendbarPeriod::M1 as i32,
        symbol_id: symbol.id,
        count: None,
    };
    let minute_res: ProtoOaGetTrendbarsRes = session.request(&minute_req).await?;
    let mut minute: Vec<Bar> = minute_res
        .trendbar
        .iter()
        .filter_map(|tb| tb.to_bar())
        .collect();
    minute.sort_by_key(|b| b.timestamp_ms);

    Ok((daily, minute))
}

fn canonical(name: &str) -> String {
    name.trim().to_uppercase()
}
