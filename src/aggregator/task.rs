// =============================================================================
// Aggregator task — single owner of one symbol's state
// =============================================================================
//
// Each subscribed symbol runs one task consuming two inboxes:
//   - a lock-free tick ring (capacity 1024, drop-oldest under pressure), fed
//     straight from the broker dispatch path;
//   - a bounded command channel for everything that must not be dropped
//     (priming, bars, attach/detach, settings).
//
// The task alone mutates `SymbolState`. Fan-out publishes immutable payloads
// into each listener's outbound queue without blocking, so one slow client
// can never stall the tick path. A listener that attaches before priming
// completes receives its snapshot the moment the state turns ready, always
// ahead of any tick on that queue.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregator::state::{SymbolState, TickOutcome};
use crate::app_state::Counters;
use crate::gateway::outbound::OutboundQueue;
use crate::gateway::protocol::ServerMessage;
use crate::runtime_config::AggregatorSettings;
use crate::types::{Bar, SpotTick, SymbolInfo};

/// Broker-to-aggregator tick buffer depth.
const TICK_RING_CAPACITY: usize = 1024;
/// Command inbox depth; commands are rare and never dropped.
const COMMAND_CAPACITY: usize = 64;
/// Volatility decay cadence during quiet markets.
const TOCK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

pub type ListenerId = u64;

/// Everything except raw ticks flows through the command inbox.
pub enum AggregatorCommand {
    /// Historical bars from the priming fetch: daily ascending (last one is
    /// the current session), then the current session's minute bars.
    Prime { daily: Vec<Bar>, minute: Vec<Bar> },
    DailyBar(Bar),
    MinuteBar(Bar),
    Settings(AggregatorSettings),
    Attach {
        id: ListenerId,
        queue: Arc<OutboundQueue>,
    },
    Detach {
        id: ListenerId,
    },
}

/// Drop-oldest ring between the broker dispatch path and the task.
#[derive(Debug)]
struct TickRing {
    queue: ArrayQueue<SpotTick>,
    notify: Notify,
    dropped: AtomicU64,
}

/// Cheap clonable handle to a running aggregator.
#[derive(Clone, Debug)]
pub struct AggregatorHandle {
    symbol: Arc<SymbolInfo>,
    cmd_tx: mpsc::Sender<AggregatorCommand>,
    ring: Arc<TickRing>,
    ready: Arc<AtomicBool>,
}

impl AggregatorHandle {
    pub fn symbol(&self) -> &Arc<SymbolInfo> {
        &self.symbol
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Push a raw tick without blocking. Under pressure the oldest queued
    /// tick is displaced; running state stays correct because tick state is
    /// cumulative.
    pub fn push_tick(&self, tick: SpotTick) {
        if self.ring.queue.force_push(tick).is_some() {
            self.ring.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ring.notify.notify_one();
    }

    /// Push a live bar from the broker dispatch path. Bars are rare; a full
    /// command inbox here means the task is wedged, so the bar is dropped
    /// with a warning rather than blocking the dispatch path.
    pub fn push_bar(&self, bar: Bar, daily: bool) {
        let cmd = if daily {
            AggregatorCommand::DailyBar(bar)
        } else {
            AggregatorCommand::MinuteBar(bar)
        };
        if self.cmd_tx.try_send(cmd).is_err() {
            warn!(symbol = %self.symbol.name, "aggregator command inbox full; bar dropped");
        }
    }

    pub async fn attach(&self, id: ListenerId, queue: Arc<OutboundQueue>) {
        let _ = self.cmd_tx.send(AggregatorCommand::Attach { id, queue }).await;
    }

    pub async fn detach(&self, id: ListenerId) {
        let _ = self.cmd_tx.send(AggregatorCommand::Detach { id }).await;
    }

    pub async fn prime(&self, daily: Vec<Bar>, minute: Vec<Bar>) {
        let _ = self
            .cmd_tx
            .send(AggregatorCommand::Prime { daily, minute })
            .await;
    }

    pub async fn update_settings(&self, settings: AggregatorSettings) {
        let _ = self
            .cmd_tx
            .send(AggregatorCommand::Settings(settings))
            .await;
    }

    /// True when the task is gone (released); the priming retry loop uses
    /// this to stop.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }
}

/// Spawn the owner task for one symbol. The returned join handle is held by
/// the multiplexer and aborted when the refcount reaches zero.
pub fn spawn_aggregator(
    symbol: Arc<SymbolInfo>,
    settings: AggregatorSettings,
    counters: Arc<Counters>,
) -> (AggregatorHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let ring = Arc::new(TickRing {
        queue: ArrayQueue::new(TICK_RING_CAPACITY),
        notify: Notify::new(),
        dropped: AtomicU64::new(0),
    });
    let ready = Arc::new(AtomicBool::new(false));

    let handle = AggregatorHandle {
        symbol: symbol.clone(),
        cmd_tx,
        ring: ring.clone(),
        ready: ready.clone(),
    };

    let task = tokio::spawn(run_aggregator(symbol, settings, counters, cmd_rx, ring, ready));
    (handle, task)
}

async fn run_aggregator(
    symbol: Arc<SymbolInfo>,
    settings: AggregatorSettings,
    counters: Arc<Counters>,
    mut cmd_rx: mpsc::Receiver<AggregatorCommand>,
    ring: Arc<TickRing>,
    ready: Arc<AtomicBool>,
) {
    let mut state = SymbolState::new(symbol.clone(), settings);
    let mut listeners: HashMap<ListenerId, Arc<OutboundQueue>> = HashMap::new();
    let mut tock = tokio::time::interval(TOCK_INTERVAL);
    tock.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(symbol = %symbol.name, "aggregator started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    AggregatorCommand::Prime { daily, minute } => {
                        state.apply_prime(&daily, &minute);
                        ready.store(true, Ordering::Release);
                        let pkg = state.snapshot();
                        for queue in listeners.values() {
                            queue.push_control(ServerMessage::SymbolDataPackage(pkg.clone()));
                        }
                    }
                    AggregatorCommand::DailyBar(bar) => {
                        if state.apply_daily_bar(bar) {
                            // Rollover: clients need the reset session figures
                            // and the emptied profile.
                            let pkg = state.snapshot();
                            for queue in listeners.values() {
                                queue.push_control(ServerMessage::SymbolDataPackage(pkg.clone()));
                            }
                        }
                    }
                    AggregatorCommand::MinuteBar(bar) => state.apply_minute_bar(bar),
                    AggregatorCommand::Settings(settings) => state.update_settings(settings),
                    AggregatorCommand::Attach { id, queue } => {
                        if state.is_ready() {
                            queue.push_control(ServerMessage::SymbolDataPackage(state.snapshot()));
                        }
                        listeners.insert(id, queue);
                    }
                    AggregatorCommand::Detach { id } => {
                        listeners.remove(&id);
                    }
                }
            }
            _ = ring.notify.notified() => {
                while let Some(tick) = ring.queue.pop() {
                    match state.apply_tick(tick) {
                        TickOutcome::Update(update) => {
                            if !state.is_ready() {
                                // Snapshot-first ordering: no ticks reach a
                                // listener before its symbolDataPackage.
                                continue;
                            }
                            let update = Arc::new(update);
                            for queue in listeners.values() {
                                queue.push_tick(update.clone());
                            }
                        }
                        TickOutcome::Incomplete => {}
                        TickOutcome::Rejected => {
                            counters.rejected_ticks.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                let dropped = ring.dropped.swap(0, Ordering::Relaxed);
                if dropped > 0 {
                    counters.dropped_ticks.fetch_add(dropped, Ordering::Relaxed);
                    debug!(symbol = %symbol.name, dropped, "tick ring displaced old ticks");
                }
            }
            _ = tock.tick() => {
                state.on_tock(chrono::Utc::now().timestamp_millis());
            }
        }
    }

    info!(symbol = %symbol.name, "aggregator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::outbound::{Drain, Outbound};
    use std::time::Instant;

    fn eurusd() -> Arc<SymbolInfo> {
        Arc::new(SymbolInfo {
            id: 1,
            name: "EURUSD".into(),
            digits: 5,
            pip_position: 4,
        })
    }

    fn daily(day: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp_ms: day * 86_400_000,
            open,
            high,
            low,
            close,
            volume: 100,
        }
    }

    fn priming_bars() -> (Vec<Bar>, Vec<Bar>) {
        let days = vec![
            daily(1, 1.0800, 1.0810, 1.0800, 1.0805),
            daily(2, 1.0805, 1.0818, 1.0805, 1.0810),
            daily(3, 1.0810, 1.0822, 1.0810, 1.0815),
            daily(4, 1.0815, 1.0830, 1.0815, 1.0820),
            daily(5, 1.0820, 1.0836, 1.0820, 1.0825),
            daily(6, 1.0825, 1.0828, 1.0824, 1.0826),
        ];
        let minute = vec![Bar {
            timestamp_ms: 6 * 86_400_000,
            open: 1.0825,
            high: 1.0828,
            low: 1.0824,
            close: 1.0826,
            volume: 5,
        }];
        (days, minute)
    }

    fn tick(bid: f64, ask: f64, ts: i64) -> SpotTick {
        SpotTick {
            bid: Some(bid),
            ask: Some(ask),
            timestamp_ms: ts,
        }
    }

    async fn drain_one(queue: &OutboundQueue) -> Outbound {
        for _ in 0..100 {
            match queue.pop_ready(Instant::now()) {
                Drain::Message(m) => return m,
                Drain::Wait(_) => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
                Drain::Closed => panic!("queue closed"),
            }
        }
        panic!("no message arrived");
    }

    #[tokio::test]
    async fn snapshot_precedes_ticks_for_attached_listener() {
        let counters = Arc::new(Counters::default());
        let (handle, task) =
            spawn_aggregator(eurusd(), AggregatorSettings::default(), counters.clone());

        let queue = Arc::new(OutboundQueue::new(counters));
        handle.attach(1, queue.clone()).await;

        // Ticks before priming must not reach the listener.
        handle.push_tick(tick(1.0826, 1.0828, 6 * 86_400_000 + 1_000));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(queue.pop_ready(Instant::now()), Drain::Wait(None)));

        let (days, minute) = priming_bars();
        handle.prime(days, minute).await;

        match drain_one(&queue).await {
            Outbound::Control(ServerMessage::SymbolDataPackage(pkg)) => {
                assert_eq!(pkg.symbol, "EURUSD");
                assert!(pkg.projected_adr_high > pkg.projected_adr_low);
            }
            other => panic!("expected snapshot first, got {other:?}"),
        }

        handle.push_tick(tick(1.0827, 1.0829, 6 * 86_400_000 + 2_000));
        match drain_one(&queue).await {
            Outbound::Tick { update, .. } => {
                assert!((update.mid - 1.0828).abs() < 1e-9);
            }
            other => panic!("expected tick after snapshot, got {other:?}"),
        }

        task.abort();
    }

    #[tokio::test]
    async fn late_attacher_gets_snapshot_immediately() {
        let counters = Arc::new(Counters::default());
        let (handle, task) =
            spawn_aggregator(eurusd(), AggregatorSettings::default(), counters.clone());

        let (days, minute) = priming_bars();
        handle.prime(days, minute).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(handle.is_ready());

        let queue = Arc::new(OutboundQueue::new(counters));
        handle.attach(7, queue.clone()).await;

        match drain_one(&queue).await {
            Outbound::Control(ServerMessage::SymbolDataPackage(_)) => {}
            other => panic!("expected snapshot on attach, got {other:?}"),
        }

        task.abort();
    }

    #[tokio::test]
    async fn detached_listener_stops_receiving() {
        let counters = Arc::new(Counters::default());
        let (handle, task) =
            spawn_aggregator(eurusd(), AggregatorSettings::default(), counters.clone());

        let (days, minute) = priming_bars();
        handle.prime(days, minute).await;

        let queue = Arc::new(OutboundQueue::new(counters));
        handle.attach(1, queue.clone()).await;
        let _ = drain_one(&queue).await; // snapshot

        handle.detach(1).await;
        handle.push_tick(tick(1.0827, 1.0829, 6 * 86_400_000 + 2_000));
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(matches!(queue.pop_ready(Instant::now()), Drain::Wait(None)));

        task.abort();
    }

    #[tokio::test]
    async fn rollover_pushes_fresh_snapshot() {
        let counters = Arc::new(Counters::default());
        let (handle, task) =
            spawn_aggregator(eurusd(), AggregatorSettings::default(), counters.clone());

        let (days, minute) = priming_bars();
        handle.prime(days, minute).await;

        let queue = Arc::new(OutboundQueue::new(counters));
        handle.attach(1, queue.clone()).await;
        let _ = drain_one(&queue).await; // initial snapshot

        handle.push_tick(tick(1.0826, 1.0828, 6 * 86_400_000 + 1_000));
        let _ = drain_one(&queue).await; // the tick

        handle.push_bar(daily(7, 1.0830, 1.0830, 1.0830, 1.0830), true);
        match drain_one(&queue).await {
            Outbound::Control(ServerMessage::SymbolDataPackage(pkg)) => {
                assert!((pkg.todays_open - 1.0830).abs() < 1e-9);
                assert!(pkg.market_profile.levels.is_empty());
                assert!((pkg.previous_close - 1.0827).abs() < 1e-9);
            }
            other => panic!("expected rollover snapshot, got {other:?}"),
        }

        task.abort();
    }

    #[tokio::test]
    async fn settings_update_reshapes_the_adr() {
        let counters = Arc::new(Counters::default());
        let (handle, task) =
            spawn_aggregator(eurusd(), AggregatorSettings::default(), counters.clone());

        let (days, minute) = priming_bars();
        handle.prime(days, minute).await;

        let queue = Arc::new(OutboundQueue::new(counters));
        handle.attach(1, queue.clone()).await;
        let first = match drain_one(&queue).await {
            Outbound::Control(ServerMessage::SymbolDataPackage(pkg)) => pkg,
            other => panic!("expected snapshot, got {other:?}"),
        };

        // Shrink the window to the most recent two completed sessions; the
        // next snapshot reflects the new band width.
        let mut narrower = AggregatorSettings::default();
        narrower.adr_window_days = 2;
        handle.update_settings(narrower).await;

        handle.push_bar(daily(7, 1.0830, 1.0830, 1.0830, 1.0830), true);
        let second = match drain_one(&queue).await {
            Outbound::Control(ServerMessage::SymbolDataPackage(pkg)) => pkg,
            other => panic!("expected rollover snapshot, got {other:?}"),
        };

        let first_band = first.projected_adr_high - first.projected_adr_low;
        let second_band = second.projected_adr_high - second.projected_adr_low;
        assert!(first_band > 0.0);
        assert!(second_band > 0.0);
        assert!((first_band - second_band).abs() > 1e-9);

        task.abort();
    }

    #[tokio::test]
    async fn ring_overflow_counts_dropped_ticks() {
        let counters = Arc::new(Counters::default());
        let (handle, task) =
            spawn_aggregator(eurusd(), AggregatorSettings::default(), counters.clone());

        // The task may be draining concurrently; force_push far beyond the
        // ring capacity so displacement is certain.
        for i in 0..(TICK_RING_CAPACITY * 3) {
            handle.push_tick(tick(1.0826, 1.0828, i as i64));
        }
        // Displacement happened on the producer side even if the consumer
        // later drains everything.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(
            handle.dropped_ticks() + counters.dropped_ticks.load(Ordering::Relaxed) > 0
        );

        task.abort();
    }
}
