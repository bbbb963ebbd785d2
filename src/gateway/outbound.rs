// =============================================================================
// Per-connection outbound queue with tick coalescing
// =============================================================================
//
// Aggregator fan-out publishes here non-blockingly; the connection's writer
// task drains. Control messages (snapshots, errors, pongs) keep FIFO order
// and are never dropped. Ticks keep at most one pending entry per symbol:
// a newer tick replaces the pending one, merging the changed-bucket deltas so
// coalescing loses granularity but never profile totals.
//
// Emission is paced to at most one tick per symbol per 16 ms. A queue that
// stays at capacity for over five seconds while control messages keep
// arriving marks the connection a slow consumer; the writer closes it.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::aggregator::profile::ProfileDeltaLevel;
use crate::aggregator::state::TickUpdate;
use crate::app_state::Counters;
use crate::gateway::protocol::ServerMessage;

/// Shared capacity across pending control messages and coalesced ticks.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Minimum spacing between tick emissions per symbol (~60 Hz).
pub const TICK_MIN_INTERVAL: Duration = Duration::from_millis(16);

/// How long the queue may sit at capacity before the connection is declared
/// a slow consumer.
const FULL_QUEUE_LIMIT: Duration = Duration::from_secs(5);

/// What the writer should send next.
#[derive(Debug)]
pub enum Outbound {
    Control(ServerMessage),
    /// Shared update plus the merged profile delta accumulated while the
    /// tick sat in the queue (None when nothing was coalesced over it).
    Tick {
        update: Arc<TickUpdate>,
        merged_delta: Option<Vec<ProfileDeltaLevel>>,
    },
}

/// Outcome of a `pop_ready` poll.
#[derive(Debug)]
pub enum Drain {
    Message(Outbound),
    /// Nothing eligible yet; wake after the given pause (None: wait for a
    /// push notification).
    Wait(Option<Duration>),
    /// The queue was closed (slow consumer or connection teardown).
    Closed,
}

struct PendingTick {
    update: Arc<TickUpdate>,
    /// Union of bucket deltas across coalesced ticks, latest totals winning.
    merged_delta: Option<Vec<ProfileDeltaLevel>>,
    coalesced: bool,
}

struct Inner {
    control: VecDeque<ServerMessage>,
    ticks: HashMap<String, PendingTick>,
    /// Symbols with a pending tick, in arrival order.
    tick_order: VecDeque<String>,
    last_emit: HashMap<String, Instant>,
    full_since: Option<Instant>,
    closed: bool,
}

impl Inner {
    fn len(&self) -> usize {
        self.control.len() + self.ticks.len()
    }
}

pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    counters: Arc<Counters>,
}

impl OutboundQueue {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                control: VecDeque::new(),
                ticks: HashMap::new(),
                tick_order: VecDeque::new(),
                last_emit: HashMap::new(),
                full_since: None,
                closed: false,
            }),
            notify: Notify::new(),
            counters,
        }
    }

    /// Queue a control message. Never dropped; pushing past capacity starts
    /// the slow-consumer clock instead.
    pub fn push_control(&self, msg: ServerMessage) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            if inner.len() >= OUTBOUND_CAPACITY {
                let since = *inner.full_since.get_or_insert_with(Instant::now);
                if since.elapsed() > FULL_QUEUE_LIMIT {
                    inner.closed = true;
                    self.counters
                        .slow_consumer_disconnects
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            inner.control.push_back(msg);
        }
        self.notify.notify_one();
    }

    /// Publish a tick non-blockingly, replacing any pending tick for the
    /// same symbol (last-write-wins, deltas merged).
    pub fn push_tick(&self, update: Arc<TickUpdate>) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            let symbol = update.symbol.clone();
            if let Some(pending) = inner.ticks.get_mut(&symbol) {
                let merged = merge_deltas(
                    pending
                        .merged_delta
                        .take()
                        .or_else(|| pending.update.profile_delta.clone()),
                    update.profile_delta.as_deref(),
                );
                *pending = PendingTick {
                    update,
                    merged_delta: merged,
                    coalesced: true,
                };
                self.counters.coalesced_ticks.fetch_add(1, Ordering::Relaxed);
            } else {
                if inner.len() >= OUTBOUND_CAPACITY {
                    // Sacrifice the oldest pending tick of another symbol.
                    if let Some(victim) = inner.tick_order.pop_front() {
                        inner.ticks.remove(&victim);
                        self.counters.coalesced_ticks.fetch_add(1, Ordering::Relaxed);
                    } else {
                        // Entirely full of control messages; the tick loses.
                        self.counters.coalesced_ticks.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
                inner.ticks.insert(
                    symbol.clone(),
                    PendingTick {
                        update,
                        merged_delta: None,
                        coalesced: false,
                    },
                );
                inner.tick_order.push_back(symbol);
            }
        }
        self.notify.notify_one();
    }

    /// Pull the next message the writer may emit at `now`, honoring FIFO for
    /// control and the per-symbol tick pacing.
    pub fn pop_ready(&self, now: Instant) -> Drain {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Drain::Closed;
        }

        if let Some(msg) = inner.control.pop_front() {
            if inner.len() < OUTBOUND_CAPACITY {
                inner.full_since = None;
            }
            return Drain::Message(Outbound::Control(msg));
        }

        // First pending symbol whose pacing window elapsed.
        let mut earliest: Option<Duration> = None;
        let mut chosen: Option<usize> = None;
        for (pos, symbol) in inner.tick_order.iter().enumerate() {
            match inner.last_emit.get(symbol) {
                Some(last) => {
                    let since = now.saturating_duration_since(*last);
                    if since >= TICK_MIN_INTERVAL {
                        chosen = Some(pos);
                        break;
                    }
                    let wait = TICK_MIN_INTERVAL - since;
                    earliest = Some(earliest.map_or(wait, |e: Duration| e.min(wait)));
                }
                None => {
                    chosen = Some(pos);
                    break;
                }
            }
        }

        if let Some(pos) = chosen {
            let symbol = inner.tick_order.remove(pos).expect("position just found");
            let pending = inner.ticks.remove(&symbol).expect("order and map in sync");
            inner.last_emit.insert(symbol, now);
            if inner.len() < OUTBOUND_CAPACITY {
                inner.full_since = None;
            }
            let merged_delta = pending.coalesced.then_some(pending.merged_delta).flatten();
            return Drain::Message(Outbound::Tick {
                update: pending.update,
                merged_delta,
            });
        }

        if inner.tick_order.is_empty() {
            Drain::Wait(None)
        } else {
            Drain::Wait(earliest)
        }
    }

    /// True once the queue has been full past the slow-consumer limit.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Close from the connection side; pending content is discarded.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    /// Await a push notification.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Merge bucket deltas from a coalesced-over tick with the newer tick's
/// deltas. Values are cumulative totals, so the newer entry wins per price.
fn merge_deltas(
    older: Option<Vec<ProfileDeltaLevel>>,
    newer: Option<&[ProfileDeltaLevel]>,
) -> Option<Vec<ProfileDeltaLevel>> {
    match (older, newer) {
        (None, None) => None,
        (Some(old), None) => Some(old),
        (None, Some(new)) => Some(new.to_vec()),
        (Some(old), Some(new)) => {
            let mut merged: Vec<ProfileDeltaLevel> = old;
            for level in new {
                match merged.iter_mut().find(|l| l.price == level.price) {
                    Some(existing) => *existing = level.clone(),
                    None => merged.push(level.clone()),
                }
            }
            merged.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap());
            Some(merged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TickDirection;

    fn queue() -> OutboundQueue {
        OutboundQueue::new(Arc::new(Counters::default()))
    }

    fn tick(symbol: &str, mid: f64, delta_price: f64, volume: u64) -> Arc<TickUpdate> {
        Arc::new(TickUpdate {
            symbol: symbol.into(),
            bid: mid - 0.0001,
            ask: mid + 0.0001,
            mid,
            ts: 0,
            last_tick_direction: TickDirection::Up,
            todays_high: mid,
            todays_low: mid,
            volatility_pct: 0.0,
            profile_delta: Some(vec![ProfileDeltaLevel {
                price: delta_price,
                volume,
                buy_volume: volume,
                sell_volume: 0,
            }]),
        })
    }

    fn pong() -> ServerMessage {
        ServerMessage::Pong { server_time_ms: 0 }
    }

    #[test]
    fn control_before_ticks_in_fifo_order() {
        let q = queue();
        q.push_tick(tick("EURUSD", 1.0827, 1.0827, 1));
        q.push_control(pong());
        q.push_control(ServerMessage::Unsubscribed {
            symbol: "GBPUSD".into(),
        });

        let now = Instant::now();
        assert!(matches!(
            q.pop_ready(now),
            Drain::Message(Outbound::Control(ServerMessage::Pong { .. }))
        ));
        assert!(matches!(
            q.pop_ready(now),
            Drain::Message(Outbound::Control(ServerMessage::Unsubscribed { .. }))
        ));
        assert!(matches!(
            q.pop_ready(now),
            Drain::Message(Outbound::Tick { .. })
        ));
    }

    #[test]
    fn newer_tick_replaces_pending_same_symbol() {
        let q = queue();
        q.push_tick(tick("EURUSD", 1.0827, 1.0827, 1));
        q.push_tick(tick("EURUSD", 1.0829, 1.0829, 1));

        match q.pop_ready(Instant::now()) {
            Drain::Message(Outbound::Tick { update, merged_delta }) => {
                assert!((update.mid - 1.0829).abs() < 1e-9);
                // Both touched buckets survive the coalescing.
                let merged = merged_delta.expect("coalesced ticks carry merged deltas");
                assert_eq!(merged.len(), 2);
            }
            other => panic!("expected tick, got {other:?}"),
        }
        assert!(matches!(q.pop_ready(Instant::now()), Drain::Wait(None)));
    }

    #[test]
    fn merged_delta_takes_latest_totals_per_price() {
        let q = queue();
        q.push_tick(tick("EURUSD", 1.0827, 1.0827, 1));
        q.push_tick(tick("EURUSD", 1.0827, 1.0827, 2));
        q.push_tick(tick("EURUSD", 1.0827, 1.0827, 3));

        match q.pop_ready(Instant::now()) {
            Drain::Message(Outbound::Tick { merged_delta, .. }) => {
                let merged = merged_delta.unwrap();
                assert_eq!(merged.len(), 1);
                assert_eq!(merged[0].volume, 3);
            }
            other => panic!("expected tick, got {other:?}"),
        }
    }

    #[test]
    fn tick_pacing_respects_min_interval() {
        let q = queue();
        let t0 = Instant::now();

        q.push_tick(tick("EURUSD", 1.0827, 1.0827, 1));
        assert!(matches!(
            q.pop_ready(t0),
            Drain::Message(Outbound::Tick { .. })
        ));

        // Same symbol again immediately: must wait out the window.
        q.push_tick(tick("EURUSD", 1.0828, 1.0828, 1));
        match q.pop_ready(t0 + Duration::from_millis(1)) {
            Drain::Wait(Some(wait)) => assert!(wait <= TICK_MIN_INTERVAL),
            other => panic!("expected pacing wait, got {other:?}"),
        }

        // After the window the tick flows.
        assert!(matches!(
            q.pop_ready(t0 + TICK_MIN_INTERVAL),
            Drain::Message(Outbound::Tick { .. })
        ));
    }

    #[test]
    fn pacing_is_per_symbol() {
        let q = queue();
        let t0 = Instant::now();

        q.push_tick(tick("EURUSD", 1.0827, 1.0827, 1));
        assert!(matches!(
            q.pop_ready(t0),
            Drain::Message(Outbound::Tick { .. })
        ));

        // A different symbol is not throttled by EURUSD's window.
        q.push_tick(tick("GBPUSD", 1.2700, 1.2700, 1));
        match q.pop_ready(t0 + Duration::from_millis(1)) {
            Drain::Message(Outbound::Tick { update, .. }) => {
                assert_eq!(update.symbol, "GBPUSD");
            }
            other => panic!("expected GBPUSD tick, got {other:?}"),
        }
    }

    #[test]
    fn capacity_overflow_drops_oldest_tick() {
        let q = queue();
        // Fill to capacity with distinct symbols.
        for i in 0..OUTBOUND_CAPACITY {
            q.push_tick(tick(&format!("SYM{i}"), 1.0, 1.0, 1));
        }
        // One more evicts SYM0.
        q.push_tick(tick("OVERFLOW", 1.0, 1.0, 1));

        let inner = q.inner.lock();
        assert_eq!(inner.ticks.len(), OUTBOUND_CAPACITY);
        assert!(!inner.ticks.contains_key("SYM0"));
        assert!(inner.ticks.contains_key("OVERFLOW"));
    }

    #[test]
    fn control_is_never_dropped_and_flags_slow_consumer() {
        let q = queue();
        for i in 0..OUTBOUND_CAPACITY {
            q.push_tick(tick(&format!("SYM{i}"), 1.0, 1.0, 1));
        }

        // Queue is at capacity: control still lands, clock starts.
        q.push_control(pong());
        assert!(!q.is_closed());
        assert_eq!(q.inner.lock().control.len(), 1);
        assert!(q.inner.lock().full_since.is_some());

        // Simulate the clock running out.
        q.inner.lock().full_since = Some(Instant::now() - Duration::from_secs(6));
        q.push_control(pong());
        assert!(q.is_closed());
        assert!(matches!(q.pop_ready(Instant::now()), Drain::Closed));
    }

    #[test]
    fn draining_resets_the_slow_consumer_clock() {
        let q = queue();
        for i in 0..OUTBOUND_CAPACITY {
            q.push_tick(tick(&format!("SYM{i}"), 1.0, 1.0, 1));
        }
        q.push_control(pong());
        assert!(q.inner.lock().full_since.is_some());

        // Drain the control message; queue falls below capacity.
        assert!(matches!(
            q.pop_ready(Instant::now()),
            Drain::Message(Outbound::Control(_))
        ));
        assert!(q.inner.lock().full_since.is_none());
    }

    #[test]
    fn closed_queue_ignores_pushes() {
        let q = queue();
        q.close();
        q.push_control(pong());
        q.push_tick(tick("EURUSD", 1.0, 1.0, 1));
        assert!(matches!(q.pop_ready(Instant::now()), Drain::Closed));
    }

    #[tokio::test]
    async fn wait_wakes_on_push() {
        let q = Arc::new(queue());
        let waiter = q.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });
        // Give the waiter a moment to park.
        tokio::task::yield_now().await;
        q.push_control(pong());
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("push must wake the waiter")
            .unwrap();
    }
}
