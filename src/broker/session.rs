// =============================================================================
// Broker Session — single TLS connection, request correlation, heartbeats
// =============================================================================
//
// One writer task serializes outbound frames through a bounded channel; one
// reader task parses inbound frames and either resolves a pending request
// waiter (frames carrying a clientMsgId) or dispatches to the event handler
// registered for the payload type (frames without one).
//
// State machine:
//   Disconnected -> Connecting -> Connected -> AppAuthed -> AccountAuthed
// Any socket error, 30 s inbound silence, or auth failure drops the session
// back to Disconnected, where a jittered exponential backoff schedules the
// next attempt. Pending requests are failed with `Disconnected` so callers
// may retry; gateway clients are never torn down by a broker reconnect.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::app_state::Counters;
use crate::broker::transport::{self, BrokerReadHalf, BrokerWriteHalf};
use crate::codec::frame;
use crate::codec::messages::{
    ProtoHeartbeatEvent, ProtoOaAccountAuthReq, ProtoOaAccountAuthRes, ProtoOaApplicationAuthReq,
    ProtoOaApplicationAuthRes, ProtoOaErrorRes,
};
use crate::codec::registry::{self, ERROR_RES, HEARTBEAT_EVENT};
use crate::codec::{decode_envelope, encode_envelope, Envelope, OpenApiMessage};
use crate::error::SessionError;
use crate::runtime_config::BrokerConfig;
use crate::types::BrokerStatus;

/// Default deadline for a single request/response exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Application heartbeat cadence while account-authed.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// The session is declared dead after this much inbound silence.
const INBOUND_IDLE_LIMIT: Duration = Duration::from_secs(30);
/// Outbound frame queue depth; callers of `request` await space up to their
/// deadline when it fills.
const WRITE_QUEUE_CAPACITY: usize = 256;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
/// A session that stays account-authed this long resets the backoff.
const STABLE_SESSION: Duration = Duration::from_secs(60);
/// Auth failing continuously for this long is unrecoverable (exit code 2).
const AUTH_FATAL_WINDOW: Duration = Duration::from_secs(600);

/// Connection lifecycle states, in order of progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    AppAuthed,
    AccountAuthed,
}

/// Which phase of a connection attempt an error interrupted. Auth-phase
/// failures feed the unrecoverable-auth clock; the others only drive backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connect,
    Auth,
    Stream,
}

type Waiter = oneshot::Sender<Result<Envelope, SessionError>>;

pub struct BrokerSession {
    cfg: BrokerConfig,
    state: RwLock<ConnectionState>,
    status_tx: watch::Sender<BrokerStatus>,

    /// Present while a connection is up; cleared on teardown so `request`
    /// fails fast with `Disconnected`.
    write_tx: RwLock<Option<mpsc::Sender<Bytes>>>,

    /// Pending request waiters keyed by clientMsgId. Ids are unique while
    /// pending: monotonic counter plus a per-connection nonce.
    pending: Mutex<HashMap<String, Waiter>>,

    /// Event handlers keyed by payload type, for frames without a
    /// clientMsgId (spot events, trend-bar events).
    handlers: RwLock<HashMap<u32, mpsc::Sender<Envelope>>>,

    msg_seq: AtomicU64,
    nonce: RwLock<String>,
    last_inbound: RwLock<Instant>,
    counters: Arc<Counters>,
}

impl BrokerSession {
    pub fn new(cfg: BrokerConfig, counters: Arc<Counters>) -> (Arc<Self>, watch::Receiver<BrokerStatus>) {
        let (status_tx, status_rx) = watch::channel(BrokerStatus::Down);
        let session = Arc::new(Self {
            cfg,
            state: RwLock::new(ConnectionState::Disconnected),
            status_tx,
            write_tx: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            msg_seq: AtomicU64::new(1),
            nonce: RwLock::new(String::new()),
            last_inbound: RwLock::new(Instant::now()),
            counters,
        });
        (session, status_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn status(&self) -> BrokerStatus {
        *self.status_tx.borrow()
    }

    pub fn account_id(&self) -> i64 {
        self.cfg.account_id
    }

    /// Register the event sink for a payload type. Later registrations for
    /// the same type replace earlier ones.
    pub fn register_handler(&self, payload_type: u32, tx: mpsc::Sender<Envelope>) {
        self.handlers.write().insert(payload_type, tx);
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(from = ?*state, to = ?next, "broker session state");
            *state = next;
        }
    }

    fn next_client_msg_id(&self) -> String {
        let seq = self.msg_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.nonce.read(), seq)
    }

    // ── Request/response correlation ────────────────────────────────────

    /// Send a request and await the correlated response with the default
    /// 10 s deadline.
    pub async fn request<Req, Res>(&self, req: &Req) -> Result<Res, SessionError>
    where
        Req: OpenApiMessage,
        Res: OpenApiMessage,
    {
        self.request_with_timeout(req, REQUEST_TIMEOUT).await
    }

    /// Send a request and await the correlated response. The broker's generic
    /// error payload resolves the waiter as `SessionError::Broker`; deadline
    /// expiry removes the waiter and yields `Timeout`.
    pub async fn request_with_timeout<Req, Res>(
        &self,
        req: &Req,
        timeout: Duration,
    ) -> Result<Res, SessionError>
    where
        Req: OpenApiMessage,
        Res: OpenApiMessage,
    {
        let id = self.next_client_msg_id();
        let envelope = encode_envelope(req, Some(id.clone()))?;
        let framed = frame::encode_frame(&envelope);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let deadline = Instant::now() + timeout;
        if let Err(e) = self.send_frame(framed, timeout).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(Ok(env))) => env.decode_as::<Res>().map_err(Into::into),
            Ok(Ok(Err(e))) => Err(e),
            // Waiter dropped wholesale by teardown.
            Ok(Err(_)) => Err(SessionError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(SessionError::Timeout(timeout))
            }
        }
    }

    /// Queue a frame for the writer task, waiting for queue space up to the
    /// caller's deadline.
    async fn send_frame(&self, framed: Bytes, timeout: Duration) -> Result<(), SessionError> {
        let tx = self
            .write_tx
            .read()
            .clone()
            .ok_or(SessionError::Disconnected)?;
        match tokio::time::timeout(timeout, tx.send(framed)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SessionError::Disconnected),
            Err(_) => Err(SessionError::Timeout(timeout)),
        }
    }

    // ── Connection supervisor ───────────────────────────────────────────

    /// Run the session until shutdown. Reconnects with exponential backoff
    /// (base 1 s, factor 2, cap 60 s, +/-20 % jitter), resetting after a
    /// session that stays authed for 60 s. Continuous auth failure for over
    /// ten minutes reports through `fatal_tx` and stops trying.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        fatal_tx: mpsc::Sender<String>,
    ) {
        let mut backoff = Backoff::new();
        let mut auth_failing_since: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let connected_at = Instant::now();
            let outcome = self.clone().connect_and_serve(&mut shutdown).await;
            self.teardown();

            match outcome {
                Ok(()) => break, // shutdown requested
                Err((e, phase)) => {
                    warn!(error = %e, phase = ?phase, "broker session ended");
                    self.counters.broker_reconnects.fetch_add(1, Ordering::Relaxed);

                    if phase == Phase::Auth {
                        let since = *auth_failing_since.get_or_insert_with(Instant::now);
                        if since.elapsed() > AUTH_FATAL_WINDOW {
                            error!(
                                window_secs = AUTH_FATAL_WINDOW.as_secs(),
                                "broker authentication has failed continuously; giving up"
                            );
                            let _ = fatal_tx.send(format!("broker auth unrecoverable: {e}")).await;
                            break;
                        }
                    } else {
                        auth_failing_since = None;
                    }

                    if connected_at.elapsed() >= STABLE_SESSION {
                        backoff.reset();
                    }
                }
            }

            let delay = backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "scheduling broker reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.teardown();
        info!("broker session supervisor stopped");
    }

    /// One full connection attempt: TLS connect, spawn reader/writer, app and
    /// account auth, then supervise heartbeats until something fails.
    async fn connect_and_serve(
        self: Arc<Self>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), (SessionError, Phase)> {
        let (read_half, write_half) = transport::connect(&self.cfg.host, self.cfg.port)
            .await
            .map_err(|e| (e, Phase::Connect))?;

        self.set_state(ConnectionState::Connected);

        // Fresh correlation namespace per connection.
        *self.nonce.write() = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        self.msg_seq.store(1, Ordering::Relaxed);
        *self.last_inbound.write() = Instant::now();

        let (write_tx, write_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_CAPACITY);
        *self.write_tx.write() = Some(write_tx);

        let mut writer_task = tokio::spawn(write_loop(write_half, write_rx));
        let mut reader_task = tokio::spawn(self.clone().read_loop(read_half));

        let result = self.serve_authed(shutdown, &mut reader_task, &mut writer_task).await;

        reader_task.abort();
        writer_task.abort();
        result
    }

    async fn serve_authed(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        mut reader_task: &mut tokio::task::JoinHandle<Result<(), SessionError>>,
        mut writer_task: &mut tokio::task::JoinHandle<Result<(), SessionError>>,
    ) -> Result<(), (SessionError, Phase)> {
        // ── Auth handshake ──────────────────────────────────────────────
        let app_auth = ProtoOaApplicationAuthReq {
            client_id: self.cfg.client_id.clone(),
            client_secret: self.cfg.client_secret.clone(),
        };
        let _: ProtoOaApplicationAuthRes = self
            .request(&app_auth)
            .await
            .map_err(|e| (e, Phase::Auth))?;
        self.set_state(ConnectionState::AppAuthed);

        let account_auth = ProtoOaAccountAuthReq {
            ctid_trader_account_id: self.cfg.account_id,
            access_token: self.cfg.access_token.clone(),
        };
        let _: ProtoOaAccountAuthRes = self
            .request(&account_auth)
            .await
            .map_err(|e| (e, Phase::Auth))?;
        self.set_state(ConnectionState::AccountAuthed);
        self.status_tx.send_replace(BrokerStatus::Up);
        info!(account_id = self.cfg.account_id, "broker session account-authed");

        // ── Steady state: heartbeats + liveness watch ───────────────────
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut idle_check = tokio::time::interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.send_heartbeat() {
                        return Err((e, Phase::Stream));
                    }
                }
                _ = idle_check.tick() => {
                    let idle = self.last_inbound.read().elapsed();
                    if idle > INBOUND_IDLE_LIMIT {
                        return Err((
                            SessionError::Transport(format!(
                                "no inbound frames for {} s",
                                idle.as_secs()
                            )),
                            Phase::Stream,
                        ));
                    }
                }
                res = &mut reader_task => {
                    let err = match res {
                        Ok(Ok(())) => SessionError::Transport("broker closed the stream".into()),
                        Ok(Err(e)) => e,
                        Err(join) => SessionError::Transport(format!("reader task failed: {join}")),
                    };
                    return Err((err, Phase::Stream));
                }
                res = &mut writer_task => {
                    let err = match res {
                        Ok(Ok(())) => SessionError::Transport("writer stopped".into()),
                        Ok(Err(e)) => e,
                        Err(join) => SessionError::Transport(format!("writer task failed: {join}")),
                    };
                    return Err((err, Phase::Stream));
                }
            }
        }
    }

    fn send_heartbeat(&self) -> Result<(), SessionError> {
        let envelope = encode_envelope(&ProtoHeartbeatEvent {}, None)?;
        let framed = frame::encode_frame(&envelope);
        let tx = self
            .write_tx
            .read()
            .clone()
            .ok_or(SessionError::Disconnected)?;
        // A full write queue at heartbeat time means the writer has stalled
        // for several seconds; let the idle check catch the dead peer case
        // rather than blocking the supervisor here.
        if tx.try_send(framed).is_err() {
            warn!("write queue full; skipping heartbeat");
        }
        Ok(())
    }

    // ── Inbound dispatch ────────────────────────────────────────────────

    async fn read_loop(self: Arc<Self>, mut reader: BrokerReadHalf) -> Result<(), SessionError> {
        loop {
            let body = match frame::read_frame(&mut reader).await {
                Err(io) => return Err(SessionError::Transport(io.to_string())),
                // An oversize prefix means the stream is desynchronized;
                // resynchronizing mid-stream is not possible, reconnect.
                Ok(Err(codec)) => return Err(codec.into()),
                Ok(Ok(body)) => body,
            };

            *self.last_inbound.write() = Instant::now();

            let env = match decode_envelope(&body) {
                Ok(env) => env,
                Err(e) => {
                    warn!(error = %e, "dropping malformed broker frame");
                    self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            self.dispatch(env);
        }
    }

    fn dispatch(&self, env: Envelope) {
        // Response path: frames carrying a correlation id resolve a waiter.
        if let Some(id) = env.client_msg_id.clone() {
            let waiter = self.pending.lock().remove(&id);
            match waiter {
                Some(tx) => {
                    let result = if env.payload_type == ERROR_RES {
                        Err(broker_error(&env))
                    } else {
                        Ok(env)
                    };
                    let _ = tx.send(result);
                }
                None => {
                    debug!(client_msg_id = %id, payload_type = env.payload_type, "orphan response dropped");
                    self.counters.orphan_responses.fetch_add(1, Ordering::Relaxed);
                }
            }
            return;
        }

        // Event path: no correlation id.
        if env.payload_type == HEARTBEAT_EVENT {
            return; // liveness was recorded above
        }
        if !env.is_known() {
            warn!(payload_type = env.payload_type, "unknown broker message dropped");
            self.counters.unknown_messages.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let handler = self.handlers.read().get(&env.payload_type).cloned();
        match handler {
            Some(tx) => {
                if tx.try_send(env).is_err() {
                    // The aggregator inboxes coalesce; losing an event at the
                    // dispatch seam only costs intermediate granularity.
                    self.counters.dropped_events.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                debug!(payload_type = env.payload_type, "no handler for broker event");
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Drop the write channel, fail every pending waiter with
    /// `Disconnected`, and flip the public status to down.
    fn teardown(&self) {
        *self.write_tx.write() = None;
        self.set_state(ConnectionState::Disconnected);
        self.status_tx.send_replace(BrokerStatus::Down);

        let waiters: Vec<Waiter> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, w)| w).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(SessionError::Disconnected));
        }
    }
}

fn broker_error(env: &Envelope) -> SessionError {
    match env.decode_as::<ProtoOaErrorRes>() {
        Ok(err) => SessionError::Broker {
            code: err.error_code,
            description: err.description.unwrap_or_default(),
        },
        Err(e) => e.into(),
    }
}

async fn write_loop(
    mut writer: BrokerWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) -> Result<(), SessionError> {
    while let Some(framed) = rx.recv().await {
        frame::write_frame(&mut writer, &framed)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
    }
    Ok(())
}

// =============================================================================
// Reconnect backoff
// =============================================================================

struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: RECONNECT_BASE,
        }
    }

    fn reset(&mut self) {
        self.current = RECONNECT_BASE;
    }

    /// Next delay with +/-20 % jitter; doubles the base up to the cap.
    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(RECONNECT_MAX);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        base.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::registry::SUBSCRIBE_SPOTS_RES;

    fn test_session() -> Arc<BrokerSession> {
        let cfg = BrokerConfig {
            host: "demo.example.test".into(),
            port: 5035,
            client_id: "cid".into(),
            client_secret: "secret".into(),
            access_token: "token".into(),
            account_id: 7,
        };
        BrokerSession::new(cfg, Arc::new(Counters::default())).0
    }

    #[test]
    fn client_msg_ids_are_unique_while_pending() {
        let session = test_session();
        *session.nonce.write() = "abc".into();
        let a = session.next_client_msg_id();
        let b = session.next_client_msg_id();
        assert_ne!(a, b);
        assert!(a.starts_with("abc-"));
    }

    #[test]
    fn dispatch_resolves_pending_waiter() {
        let session = test_session();
        let (tx, mut rx) = oneshot::channel();
        session.pending.lock().insert("n-1".into(), tx);

        session.dispatch(Envelope {
            payload_type: SUBSCRIBE_SPOTS_RES,
            payload: Vec::new(),
            client_msg_id: Some("n-1".into()),
        });

        let resolved = rx.try_recv().unwrap().unwrap();
        assert_eq!(resolved.payload_type, SUBSCRIBE_SPOTS_RES);
        assert!(session.pending.lock().is_empty());
    }

    #[test]
    fn dispatch_translates_broker_error_payload() {
        use prost::Message;

        let session = test_session();
        let (tx, mut rx) = oneshot::channel();
        session.pending.lock().insert("n-2".into(), tx);

        let err = ProtoOaErrorRes {
            error_code: "CH_ACCESS_TOKEN_INVALID".into(),
            description: Some("expired".into()),
        };
        session.dispatch(Envelope {
            payload_type: ERROR_RES,
            payload: err.encode_to_vec(),
            client_msg_id: Some("n-2".into()),
        });

        match rx.try_recv().unwrap() {
            Err(SessionError::Broker { code, description }) => {
                assert_eq!(code, "CH_ACCESS_TOKEN_INVALID");
                assert_eq!(description, "expired");
            }
            other => panic!("expected broker error, got {other:?}"),
        }
    }

    #[test]
    fn orphan_response_is_counted_and_dropped() {
        let session = test_session();
        session.dispatch(Envelope {
            payload_type: SUBSCRIBE_SPOTS_RES,
            payload: Vec::new(),
            client_msg_id: Some("nobody-waiting".into()),
        });
        assert_eq!(
            session.counters.orphan_responses.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn events_route_to_registered_handler() {
        let session = test_session();
        let (tx, mut rx) = mpsc::channel(4);
        session.register_handler(registry::SPOT_EVENT, tx);

        session.dispatch(Envelope {
            payload_type: registry::SPOT_EVENT,
            payload: vec![1, 2, 3],
            client_msg_id: None,
        });

        let env = rx.try_recv().unwrap();
        assert_eq!(env.payload_type, registry::SPOT_EVENT);
    }

    #[test]
    fn unknown_event_payload_is_counted() {
        let session = test_session();
        session.dispatch(Envelope {
            payload_type: 4242,
            payload: Vec::new(),
            client_msg_id: None,
        });
        assert_eq!(session.counters.unknown_messages.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn teardown_fails_all_pending_waiters() {
        let session = test_session();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        session.pending.lock().insert("a".into(), tx1);
        session.pending.lock().insert("b".into(), tx2);

        session.teardown();

        assert_eq!(rx1.try_recv().unwrap(), Err(SessionError::Disconnected));
        assert_eq!(rx2.try_recv().unwrap(), Err(SessionError::Disconnected));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.status(), BrokerStatus::Down);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        // Jitter is +/-20 %, so compare against generous bounds.
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(1600) && second <= Duration::from_millis(2400));

        for _ in 0..10 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped <= RECONNECT_MAX.mul_f64(1.2));

        backoff.reset();
        let reset = backoff.next_delay();
        assert!(reset <= Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn request_without_connection_fails_fast() {
        let session = test_session();
        let req = ProtoOaApplicationAuthReq {
            client_id: "x".into(),
            client_secret: "y".into(),
        };
        let res: Result<ProtoOaApplicationAuthRes, _> = session.request(&req).await;
        assert_eq!(res.unwrap_err(), SessionError::Disconnected);
        assert!(session.pending.lock().is_empty());
    }
}
