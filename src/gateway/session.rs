// =============================================================================
// Client connection lifecycle — one reader and one writer task per socket
// =============================================================================
//
// The reader parses inbound JSON commands and drives subscribe/unsubscribe
// bookkeeping; the writer drains the connection's outbound queue, pacing
// ticks per symbol and watching for the slow-consumer flag. On any exit the
// reader detaches every listener and releases every multiplexer refcount, so
// a vanished client never leaks a broker subscription.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::aggregator::task::AggregatorHandle;
use crate::app_state::AppState;
use crate::gateway::outbound::{Drain, Outbound, OutboundQueue};
use crate::gateway::protocol::{
    ClientCommand, ServerMessage, TickFrame, CLOSE_SLOW_CONSUMER, ERR_BAD_FRAME,
    ERR_SUBSCRIBE_FAILED, ERR_UNKNOWN_SYMBOL, ERR_UNKNOWN_TYPE,
};
use crate::multiplexer::AcquireError;
use crate::types::BrokerStatus;

/// More than this many unparseable frames inside the window closes the
/// connection.
const BAD_FRAME_LIMIT: usize = 3;
const BAD_FRAME_WINDOW: Duration = Duration::from_secs(10);

/// Close codes: normal shutdown uses 1001 (going away), slow consumers get
/// 1008 (policy violation) with the reason string.
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_POLICY: u16 = 1008;

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let listener_id = state.next_listener_id();
    state.counters.clients_connected.fetch_add(1, Ordering::Relaxed);
    info!(conn = listener_id, "client connected");

    let queue = Arc::new(OutboundQueue::new(state.counters.clone()));

    // Hello: the symbol list, then the current broker status.
    queue.push_control(ServerMessage::SymbolList {
        symbols: state.symbol_entries(),
    });
    queue.push_control(ServerMessage::ConnectionStatus {
        broker: *state.broker_status.borrow(),
    });

    let (sender, mut receiver) = socket.split();

    let status_task = tokio::spawn(forward_broker_status(
        state.broker_status.clone(),
        queue.clone(),
    ));
    let mut writer_task = tokio::spawn(writer_loop(
        sender,
        queue.clone(),
        state.shutdown.clone(),
    ));

    let mut subscriptions: HashMap<String, AggregatorHandle> = HashMap::new();
    let mut bad_frames: VecDeque<Instant> = VecDeque::new();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(cmd) => {
                                handle_command(
                                    cmd,
                                    listener_id,
                                    &state,
                                    &queue,
                                    &mut subscriptions,
                                )
                                .await;
                            }
                            Err(e) => {
                                debug!(conn = listener_id, error = %e, "bad client frame");
                                state
                                    .counters
                                    .bad_client_frames
                                    .fetch_add(1, Ordering::Relaxed);
                                queue.push_control(ServerMessage::Error {
                                    code: ERR_BAD_FRAME,
                                    message: "message is not valid JSON for this protocol".into(),
                                });
                                if too_many_bad_frames(&mut bad_frames) {
                                    warn!(conn = listener_id, "repeated bad frames; closing");
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // The protocol layer answers pings on the next write.
                        debug!(conn = listener_id, "ws ping/pong frame");
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(conn = listener_id, "binary frame ignored");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(conn = listener_id, "client sent close");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(conn = listener_id, error = %e, "client read error");
                        break;
                    }
                    None => break,
                }
            }
            // Writer gone: slow-consumer close, shutdown, or send failure.
            _ = &mut writer_task => break,
        }
    }

    // ── Cleanup: every subscription releases its refcount ───────────────
    for (symbol, handle) in subscriptions.drain() {
        handle.detach(listener_id).await;
        state.multiplexer.release(&symbol).await;
    }
    queue.close();
    status_task.abort();
    state
        .counters
        .clients_connected
        .fetch_sub(1, Ordering::Relaxed);
    info!(conn = listener_id, "client disconnected");
}

async fn handle_command(
    cmd: ClientCommand,
    listener_id: u64,
    state: &Arc<AppState>,
    queue: &Arc<OutboundQueue>,
    subscriptions: &mut HashMap<String, AggregatorHandle>,
) {
    match cmd {
        ClientCommand::Subscribe { symbol } => {
            let symbol = canonical(&symbol);
            if subscriptions.contains_key(&symbol) {
                debug!(conn = listener_id, symbol = %symbol, "duplicate subscribe ignored");
                return;
            }
            match state.multiplexer.acquire(&symbol).await {
                Ok(handle) => {
                    // Attach pushes the snapshot (now, or once priming
                    // completes) before any tick reaches this queue.
                    handle.attach(listener_id, queue.clone()).await;
                    subscriptions.insert(symbol.clone(), handle);
                    debug!(conn = listener_id, symbol = %symbol, "subscribed");
                }
                Err(AcquireError::UnknownSymbol(name)) => {
                    queue.push_control(ServerMessage::Error {
                        code: ERR_UNKNOWN_SYMBOL,
                        message: format!("symbol {name:?} is not available"),
                    });
                }
                Err(e @ AcquireError::Subscribe(_)) => {
                    queue.push_control(ServerMessage::Error {
                        code: ERR_SUBSCRIBE_FAILED,
                        message: e.to_string(),
                    });
                }
            }
        }
        ClientCommand::Unsubscribe { symbol } => {
            let symbol = canonical(&symbol);
            if let Some(handle) = subscriptions.remove(&symbol) {
                handle.detach(listener_id).await;
                state.multiplexer.release(&symbol).await;
            }
            // Reply after the bookkeeping, idempotently; the broker's own
            // unsubscribe ack may still be in flight.
            queue.push_control(ServerMessage::Unsubscribed { symbol });
        }
        ClientCommand::Ping => {
            queue.push_control(ServerMessage::Pong {
                server_time_ms: chrono::Utc::now().timestamp_millis(),
            });
        }
        ClientCommand::Unknown => {
            queue.push_control(ServerMessage::Error {
                code: ERR_UNKNOWN_TYPE,
                message: "unsupported message type".into(),
            });
        }
    }
}

/// Sliding-window bad-frame accounting.
fn too_many_bad_frames(window: &mut VecDeque<Instant>) -> bool {
    let now = Instant::now();
    window.push_back(now);
    while let Some(first) = window.front() {
        if now.duration_since(*first) > BAD_FRAME_WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
    window.len() > BAD_FRAME_LIMIT
}

/// Drain the outbound queue into the socket.
async fn writer_loop(
    mut sender: SplitSink<WebSocket, Message>,
    queue: Arc<OutboundQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_GOING_AWAY,
                    reason: "server shutting down".into(),
                })))
                .await;
            return;
        }

        match queue.pop_ready(Instant::now()) {
            Drain::Message(out) => {
                let text = match &out {
                    Outbound::Control(msg) => serde_json::to_string(msg),
                    Outbound::Tick {
                        update,
                        merged_delta,
                    } => match merged_delta {
                        Some(delta) => {
                            let mut owned = (**update).clone();
                            owned.profile_delta = Some(delta.clone());
                            serde_json::to_string(&TickFrame::new(&owned))
                        }
                        None => serde_json::to_string(&TickFrame::new(update)),
                    },
                };
                match text {
                    Ok(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        // Not a socket problem; drop the frame and carry on.
                        warn!(error = %e, "outbound frame failed to serialize");
                    }
                }
            }
            Drain::Wait(Some(pause)) => {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = queue.wait() => {}
                    _ = shutdown.changed() => {}
                }
            }
            Drain::Wait(None) => {
                tokio::select! {
                    _ = queue.wait() => {}
                    _ = shutdown.changed() => {}
                }
            }
            Drain::Closed => {
                // Slow consumer, or the reader already tore the queue down.
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_POLICY,
                        reason: CLOSE_SLOW_CONSUMER.into(),
                    })))
                    .await;
                return;
            }
        }
    }
}

/// Push broker up/down transitions to this client.
async fn forward_broker_status(
    mut status: watch::Receiver<BrokerStatus>,
    queue: Arc<OutboundQueue>,
) {
    loop {
        if status.changed().await.is_err() {
            return;
        }
        let broker = *status.borrow_and_update();
        queue.push_control(ServerMessage::ConnectionStatus { broker });
        if queue.is_closed() {
            return;
        }
    }
}

fn canonical(name: &str) -> String {
    name.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_frame_window_trips_after_limit() {
        let mut window = VecDeque::new();
        assert!(!too_many_bad_frames(&mut window));
        assert!(!too_many_bad_frames(&mut window));
        assert!(!too_many_bad_frames(&mut window));
        // Fourth strike inside the window.
        assert!(too_many_bad_frames(&mut window));
    }

    #[test]
    fn bad_frame_window_forgets_old_strikes() {
        let mut window = VecDeque::new();
        // Strikes aged out of the window no longer count.
        window.push_back(Instant::now() - Duration::from_secs(60));
        window.push_back(Instant::now() - Duration::from_secs(59));
        window.push_back(Instant::now() - Duration::from_secs(58));
        assert!(!too_many_bad_frames(&mut window));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn canonicalizes_symbol_names() {
        assert_eq!(canonical(" eurusd "), "EURUSD");
        assert_eq!(canonical("GBPUSD"), "GBPUSD");
    }
}
