// =============================================================================
// Client WebSocket protocol — JSON frames tagged by `type`
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::aggregator::state::{SymbolDataPackage, TickUpdate};
use crate::types::BrokerStatus;

/// Inbound commands. Unknown `type` values parse as `Unknown` so the
/// connection can answer with an error instead of dropping the frame.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientCommand {
    Subscribe { symbol: String },
    Unsubscribe { symbol: String },
    Ping,
    #[serde(other)]
    Unknown,
}

/// Outbound control messages. Ticks take the dedicated [`TickFrame`] path so
/// the fan-out can share one `Arc<TickUpdate>` across subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    SymbolList {
        symbols: Vec<SymbolListEntry>,
    },
    SymbolDataPackage(SymbolDataPackage),
    Unsubscribed {
        symbol: String,
    },
    ConnectionStatus {
        broker: BrokerStatus,
    },
    #[serde(rename_all = "camelCase")]
    Pong {
        server_time_ms: i64,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolListEntry {
    pub name: String,
    pub digits: i32,
    pub pip_position: i32,
}

/// Borrowing serializer for tick frames: `{"type":"tick", ...update fields}`.
#[derive(Serialize)]
pub struct TickFrame<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub update: &'a TickUpdate,
}

impl<'a> TickFrame<'a> {
    pub fn new(update: &'a TickUpdate) -> Self {
        Self {
            kind: "tick",
            update,
        }
    }
}

// ── Error codes ──────────────────────────────────────────────────────────────

pub const ERR_UNKNOWN_SYMBOL: &str = "unknown_symbol";
pub const ERR_UNKNOWN_TYPE: &str = "unknown_type";
pub const ERR_BAD_FRAME: &str = "bad_frame";
pub const ERR_SUBSCRIBE_FAILED: &str = "subscribe_failed";

/// WebSocket close reason for a client that stopped draining its queue.
pub const CLOSE_SLOW_CONSUMER: &str = "slow_consumer";
