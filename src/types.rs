// =============================================================================
// Shared types used across the Meridian backend
// =============================================================================

use serde::{Deserialize, Serialize};

/// Immutable per-symbol metadata fetched from the broker after account auth.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolInfo {
    /// Broker-assigned symbol id, stable per account.
    pub id: i64,
    /// Canonical symbol name, e.g. `"EURUSD"`.
    pub name: String,
    /// Number of price digits (0-10).
    pub digits: i32,
    /// Integer `p` such that one pip equals `10^(-p)` price units.
    pub pip_position: i32,
}

impl SymbolInfo {
    /// Width of one pip in price units.
    pub fn pip_size(&self) -> f64 {
        10f64.powi(-self.pip_position)
    }
}

/// Direction of the latest tick relative to the previous mid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickDirection {
    Up,
    Down,
    Flat,
}

impl TickDirection {
    /// Classify a mid move against the previous mid. `None` previous means the
    /// very first tick, which is flat by definition.
    pub fn classify(mid: f64, previous_mid: Option<f64>) -> Self {
        match previous_mid {
            Some(prev) if mid > prev => Self::Up,
            Some(prev) if mid < prev => Self::Down,
            _ => Self::Flat,
        }
    }
}

impl std::fmt::Display for TickDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Flat => write!(f, "flat"),
        }
    }
}

/// Whether the broker-facing session currently has an authenticated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    Up,
    Down,
}

impl std::fmt::Display for BrokerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// A raw bid/ask update as delivered by the broker.
#[derive(Debug, Clone, Copy)]
pub struct SpotTick {
    /// Bid price, absent when the broker only refreshed the ask side.
    pub bid: Option<f64>,
    /// Ask price, absent when the broker only refreshed the bid side.
    pub ask: Option<f64>,
    /// Broker event timestamp in UNIX milliseconds.
    pub timestamp_ms: i64,
}

/// A single OHLC bar decoded from the broker's trend-bar wire format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    /// Bar open timestamp in UNIX milliseconds.
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Tick volume reported by the broker.
    pub volume: i64,
}
