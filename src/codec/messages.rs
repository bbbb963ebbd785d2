// =============================================================================
// Broker Open API message bindings (Protocol Buffers, proto2)
// =============================================================================
//
// Hand-maintained prost structs for the subset of the broker schema this
// backend speaks. Field tags and payload-type numbers follow the broker's
// published .proto files; prices travel as unsigned integers scaled by 1e5
// and trend bars use the low + delta encoding, both converted here so the
// rest of the backend only ever sees f64 prices and plain OHLC bars.
// =============================================================================

use crate::types::Bar;

/// Fixed-point denominator for wire prices.
pub const PRICE_SCALE: f64 = 100_000.0;

/// Convert a wire price (uint64, 1e-5 units) to a plain price.
pub fn price_from_wire(raw: u64) -> f64 {
    raw as f64 / PRICE_SCALE
}

// =============================================================================
// Envelope
// =============================================================================

/// Outer envelope carried in every length-prefixed frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoMessage {
    #[prost(uint32, required, tag = "1")]
    pub payload_type: u32,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub payload: Option<Vec<u8>>,
    #[prost(string, optional, tag = "3")]
    pub client_msg_id: Option<String>,
}

/// Application-level heartbeat, sent both ways every few seconds.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoHeartbeatEvent {}

// =============================================================================
// Authentication
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaApplicationAuthReq {
    #[prost(string, required, tag = "2")]
    pub client_id: String,
    #[prost(string, required, tag = "3")]
    pub client_secret: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaApplicationAuthRes {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaAccountAuthReq {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(string, required, tag = "3")]
    pub access_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaAccountAuthRes {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}

/// Generic broker error response; may answer any request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaErrorRes {
    #[prost(string, required, tag = "2")]
    pub error_code: String,
    #[prost(string, optional, tag = "3")]
    pub description: Option<String>,
}

// =============================================================================
// Symbol catalog
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSymbolsListReq {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(bool, optional, tag = "3")]
    pub include_archived_symbols: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSymbolsListRes {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(message, repeated, tag = "3")]
    pub symbol: Vec<ProtoOaLightSymbol>,
}

/// Name/id pair from the symbols-list response; metadata requires a
/// follow-up symbol-by-id request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaLightSymbol {
    #[prost(int64, required, tag = "1")]
    pub symbol_id: i64,
    #[prost(string, optional, tag = "2")]
    pub symbol_name: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub enabled: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSymbolByIdReq {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, repeated, packed = "false", tag = "3")]
    pub symbol_id: Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSymbolByIdRes {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(message, repeated, tag = "3")]
    pub symbol: Vec<ProtoOaSymbol>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSymbol {
    #[prost(int64, required, tag = "1")]
    pub symbol_id: i64,
    #[prost(int32, required, tag = "2")]
    pub digits: i32,
    #[prost(int32, required, tag = "3")]
    pub pip_position: i32,
}

// =============================================================================
// Spot subscriptions
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSubscribeSpotsReq {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, repeated, packed = "false", tag = "3")]
    pub symbol_id: Vec<i64>,
    #[prost(bool, optional, tag = "4")]
    pub subscribe_to_spot_timestamp: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSubscribeSpotsRes {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaUnsubscribeSpotsReq {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, repeated, packed = "false", tag = "3")]
    pub symbol_id: Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaUnsubscribeSpotsRes {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}

/// Live quote event. Either side may be absent when only one side moved.
/// When live trend bars are subscribed the current bars ride along in
/// `trendbar`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSpotEvent {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, required, tag = "3")]
    pub symbol_id: i64,
    #[prost(uint64, optional, tag = "4")]
    pub bid: Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub ask: Option<u64>,
    #[prost(message, repeated, tag = "6")]
    pub trendbar: Vec<ProtoOaTrendbar>,
    #[prost(int64, optional, tag = "8")]
    pub timestamp: Option<i64>,
}

// =============================================================================
// Trend bars
// =============================================================================

/// Trend-bar periods defined by the broker schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TrendbarPeriod {
    M1 = 1,
    M2 = 2,
    M3 = 3,
    M4 = 4,
    M5 = 5,
    M10 = 6,
    M15 = 7,
    M30 = 8,
    H1 = 9,
    H4 = 10,
    H12 = 11,
    D1 = 12,
    W1 = 13,
    Mn1 = 14,
}

/// Wire-format bar: `low` is an absolute 1e-5 fixed-point price and the other
/// three corners are unsigned deltas above it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaTrendbar {
    #[prost(int64, required, tag = "3")]
    pub volume: i64,
    #[prost(enumeration = "TrendbarPeriod", optional, tag = "4")]
    pub period: Option<i32>,
    #[prost(int64, optional, tag = "5")]
    pub low: Option<i64>,
    #[prost(uint64, optional, tag = "6")]
    pub delta_open: Option<u64>,
    #[prost(uint64, optional, tag = "7")]
    pub delta_close: Option<u64>,
    #[prost(uint64, optional, tag = "8")]
    pub delta_high: Option<u64>,
    #[prost(uint32, optional, tag = "9")]
    pub utc_timestamp_in_minutes: Option<u32>,
}

impl ProtoOaTrendbar {
    /// Period of this bar, defaulting to M1 when the broker omits the field.
    pub fn period_value(&self) -> TrendbarPeriod {
        self.period
            .and_then(|p| TrendbarPeriod::try_from(p).ok())
            .unwrap_or(TrendbarPeriod::M1)
    }

    /// Resolve the delta encoding into a plain [`Bar`]. Returns `None` when
    /// the bar is missing its low anchor or timestamp (the broker sends such
    /// placeholders for not-yet-formed bars).
    pub fn to_bar(&self) -> Option<Bar> {
        let low_raw = self.low?;
        let minutes = self.utc_timestamp_in_minutes?;
        let low = low_raw as f64 / PRICE_SCALE;
        let open = (low_raw + self.delta_open.unwrap_or(0) as i64) as f64 / PRICE_SCALE;
        let high = (low_raw + self.delta_high.unwrap_or(0) as i64) as f64 / PRICE_SCALE;
        let close = (low_raw + self.delta_close.unwrap_or(0) as i64) as f64 / PRICE_SCALE;
        Some(Bar {
            timestamp_ms: minutes as i64 * 60_000,
            open,
            high,
            low,
            close,
            volume: self.volume,
        })
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaGetTrendbarsReq {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, required, tag = "3")]
    pub from_timestamp: i64,
    #[prost(int64, required, tag = "4")]
    pub to_timestamp: i64,
    #[prost(enumeration = "TrendbarPeriod", required, tag = "5")]
    pub period: i32,
    #[prost(int64, required, tag = "6")]
    pub symbol_id: i64,
    #[prost(uint32, optional, tag = "7")]
    pub count: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaGetTrendbarsRes {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(enumeration = "TrendbarPeriod", required, tag = "3")]
    pub period: i32,
    #[prost(message, repeated, tag = "5")]
    pub trendbar: Vec<ProtoOaTrendbar>,
    #[prost(int64, optional, tag = "6")]
    pub symbol_id: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSubscribeLiveTrendbarReq {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(enumeration = "TrendbarPeriod", required, tag = "3")]
    pub period: i32,
    #[prost(int64, required, tag = "4")]
    pub symbol_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSubscribeLiveTrendbarRes {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaUnsubscribeLiveTrendbarReq {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(enumeration = "TrendbarPeriod", required, tag = "3")]
    pub period: i32,
    #[prost(int64, required, tag = "4")]
    pub symbol_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaUnsubscribeLiveTrendbarRes {
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn envelope_roundtrip() {
        let env = ProtoMessage {
            payload_type: 2100,
            payload: Some(vec![1, 2, 3]),
            client_msg_id: Some("abc-1".into()),
        };
        let bytes = env.encode_to_vec();
        let back = ProtoMessage::decode(bytes.as_slice()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn trendbar_delta_encoding_resolves() {
        // low = 1.08000, open +10 pips worth of 1e-5 units, high +25, close +5
        let tb = ProtoOaTrendbar {
            volume: 1234,
            period: Some(TrendbarPeriod::D1 as i32),
            low: Some(108_000),
            delta_open: Some(100),
            delta_close: Some(50),
            delta_high: Some(250),
            utc_timestamp_in_minutes: Some(28_000_000),
        };
        let bar = tb.to_bar().unwrap();
        assert!((bar.low - 1.08).abs() < 1e-9);
        assert!((bar.open - 1.081).abs() < 1e-9);
        assert!((bar.high - 1.0825).abs() < 1e-9);
        assert!((bar.close - 1.0805).abs() < 1e-9);
        assert_eq!(bar.timestamp_ms, 28_000_000i64 * 60_000);
        assert_eq!(bar.volume, 1234);
    }

    #[test]
    fn trendbar_without_anchor_is_none() {
        let tb = ProtoOaTrendbar {
            volume: 0,
            period: None,
            low: None,
            delta_open: None,
            delta_close: None,
            delta_high: None,
            utc_timestamp_in_minutes: Some(1),
        };
        assert!(tb.to_bar().is_none());
    }

    #[test]
    fn spot_event_optional_sides() {
        let ev = ProtoOaSpotEvent {
            ctid_trader_account_id: 7,
            symbol_id: 1,
            bid: Some(108_123),
            ask: None,
            trendbar: Vec::new(),
            timestamp: Some(1_700_000_000_000),
        };
        let bytes = ev.encode_to_vec();
        let back = ProtoOaSpotEvent::decode(bytes.as_slice()).unwrap();
        assert_eq!(back.bid, Some(108_123));
        assert_eq!(back.ask, None);
        assert!((price_from_wire(back.bid.unwrap()) - 1.08123).abs() < 1e-9);
    }

    #[test]
    fn period_defaults_to_m1() {
        let tb = ProtoOaTrendbar {
            volume: 1,
            period: None,
            low: Some(1),
            delta_open: None,
            delta_close: None,
            delta_high: None,
            utc_timestamp_in_minutes: Some(1),
        };
        assert_eq!(tb.period_value(), TrendbarPeriod::M1);
    }
}
