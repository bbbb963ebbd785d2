// =============================================================================
// Payload-type registry: number <-> message-name resolution
// =============================================================================
//
// The broker selects the inner message of every envelope by a numeric payload
// type. The registry carries one descriptor per supported type so that the
// session can resolve identifiers given as a message name, an enum constant
// name, or a raw number, and so unknown inbound payload types surface as a
// loggable event instead of a decode panic.
// =============================================================================

use prost::Message;

use crate::codec::messages::*;
use crate::error::CodecError;

// ── Payload-type numbers from the broker schema ─────────────────────────────

pub const PROTO_MESSAGE: u32 = 5;
pub const HEARTBEAT_EVENT: u32 = 51;
pub const APPLICATION_AUTH_REQ: u32 = 2100;
pub const APPLICATION_AUTH_RES: u32 = 2101;
pub const ACCOUNT_AUTH_REQ: u32 = 2102;
pub const ACCOUNT_AUTH_RES: u32 = 2103;
pub const SYMBOLS_LIST_REQ: u32 = 2114;
pub const SYMBOLS_LIST_RES: u32 = 2115;
pub const SYMBOL_BY_ID_REQ: u32 = 2116;
pub const SYMBOL_BY_ID_RES: u32 = 2117;
pub const SUBSCRIBE_SPOTS_REQ: u32 = 2127;
pub const SUBSCRIBE_SPOTS_RES: u32 = 2128;
pub const UNSUBSCRIBE_SPOTS_REQ: u32 = 2129;
pub const UNSUBSCRIBE_SPOTS_RES: u32 = 2130;
pub const SPOT_EVENT: u32 = 2131;
pub const SUBSCRIBE_LIVE_TRENDBAR_REQ: u32 = 2135;
pub const UNSUBSCRIBE_LIVE_TRENDBAR_REQ: u32 = 2136;
pub const GET_TRENDBARS_REQ: u32 = 2137;
pub const GET_TRENDBARS_RES: u32 = 2138;
pub const ERROR_RES: u32 = 2142;
pub const SUBSCRIBE_LIVE_TRENDBAR_RES: u32 = 2165;
pub const UNSUBSCRIBE_LIVE_TRENDBAR_RES: u32 = 2166;

/// One registry entry: numeric payload type plus both spellings of its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadDescriptor {
    pub payload_type: u32,
    /// Message name as written in the .proto file, e.g. `ProtoOASpotEvent`.
    pub message_name: &'static str,
    /// Enum constant name, e.g. `PROTO_OA_SPOT_EVENT`.
    pub constant_name: &'static str,
}

/// Every payload type this backend understands.
pub const DESCRIPTORS: &[PayloadDescriptor] = &[
    PayloadDescriptor {
        payload_type: PROTO_MESSAGE,
        message_name: "ProtoMessage",
        constant_name: "PROTO_MESSAGE",
    },
    PayloadDescriptor {
        payload_type: HEARTBEAT_EVENT,
        message_name: "ProtoHeartbeatEvent",
        constant_name: "HEARTBEAT_EVENT",
    },
    PayloadDescriptor {
        payload_type: APPLICATION_AUTH_REQ,
        message_name: "ProtoOAApplicationAuthReq",
        constant_name: "PROTO_OA_APPLICATION_AUTH_REQ",
    },
    PayloadDescriptor {
        payload_type: APPLICATION_AUTH_RES,
        message_name: "ProtoOAApplicationAuthRes",
        constant_name: "PROTO_OA_APPLICATION_AUTH_RES",
    },
    PayloadDescriptor {
        payload_type: ACCOUNT_AUTH_REQ,
        message_name: "ProtoOAAccountAuthReq",
        constant_name: "PROTO_OA_ACCOUNT_AUTH_REQ",
    },
    PayloadDescriptor {
        payload_type: ACCOUNT_AUTH_RES,
        message_name: "ProtoOAAccountAuthRes",
        constant_name: "PROTO_OA_ACCOUNT_AUTH_RES",
    },
    PayloadDescriptor {
        payload_type: SYMBOLS_LIST_REQ,
        message_name: "ProtoOASymbolsListReq",
        constant_name: "PROTO_OA_SYMBOLS_LIST_REQ",
    },
    PayloadDescriptor {
        payload_type: SYMBOLS_LIST_RES,
        message_name: "ProtoOASymbolsListRes",
        constant_name: "PROTO_OA_SYMBOLS_LIST_RES",
    },
    PayloadDescriptor {
        payload_type: SYMBOL_BY_ID_REQ,
        message_name: "ProtoOASymbolByIdReq",
        constant_name: "PROTO_OA_SYMBOL_BY_ID_REQ",
    },
    PayloadDescriptor {
        payload_type: SYMBOL_BY_ID_RES,
        message_name: "ProtoOASymbolByIdRes",
        constant_name: "PROTO_OA_SYMBOL_BY_ID_RES",
    },
    PayloadDescriptor {
        payload_type: SUBSCRIBE_SPOTS_REQ,
        message_name: "ProtoOASubscribeSpotsReq",
        constant_name: "PROTO_OA_SUBSCRIBE_SPOTS_REQ",
    },
    PayloadDescriptor {
        payload_type: SUBSCRIBE_SPOTS_RES,
        message_name: "ProtoOASubscribeSpotsRes",
        constant_name: "PROTO_OA_SUBSCRIBE_SPOTS_RES",
    },
    PayloadDescriptor {
        payload_type: UNSUBSCRIBE_SPOTS_REQ,
        message_name: "ProtoOAUnsubscribeSpotsReq",
        constant_name: "PROTO_OA_UNSUBSCRIBE_SPOTS_REQ",
    },
    PayloadDescriptor {
        payload_type: UNSUBSCRIBE_SPOTS_RES,
        message_name: "ProtoOAUnsubscribeSpotsRes",
        constant_name: "PROTO_OA_UNSUBSCRIBE_SPOTS_RES",
    },
    PayloadDescriptor {
        payload_type: SPOT_EVENT,
        message_name: "ProtoOASpotEvent",
        constant_name: "PROTO_OA_SPOT_EVENT",
    },
    PayloadDescriptor {
        payload_type: SUBSCRIBE_LIVE_TRENDBAR_REQ,
        message_name: "ProtoOASubscribeLiveTrendbarReq",
        constant_name: "PROTO_OA_SUBSCRIBE_LIVE_TRENDBAR_REQ",
    },
    PayloadDescriptor {
        payload_type: UNSUBSCRIBE_LIVE_TRENDBAR_REQ,
        message_name: "ProtoOAUnsubscribeLiveTrendbarReq",
        constant_name: "PROTO_OA_UNSUBSCRIBE_LIVE_TRENDBAR_REQ",
    },
    PayloadDescriptor {
        payload_type: GET_TRENDBARS_REQ,
        message_name: "ProtoOAGetTrendbarsReq",
        constant_name: "PROTO_OA_GET_TRENDBARS_REQ",
    },
    PayloadDescriptor {
        payload_type: GET_TRENDBARS_RES,
        message_name: "ProtoOAGetTrendbarsRes",
        constant_name: "PROTO_OA_GET_TRENDBARS_RES",
    },
    PayloadDescriptor {
        payload_type: ERROR_RES,
        message_name: "ProtoOAErrorRes",
        constant_name: "PROTO_OA_ERROR_RES",
    },
    PayloadDescriptor {
        payload_type: SUBSCRIBE_LIVE_TRENDBAR_RES,
        message_name: "ProtoOASubscribeLiveTrendbarRes",
        constant_name: "PROTO_OA_SUBSCRIBE_LIVE_TRENDBAR_RES",
    },
    PayloadDescriptor {
        payload_type: UNSUBSCRIBE_LIVE_TRENDBAR_RES,
        message_name: "ProtoOAUnsubscribeLiveTrendbarRes",
        constant_name: "PROTO_OA_UNSUBSCRIBE_LIVE_TRENDBAR_RES",
    },
];

/// Look up the descriptor for a numeric payload type.
pub fn describe(payload_type: u32) -> Option<&'static PayloadDescriptor> {
    DESCRIPTORS.iter().find(|d| d.payload_type == payload_type)
}

/// Resolve an identifier to a payload type. Accepts the message name
/// (`ProtoOASpotEvent`), the enum constant name (`PROTO_OA_SPOT_EVENT`), or
/// the raw number (`"2131"`).
pub fn resolve_identifier(identifier: &str) -> Result<u32, CodecError> {
    if let Ok(number) = identifier.parse::<u32>() {
        return match describe(number) {
            Some(d) => Ok(d.payload_type),
            None => Err(CodecError::UnknownPayloadType(number)),
        };
    }
    DESCRIPTORS
        .iter()
        .find(|d| d.message_name == identifier || d.constant_name == identifier)
        .map(|d| d.payload_type)
        .ok_or_else(|| CodecError::UnknownIdentifier(identifier.to_string()))
}

// =============================================================================
// Typed message <-> envelope bridging
// =============================================================================

/// Implemented by every payload message so the session can encode requests and
/// decode responses generically.
pub trait OpenApiMessage: Message + Default {
    const PAYLOAD_TYPE: u32;
    const MESSAGE_NAME: &'static str;
}

macro_rules! open_api_message {
    ($ty:ty, $payload_type:expr, $name:literal) => {
        impl OpenApiMessage for $ty {
            const PAYLOAD_TYPE: u32 = $payload_type;
            const MESSAGE_NAME: &'static str = $name;
        }
    };
}

open_api_message!(ProtoHeartbeatEvent, HEARTBEAT_EVENT, "ProtoHeartbeatEvent");
open_api_message!(
    ProtoOaApplicationAuthReq,
    APPLICATION_AUTH_REQ,
    "ProtoOAApplicationAuthReq"
);
open_api_message!(
    ProtoOaApplicationAuthRes,
    APPLICATION_AUTH_RES,
    "ProtoOAApplicationAuthRes"
);
open_api_message!(ProtoOaAccountAuthReq, ACCOUNT_AUTH_REQ, "ProtoOAAccountAuthReq");
open_api_message!(ProtoOaAccountAuthRes, ACCOUNT_AUTH_RES, "ProtoOAAccountAuthRes");
open_api_message!(ProtoOaSymbolsListReq, SYMBOLS_LIST_REQ, "ProtoOASymbolsListReq");
open_api_message!(ProtoOaSymbolsListRes, SYMBOLS_LIST_RES, "ProtoOASymbolsListRes");
open_api_message!(ProtoOaSymbolByIdReq, SYMBOL_BY_ID_REQ, "ProtoOASymbolByIdReq");
open_api_message!(ProtoOaSymbolByIdRes, SYMBOL_BY_ID_RES, "ProtoOASymbolByIdRes");
open_api_message!(
    ProtoOaSubscribeSpotsReq,
    SUBSCRIBE_SPOTS_REQ,
    "ProtoOASubscribeSpotsReq"
);
open_api_message!(
    ProtoOaSubscribeSpotsRes,
    SUBSCRIBE_SPOTS_RES,
    "ProtoOASubscribeSpotsRes"
);
open_api_message!(
    ProtoOaUnsubscribeSpotsReq,
    UNSUBSCRIBE_SPOTS_REQ,
    "ProtoOAUnsubscribeSpotsReq"
);
open_api_message!(
    ProtoOaUnsubscribeSpotsRes,
    UNSUBSCRIBE_SPOTS_RES,
    "ProtoOAUnsubscribeSpotsRes"
);
open_api_message!(ProtoOaSpotEvent, SPOT_EVENT, "ProtoOASpotEvent");
open_api_message!(
    ProtoOaSubscribeLiveTrendbarReq,
    SUBSCRIBE_LIVE_TRENDBAR_REQ,
    "ProtoOASubscribeLiveTrendbarReq"
);
open_api_message!(
    ProtoOaSubscribeLiveTrendbarRes,
    SUBSCRIBE_LIVE_TRENDBAR_RES,
    "ProtoOASubscribeLiveTrendbarRes"
);
open_api_message!(
    ProtoOaUnsubscribeLiveTrendbarReq,
    UNSUBSCRIBE_LIVE_TRENDBAR_REQ,
    "ProtoOAUnsubscribeLiveTrendbarReq"
);
open_api_message!(
    ProtoOaUnsubscribeLiveTrendbarRes,
    UNSUBSCRIBE_LIVE_TRENDBAR_RES,
    "ProtoOAUnsubscribeLiveTrendbarRes"
);
open_api_message!(ProtoOaGetTrendbarsReq, GET_TRENDBARS_REQ, "ProtoOAGetTrendbarsReq");
open_api_message!(ProtoOaGetTrendbarsRes, GET_TRENDBARS_RES, "ProtoOAGetTrendbarsRes");
open_api_message!(ProtoOaErrorRes, ERROR_RES, "ProtoOAErrorRes");

/// A decoded envelope: payload type, raw inner bytes, optional correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload_type: u32,
    pub payload: Vec<u8>,
    pub client_msg_id: Option<String>,
}

impl Envelope {
    /// True when the registry knows this payload type.
    pub fn is_known(&self) -> bool {
        describe(self.payload_type).is_some()
    }

    /// Decode the inner payload as `M`, checking the payload type first.
    pub fn decode_as<M: OpenApiMessage>(&self) -> Result<M, CodecError> {
        if self.payload_type != M::PAYLOAD_TYPE {
            return Err(CodecError::Schema {
                message: M::MESSAGE_NAME,
                detail: format!(
                    "payload type {} does not match expected {}",
                    self.payload_type,
                    M::PAYLOAD_TYPE
                ),
            });
        }
        M::decode(self.payload.as_slice()).map_err(|e| CodecError::Schema {
            message: M::MESSAGE_NAME,
            detail: e.to_string(),
        })
    }
}

/// Encode a typed message into envelope bytes (no length prefix; the frame
/// layer adds it).
pub fn encode_envelope<M: OpenApiMessage>(
    msg: &M,
    client_msg_id: Option<String>,
) -> Result<Vec<u8>, CodecError> {
    // Registry membership is enforced by the OpenApiMessage impl list, but a
    // descriptor lookup keeps a schema drift from silently encoding frames
    // the reader side cannot name.
    if describe(M::PAYLOAD_TYPE).is_none() {
        return Err(CodecError::UnknownPayloadType(M::PAYLOAD_TYPE));
    }
    let envelope = ProtoMessage {
        payload_type: M::PAYLOAD_TYPE,
        payload: Some(msg.encode_to_vec()),
        client_msg_id,
    };
    Ok(envelope.encode_to_vec())
}

/// Decode envelope bytes (no length prefix) into an [`Envelope`].
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let envelope =
        ProtoMessage::decode(bytes).map_err(|e| CodecError::Frame(e.to_string()))?;
    Ok(Envelope {
        payload_type: envelope.payload_type,
        payload: envelope.payload.unwrap_or_default(),
        client_msg_id: envelope.client_msg_id.filter(|id| !id.is_empty()),
    })
}
