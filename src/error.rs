// =============================================================================
// Typed errors at the component seams
// =============================================================================
//
// Each subsystem surfaces a small thiserror enum; `anyhow` is reserved for the
// application edges (startup, config loading). Session errors are stringly
// cloneable so a single disconnect can fail every pending request waiter.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the wire codec (framing + Protocol Buffers envelope).
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload type is not present in the registry.
    #[error("unknown payload type {0}")]
    UnknownPayloadType(u32),

    /// The identifier could not be resolved to a payload type.
    #[error("unresolvable message identifier {0:?}")]
    UnknownIdentifier(String),

    /// The payload bytes violate the message schema.
    #[error("schema violation for {message}: {detail}")]
    Schema {
        message: &'static str,
        detail: String,
    },

    /// The frame itself is malformed (truncated envelope, bad prefix).
    #[error("malformed frame: {0}")]
    Frame(String),

    /// The length prefix announces a frame larger than the configured cap.
    #[error("frame of {got} bytes exceeds the {limit} byte limit")]
    Oversize { got: usize, limit: usize },
}

/// Errors surfaced by the broker session to callers of `request`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// TCP/TLS read or write failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The broker answered a request with its generic error payload.
    #[error("broker error {code}: {description}")]
    Broker { code: String, description: String },

    /// No response arrived within the request deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The session dropped while the request was pending; callers may retry.
    #[error("broker session disconnected")]
    Disconnected,

    /// Encode/decode failure on the request or response payload.
    #[error("codec failure: {0}")]
    Codec(String),
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Errors surfaced by the symbol catalog.
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    /// The broker does not list this symbol for the account.
    #[error("symbol {0:?} not found")]
    NotFound(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Startup configuration problems. Fatal: the process exits with code 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {detail}")]
    Invalid { name: &'static str, detail: String },
}
