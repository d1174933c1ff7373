//! `zros-types` – shared vocabulary of the zros bridge.
//!
//! Plain data only: the dynamic message [`Value`], the routing enums, the
//! configuration schema consumed at startup and the error taxonomy surfaced
//! by the bridge core.  Nothing in this crate performs I/O.

pub mod settings;
pub mod value;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use settings::{
    BackpressurePolicy, BridgeSettings, ChannelConfig, ChannelField, ChannelPatch, EndpointSpec,
    NetworkSettings, RequestPolicy, RosbridgeSettings, TransportSettings,
};
pub use value::{Schema, TypeDescriptor, Value};

/// Which way a channel moves data, relative to the robotics bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Bus topic → socket endpoint.
    SubscribeFromBus,
    /// Socket endpoint → bus topic.
    PublishToBus,
    /// Blocking request sent out over a request socket.
    ServiceCall,
    /// Requests arriving on a reply socket, answered by a handler.
    ServiceServe,
}

impl Direction {
    /// Socket patterns a channel with this direction may be bound to.
    pub fn compatible_patterns(self) -> &'static [Pattern] {
        match self {
            Direction::SubscribeFromBus => &[Pattern::Pub, Pattern::Push],
            Direction::PublishToBus => &[Pattern::Sub, Pattern::Pull],
            Direction::ServiceCall => &[Pattern::Req],
            Direction::ServiceServe => &[Pattern::Rep],
        }
    }

    /// Pattern used when the channel does not name an endpoint.
    pub fn default_pattern(self) -> Pattern {
        self.compatible_patterns()[0]
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::SubscribeFromBus => write!(f, "subscribe_from_bus"),
            Direction::PublishToBus => write!(f, "publish_to_bus"),
            Direction::ServiceCall => write!(f, "service_call"),
            Direction::ServiceServe => write!(f, "service_serve"),
        }
    }
}

/// Socket messaging pattern of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    Pub,
    Sub,
    Req,
    Rep,
    Push,
    Pull,
}

impl Pattern {
    /// Whether the pattern ever carries outbound application traffic.
    pub fn sends(self) -> bool {
        matches!(self, Pattern::Pub | Pattern::Push | Pattern::Req | Pattern::Rep)
    }

    /// Whether inbound frames are expected on this pattern.
    pub fn receives(self) -> bool {
        matches!(self, Pattern::Sub | Pattern::Pull | Pattern::Req | Pattern::Rep)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Pattern::Pub => "pub",
            Pattern::Sub => "sub",
            Pattern::Req => "req",
            Pattern::Rep => "rep",
            Pattern::Push => "push",
            Pattern::Pull => "pull",
        };
        f.write_str(s)
    }
}

/// Wire formats understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Compact, type-preserving binary encoding.
    Binary,
    /// Textual-structured encoding; the canonical fallback.
    Json,
    /// UTF-8 text; only string messages.
    Text,
    /// Opaque bytes; only byte messages.
    Raw,
}

impl Format {
    /// The format every peer is expected to understand.
    pub const CANONICAL: Format = Format::Json;

    /// Default preference order.
    pub const ALL: [Format; 4] = [Format::Binary, Format::Json, Format::Text, Format::Raw];
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Format::Binary => "binary",
            Format::Json => "json",
            Format::Text => "text",
            Format::Raw => "raw",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Closing,
    Closed,
}

impl EndpointState {
    /// `send` is accepted without buffering in these states.
    pub fn is_live(self) -> bool {
        matches!(self, EndpointState::Connected | EndpointState::Degraded)
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointState::Disconnected => "disconnected",
            EndpointState::Connecting => "connecting",
            EndpointState::Connected => "connected",
            EndpointState::Degraded => "degraded",
            EndpointState::Closing => "closing",
            EndpointState::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Health reporting
// ---------------------------------------------------------------------------

/// Coarse, operator-facing health of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Degraded,
    Down,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Up => write!(f, "up"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Down => write!(f, "down"),
        }
    }
}

/// Per-channel traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChannelCounters {
    /// Messages handed to the socket side.
    pub forwarded: u64,
    /// Messages handed to the bus side (or replies resolved).
    pub delivered: u64,
    pub encode_failures: u64,
    pub decode_failures: u64,
    /// Messages that only succeeded with the canonical format.
    pub fallbacks: u64,
    /// Messages discarded by backpressure.
    pub dropped: u64,
    /// Messages discarded by the rate limiter.
    pub throttled: u64,
    pub heartbeats: u64,
}

/// Snapshot returned by the health surface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChannelHealth {
    pub key: String,
    pub direction: Direction,
    pub status: HealthStatus,
    pub endpoint: String,
    pub endpoint_state: EndpointState,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub counters: ChannelCounters,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure to turn a [`Value`] into bytes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("format {0} is not enabled")]
    Unsupported(Format),

    #[error("message cannot be encoded as {format}: {reason}")]
    Incompatible { format: Format, reason: String },
}

/// Failure to turn bytes back into a [`Value`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("format {0} is not enabled")]
    Unsupported(Format),

    /// Zero-length payload; a heartbeat on streaming patterns.
    #[error("empty payload")]
    Empty,

    #[error("malformed {format} payload: {reason}")]
    Malformed { format: Format, reason: String },

    #[error("expected {expected}, found {found}")]
    SchemaMismatch { expected: String, found: String },
}

/// Error taxonomy of the bridge core.
///
/// Per-message and per-call variants are returned to the immediate caller
/// and recorded on the channel's status; none of them is process-fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Duplicate channel key: {0}")]
    DuplicateKey(String),

    #[error("Invalid direction for channel {key}: {reason}")]
    InvalidDirection { key: String, reason: String },

    #[error("Channel not found: {0}")]
    NotFound(String),

    #[error("Direction of channel {0} cannot change; remove and re-add it")]
    DirectionImmutable(String),

    #[error("Encode Error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Decode Error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Endpoint {0} is not connected")]
    NotConnected(String),

    #[error("Endpoint {0} is busy")]
    Busy(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Call cancelled: {0}")]
    Cancelled(String),

    #[error("Endpoint {0} exhausted its reconnect attempts")]
    TransportFatal(String),

    #[error("Bridge is shutting down")]
    ShuttingDown,

    #[error("Remote service failed: {0}")]
    ServiceFailed(String),

    #[error("Bus Adapter Error: {0}")]
    Bus(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_serializes_snake_case() {
        let json = serde_json::to_string(&Direction::SubscribeFromBus).unwrap();
        assert_eq!(json, "\"subscribe_from_bus\"");
        let back: Direction = serde_json::from_str("\"service_serve\"").unwrap();
        assert_eq!(back, Direction::ServiceServe);
    }

    #[test]
    fn direction_pattern_compatibility() {
        assert!(Direction::SubscribeFromBus.compatible_patterns().contains(&Pattern::Push));
        assert!(!Direction::PublishToBus.compatible_patterns().contains(&Pattern::Pub));
        assert_eq!(Direction::ServiceCall.default_pattern(), Pattern::Req);
        assert_eq!(Direction::ServiceServe.default_pattern(), Pattern::Rep);
    }

    #[test]
    fn canonical_format_is_json() {
        assert_eq!(Format::CANONICAL, Format::Json);
        assert_eq!(Format::Binary.to_string(), "binary");
    }

    #[test]
    fn endpoint_state_liveness() {
        assert!(EndpointState::Connected.is_live());
        assert!(EndpointState::Degraded.is_live());
        assert!(!EndpointState::Connecting.is_live());
        assert!(!EndpointState::Closing.is_live());
    }

    #[test]
    fn bridge_error_display() {
        let err = BridgeError::Busy("req@tcp://localhost:5555".to_string());
        assert!(err.to_string().contains("busy"));
        let err: BridgeError = DecodeError::Empty.into();
        assert!(err.to_string().contains("empty payload"));
    }
}
