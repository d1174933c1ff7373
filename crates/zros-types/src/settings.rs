//! Configuration schema consumed at startup.
//!
//! The schema is format-agnostic: the CLI reads it from TOML, JSON or YAML.
//! Every section carries defaults so a file only needs the channels it
//! declares.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::value::{Schema, TypeDescriptor};
use crate::{Direction, Format, Pattern};

/// Whole bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BridgeSettings {
    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub rosbridge: RosbridgeSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    /// Named endpoint overrides referenced by `ChannelConfig::endpoint`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<EndpointSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelConfig>,
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// One configured route between a bus entity and a socket entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChannelConfig {
    /// Unique key, stable across reconfiguration.
    pub key: String,

    pub direction: Direction,

    /// Topic or service name on the bus side.
    #[serde(default)]
    pub bus_name: String,

    #[serde(default, skip_serializing_if = "TypeDescriptor::is_empty")]
    pub bus_type: TypeDescriptor,

    /// Topic (pub/sub, push/pull) or service name (req/rep) on the socket side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_topic: Option<String>,

    /// Named endpoint or literal address; the direction's default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_serialization")]
    pub serialization: Format,

    /// Drive the channel from a timer at this rate (Hz).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,

    /// Static content emitted on every timer tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,

    /// Maximum delivery rate towards the bus (Hz).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_hz: Option<f64>,

    /// Decode target for payloads arriving on this channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
}

fn default_serialization() -> Format {
    Format::CANONICAL
}

impl ChannelConfig {
    pub fn new(
        key: impl Into<String>,
        direction: Direction,
        bus_name: impl Into<String>,
        remote_topic: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            direction,
            bus_name: bus_name.into(),
            bus_type: TypeDescriptor::default(),
            remote_topic: Some(remote_topic.into()),
            endpoint: None,
            serialization: default_serialization(),
            frequency: None,
            content: None,
            rate_limit_hz: None,
            schema: None,
        }
    }

    pub fn with_type(mut self, ty: impl Into<String>) -> Self {
        self.bus_type = TypeDescriptor::new(ty);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_serialization(mut self, format: Format) -> Self {
        self.serialization = format;
        self
    }

    pub fn with_frequency(mut self, hz: f64, content: serde_json::Value) -> Self {
        self.frequency = Some(hz);
        self.content = Some(content);
        self
    }

    pub fn with_rate_limit(mut self, hz: f64) -> Self {
        self.rate_limit_hz = Some(hz);
        self
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// Partial update applied by `update_channel`.
///
/// `direction` is accepted only so that an attempt to change it can be
/// rejected explicitly instead of being silently ignored.  Optional fields
/// listed in `clear` are reset to unset before the other fields apply, so
/// `{"clear": ["frequency", "content"]}` turns a periodic channel back into
/// an event-driven one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelPatch {
    pub direction: Option<Direction>,
    pub bus_name: Option<String>,
    pub bus_type: Option<TypeDescriptor>,
    pub remote_topic: Option<String>,
    pub endpoint: Option<String>,
    pub serialization: Option<Format>,
    pub frequency: Option<f64>,
    pub content: Option<serde_json::Value>,
    pub rate_limit_hz: Option<f64>,
    pub schema: Option<Schema>,
    pub clear: Vec<ChannelField>,
}

/// Optional channel fields a [`ChannelPatch`] can unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChannelField {
    Endpoint,
    Frequency,
    Content,
    RateLimitHz,
    Schema,
}

impl ChannelPatch {
    pub fn clears(&self, field: ChannelField) -> bool {
        self.clear.contains(&field)
    }

    /// Whether applying the patch changes anything that requires the channel
    /// to be rewired (new endpoint, new bus subscription or new timer).
    pub fn touches_wiring(&self) -> bool {
        self.bus_name.is_some()
            || self.bus_type.is_some()
            || self.remote_topic.is_some()
            || self.endpoint.is_some()
            || self.frequency.is_some()
            || self.rate_limit_hz.is_some()
            || self.clear.iter().any(|f| {
                matches!(f, ChannelField::Endpoint | ChannelField::Frequency | ChannelField::RateLimitHz)
            })
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// What to do when an endpoint's outbound buffer reaches its high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Evict the oldest buffered message; the publisher never blocks.
    DropOldest,
    /// Refuse the new message with `Busy`.
    Reject,
}

impl BackpressurePolicy {
    pub fn default_for(pattern: Pattern) -> Self {
        match pattern {
            Pattern::Pub => BackpressurePolicy::DropOldest,
            _ => BackpressurePolicy::Reject,
        }
    }
}

/// Concurrent `call_service` handling on one request endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestPolicy {
    /// Second caller fails with `Busy`.
    #[default]
    Reject,
    /// Second caller waits strictly behind the first.
    Queue,
}

/// Named endpoint declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EndpointSpec {
    pub name: String,
    pub pattern: Pattern,

    /// `tcp://host:port`, `tcp://*:port` or `inproc://name`.  Defaults to the
    /// pattern's port from `[transport]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Bind instead of connect.  Defaults to `true` for wildcard TCP hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_water_mark: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linger_millis: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backpressure: Option<BackpressurePolicy>,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Transport defaults shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TransportSettings {
    pub host: String,
    pub pub_port: u16,
    pub sub_port: u16,
    pub req_port: u16,
    pub rep_port: u16,
    pub push_port: u16,
    pub pull_port: u16,

    /// Queued-but-undelivered message limit per endpoint.
    pub high_water_mark: usize,
    /// Default `call_service` deadline and peer stall limit.
    pub socket_timeout_millis: u64,
    pub connect_timeout_millis: u64,
    /// Flush budget on close.
    pub linger_millis: u64,

    pub auto_reconnect: bool,
    pub reconnect_interval_seconds: f64,
    pub max_reconnect_interval_seconds: f64,
    pub backoff_multiplier: f64,
    /// `-1` retries forever.
    pub max_reconnect_attempts: i64,

    /// Consecutive send/receive failures before `Connected -> Degraded`.
    pub degrade_after_failures: u32,
    /// Idle heartbeat period for outbound streams; `0` disables it.
    pub heartbeat_interval_millis: u64,
    /// Silence tolerated while degraded before the link is dropped.
    pub heartbeat_timeout_millis: u64,

    pub max_message_bytes: usize,
    /// Enabled codec formats, in preference order.
    pub formats: Vec<Format>,
    pub request_policy: RequestPolicy,
    /// Inbound frames buffered per endpoint before new ones are dropped.
    pub inbound_queue: usize,

    pub show_message_content: bool,
    pub max_message_length: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            pub_port: 5556,
            sub_port: 5557,
            req_port: 5555,
            rep_port: 5558,
            push_port: 5559,
            pull_port: 5560,
            high_water_mark: 1000,
            socket_timeout_millis: 5000,
            connect_timeout_millis: 10_000,
            linger_millis: 1000,
            auto_reconnect: true,
            reconnect_interval_seconds: 5.0,
            max_reconnect_interval_seconds: 60.0,
            backoff_multiplier: 2.0,
            max_reconnect_attempts: 5,
            degrade_after_failures: 3,
            heartbeat_interval_millis: 0,
            heartbeat_timeout_millis: 15_000,
            max_message_bytes: 1024 * 1024,
            formats: Format::ALL.to_vec(),
            request_policy: RequestPolicy::Reject,
            inbound_queue: 1024,
            show_message_content: false,
            max_message_length: 200,
        }
    }
}

impl TransportSettings {
    pub fn default_port(&self, pattern: Pattern) -> u16 {
        match pattern {
            Pattern::Pub => self.pub_port,
            Pattern::Sub => self.sub_port,
            Pattern::Req => self.req_port,
            Pattern::Rep => self.rep_port,
            Pattern::Push => self.push_port,
            Pattern::Pull => self.pull_port,
        }
    }

    /// Default address for an endpoint of `pattern`.
    ///
    /// Publishers, reply servers and pull sinks bind; the rest connect to
    /// `host`.
    pub fn default_address(&self, pattern: Pattern) -> String {
        let port = self.default_port(pattern);
        match pattern {
            Pattern::Pub | Pattern::Rep | Pattern::Pull => format!("tcp://*:{port}"),
            Pattern::Sub | Pattern::Req | Pattern::Push => format!("tcp://{}:{port}", self.host),
        }
    }
}

/// Connection to a rosbridge server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RosbridgeSettings {
    #[serde(default = "default_rosbridge_url")]
    pub url: String,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: f64,

    #[serde(default = "default_retry_interval")]
    pub retry_interval_seconds: f64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: f64,
}

fn default_rosbridge_url() -> String {
    "ws://localhost:9090".to_string()
}
fn default_connection_timeout() -> f64 {
    10.0
}
fn default_retry_interval() -> f64 {
    1.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_call_timeout() -> f64 {
    10.0
}

impl Default for RosbridgeSettings {
    fn default() -> Self {
        Self {
            url: default_rosbridge_url(),
            connection_timeout_seconds: default_connection_timeout(),
            retry_interval_seconds: default_retry_interval(),
            max_retries: default_max_retries(),
            call_timeout_seconds: default_call_timeout(),
        }
    }
}

/// Startup connectivity probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NetworkSettings {
    #[serde(default = "default_true")]
    pub connectivity_check_enabled: bool,

    #[serde(default = "default_connectivity_timeout")]
    pub connectivity_timeout_seconds: f64,
}

fn default_true() -> bool {
    true
}
fn default_connectivity_timeout() -> f64 {
    3.0
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            connectivity_check_enabled: default_true(),
            connectivity_timeout_seconds: default_connectivity_timeout(),
        }
    }
}
