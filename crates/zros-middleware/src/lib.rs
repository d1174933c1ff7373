//! `zros-middleware` – the bridge core.
//!
//! Moves messages between a topic/service robotics bus and a socket
//! messaging fabric without caring what the messages mean.
//!
//! # Modules
//!
//! - [`codec`] – `Value` ⇄ bytes in binary, JSON, text or raw form, with a
//!   single fallback to the canonical JSON format.
//! - [`registry`] – the runtime-mutable arena of configured channels.
//! - [`settings`] – editable settings sections and endpoint resolution.
//! - [`transport`] – multipart frames over TCP or the in-process hub.
//! - [`socket_manager`] – endpoint state machine, reconnect backoff,
//!   high-water marks and linger.
//! - [`pending`] – one-call-at-a-time request/reply bookkeeping.
//! - [`dispatcher`] – the routing engine between both domains.
//! - [`adapter`] – the Bus Adapter boundary, with the in-process [`bus`] and
//!   the WebSocket [`rosbridge`] implementations.
//! - [`bridge`] – the facade: startup, reconfiguration, shutdown.
//!
//! # Data flow
//!
//! ```text
//! Bus Adapter ─▶ Dispatcher ─▶ Codec ─▶ Socket Manager ─▶ network
//! Bus Adapter ◀─ Dispatcher ◀─ Codec ◀─ Socket Manager ◀─ network
//! ```

pub mod adapter;
pub mod backoff;
pub mod bridge;
pub mod bus;
pub mod codec;
pub mod dispatcher;
pub mod pending;
pub mod registry;
pub mod rosbridge;
pub mod settings;
pub mod socket_manager;
pub mod status;
pub mod transport;

pub use adapter::{BusAdapter, BusSink, ServiceHandler, SubscriptionHandle};
pub use backoff::ReconnectPolicy;
pub use bridge::{Bridge, validate_settings};
pub use bus::{BusSubscriber, LoopbackBus};
pub use codec::Codec;
pub use dispatcher::Dispatcher;
pub use registry::ChannelRegistry;
pub use rosbridge::RosbridgeAdapter;
pub use settings::SettingsStore;
pub use socket_manager::{Endpoint, EndpointConfig, SocketManager};
pub use transport::{Address, Connector, Fabric, InprocHub};
