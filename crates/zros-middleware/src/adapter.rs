//! The Bus Adapter boundary.
//!
//! The bridge core never speaks to the robotics bus directly.  Everything it
//! needs from the bus goes through [`BusAdapter`], so the same dispatcher
//! runs against a live rosbridge server or an in-process loopback bus.
//!
//! # Overview
//!
//! - [`BusAdapter`] – publish, subscribe and call services on the bus.
//! - [`ServiceHandler`] – answers requests arriving on a reply endpoint.
//! - [`LoopbackBus`][crate::bus::LoopbackBus] – in-process bus for tests and
//!   offline runs.
//! - [`RosbridgeAdapter`][crate::rosbridge::RosbridgeAdapter] – rosbridge v2
//!   JSON protocol over a WebSocket.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;
use zros_types::{BridgeError, TypeDescriptor, Value};

/// Where a bus subscription delivers its messages.
pub type BusSink = mpsc::Sender<Value>;

/// Live bus subscription.  Dropping the handle unsubscribes.
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    /// A handle with nothing to release.
    pub fn detached() -> Self {
        Self { cancel: None }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").field("active", &self.cancel.is_some()).finish()
    }
}

/// Every robotics-bus backend must implement this trait.
///
/// # Contract
///
/// * `publish` – deliver `msg` on topic `name`.  The `ty` descriptor is the
///   channel's configured `bus_type`, passed through untouched.
///
/// * `subscribe` – forward every message seen on `name` into `sink` until the
///   returned handle is dropped.  Implementations must never block on a full
///   sink for longer than it takes to drop the message.
///
/// * `call_service` – invoke bus service `name` and wait for its response.
#[async_trait]
pub trait BusAdapter: Send + Sync {
    async fn publish(&self, name: &str, ty: &TypeDescriptor, msg: Value) -> Result<(), BridgeError>;

    async fn subscribe(
        &self,
        name: &str,
        ty: &TypeDescriptor,
        sink: BusSink,
    ) -> Result<SubscriptionHandle, BridgeError>;

    async fn call_service(&self, name: &str, ty: &TypeDescriptor, request: Value) -> Result<Value, BridgeError>;
}

/// Answers requests arriving on a `service_serve` channel.
///
/// Closures `Fn(Value) -> impl Future<Output = Result<Value, String>>` are
/// handlers too.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, request: Value) -> Result<Value, String>;
}

#[async_trait]
impl<F, Fut> ServiceHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    async fn handle(&self, request: Value) -> Result<Value, String> {
        self(request).await
    }
}
