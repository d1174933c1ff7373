//! In-process robotics bus.
//!
//! [`LoopbackBus`] implements [`BusAdapter`] on top of
//! [`tokio::sync::broadcast`] lanes, one per topic, so every subscriber sees
//! every message and a slow subscriber only ever lags itself.  Services are
//! plain [`ServiceHandler`]s registered by name.
//!
//! It backs `zros run --loopback` and the test suites.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use zros_types::{BridgeError, TypeDescriptor, Value};

use crate::adapter::{BusAdapter, BusSink, ServiceHandler, SubscriptionHandle};

/// Default lane capacity (messages buffered before slow subscribers lag).
const DEFAULT_CAPACITY: usize = 256;

struct Lane {
    ty: TypeDescriptor,
    sender: broadcast::Sender<Value>,
}

/// Shared in-process bus.  Clone it cheaply; clones share every lane.
#[derive(Clone)]
pub struct LoopbackBus {
    lanes: Arc<DashMap<String, Lane>>,
    services: Arc<DashMap<String, Arc<dyn ServiceHandler>>>,
    capacity: usize,
}

impl LoopbackBus {
    /// Create a bus whose lanes buffer `capacity` messages each.
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Arc::new(DashMap::new()),
            services: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Lane for `name`, created on first use.
    ///
    /// The first non-empty type descriptor seen on a topic sticks; a later
    /// publisher or subscriber with a different one is refused.
    fn lane(&self, name: &str, ty: &TypeDescriptor) -> Result<broadcast::Sender<Value>, BridgeError> {
        let mut lane = self.lanes.entry(name.to_string()).or_insert_with(|| Lane {
            ty: TypeDescriptor::default(),
            sender: broadcast::channel(self.capacity).0,
        });
        if !ty.is_empty() {
            if lane.ty.is_empty() {
                lane.ty = ty.clone();
            } else if lane.ty != *ty {
                return Err(BridgeError::Bus(format!(
                    "topic {name} carries {} but {ty} was requested",
                    lane.ty
                )));
            }
        }
        Ok(lane.sender.clone())
    }

    /// Publish `value` on `name` as a bus-side node would.
    ///
    /// Returns the number of subscribers that were handed the message.
    pub fn publish_value(&self, name: &str, value: Value) -> usize {
        match self.lane(name, &TypeDescriptor::default()) {
            Ok(sender) => sender.send(value).unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Listen on `name` as a bus-side node would.
    pub fn subscribe_topic(&self, name: &str) -> BusSubscriber {
        let receiver = match self.lane(name, &TypeDescriptor::default()) {
            Ok(sender) => sender.subscribe(),
            // An untyped lookup never conflicts.
            Err(_) => broadcast::channel(1).1,
        };
        BusSubscriber { topic: name.to_string(), receiver }
    }

    /// Offer service `name` on the bus.  Replaces any previous handler.
    pub fn advertise_service(&self, name: &str, handler: impl ServiceHandler + 'static) {
        self.services.insert(name.to_string(), Arc::new(handler));
    }

    /// Topics with at least one lane, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lanes.iter().map(|l| l.key().clone()).collect();
        names.sort();
        names
    }

    /// Active subscribers on `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.lanes.get(name).map_or(0, |l| l.sender.receiver_count())
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl BusAdapter for LoopbackBus {
    async fn publish(&self, name: &str, ty: &TypeDescriptor, msg: Value) -> Result<(), BridgeError> {
        let sender = self.lane(name, ty)?;
        // No listener is a normal condition on a bus.
        if sender.send(msg).is_err() {
            debug!(topic = %name, "published with no bus subscribers");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        name: &str,
        ty: &TypeDescriptor,
        sink: BusSink,
    ) -> Result<SubscriptionHandle, BridgeError> {
        let mut rx = self.lane(name, ty)?.subscribe();
        let topic = name.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(value) => match sink.try_send(value) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!(topic = %topic, "bus subscriber sink full; message dropped");
                            }
                            Err(TrySendError::Closed(_)) => break,
                        },
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(topic = %topic, lagged_by = n, "bus subscription lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = sink.closed() => break,
                }
            }
        });
        Ok(SubscriptionHandle::new(move || task.abort()))
    }

    async fn call_service(&self, name: &str, _ty: &TypeDescriptor, request: Value) -> Result<Value, BridgeError> {
        let handler = self
            .services
            .get(name)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| BridgeError::Bus(format!("no service advertised as {name}")))?;
        handler.handle(request).await.map_err(BridgeError::ServiceFailed)
    }
}

// ---------------------------------------------------------------------------
// Bus-side subscriber
// ---------------------------------------------------------------------------

/// A bus-side listener on one topic.
pub struct BusSubscriber {
    topic: String,
    receiver: broadcast::Receiver<Value>,
}

impl BusSubscriber {
    /// Wait for the next message.  `None` once the lane is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, lagged_by = n, "BusSubscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Value> {
        loop {
            match self.receiver.try_recv() {
                Ok(value) => return Some(value),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    fn ty(s: &str) -> TypeDescriptor {
        TypeDescriptor::new(s)
    }

    #[tokio::test]
    async fn publish_reaches_bus_listener() -> Result<(), Box<dyn std::error::Error>> {
        let bus = LoopbackBus::default();
        let mut listener = bus.subscribe_topic("/chatter");
        bus.publish("/chatter", &ty("std_msgs/String"), Value::from("hi")).await?;
        assert_eq!(listener.recv().await, Some(Value::from("hi")));
        Ok(())
    }

    #[tokio::test]
    async fn publish_without_listeners_is_ok() -> Result<(), Box<dyn std::error::Error>> {
        let bus = LoopbackBus::default();
        bus.publish("/nobody", &ty("std_msgs/String"), Value::Null).await?;
        Ok(())
    }

    #[tokio::test]
    async fn subscription_forwards_until_dropped() -> Result<(), Box<dyn std::error::Error>> {
        let bus = LoopbackBus::default();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = bus.subscribe("/odom", &ty("nav_msgs/Odometry"), tx).await?;

        bus.publish_value("/odom", Value::Int(1));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
        assert_eq!(got, Some(Value::Int(1)));

        drop(handle);
        // The forwarding task owned the only sender.
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
        assert_eq!(closed, None);
        Ok(())
    }

    #[tokio::test]
    async fn conflicting_types_are_refused() {
        let bus = LoopbackBus::default();
        bus.publish("/x", &ty("a/A"), Value::Null).await.unwrap();
        let err = bus.publish("/x", &ty("b/B"), Value::Null).await.unwrap_err();
        assert!(matches!(err, BridgeError::Bus(_)));
        // Untyped access still works.
        assert!(bus.publish("/x", &TypeDescriptor::default(), Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn services_answer_calls() {
        let bus = LoopbackBus::default();
        bus.advertise_service("/add_two_ints", |req: Value| async move {
            let a = match req.get("a") {
                Some(Value::Int(a)) => *a,
                _ => return Err("missing a".to_string()),
            };
            let b = match req.get("b") {
                Some(Value::Int(b)) => *b,
                _ => return Err("missing b".to_string()),
            };
            Ok(Value::map([("sum", Value::Int(a + b))]))
        });
        let ty = ty("example_interfaces/AddTwoInts");
        let reply = bus
            .call_service("/add_two_ints", &ty, Value::map([("a", Value::Int(2)), ("b", Value::Int(3))]))
            .await
            .unwrap();
        assert_eq!(reply.get("sum"), Some(&Value::Int(5)));

        let failed = bus.call_service("/add_two_ints", &ty, Value::Null).await;
        assert_eq!(failed, Err(BridgeError::ServiceFailed("missing a".to_string())));

        let missing = bus.call_service("/nope", &ty, Value::Null).await;
        assert!(matches!(missing, Err(BridgeError::Bus(_))));
    }

    #[tokio::test]
    async fn lagging_listener_keeps_receiving() {
        let bus = LoopbackBus::new(4);
        let mut slow = bus.subscribe_topic("/flood");
        for i in 0..100 {
            bus.publish_value("/flood", Value::Int(i));
        }
        // The oldest surviving message is returned after the lag warning.
        assert_eq!(slow.recv().await, Some(Value::Int(96)));
    }
}
