//! The Dispatcher: the only component that sees both message domains.
//!
//! | Direction | Bus side | Socket side |
//! |---|---|---|
//! | `subscribe_from_bus` | subscription feeding [`Dispatcher::on_bus_message`] | `pub` / `push` endpoint |
//! | `publish_to_bus` | `publish` per decoded message | `sub` / `pull` endpoint |
//! | `service_call` | caller of [`Dispatcher::call_service`] | `req` endpoint |
//! | `service_serve` | handler, or the bus service by default | `rep` endpoint |
//!
//! Inbound frames of one endpoint are handled by one route task, strictly in
//! arrival order, so a `rep` endpoint answers one request before it looks at
//! the next.  Bus subscriptions and periodic timers get a task per channel.
//! Every task holds a weak reference to the dispatcher and ends once it is
//! gone.
//!
//! The registry is read on every event; a channel updated while traffic
//! flows takes effect from the next message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zros_types::{
    BridgeError, ChannelConfig, ChannelHealth, ChannelPatch, Direction, EncodeError, EndpointState, Format, Pattern,
    Schema, TypeDescriptor, Value,
};

use crate::adapter::{BusAdapter, ServiceHandler, SubscriptionHandle};
use crate::codec::Codec;
use crate::pending::CallSlot;
use crate::registry::{ChannelRegistry, validate_channel};
use crate::settings::SettingsStore;
use crate::socket_manager::{Endpoint, EndpointConfig, SocketManager};
use crate::status::{ChannelStatus, Counter, health_of};
use crate::transport::{Connector, Envelope, Inbound, Outbound, PeerId};

/// Bounds on the period of a periodic channel.
const MIN_PERIOD: Duration = Duration::from_millis(1);
const MAX_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Runtime wiring of one channel.
struct Binding {
    key: String,
    direction: Direction,
    endpoint: Arc<Endpoint>,
    status: Arc<ChannelStatus>,
    content: Mutex<Option<Value>>,
    limiter: Option<DefaultDirectRateLimiter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl Binding {
    fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.subscription.lock().take();
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.stop();
    }
}

/// What a channel needs to move one message, read from the registry.
struct Route {
    direction: Direction,
    bus_name: String,
    bus_type: TypeDescriptor,
    topic: String,
    format: Format,
    schema: Schema,
}

impl Route {
    fn of(c: &ChannelConfig) -> Self {
        Self {
            direction: c.direction,
            bus_name: c.bus_name.clone(),
            bus_type: c.bus_type.clone(),
            topic: c.remote_topic.clone().unwrap_or_default(),
            format: c.serialization,
            schema: c.schema.clone().unwrap_or_default(),
        }
    }
}

pub struct Dispatcher {
    me: Weak<Dispatcher>,
    registry: ChannelRegistry,
    sockets: SocketManager,
    settings: Arc<SettingsStore>,
    codec: RwLock<Arc<Codec>>,
    bus: Arc<dyn BusAdapter>,
    bindings: DashMap<String, Arc<Binding>>,
    routes: DashMap<String, JoinHandle<()>>,
    slots: DashMap<String, Arc<CallSlot>>,
    handlers: DashMap<String, Arc<dyn ServiceHandler>>,
    accepting: AtomicBool,
}

impl Dispatcher {
    pub fn new(settings: Arc<SettingsStore>, bus: Arc<dyn BusAdapter>, connector: Arc<dyn Connector>) -> Arc<Self> {
        let codec = Codec::new(settings.with(|s| s.transport.formats.clone()));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            registry: ChannelRegistry::new(),
            sockets: SocketManager::new(connector),
            settings,
            codec: RwLock::new(Arc::new(codec)),
            bus,
            bindings: DashMap::new(),
            routes: DashMap::new(),
            slots: DashMap::new(),
            handlers: DashMap::new(),
            accepting: AtomicBool::new(true),
        })
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn sockets(&self) -> &SocketManager {
        &self.sockets
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn codec(&self) -> Arc<Codec> {
        self.codec.read().clone()
    }

    /// Rebuild the codec from `transport.formats`.
    pub fn refresh_codec(&self) {
        let formats = self.settings.with(|s| s.transport.formats.clone());
        *self.codec.write() = Arc::new(Codec::new(formats));
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    fn ensure_accepting(&self) -> Result<(), BridgeError> {
        if self.is_accepting() { Ok(()) } else { Err(BridgeError::ShuttingDown) }
    }

    fn binding(&self, key: &str) -> Result<Arc<Binding>, BridgeError> {
        self.bindings
            .get(key)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| BridgeError::NotFound(key.to_string()))
    }

    fn route(&self, key: &str) -> Result<Route, BridgeError> {
        self.registry.with_channel(key, Route::of)
    }

    // -----------------------------------------------------------------------
    // Channel lifecycle
    // -----------------------------------------------------------------------

    /// Register and wire a channel.  Nothing else is touched when it fails.
    pub async fn add_channel(&self, config: ChannelConfig) -> Result<(), BridgeError> {
        self.ensure_accepting()?;
        validate_channel(&config)?;
        let endpoint = self.settings.resolve_endpoint(&config)?;
        self.registry.add(config.clone())?;
        if let Err(e) = self.wire(&config, endpoint, Arc::default()).await {
            self.registry.remove(&config.key);
            return Err(e);
        }
        self.ensure_registered(&config.key).await?;
        info!(channel = %config.key, direction = %config.direction, "channel added");
        Ok(())
    }

    /// Unwire and forget a channel.  Unknown keys are a no-op.
    ///
    /// A call in flight on the channel fails with `Cancelled`.  Returns
    /// whether the channel existed.
    pub async fn remove_channel(&self, key: &str) -> bool {
        let existed = self.registry.remove(key).is_some();
        self.unwire(key).await;
        self.handlers.remove(key);
        if existed {
            info!(channel = %key, "channel removed");
        }
        existed
    }

    /// Merge `patch` into a channel.
    ///
    /// Patches that move the channel (endpoint, topic, bus name or type,
    /// timer, rate limit) rewire it; counters survive the move.  If the new
    /// wiring cannot be set up the previous configuration is restored.
    pub async fn update_channel(&self, key: &str, patch: ChannelPatch) -> Result<ChannelConfig, BridgeError> {
        self.ensure_accepting()?;
        if !patch.touches_wiring() {
            let merged = self.registry.update(key, &patch)?;
            if let Some(binding) = self.bindings.get(key) {
                *binding.content.lock() = merged.content.clone().map(Value::from);
            }
            info!(channel = %key, "channel updated");
            return Ok(merged);
        }

        let previous = self.registry.resolve(key)?;
        let candidate = self.registry.preview(key, &patch)?;
        let endpoint = self.settings.resolve_endpoint(&candidate)?;
        let status = self.unwire(key).await.unwrap_or_default();
        let merged = self.registry.update(key, &patch)?;
        match self.wire(&merged, endpoint, Arc::clone(&status)).await {
            Ok(()) => {
                self.ensure_registered(key).await?;
                info!(channel = %key, "channel rewired");
                Ok(merged)
            }
            Err(e) if !self.registry.contains(key) => Err(e),
            Err(e) => {
                warn!(channel = %key, error = %e, "rewire failed; restoring previous wiring");
                let restored = match self.registry.replace(previous.clone()) {
                    Ok(()) => match self.settings.resolve_endpoint(&previous) {
                        Ok(ep) => match self.wire(&previous, ep, status).await {
                            Ok(()) => self.ensure_registered(key).await,
                            Err(e) => Err(e),
                        },
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                if let Err(e) = restored {
                    error!(channel = %key, error = %e, "previous wiring could not be restored; channel carries no traffic");
                }
                Err(e)
            }
        }
    }

    /// Change what a periodic channel emits on each tick.
    pub async fn update_content(&self, key: &str, content: serde_json::Value) -> Result<(), BridgeError> {
        let periodic = self.registry.with_channel(key, |c| c.frequency.is_some())?;
        if !periodic {
            return Err(BridgeError::Config(format!("channel {key} has no frequency")));
        }
        let patch = ChannelPatch { content: Some(content), ..Default::default() };
        self.update_channel(key, patch).await.map(|_| ())
    }

    /// Replace the handler answering requests on a `service_serve` channel.
    pub fn serve_service(&self, key: &str, handler: impl ServiceHandler + 'static) -> Result<(), BridgeError> {
        let direction = self.registry.with_channel(key, |c| c.direction)?;
        if direction != Direction::ServiceServe {
            return Err(BridgeError::InvalidDirection {
                key: key.to_string(),
                reason: format!("{direction} channels do not serve requests"),
            });
        }
        self.handlers.insert(key.to_string(), Arc::new(handler));
        debug!(channel = %key, "service handler registered");
        Ok(())
    }

    async fn wire(
        &self,
        config: &ChannelConfig,
        endpoint: EndpointConfig,
        status: Arc<ChannelStatus>,
    ) -> Result<(), BridgeError> {
        let acquired = self.sockets.acquire(endpoint)?;
        let endpoint = acquired.endpoint;
        let name = endpoint.name().to_string();
        if let Some(inbound) = acquired.inbound {
            let route = self.spawn_route(name.clone(), inbound);
            self.routes.insert(name.clone(), route);
        }
        if endpoint.pattern() == Pattern::Req {
            let policy = self.settings.with(|s| s.transport.request_policy);
            self.slots
                .entry(name.clone())
                .or_insert_with(|| CallSlot::new(name.clone(), policy));
        }

        let binding = Arc::new(Binding {
            key: config.key.clone(),
            direction: config.direction,
            endpoint,
            status,
            content: Mutex::new(config.content.clone().map(Value::from)),
            limiter: config.rate_limit_hz.and_then(limiter_for),
            tasks: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
        });

        if config.direction == Direction::SubscribeFromBus {
            match self.subscribe_bus(config).await {
                Ok((handle, task)) => {
                    *binding.subscription.lock() = Some(handle);
                    binding.tasks.lock().push(task);
                }
                Err(e) => {
                    drop(binding);
                    self.release_endpoint(&name).await;
                    return Err(e);
                }
            }
        }
        if let Some(hz) = config.frequency {
            binding.tasks.lock().push(self.spawn_periodic(config.key.clone(), hz));
        }
        if let Some(replaced) = self.bindings.insert(config.key.clone(), binding) {
            replaced.stop();
            let name = replaced.endpoint.name().to_string();
            drop(replaced);
            self.release_endpoint(&name).await;
        }
        Ok(())
    }

    /// Undo fresh wiring when `remove_channel` ran while `wire` was pending.
    ///
    /// `wire` inserts the binding before this looks at the registry and
    /// `remove_channel` drops the registry entry before the binding, so one
    /// of the two always sees the other.
    async fn ensure_registered(&self, key: &str) -> Result<(), BridgeError> {
        if self.registry.contains(key) {
            return Ok(());
        }
        self.unwire(key).await;
        debug!(channel = %key, "channel removed while wiring; released its endpoint");
        Err(BridgeError::NotFound(key.to_string()))
    }

    /// Tear down a channel's wiring and hand back its counters.
    async fn unwire(&self, key: &str) -> Option<Arc<ChannelStatus>> {
        let (_, binding) = self.bindings.remove(key)?;
        binding.stop();
        let name = binding.endpoint.name().to_string();
        if let Some(slot) = self.slots.get(&name).map(|s| Arc::clone(s.value())) {
            slot.cancel_channel(key, "channel removed");
        }
        let status = Arc::clone(&binding.status);
        drop(binding);
        self.release_endpoint(&name).await;
        Some(status)
    }

    async fn release_endpoint(&self, name: &str) {
        if let Some(driver) = self.sockets.release(name) {
            self.slots.remove(name);
            if let Some((_, route)) = self.routes.remove(name) {
                route.abort();
            }
            if let Err(e) = driver.await
                && !e.is_cancelled()
            {
                warn!(endpoint = %name, error = %e, "endpoint driver failed");
            }
        }
    }

    async fn subscribe_bus(&self, config: &ChannelConfig) -> Result<(SubscriptionHandle, JoinHandle<()>), BridgeError> {
        let depth = self.settings.with(|s| s.transport.inbound_queue.max(1));
        let (tx, mut rx) = mpsc::channel(depth);
        let handle = self.bus.subscribe(&config.bus_name, &config.bus_type, tx).await?;
        let me = self.me.clone();
        let key = config.key.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(dispatcher) = me.upgrade() else { break };
                if let Err(e) = dispatcher.on_bus_message(&key, msg) {
                    debug!(channel = %key, error = %e, "bus message not forwarded");
                }
            }
        });
        Ok((handle, task))
    }

    fn spawn_route(&self, endpoint: String, mut inbound: mpsc::Receiver<Inbound>) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let Some(dispatcher) = me.upgrade() else { break };
                dispatcher.on_socket_message(&endpoint, frame).await;
            }
            debug!(%endpoint, "route finished");
        })
    }

    fn spawn_periodic(&self, key: String, hz: f64) -> JoinHandle<()> {
        let period = Duration::try_from_secs_f64(1.0 / hz)
            .unwrap_or(MAX_PERIOD)
            .clamp(MIN_PERIOD, MAX_PERIOD);
        let me = self.me.clone();
        debug!(channel = %key, period_ms = period.as_millis() as u64, "periodic channel scheduled");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(dispatcher) = me.upgrade() else { break };
                dispatcher.periodic_tick(&key).await;
            }
        })
    }

    async fn periodic_tick(&self, key: &str) {
        let Ok(binding) = self.binding(key) else { return };
        let Some(content) = binding.content.lock().clone() else { return };
        match binding.direction {
            Direction::SubscribeFromBus => {
                if let Err(e) = self.on_bus_message(key, content) {
                    debug!(channel = %key, error = %e, "periodic message not forwarded");
                }
            }
            Direction::PublishToBus => {
                let Ok(route) = self.route(key) else { return };
                self.show(key, "bus", &content);
                match self.bus.publish(&route.bus_name, &route.bus_type, content).await {
                    Ok(()) => binding.status.bump(Counter::Delivered),
                    Err(e) => {
                        binding.status.record_error(&e);
                        warn!(channel = %key, error = %e, "periodic publish failed");
                    }
                }
            }
            Direction::ServiceCall | Direction::ServiceServe => {}
        }
    }

    // -----------------------------------------------------------------------
    // Bus → socket
    // -----------------------------------------------------------------------

    /// Encode a bus message and hand it to the channel's endpoint.
    ///
    /// Never blocks: the endpoint queues the frame for its driver.
    pub fn on_bus_message(&self, key: &str, msg: Value) -> Result<(), BridgeError> {
        self.ensure_accepting()?;
        let binding = self.binding(key)?;
        let route = self.route(key)?;
        if route.direction != Direction::SubscribeFromBus {
            return Err(BridgeError::InvalidDirection {
                key: key.to_string(),
                reason: format!("{} channels do not forward bus messages", route.direction),
            });
        }
        let payload = self.encode(&binding, &msg, route.format)?;
        let frame = Envelope::Message { topic: route.topic, payload }.into_frame();
        match binding.endpoint.send(Outbound::broadcast(frame)) {
            Ok(report) => {
                binding.status.bump(Counter::Forwarded);
                if report.evicted {
                    binding.status.bump(Counter::Dropped);
                }
                self.show(key, "socket", &msg);
                Ok(())
            }
            Err(e) => {
                binding.status.bump(Counter::Dropped);
                binding.status.record_error(&e);
                Err(e)
            }
        }
    }

    /// Preferred format, then the canonical one; size-checked.
    fn encode(&self, binding: &Binding, value: &Value, format: Format) -> Result<Vec<u8>, BridgeError> {
        let limit = binding.endpoint.config().max_message_bytes;
        let checked = self.codec().encode_with_fallback(value, format).and_then(|encoded| {
            if encoded.bytes.is_empty() {
                Err(EncodeError::Incompatible {
                    format: encoded.format,
                    reason: "an empty payload would read as a heartbeat".to_string(),
                })
            } else if encoded.bytes.len() > limit {
                Err(EncodeError::Incompatible {
                    format: encoded.format,
                    reason: format!("{} bytes exceeds the {limit} byte limit", encoded.bytes.len()),
                })
            } else {
                Ok(encoded)
            }
        });
        match checked {
            Ok(encoded) => {
                if encoded.fell_back {
                    binding.status.bump(Counter::Fallback);
                    debug!(channel = %binding.key, preferred = %format, "encoded with canonical format");
                }
                Ok(encoded.bytes)
            }
            Err(e) => {
                binding.status.bump(Counter::EncodeFailure);
                binding.status.record_error(&e);
                warn!(channel = %binding.key, error = %e, "encode failed; message dropped");
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Socket → bus
    // -----------------------------------------------------------------------

    /// Handle one frame received by `endpoint`.
    pub async fn on_socket_message(&self, endpoint: &str, inbound: Inbound) {
        let Some(ep) = self.sockets.get(endpoint) else { return };
        let envelope = match Envelope::from_frame(ep.pattern(), inbound.frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%endpoint, error = %e, "malformed frame dropped");
                return;
            }
        };
        match envelope {
            Envelope::Message { topic, payload } => self.deliver_to_bus(endpoint, &topic, &payload).await,
            Envelope::Reply { id, outcome } => {
                let Some(slot) = self.slots.get(endpoint).map(|s| Arc::clone(s.value())) else {
                    warn!(%endpoint, correlation_id = %id, "reply on an endpoint with no calls");
                    return;
                };
                slot.resolve(id, outcome.map_err(BridgeError::ServiceFailed));
            }
            Envelope::Request { id, service, payload } => {
                self.answer(&ep, inbound.peer, id, &service, payload).await;
            }
        }
    }

    /// Publish a streamed message to every channel on `endpoint` whose topic
    /// prefixes `topic`.  Heartbeats only bump counters.
    async fn deliver_to_bus(&self, endpoint: &str, topic: &str, payload: &[u8]) {
        let targets: Vec<Arc<Binding>> = self
            .bindings
            .iter()
            .filter(|b| b.direction == Direction::PublishToBus && b.endpoint.name() == endpoint)
            .map(|b| Arc::clone(b.value()))
            .collect();
        if payload.is_empty() {
            for binding in &targets {
                binding.status.bump(Counter::Heartbeat);
            }
            return;
        }

        let mut matched = false;
        for binding in targets {
            let Ok(route) = self.route(&binding.key) else { continue };
            if !topic.starts_with(route.topic.as_str()) {
                continue;
            }
            matched = true;
            if let Some(limiter) = &binding.limiter
                && limiter.check().is_err()
            {
                binding.status.bump(Counter::Throttled);
                debug!(channel = %binding.key, "rate limited; message dropped");
                continue;
            }
            let value = match self.codec().decode_with_fallback(payload, route.format, &route.schema) {
                Ok(decoded) => {
                    if decoded.fell_back {
                        binding.status.bump(Counter::Fallback);
                        debug!(channel = %binding.key, preferred = %route.format, "decoded with canonical format");
                    }
                    decoded.value
                }
                Err(e) => {
                    binding.status.bump(Counter::DecodeFailure);
                    binding.status.record_error(&e);
                    warn!(channel = %binding.key, error = %e, "decode failed; message dropped");
                    continue;
                }
            };
            self.show(&binding.key, "bus", &value);
            match self.bus.publish(&route.bus_name, &route.bus_type, value).await {
                Ok(()) => binding.status.bump(Counter::Delivered),
                Err(e) => {
                    binding.status.record_error(&e);
                    warn!(channel = %binding.key, error = %e, "bus publish failed");
                }
            }
        }
        if !matched {
            debug!(%endpoint, %topic, "no channel for topic");
        }
    }

    // -----------------------------------------------------------------------
    // Services
    // -----------------------------------------------------------------------

    /// Answer one request arriving on a `rep` endpoint.
    async fn answer(&self, endpoint: &Endpoint, peer: PeerId, id: Uuid, service: &str, payload: Vec<u8>) {
        let binding = self
            .bindings
            .iter()
            .filter(|b| b.direction == Direction::ServiceServe && b.endpoint.name() == endpoint.name())
            .find(|b| {
                self.registry
                    .with_channel(&b.value().key, |c| c.remote_topic.as_deref() == Some(service))
                    .unwrap_or(false)
            })
            .map(|b| Arc::clone(b.value()));

        let outcome = match binding {
            Some(binding) => self.serve(&binding, &payload).await,
            None => {
                warn!(endpoint = %endpoint.name(), %service, "request for unknown service");
                Err(format!("no service {service} on this endpoint"))
            }
        };
        let frame = Envelope::Reply { id, outcome }.into_frame();
        if let Err(e) = endpoint.send(Outbound::to(peer, frame)) {
            warn!(endpoint = %endpoint.name(), correlation_id = %id, error = %e, "reply not sent");
        }
    }

    async fn serve(&self, binding: &Binding, payload: &[u8]) -> Result<Vec<u8>, String> {
        let route = self.route(&binding.key).map_err(|e| e.to_string())?;
        let request = match self.codec().decode_with_fallback(payload, route.format, &route.schema) {
            Ok(decoded) => {
                if decoded.fell_back {
                    binding.status.bump(Counter::Fallback);
                }
                decoded.value
            }
            Err(e) => {
                binding.status.bump(Counter::DecodeFailure);
                binding.status.record_error(&e);
                return Err(e.to_string());
            }
        };
        binding.status.bump(Counter::Delivered);
        self.show(&binding.key, "handler", &request);

        let handler = self.handlers.get(&binding.key).map(|h| Arc::clone(h.value()));
        let reply = match handler {
            Some(handler) => handler.handle(request).await,
            None => self
                .bus
                .call_service(&route.bus_name, &route.bus_type, request)
                .await
                .map_err(|e| match e {
                    BridgeError::ServiceFailed(reason) => reason,
                    other => other.to_string(),
                }),
        };
        match reply {
            Ok(value) => {
                let bytes = self.encode(binding, &value, route.format).map_err(|e| e.to_string())?;
                binding.status.bump(Counter::Forwarded);
                Ok(bytes)
            }
            Err(reason) => {
                binding.status.record_error(&reason);
                warn!(channel = %binding.key, %reason, "service handler failed");
                Err(reason)
            }
        }
    }

    /// Make one request/reply turn on a `service_call` channel.
    ///
    /// `timeout` defaults to `transport.socket_timeout_millis`.  The caller
    /// is suspended until the reply arrives, the deadline passes, or the
    /// call is cancelled by channel removal, link loss or shutdown.
    ///
    /// # Errors
    ///
    /// `NotConnected` / `TransportFatal` when the endpoint has no link,
    /// `Busy` when another call is outstanding under the reject policy,
    /// `Timeout`, `Cancelled`, `ServiceFailed` for a remote handler failure,
    /// and codec errors for either direction.
    pub async fn call_service(&self, key: &str, request: Value, timeout: Option<Duration>) -> Result<Value, BridgeError> {
        self.ensure_accepting()?;
        let binding = self.binding(key)?;
        let route = self.route(key)?;
        if route.direction != Direction::ServiceCall {
            return Err(BridgeError::InvalidDirection {
                key: key.to_string(),
                reason: format!("{} channels do not make calls", route.direction),
            });
        }
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_millis(self.settings.with(|s| s.transport.socket_timeout_millis)));
        let deadline = Instant::now() + timeout;
        let endpoint = Arc::clone(&binding.endpoint);
        if endpoint.is_exhausted() {
            return Err(BridgeError::TransportFatal(endpoint.name().to_string()));
        }
        if !endpoint.state().is_live() {
            return Err(BridgeError::NotConnected(endpoint.name().to_string()));
        }
        let slot = self
            .slots
            .get(endpoint.name())
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| BridgeError::NotConnected(endpoint.name().to_string()))?;

        let mut ticket = slot.begin(key, deadline, timeout).await?;
        let payload = self.encode(&binding, &request, route.format)?;
        let frame = Envelope::Request { id: ticket.id, service: route.topic, payload }.into_frame();
        if let Err(e) = endpoint.send(Outbound::broadcast(frame)) {
            binding.status.record_error(&e);
            return Err(e);
        }
        binding.status.bump(Counter::Forwarded);
        self.show(key, "socket", &request);

        let outcome = tokio::select! {
            outcome = ticket.outcome() => outcome,
            _ = tokio::time::sleep_until(deadline) => Err(BridgeError::Timeout(timeout)),
            _ = link_lost(endpoint.subscribe_state()) => {
                Err(BridgeError::Cancelled(format!("endpoint {} lost its link", endpoint.name())))
            }
        };
        drop(ticket);

        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(e) => {
                binding.status.record_error(&e);
                warn!(channel = %key, error = %e, "call failed");
                return Err(e);
            }
        };
        match self.codec().decode_with_fallback(&bytes, route.format, &route.schema) {
            Ok(decoded) => {
                if decoded.fell_back {
                    binding.status.bump(Counter::Fallback);
                }
                binding.status.bump(Counter::Delivered);
                Ok(decoded.value)
            }
            Err(e) => {
                binding.status.bump(Counter::DecodeFailure);
                binding.status.record_error(&e);
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    pub fn health(&self, key: &str) -> Result<ChannelHealth, BridgeError> {
        let binding = self.binding(key)?;
        let state = binding.endpoint.state();
        let last = latest(binding.status.last_error(), binding.endpoint.last_error());
        Ok(ChannelHealth {
            key: key.to_string(),
            direction: binding.direction,
            status: health_of(state, binding.endpoint.is_exhausted()),
            endpoint: binding.endpoint.name().to_string(),
            endpoint_state: state,
            last_error_at: last.as_ref().map(|(_, at)| *at),
            last_error: last.map(|(msg, _)| msg),
            counters: binding.status.counters(),
        })
    }

    /// Health of every channel, in insertion order.
    pub fn health_report(&self) -> Vec<ChannelHealth> {
        self.registry.keys().iter().filter_map(|k| self.health(k).ok()).collect()
    }

    fn show(&self, key: &str, towards: &'static str, value: &Value) {
        let (show, max) = self.settings.with(|s| (s.transport.show_message_content, s.transport.max_message_length));
        if show {
            info!(channel = %key, towards, content = %preview(value, max), "message");
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Ordered teardown.  Idempotent.
    ///
    /// New messages and calls are refused first, outstanding calls are
    /// cancelled, channel tasks stop, then every endpoint flushes within its
    /// linger budget and closes.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(channels = self.bindings.len(), endpoints = self.sockets.len(), "dispatcher shutting down");
        for slot in self.slots.iter() {
            slot.cancel("bridge shutting down");
        }
        let keys: Vec<String> = self.bindings.iter().map(|b| b.key().clone()).collect();
        for key in keys {
            if let Some((_, binding)) = self.bindings.remove(&key) {
                binding.stop();
            }
        }
        self.handlers.clear();
        self.sockets.shutdown().await;
        for route in self.routes.iter() {
            route.abort();
        }
        self.routes.clear();
        self.slots.clear();
        info!("dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for route in self.routes.iter() {
            route.abort();
        }
        for endpoint in self.sockets.endpoints() {
            endpoint.close();
        }
    }
}

fn limiter_for(hz: f64) -> Option<DefaultDirectRateLimiter> {
    let period = Duration::try_from_secs_f64(1.0 / hz).ok()?;
    Quota::with_period(period).map(RateLimiter::direct)
}

/// Resolves once the endpoint is no longer live.
async fn link_lost(mut state: watch::Receiver<EndpointState>) {
    loop {
        if !state.borrow_and_update().is_live() {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

fn latest(
    a: Option<(String, DateTime<Utc>)>,
    b: Option<(String, DateTime<Utc>)>,
) -> Option<(String, DateTime<Utc>)> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.1 > a.1 { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Payload text for logs, cut at `max` characters.
fn preview(value: &Value, max: usize) -> String {
    let text = value.to_json().to_string();
    if text.chars().count() <= max {
        return text;
    }
    let mut cut: String = text.chars().take(max).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;
    use crate::transport::Fabric;
    use zros_types::BridgeSettings;

    fn dispatcher() -> Arc<Dispatcher> {
        let settings = Arc::new(SettingsStore::new(BridgeSettings::default()));
        Dispatcher::new(settings, Arc::new(LoopbackBus::default()), Arc::new(Fabric::new()))
    }

    fn inproc_channel(key: &str, direction: Direction) -> ChannelConfig {
        ChannelConfig::new(key, direction, format!("/{key}"), key).with_endpoint(format!("inproc://{key}"))
    }

    #[test]
    fn preview_truncates_long_payloads() {
        let v = Value::from("abcdefghij");
        assert_eq!(preview(&v, 100), "\"abcdefghij\"");
        assert_eq!(preview(&v, 4), "\"abc...");
    }

    #[test]
    fn latest_error_wins() {
        let early = Utc::now() - chrono::Duration::seconds(5);
        let late = Utc::now();
        let picked = latest(Some(("old".to_string(), early)), Some(("new".to_string(), late)));
        assert_eq!(picked.map(|(m, _)| m), Some("new".to_string()));
        assert_eq!(latest(None, None), None);
    }

    #[tokio::test]
    async fn unknown_channel_is_not_found() {
        let d = dispatcher();
        assert_eq!(
            d.on_bus_message("ghost", Value::Null),
            Err(BridgeError::NotFound("ghost".to_string()))
        );
        assert!(matches!(d.health("ghost"), Err(BridgeError::NotFound(_))));
        assert!(!d.remove_channel("ghost").await);
    }

    #[tokio::test]
    async fn wrong_direction_is_refused() {
        let d = dispatcher();
        d.add_channel(inproc_channel("cmd", Direction::PublishToBus)).await.unwrap();
        assert!(matches!(
            d.on_bus_message("cmd", Value::from("x")),
            Err(BridgeError::InvalidDirection { .. })
        ));
        assert!(matches!(
            d.call_service("cmd", Value::Null, None).await,
            Err(BridgeError::InvalidDirection { .. })
        ));
        assert!(matches!(
            d.serve_service("cmd", |v: Value| async move { Ok(v) }),
            Err(BridgeError::InvalidDirection { .. })
        ));
        d.shutdown().await;
    }

    #[tokio::test]
    async fn failed_add_leaves_registry_untouched() {
        let d = dispatcher();
        let bad = inproc_channel("bad", Direction::PublishToBus).with_endpoint("udp://nowhere:1");
        assert!(matches!(d.add_channel(bad).await, Err(BridgeError::Config(_))));
        assert!(d.registry().is_empty());
        assert!(d.sockets().is_empty());
    }

    #[tokio::test]
    async fn channels_on_one_endpoint_share_it() {
        let d = dispatcher();
        let a = ChannelConfig::new("a", Direction::SubscribeFromBus, "/a", "a").with_endpoint("inproc://shared");
        let b = ChannelConfig::new("b", Direction::SubscribeFromBus, "/b", "b").with_endpoint("inproc://shared");
        d.add_channel(a).await.unwrap();
        d.add_channel(b).await.unwrap();
        assert_eq!(d.sockets().len(), 1);
        assert!(d.remove_channel("a").await);
        assert_eq!(d.sockets().len(), 1);
        assert!(d.remove_channel("b").await);
        assert!(d.sockets().is_empty());
    }

    #[tokio::test]
    async fn wiring_finished_after_removal_is_released() {
        let d = dispatcher();
        let config = inproc_channel("late", Direction::SubscribeFromBus);
        let endpoint = d.settings.resolve_endpoint(&config).unwrap();
        // The registry entry is already gone when the wiring lands.
        d.wire(&config, endpoint, Arc::default()).await.unwrap();
        assert_eq!(d.sockets().len(), 1);

        assert_eq!(d.ensure_registered("late").await, Err(BridgeError::NotFound("late".to_string())));
        assert!(d.bindings.is_empty());
        assert!(d.sockets().is_empty());
        assert!(!d.remove_channel("late").await);
    }

    #[tokio::test]
    async fn rewiring_a_key_releases_the_replaced_binding() {
        let d = dispatcher();
        let config = inproc_channel("twice", Direction::SubscribeFromBus);
        d.add_channel(config.clone()).await.unwrap();
        let endpoint = d.settings.resolve_endpoint(&config).unwrap();
        d.wire(&config, endpoint, Arc::default()).await.unwrap();
        assert_eq!(d.bindings.len(), 1);

        assert!(d.remove_channel("twice").await);
        assert!(d.sockets().is_empty());
    }

    #[tokio::test]
    async fn content_update_requires_periodic_channel() {
        let d = dispatcher();
        d.add_channel(inproc_channel("plain", Direction::SubscribeFromBus)).await.unwrap();
        assert!(matches!(
            d.update_content("plain", serde_json::json!("x")).await,
            Err(BridgeError::Config(_))
        ));
        d.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let d = dispatcher();
        d.add_channel(inproc_channel("chatter", Direction::SubscribeFromBus)).await.unwrap();
        d.shutdown().await;
        assert_eq!(d.on_bus_message("chatter", Value::from("x")), Err(BridgeError::ShuttingDown));
        assert_eq!(
            d.add_channel(inproc_channel("late", Direction::SubscribeFromBus)).await,
            Err(BridgeError::ShuttingDown)
        );
        // Second call is a no-op.
        d.shutdown().await;
    }
}
