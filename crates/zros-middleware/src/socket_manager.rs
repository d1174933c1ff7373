//! Endpoint lifecycle: connect, reconnect with backoff, buffer, flush, close.
//!
//! Every [`Endpoint`] is owned by a single driver task.  Callers never touch
//! the link; they append to the endpoint's bounded outbox with the
//! non-blocking [`Endpoint::send`] and the driver flushes it whenever the
//! link has room.
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Connected ⇄ Degraded
//!      ▲               │             │          │
//!      └── backoff ◀───┴─────────────┴──────────┘
//!                    any state ─▶ Closing ─▶ Closed
//! ```
//!
//! An endpoint whose reconnect budget is spent stays `Disconnected` and is
//! flagged exhausted; sends then fail with `TransportFatal`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use zros_types::{BackpressurePolicy, BridgeError, EndpointSpec, EndpointState, Pattern, TransportSettings};

use crate::backoff::ReconnectPolicy;
use crate::transport::{Address, Connector, Envelope, Inbound, Link, LinkError, LinkSpec, Outbound, Rejected};

/// Period of the driver's housekeeping tick (retries, heartbeats, liveness).
const TICK: Duration = Duration::from_millis(100);

/// Fully resolved endpoint configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub name: String,
    pub pattern: Pattern,
    pub address: Address,
    pub bind: bool,
    pub high_water_mark: usize,
    pub linger: Duration,
    pub backpressure: BackpressurePolicy,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub degrade_after: u32,
    pub heartbeat_interval: Option<Duration>,
    pub heartbeat_timeout: Duration,
    pub max_message_bytes: usize,
    pub inbound_queue: usize,
}

impl EndpointConfig {
    /// Endpoint with the transport defaults; binds when the address says so.
    pub fn new(pattern: Pattern, address: Address, transport: &TransportSettings) -> Self {
        let bind = address.binds_by_default(pattern);
        Self {
            name: format!("{pattern}@{address}"),
            pattern,
            bind,
            address,
            high_water_mark: transport.high_water_mark.max(1),
            linger: Duration::from_millis(transport.linger_millis),
            backpressure: BackpressurePolicy::default_for(pattern),
            reconnect: ReconnectPolicy::from_settings(transport),
            connect_timeout: Duration::from_millis(transport.connect_timeout_millis),
            degrade_after: transport.degrade_after_failures.max(1),
            heartbeat_interval: (transport.heartbeat_interval_millis > 0)
                .then(|| Duration::from_millis(transport.heartbeat_interval_millis)),
            heartbeat_timeout: Duration::from_millis(transport.heartbeat_timeout_millis),
            max_message_bytes: transport.max_message_bytes,
            inbound_queue: transport.inbound_queue.max(1),
        }
    }

    /// Endpoint declared under `[[endpoints]]`.
    pub fn from_spec(spec: &EndpointSpec, transport: &TransportSettings) -> Result<Self, BridgeError> {
        let raw = spec
            .address
            .clone()
            .unwrap_or_else(|| transport.default_address(spec.pattern));
        let address = Address::parse(&raw)
            .map_err(|e| BridgeError::Config(format!("endpoint {}: {e}", spec.name)))?;
        let mut config = Self::new(spec.pattern, address, transport);
        config.name = spec.name.clone();
        if let Some(bind) = spec.bind {
            config.bind = bind;
        }
        if let Some(hwm) = spec.high_water_mark {
            config.high_water_mark = hwm.max(1);
        }
        if let Some(linger) = spec.linger_millis {
            config.linger = Duration::from_millis(linger);
        }
        if let Some(policy) = spec.backpressure {
            config.backpressure = policy;
        }
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_bind(mut self, bind: bool) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_high_water_mark(mut self, hwm: usize) -> Self {
        self.high_water_mark = hwm.max(1);
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    fn link_spec(&self) -> LinkSpec {
        LinkSpec {
            address: self.address.clone(),
            bind: self.bind,
            pattern: self.pattern,
            peer_capacity: self.high_water_mark,
            max_message_bytes: self.max_message_bytes,
            connect_timeout: self.connect_timeout,
        }
    }
}

/// Outcome of an accepted [`Endpoint::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    /// The oldest buffered message was evicted to make room.
    pub evicted: bool,
}

#[derive(Debug, Default)]
struct EndpointStats {
    sent: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
    inbound_dropped: AtomicU64,
    failures: AtomicU64,
}

/// Counters of one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStatsSnapshot {
    pub sent: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub inbound_dropped: u64,
    pub failures: u64,
}

enum Flush {
    Idle,
    Sent,
    Blocked(LinkError),
    Failed(LinkError),
}

enum SessionEnd {
    Closed,
    Lost(String),
}

pub struct Endpoint {
    config: EndpointConfig,
    outbox: Mutex<VecDeque<Outbound>>,
    wake: Notify,
    state: watch::Sender<EndpointState>,
    close: watch::Sender<bool>,
    exhausted: AtomicBool,
    last_error: Mutex<Option<(String, DateTime<Utc>)>>,
    stats: EndpointStats,
}

impl Endpoint {
    fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            outbox: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            state: watch::Sender::new(EndpointState::Disconnected),
            close: watch::Sender::new(false),
            exhausted: AtomicBool::new(false),
            last_error: Mutex::new(None),
            stats: EndpointStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn pattern(&self) -> Pattern {
        self.config.pattern
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn state(&self) -> EndpointState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EndpointState> {
        self.state.subscribe()
    }

    /// Reconnect attempts are used up; the endpoint will not recover.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// Most recent link failure and when it happened.
    pub fn last_error(&self) -> Option<(String, DateTime<Utc>)> {
        self.last_error.lock().clone()
    }

    pub fn queued(&self) -> usize {
        self.outbox.lock().len()
    }

    pub fn stats(&self) -> EndpointStatsSnapshot {
        EndpointStatsSnapshot {
            sent: self.stats.sent.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            inbound_dropped: self.stats.inbound_dropped.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }

    /// Queue `out` for the driver.  Never blocks.
    ///
    /// Publishers accept messages while disconnected and buffer them up to
    /// the high-water mark; every other pattern needs a live link.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::ShuttingDown`] – the endpoint is closing.
    /// * [`BridgeError::TransportFatal`] – reconnect attempts are exhausted.
    /// * [`BridgeError::NotConnected`] – no live link and not a publisher.
    /// * [`BridgeError::Busy`] – the outbox is full under the reject policy.
    pub fn send(&self, out: Outbound) -> Result<SendReport, BridgeError> {
        if *self.close.borrow() {
            return Err(BridgeError::ShuttingDown);
        }
        if self.is_exhausted() {
            return Err(BridgeError::TransportFatal(self.config.name.clone()));
        }
        if !self.state().is_live() && self.config.pattern != Pattern::Pub {
            return Err(BridgeError::NotConnected(self.config.name.clone()));
        }
        let mut evicted = false;
        {
            let mut outbox = self.outbox.lock();
            if outbox.len() >= self.config.high_water_mark {
                match self.config.backpressure {
                    BackpressurePolicy::DropOldest => {
                        outbox.pop_front();
                        evicted = true;
                        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                    }
                    BackpressurePolicy::Reject => {
                        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(BridgeError::Busy(self.config.name.clone()));
                    }
                }
            }
            outbox.push_back(out);
        }
        self.wake.notify_one();
        Ok(SendReport { evicted })
    }

    /// Ask the driver to flush within the linger budget and stop.
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    fn set_state(&self, next: EndpointState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(endpoint = %self.config.name, from = %prev, to = %next, "endpoint state");
        }
    }

    fn record_error(&self, err: impl ToString) {
        *self.last_error.lock() = Some((err.to_string(), Utc::now()));
    }

    fn recover(&self) {
        if self.state() == EndpointState::Degraded {
            self.set_state(EndpointState::Connected);
            info!(endpoint = %self.config.name, "endpoint recovered");
        }
    }

    fn degrade(&self, err: &LinkError) {
        if self.state() == EndpointState::Connected {
            self.set_state(EndpointState::Degraded);
            self.record_error(err);
            warn!(endpoint = %self.config.name, error = %err, "endpoint degraded");
        }
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    async fn drive(self: Arc<Self>, connector: Arc<dyn Connector>, inbound: mpsc::Sender<Inbound>) {
        let mut close = self.close.subscribe();
        let spec = self.config.link_spec();
        let mut failures: u32 = 0;

        loop {
            if is_set(&close) {
                break;
            }
            self.set_state(EndpointState::Connecting);
            let opened = tokio::select! {
                r = connector.open(&spec) => r,
                _ = close.changed() => break,
            };
            match opened {
                Ok(link) => {
                    failures = 0;
                    self.set_state(EndpointState::Connected);
                    info!(endpoint = %self.config.name, link = %link.description(), bind = self.config.bind, "endpoint connected");
                    match self.session(link, &inbound, &mut close).await {
                        SessionEnd::Closed => {
                            self.set_state(EndpointState::Closed);
                            info!(endpoint = %self.config.name, "endpoint closed");
                            return;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!(endpoint = %self.config.name, %reason, "link lost");
                            self.record_error(&reason);
                            failures = 1;
                        }
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(endpoint = %self.config.name, attempt = failures, error = %e, "connect failed");
                    self.record_error(&e);
                }
            }

            self.set_state(EndpointState::Disconnected);
            if !self.config.reconnect.allows(failures) {
                self.exhausted.store(true, Ordering::Release);
                error!(endpoint = %self.config.name, attempts = failures, "reconnect attempts exhausted");
                while !is_set(&close) {
                    if close.changed().await.is_err() {
                        break;
                    }
                }
                break;
            }
            let delay = self.config.reconnect.delay_for(failures);
            debug!(endpoint = %self.config.name, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = close.changed() => break,
            }
        }

        let discarded = self.outbox.lock().drain(..).count();
        if discarded > 0 {
            warn!(endpoint = %self.config.name, discarded, "closed while disconnected; queued messages dropped");
        }
        self.set_state(EndpointState::Closed);
        info!(endpoint = %self.config.name, "endpoint closed");
    }

    async fn session(
        &self,
        mut link: Link,
        inbound: &mpsc::Sender<Inbound>,
        close: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let writable = link.writable();
        let mut streak: u32 = 0;
        let mut last_io = Instant::now();
        let mut last_send = Instant::now();
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match self.flush(&link) {
                Flush::Idle => {}
                Flush::Sent => {
                    streak = 0;
                    last_io = Instant::now();
                    last_send = last_io;
                    self.recover();
                }
                Flush::Blocked(e) => {
                    streak = streak.saturating_add(1);
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    if streak >= self.config.degrade_after {
                        self.degrade(&e);
                    }
                }
                Flush::Failed(e) => return SessionEnd::Lost(e.to_string()),
            }

            tokio::select! {
                biased;
                _ = close.changed() => {
                    self.drain(&link, &writable).await;
                    return SessionEnd::Closed;
                }
                _ = self.wake.notified() => {}
                _ = writable.notified() => {}
                received = link.recv() => match received {
                    Some(frame) => {
                        streak = 0;
                        last_io = Instant::now();
                        self.recover();
                        self.deliver(inbound, frame);
                    }
                    None => return SessionEnd::Lost("link closed".to_string()),
                },
                _ = tick.tick() => {
                    if self.state() == EndpointState::Degraded
                        && last_io.elapsed() >= self.config.heartbeat_timeout
                    {
                        return SessionEnd::Lost("no traffic within heartbeat timeout".to_string());
                    }
                    if let Some(period) = self.config.heartbeat_interval
                        && matches!(self.config.pattern, Pattern::Pub | Pattern::Push)
                        && last_send.elapsed() >= period
                        && self.queued() == 0
                        && link.send(Outbound::broadcast(Envelope::heartbeat().into_frame())).is_ok()
                    {
                        last_send = Instant::now();
                    }
                }
            }
        }
    }

    fn flush(&self, link: &Link) -> Flush {
        let mut sent = false;
        loop {
            let next = self.outbox.lock().pop_front();
            let Some(out) = next else { break };
            match link.send(out) {
                Ok(()) => {
                    sent = true;
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(Rejected { error, out }) if error.is_transient() => {
                    self.outbox.lock().push_front(out);
                    return Flush::Blocked(error);
                }
                Err(Rejected { error, .. }) => return Flush::Failed(error),
            }
        }
        if sent { Flush::Sent } else { Flush::Idle }
    }

    /// Flush what is left within the linger budget.
    async fn drain(&self, link: &Link, writable: &Notify) {
        self.set_state(EndpointState::Closing);
        let deadline = Instant::now() + self.config.linger;
        loop {
            let flushed = self.flush(link);
            let pending = self.queued() + link.pending();
            if pending == 0 || matches!(flushed, Flush::Failed(_)) {
                break;
            }
            tokio::select! {
                _ = writable.notified() => {}
                _ = tokio::time::sleep(TICK) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(endpoint = %self.config.name, dropped = pending, "linger expired with messages pending");
                    break;
                }
            }
        }
    }

    fn deliver(&self, inbound: &mpsc::Sender<Inbound>, frame: Inbound) {
        match inbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.inbound_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(endpoint = %self.config.name, dropped, "inbound queue full; frame dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

fn is_set(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Managed {
    endpoint: Arc<Endpoint>,
    refs: usize,
    driver: JoinHandle<()>,
}

/// An endpoint handed out by [`SocketManager::acquire`].
///
/// `inbound` is `Some` only for the first acquirer of an endpoint, which is
/// expected to drain it.
pub struct Acquired {
    pub endpoint: Arc<Endpoint>,
    pub inbound: Option<mpsc::Receiver<Inbound>>,
}

/// Owns every endpoint and shares them between channels by name.
pub struct SocketManager {
    connector: Arc<dyn Connector>,
    endpoints: DashMap<String, Managed>,
}

impl SocketManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector, endpoints: DashMap::new() }
    }

    /// Open `config.name`, or take another reference to it if already open.
    pub fn acquire(&self, config: EndpointConfig) -> Result<Acquired, BridgeError> {
        match self.endpoints.entry(config.name.clone()) {
            Entry::Occupied(mut occupied) => {
                let managed = occupied.get_mut();
                let existing = managed.endpoint.config();
                if existing.pattern != config.pattern || existing.address != config.address {
                    return Err(BridgeError::Config(format!(
                        "endpoint {} is already open as {} on {}",
                        config.name, existing.pattern, existing.address
                    )));
                }
                managed.refs += 1;
                Ok(Acquired { endpoint: Arc::clone(&managed.endpoint), inbound: None })
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::channel(config.inbound_queue);
                info!(endpoint = %config.name, pattern = %config.pattern, address = %config.address, "opening endpoint");
                let endpoint = Arc::new(Endpoint::new(config));
                let driver = tokio::spawn(Arc::clone(&endpoint).drive(Arc::clone(&self.connector), tx));
                vacant.insert(Managed { endpoint: Arc::clone(&endpoint), refs: 1, driver });
                Ok(Acquired { endpoint, inbound: Some(rx) })
            }
        }
    }

    /// Drop one reference.  The last one closes the endpoint; the returned
    /// handle finishes once it has lingered and closed.
    pub fn release(&self, name: &str) -> Option<JoinHandle<()>> {
        if let Entry::Occupied(mut occupied) = self.endpoints.entry(name.to_string()) {
            occupied.get_mut().refs -= 1;
            if occupied.get().refs == 0 {
                let (_, managed) = occupied.remove_entry();
                managed.endpoint.close();
                return Some(managed.driver);
            }
        }
        None
    }

    pub fn get(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(name).map(|m| Arc::clone(&m.endpoint))
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.iter().map(|m| Arc::clone(&m.endpoint)).collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Close every endpoint and wait for the drivers to finish lingering.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.endpoints.iter().map(|m| m.key().clone()).collect();
        let managed: Vec<Managed> = names
            .iter()
            .filter_map(|n| self.endpoints.remove(n).map(|(_, m)| m))
            .collect();
        for m in &managed {
            m.endpoint.close();
        }
        let count = managed.len();
        join_all(managed.into_iter().map(|m| m.driver)).await;
        info!(endpoints = count, "socket manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::transport::{Fabric, InprocHub};

    fn transport() -> TransportSettings {
        TransportSettings::default()
    }

    fn fast_policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            auto_reconnect: true,
            initial: Duration::from_millis(100),
            ceiling: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts,
        }
    }

    /// Fails the first `fail` opens, then defers to an inproc fabric.
    struct Flaky {
        fail: u32,
        opens: AtomicU32,
        attempts: Mutex<Vec<Instant>>,
        fabric: Fabric,
    }

    #[async_trait]
    impl Connector for Flaky {
        async fn open(&self, spec: &LinkSpec) -> Result<Link, LinkError> {
            self.attempts.lock().push(Instant::now());
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.fail {
                return Err(LinkError::Connect { address: spec.address.to_string(), reason: "refused".into() });
            }
            self.fabric.open(spec).await
        }
    }

    async fn wait_state(endpoint: &Endpoint, want: EndpointState) {
        let mut rx = endpoint.subscribe_state();
        rx.wait_for(|s| *s == want).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_delays_follow_backoff() {
        let flaky = Arc::new(Flaky {
            fail: 4,
            opens: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
            fabric: Fabric::new(),
        });
        let manager = SocketManager::new(flaky.clone());
        let config = EndpointConfig::new(Pattern::Pub, Address::Inproc("backoff".into()), &transport())
            .with_reconnect(fast_policy(None));
        let acquired = manager.acquire(config).unwrap();
        wait_state(&acquired.endpoint, EndpointState::Connected).await;

        let attempts = flaky.attempts.lock().clone();
        assert_eq!(attempts.len(), 5);
        let gaps: Vec<u128> = attempts.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        assert_eq!(gaps, vec![100, 200, 400, 800]);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_endpoint_is_fatal() {
        let flaky = Arc::new(Flaky {
            fail: u32::MAX,
            opens: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
            fabric: Fabric::new(),
        });
        let manager = SocketManager::new(flaky.clone());
        let config = EndpointConfig::new(Pattern::Push, Address::Inproc("never".into()), &transport())
            .with_reconnect(fast_policy(Some(2)));
        let acquired = manager.acquire(config).unwrap();
        let endpoint = acquired.endpoint;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(endpoint.is_exhausted());
        assert_eq!(endpoint.state(), EndpointState::Disconnected);
        assert_eq!(flaky.opens.load(Ordering::SeqCst), 3);
        assert!(matches!(
            endpoint.send(Outbound::broadcast(vec![b"x".to_vec()])),
            Err(BridgeError::TransportFatal(_))
        ));
        manager.shutdown().await;
        assert_eq!(endpoint.state(), EndpointState::Closed);
    }

    #[tokio::test]
    async fn push_requires_live_link() {
        let manager = SocketManager::new(Arc::new(Fabric::new()));
        let config = EndpointConfig::new(Pattern::Push, Address::Inproc("nobody".into()), &transport())
            .with_reconnect(fast_policy(None));
        let acquired = manager.acquire(config).unwrap();
        assert!(matches!(
            acquired.endpoint.send(Outbound::broadcast(vec![b"x".to_vec()])),
            Err(BridgeError::NotConnected(_))
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn publisher_buffers_and_evicts_oldest_while_disconnected() {
        let hub = InprocHub::new();
        let manager = SocketManager::new(Arc::new(Fabric::with_hub(hub.clone())));
        let policy = ReconnectPolicy { multiplier: 1.0, initial: Duration::from_millis(20), ..fast_policy(None) };
        let config = EndpointConfig::new(Pattern::Pub, Address::Inproc("late".into()), &transport())
            .with_bind(false)
            .with_high_water_mark(2)
            .with_reconnect(policy);
        let acquired = manager.acquire(config).unwrap();
        let endpoint = acquired.endpoint;

        let mut evicted = 0;
        for i in 0u8..5 {
            let report = endpoint.send(Outbound::broadcast(vec![b"t".to_vec(), vec![i]])).unwrap();
            evicted += report.evicted as u32;
        }
        assert_eq!(evicted, 3);
        assert_eq!(endpoint.stats().evicted, 3);

        let spec = LinkSpec {
            address: Address::Inproc("late".into()),
            bind: true,
            pattern: Pattern::Sub,
            peer_capacity: 16,
            max_message_bytes: 1024,
            connect_timeout: Duration::from_secs(1),
        };
        let mut sub = Fabric::with_hub(hub).open(&spec).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        assert_eq!(first.frame[1], vec![3]);
        assert_eq!(second.frame[1], vec![4]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn reject_policy_reports_busy_at_high_water_mark() {
        let hub = InprocHub::new();
        let fabric = Fabric::with_hub(hub.clone());
        let spec = LinkSpec {
            address: Address::Inproc("slow".into()),
            bind: true,
            pattern: Pattern::Pull,
            peer_capacity: 1,
            max_message_bytes: 1024,
            connect_timeout: Duration::from_secs(1),
        };
        // Bound but never drained.
        let _pull = fabric.open(&spec).await.unwrap();

        let manager = SocketManager::new(Arc::new(fabric));
        let config = EndpointConfig::new(Pattern::Push, Address::Inproc("slow".into()), &transport())
            .with_high_water_mark(1);
        let acquired = manager.acquire(config).unwrap();
        let endpoint = acquired.endpoint;
        wait_state(&endpoint, EndpointState::Connected).await;

        let mut busy = false;
        for i in 0u8..50 {
            match endpoint.send(Outbound::broadcast(vec![b"t".to_vec(), vec![i]])) {
                Ok(_) => tokio::task::yield_now().await,
                Err(BridgeError::Busy(_)) => {
                    busy = true;
                    break;
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert!(busy);
        assert!(endpoint.stats().rejected >= 1);
        manager.shutdown().await;
    }

    fn pull_spec(name: &str) -> LinkSpec {
        LinkSpec {
            address: Address::Inproc(name.into()),
            bind: false,
            pattern: Pattern::Pull,
            peer_capacity: 16,
            max_message_bytes: 1024,
            connect_timeout: Duration::from_secs(1),
        }
    }

    /// Bound push endpoint nobody pulls from.
    fn lonely_push(name: &str) -> EndpointConfig {
        EndpointConfig::new(Pattern::Push, Address::Inproc(name.into()), &transport())
            .with_bind(true)
            .with_reconnect(fast_policy(None))
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_sends_degrade_and_one_success_recovers() {
        let hub = InprocHub::new();
        let manager = SocketManager::new(Arc::new(Fabric::with_hub(hub.clone())));
        let acquired = manager.acquire(lonely_push("lonely")).unwrap();
        let _inbound = acquired.inbound;
        let endpoint = acquired.endpoint;
        wait_state(&endpoint, EndpointState::Connected).await;
        assert_eq!(endpoint.config().degrade_after, 3);

        endpoint.send(Outbound::broadcast(vec![b"t".to_vec(), vec![1]])).unwrap();
        tokio::time::timeout(Duration::from_secs(5), wait_state(&endpoint, EndpointState::Degraded))
            .await
            .expect("degraded after repeated blocked flushes");
        assert!(endpoint.stats().failures >= 3);
        assert_eq!(endpoint.queued(), 1);
        let (reason, _) = endpoint.last_error().unwrap();
        assert!(reason.contains("no peer"), "{reason}");

        let mut pull = Fabric::with_hub(hub).open(&pull_spec("lonely")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), wait_state(&endpoint, EndpointState::Connected))
            .await
            .expect("recovered after the first successful send");
        let got = tokio::time::timeout(Duration::from_secs(5), pull.recv()).await.unwrap().unwrap();
        assert_eq!(got.frame[1], vec![1]);
        assert_eq!(endpoint.queued(), 0);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_endpoint_drops_its_link_after_heartbeat_timeout() {
        let hub = InprocHub::new();
        let manager = SocketManager::new(Arc::new(Fabric::with_hub(hub.clone())));
        let mut config = lonely_push("silent");
        config.heartbeat_timeout = Duration::from_secs(1);
        let acquired = manager.acquire(config).unwrap();
        let _inbound = acquired.inbound;
        let endpoint = acquired.endpoint;
        wait_state(&endpoint, EndpointState::Connected).await;

        let mut states = endpoint.subscribe_state();
        endpoint.send(Outbound::broadcast(vec![b"t".to_vec(), vec![7]])).unwrap();
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == EndpointState::Degraded))
            .await
            .expect("degraded")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == EndpointState::Disconnected))
            .await
            .expect("link dropped")
            .unwrap();
        let (reason, _) = endpoint.last_error().unwrap();
        assert!(reason.contains("heartbeat"), "{reason}");

        // The driver rebinds after the backoff delay; the message is still queued.
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == EndpointState::Connected))
            .await
            .expect("reconnected")
            .unwrap();
        assert!(!endpoint.is_exhausted());
        assert_eq!(endpoint.queued(), 1);

        let mut pull = Fabric::with_hub(hub).open(&pull_spec("silent")).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), pull.recv()).await.unwrap().unwrap();
        assert_eq!(got.frame[1], vec![7]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn acquire_is_shared_and_refcounted() {
        let manager = SocketManager::new(Arc::new(Fabric::new()));
        let config = EndpointConfig::new(Pattern::Pub, Address::Inproc("shared".into()), &transport());
        let a = manager.acquire(config.clone()).unwrap();
        let b = manager.acquire(config.clone()).unwrap();
        assert!(a.inbound.is_some());
        assert!(b.inbound.is_none());
        assert!(Arc::ptr_eq(&a.endpoint, &b.endpoint));

        let conflicting = EndpointConfig::new(Pattern::Sub, Address::Inproc("other".into()), &transport())
            .with_name(config.name.clone());
        assert!(matches!(manager.acquire(conflicting), Err(BridgeError::Config(_))));

        assert!(manager.release(&config.name).is_none());
        let driver = manager.release(&config.name).unwrap();
        driver.await.unwrap();
        assert_eq!(a.endpoint.state(), EndpointState::Closed);
        assert!(manager.is_empty());
        assert!(matches!(
            a.endpoint.send(Outbound::broadcast(vec![b"x".to_vec()])),
            Err(BridgeError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn close_flushes_pending_within_linger() {
        let hub = InprocHub::new();
        let fabric = Fabric::with_hub(hub);
        let spec = LinkSpec {
            address: Address::Inproc("sink".into()),
            bind: true,
            pattern: Pattern::Pull,
            peer_capacity: 64,
            max_message_bytes: 1024,
            connect_timeout: Duration::from_secs(1),
        };
        let mut pull = fabric.open(&spec).await.unwrap();
        let manager = SocketManager::new(Arc::new(fabric));
        let config = EndpointConfig::new(Pattern::Push, Address::Inproc("sink".into()), &transport());
        let acquired = manager.acquire(config).unwrap();
        wait_state(&acquired.endpoint, EndpointState::Connected).await;

        for i in 0u8..10 {
            acquired.endpoint.send(Outbound::broadcast(vec![b"t".to_vec(), vec![i]])).unwrap();
        }
        manager.shutdown().await;

        let mut got = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(200), pull.recv()).await {
            got.push(msg.frame[1][0]);
        }
        assert_eq!(got, (0u8..10).collect::<Vec<_>>());
    }
}
