//! Per-channel counters and last-error bookkeeping.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use zros_types::{ChannelCounters, EndpointState, HealthStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Forwarded,
    Delivered,
    EncodeFailure,
    DecodeFailure,
    Fallback,
    Dropped,
    Throttled,
    Heartbeat,
}

#[derive(Debug, Default)]
pub struct ChannelStatus {
    forwarded: AtomicU64,
    delivered: AtomicU64,
    encode_failures: AtomicU64,
    decode_failures: AtomicU64,
    fallbacks: AtomicU64,
    dropped: AtomicU64,
    throttled: AtomicU64,
    heartbeats: AtomicU64,
    last_error: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl ChannelStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, counter: Counter) {
        self.bump_by(counter, 1);
    }

    pub fn bump_by(&self, counter: Counter, n: u64) {
        let cell = match counter {
            Counter::Forwarded => &self.forwarded,
            Counter::Delivered => &self.delivered,
            Counter::EncodeFailure => &self.encode_failures,
            Counter::DecodeFailure => &self.decode_failures,
            Counter::Fallback => &self.fallbacks,
            Counter::Dropped => &self.dropped,
            Counter::Throttled => &self.throttled,
            Counter::Heartbeat => &self.heartbeats,
        };
        cell.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Display) {
        *self.last_error.lock() = Some((err.to_string(), Utc::now()));
    }

    pub fn last_error(&self) -> Option<(String, DateTime<Utc>)> {
        self.last_error.lock().clone()
    }

    pub fn counters(&self) -> ChannelCounters {
        ChannelCounters {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
        }
    }
}

/// Channel health from its endpoint's state.
///
/// An endpoint that gave up reconnecting is `Down` whatever state it last
/// reached.
pub fn health_of(state: EndpointState, exhausted: bool) -> HealthStatus {
    if exhausted {
        return HealthStatus::Down;
    }
    match state {
        EndpointState::Connected => HealthStatus::Up,
        EndpointState::Degraded => HealthStatus::Degraded,
        _ => HealthStatus::Down,
    }
}
