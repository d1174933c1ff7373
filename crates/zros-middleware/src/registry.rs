//! Channel registry: the arena of configured channels, keyed by `key`.
//!
//! Every entry sits behind its own lock so reconfiguring one channel never
//! serializes traffic on another.  Enumeration follows insertion order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tracing::debug;
use zros_types::{BridgeError, ChannelConfig, ChannelField, ChannelPatch, Direction};

struct Slot {
    seq: u64,
    config: Arc<RwLock<ChannelConfig>>,
}

/// Runtime-mutable set of channels.
#[derive(Default)]
pub struct ChannelRegistry {
    entries: DashMap<String, Slot>,
    next_seq: AtomicU64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new channel.
    ///
    /// # Errors
    ///
    /// [`BridgeError::DuplicateKey`] if `key` is taken,
    /// [`BridgeError::InvalidDirection`] if a field the direction requires is
    /// missing, [`BridgeError::Config`] for malformed values.
    pub fn add(&self, config: ChannelConfig) -> Result<(), BridgeError> {
        validate_channel(&config)?;
        match self.entries.entry(config.key.clone()) {
            Entry::Occupied(_) => Err(BridgeError::DuplicateKey(config.key)),
            Entry::Vacant(v) => {
                debug!(channel = %config.key, direction = %config.direction, "channel registered");
                v.insert(Slot {
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    config: Arc::new(RwLock::new(config)),
                });
                Ok(())
            }
        }
    }

    /// Remove a channel.  Unknown keys are a no-op.
    pub fn remove(&self, key: &str) -> Option<ChannelConfig> {
        self.entries.remove(key).map(|(_, slot)| slot.config.read().clone())
    }

    pub fn resolve(&self, key: &str) -> Result<ChannelConfig, BridgeError> {
        self.with_channel(key, |c| c.clone())
    }

    /// Run `f` against the channel under its read lock, without cloning it.
    pub fn with_channel<R>(&self, key: &str, f: impl FnOnce(&ChannelConfig) -> R) -> Result<R, BridgeError> {
        let lock = self.slot(key)?;
        let guard = lock.read();
        Ok(f(&guard))
    }

    /// Merge `patch` into the channel and return the result.
    ///
    /// The merged channel is validated before it replaces the old one; on
    /// error the entry is left untouched.
    pub fn update(&self, key: &str, patch: &ChannelPatch) -> Result<ChannelConfig, BridgeError> {
        let lock = self.slot(key)?;
        let mut guard = lock.write();
        let merged = merge(&guard, key, patch)?;
        *guard = merged.clone();
        Ok(merged)
    }

    /// What [`update`](Self::update) would produce, without applying it.
    pub fn preview(&self, key: &str, patch: &ChannelPatch) -> Result<ChannelConfig, BridgeError> {
        let lock = self.slot(key)?;
        let guard = lock.read();
        merge(&guard, key, patch)
    }

    /// Overwrite an existing channel in place, keeping its position.
    pub fn replace(&self, config: ChannelConfig) -> Result<(), BridgeError> {
        validate_channel(&config)?;
        let lock = self.slot(&config.key)?;
        let mut guard = lock.write();
        if guard.direction != config.direction {
            return Err(BridgeError::DirectionImmutable(config.key));
        }
        *guard = config;
        Ok(())
    }

    fn slot(&self, key: &str) -> Result<Arc<RwLock<ChannelConfig>>, BridgeError> {
        self.entries
            .get(key)
            .map(|slot| Arc::clone(&slot.config))
            .ok_or_else(|| BridgeError::NotFound(key.to_string()))
    }

    /// All channels, in insertion order.
    pub fn list(&self) -> Vec<ChannelConfig> {
        let mut slots: Vec<(u64, ChannelConfig)> = self
            .entries
            .iter()
            .map(|e| (e.seq, e.config.read().clone()))
            .collect();
        slots.sort_by_key(|(seq, _)| *seq);
        slots.into_iter().map(|(_, c)| c).collect()
    }

    /// Channel keys, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<(u64, String)> = self.entries.iter().map(|e| (e.seq, e.key().clone())).collect();
        keys.sort_by_key(|(seq, _)| *seq);
        keys.into_iter().map(|(_, k)| k).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn merge(current: &ChannelConfig, key: &str, patch: &ChannelPatch) -> Result<ChannelConfig, BridgeError> {
    if let Some(direction) = patch.direction
        && direction != current.direction
    {
        return Err(BridgeError::DirectionImmutable(key.to_string()));
    }
    let merged = apply_patch(current.clone(), patch);
    validate_channel(&merged)?;
    Ok(merged)
}

fn apply_patch(mut c: ChannelConfig, patch: &ChannelPatch) -> ChannelConfig {
    for field in &patch.clear {
        match field {
            ChannelField::Endpoint => c.endpoint = None,
            ChannelField::Frequency => c.frequency = None,
            ChannelField::Content => c.content = None,
            ChannelField::RateLimitHz => c.rate_limit_hz = None,
            ChannelField::Schema => c.schema = None,
        }
    }
    if let Some(v) = &patch.bus_name {
        c.bus_name = v.clone();
    }
    if let Some(v) = &patch.bus_type {
        c.bus_type = v.clone();
    }
    if let Some(v) = &patch.remote_topic {
        c.remote_topic = Some(v.clone());
    }
    if let Some(v) = &patch.endpoint {
        c.endpoint = Some(v.clone());
    }
    if let Some(v) = patch.serialization {
        c.serialization = v;
    }
    if let Some(v) = patch.frequency {
        c.frequency = Some(v);
    }
    if let Some(v) = &patch.content {
        c.content = Some(v.clone());
    }
    if let Some(v) = patch.rate_limit_hz {
        c.rate_limit_hz = Some(v);
    }
    if let Some(v) = &patch.schema {
        c.schema = Some(v.clone());
    }
    c
}

/// Check that `c` carries what its direction needs.
pub fn validate_channel(c: &ChannelConfig) -> Result<(), BridgeError> {
    if c.key.trim().is_empty() {
        return Err(BridgeError::Config("channel key must not be empty".to_string()));
    }
    let invalid = |reason: &str| BridgeError::InvalidDirection {
        key: c.key.clone(),
        reason: reason.to_string(),
    };
    if c.bus_name.trim().is_empty() {
        return Err(invalid("bus_name is required"));
    }
    if c.remote_topic.as_deref().is_none_or(|t| t.trim().is_empty()) {
        return Err(match c.direction {
            Direction::ServiceCall | Direction::ServiceServe => invalid("remote_topic (service name) is required"),
            _ => invalid("remote_topic is required"),
        });
    }
    if let Some(hz) = c.frequency {
        if matches!(c.direction, Direction::ServiceCall | Direction::ServiceServe) {
            return Err(invalid("frequency only applies to topic channels"));
        }
        if !(hz.is_finite() && hz > 0.0) {
            return Err(BridgeError::Config(format!("channel {}: frequency must be positive, got {hz}", c.key)));
        }
        if c.content.is_none() {
            return Err(invalid("a periodic channel needs content"));
        }
    }
    if let Some(hz) = c.rate_limit_hz {
        if c.direction != Direction::PublishToBus {
            return Err(invalid("rate_limit_hz only applies to publish_to_bus"));
        }
        if !(hz.is_finite() && hz > 0.0) {
            return Err(BridgeError::Config(format!("channel {}: rate_limit_hz must be positive, got {hz}", c.key)));
        }
    }
    Ok(())
}
