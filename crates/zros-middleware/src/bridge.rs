//! `Bridge` – the facade the CLI and embedding applications drive.
//!
//! [`Bridge::start`] validates the whole configuration up front, probes the
//! remote peers it will connect to, wires every configured channel and
//! refuses to come up if none of its listening endpoints could bind.  After
//! that the facade is the runtime reconfiguration surface: channels and
//! settings can change while traffic flows.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::{Map, Value as Json};
use tokio::time::Instant;
use tracing::{info, warn};
use zros_types::{
    BridgeError, BridgeSettings, ChannelConfig, ChannelHealth, ChannelPatch, Format, Value,
};

use crate::adapter::{BusAdapter, ServiceHandler};
use crate::dispatcher::Dispatcher;
use crate::registry::validate_channel;
use crate::settings::{SettingsStore, resolve_endpoint};
use crate::socket_manager::{Endpoint, EndpointConfig};
use crate::transport::{Address, Connector, tcp};

/// How often startup checks whether a listening endpoint came up.
const BIND_POLL: Duration = Duration::from_millis(50);

pub struct Bridge {
    dispatcher: Arc<Dispatcher>,
    settings: Arc<SettingsStore>,
}

impl Bridge {
    /// Validate `settings`, wire every channel and return the running bridge.
    ///
    /// # Errors
    ///
    /// Any configuration error is fatal here, as is a bridge whose listening
    /// endpoints all fail to bind within `connect_timeout_millis`.  Peers
    /// that do not answer the connectivity probe only produce a warning;
    /// their endpoints keep retrying.
    pub async fn start(
        settings: BridgeSettings,
        bus: Arc<dyn BusAdapter>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, BridgeError> {
        validate_settings(&settings)?;
        if settings.network.connectivity_check_enabled {
            probe_peers(&settings).await;
        }

        let channels = settings.channels.clone();
        let connect_timeout = Duration::from_millis(settings.transport.connect_timeout_millis);
        let store = Arc::new(SettingsStore::new(BridgeSettings { channels: Vec::new(), ..settings }));
        let dispatcher = Dispatcher::new(Arc::clone(&store), bus, connector);

        for channel in channels {
            if let Err(e) = dispatcher.add_channel(channel).await {
                dispatcher.shutdown().await;
                return Err(e);
            }
        }
        if let Err(e) = ensure_bound(&dispatcher.sockets().endpoints(), connect_timeout).await {
            dispatcher.shutdown().await;
            return Err(e);
        }

        info!(
            channels = dispatcher.registry().len(),
            endpoints = dispatcher.sockets().len(),
            "bridge started"
        );
        Ok(Self { dispatcher, settings: store })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    pub async fn add_channel(&self, config: ChannelConfig) -> Result<(), BridgeError> {
        self.dispatcher.add_channel(config).await
    }

    pub async fn remove_channel(&self, key: &str) -> bool {
        self.dispatcher.remove_channel(key).await
    }

    pub async fn update_channel(&self, key: &str, patch: ChannelPatch) -> Result<ChannelConfig, BridgeError> {
        self.dispatcher.update_channel(key, patch).await
    }

    pub async fn update_content(&self, key: &str, content: Json) -> Result<(), BridgeError> {
        self.dispatcher.update_content(key, content).await
    }

    pub fn channel(&self, key: &str) -> Result<ChannelConfig, BridgeError> {
        self.dispatcher.registry().resolve(key)
    }

    /// Every channel, in insertion order.
    pub fn channels(&self) -> Vec<ChannelConfig> {
        self.dispatcher.registry().list()
    }

    // -----------------------------------------------------------------------
    // Traffic
    // -----------------------------------------------------------------------

    pub fn on_bus_message(&self, key: &str, msg: Value) -> Result<(), BridgeError> {
        self.dispatcher.on_bus_message(key, msg)
    }

    pub async fn call_service(&self, key: &str, request: Value, timeout: Option<Duration>) -> Result<Value, BridgeError> {
        self.dispatcher.call_service(key, request, timeout).await
    }

    pub fn serve_service(&self, key: &str, handler: impl ServiceHandler + 'static) -> Result<(), BridgeError> {
        self.dispatcher.serve_service(key, handler)
    }

    pub fn health(&self, key: &str) -> Result<ChannelHealth, BridgeError> {
        self.dispatcher.health(key)
    }

    pub fn health_report(&self) -> Vec<ChannelHealth> {
        self.dispatcher.health_report()
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub fn get_value(&self, section: &str, key: &str) -> Result<Json, BridgeError> {
        self.settings.get_value(section, key)
    }

    pub fn set_value(&self, section: &str, key: &str, value: Json) -> Result<(), BridgeError> {
        self.settings.set_value(section, key, value)?;
        self.after_settings_change(section);
        Ok(())
    }

    pub fn batch_update(&self, section: &str, updates: Map<String, Json>) -> Result<(), BridgeError> {
        self.settings.batch_update(section, updates)?;
        self.after_settings_change(section);
        Ok(())
    }

    pub fn reset_section(&self, section: &str) -> Result<(), BridgeError> {
        self.settings.reset_section(section)?;
        self.after_settings_change(section);
        Ok(())
    }

    fn after_settings_change(&self, section: &str) {
        if section == "transport" {
            self.dispatcher.refresh_codec();
        }
    }

    /// Current settings with the live channel set, ready to be saved.
    pub fn export(&self) -> BridgeSettings {
        let mut settings = self.settings.snapshot();
        settings.channels = self.dispatcher.registry().list();
        settings
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        info!("bridge stopped");
    }
}

/// Check a configuration without opening anything.
///
/// # Errors
///
/// [`BridgeError::Config`] for a missing canonical format or a bad endpoint
/// declaration, [`BridgeError::DuplicateKey`] for a repeated channel key, and
/// whatever [`validate_channel`] or endpoint resolution reports for a
/// channel.
pub fn validate_settings(settings: &BridgeSettings) -> Result<(), BridgeError> {
    if !settings.transport.formats.contains(&Format::CANONICAL) {
        return Err(BridgeError::Config(format!(
            "transport.formats must include {}, the fallback format",
            Format::CANONICAL
        )));
    }
    let mut names = HashSet::new();
    for spec in &settings.endpoints {
        if !names.insert(spec.name.as_str()) {
            return Err(BridgeError::Config(format!("endpoint {} is declared twice", spec.name)));
        }
        EndpointConfig::from_spec(spec, &settings.transport)?;
    }
    let mut keys = HashSet::new();
    let mut opened: HashMap<String, EndpointConfig> = HashMap::new();
    for channel in &settings.channels {
        if !keys.insert(channel.key.as_str()) {
            return Err(BridgeError::DuplicateKey(channel.key.clone()));
        }
        validate_channel(channel)?;
        let endpoint = resolve_endpoint(channel, settings)?;
        if let Some(existing) = opened.get(&endpoint.name)
            && (existing.pattern != endpoint.pattern || existing.address != endpoint.address)
        {
            return Err(BridgeError::Config(format!(
                "channel {} needs {} as {} on {}, but it is already {} on {}",
                channel.key, endpoint.name, endpoint.pattern, endpoint.address, existing.pattern, existing.address
            )));
        }
        opened.insert(endpoint.name.clone(), endpoint);
    }
    Ok(())
}

/// Probe every TCP peer the bridge will connect to.  Failures only warn.
async fn probe_peers(settings: &BridgeSettings) {
    let timeout = Duration::try_from_secs_f64(settings.network.connectivity_timeout_seconds)
        .unwrap_or(Duration::from_secs(3));
    let mut peers = HashSet::new();
    for channel in &settings.channels {
        if let Ok(endpoint) = resolve_endpoint(channel, settings)
            && !endpoint.bind
            && let Address::Tcp { host, port } = endpoint.address
        {
            peers.insert((host, port));
        }
    }
    let probes = peers.into_iter().map(|(host, port)| async move {
        let result = tcp::probe(&host, port, timeout).await;
        (host, port, result)
    });
    for (host, port, result) in join_all(probes).await {
        match result {
            Ok(()) => info!(%host, port, "peer reachable"),
            Err(e) => warn!(%host, port, error = %e, "peer unreachable; its endpoint will keep retrying"),
        }
    }
}

/// Fail when there are listening endpoints and none of them came up.
async fn ensure_bound(endpoints: &[Arc<Endpoint>], timeout: Duration) -> Result<(), BridgeError> {
    let listeners: Vec<&Arc<Endpoint>> = endpoints.iter().filter(|e| e.config().bind).collect();
    if listeners.is_empty() {
        return Ok(());
    }
    let deadline = Instant::now() + timeout;
    loop {
        if listeners.iter().any(|e| e.state().is_live()) {
            return Ok(());
        }
        if Instant::now() >= deadline || listeners.iter().all(|e| e.is_exhausted()) {
            let names: Vec<&str> = listeners.iter().map(|e| e.name()).collect();
            return Err(BridgeError::TransportFatal(format!(
                "no listening endpoint could bind ({})",
                names.join(", ")
            )));
        }
        tokio::time::sleep(BIND_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use zros_types::{Direction, EndpointSpec, Pattern};

    use super::*;

    fn settings() -> BridgeSettings {
        let mut s = BridgeSettings::default();
        s.network.connectivity_check_enabled = false;
        s
    }

    #[test]
    fn duplicate_channel_keys_are_rejected() {
        let mut s = settings();
        let ch = ChannelConfig::new("a", Direction::SubscribeFromBus, "/a", "a");
        s.channels = vec![ch.clone(), ch];
        assert_eq!(validate_settings(&s), Err(BridgeError::DuplicateKey("a".to_string())));
    }

    #[test]
    fn canonical_format_is_required() {
        let mut s = settings();
        s.transport.formats = vec![Format::Binary];
        assert!(matches!(validate_settings(&s), Err(BridgeError::Config(_))));
    }

    #[test]
    fn endpoint_names_are_unique() {
        let mut s = settings();
        let spec = EndpointSpec {
            name: "out".to_string(),
            pattern: Pattern::Pub,
            address: None,
            bind: None,
            high_water_mark: None,
            linger_millis: None,
            backpressure: None,
        };
        s.endpoints = vec![spec.clone(), spec];
        assert!(matches!(validate_settings(&s), Err(BridgeError::Config(_))));
    }

    #[test]
    fn default_configuration_is_valid() {
        let mut s = settings();
        s.channels = vec![
            ChannelConfig::new("chatter", Direction::SubscribeFromBus, "/chatter", "chatter"),
            ChannelConfig::new("cmd", Direction::PublishToBus, "/cmd_vel", "cmd_vel"),
            ChannelConfig::new("add", Direction::ServiceCall, "/add_two_ints", "add_two_ints"),
        ];
        assert_eq!(validate_settings(&s), Ok(()));
    }
}
