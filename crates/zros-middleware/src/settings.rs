//! Runtime settings store and endpoint resolution.
//!
//! The editable sections are `transport`, `rosbridge` and `network`.  Keys
//! are the field names of the section structs; values are JSON.  Every edit
//! goes through a serialize → patch → deserialize round trip, so a bad value
//! is rejected as a whole and the stored settings never hold a half-applied
//! batch.
//!
//! Edits to `transport` apply to endpoints opened afterwards; endpoints that
//! are already open keep the configuration they were opened with.

use parking_lot::RwLock;
use serde_json::{Map, Value as Json};
use tracing::info;
use zros_types::{
    BridgeError, BridgeSettings, ChannelConfig, NetworkSettings, RosbridgeSettings, TransportSettings,
};

use crate::socket_manager::EndpointConfig;
use crate::transport::Address;

/// Sections reachable through [`SettingsStore::get_value`] and friends.
pub const SECTIONS: [&str; 3] = ["transport", "rosbridge", "network"];

pub struct SettingsStore {
    inner: RwLock<BridgeSettings>,
}

impl SettingsStore {
    pub fn new(settings: BridgeSettings) -> Self {
        Self { inner: RwLock::new(settings) }
    }

    /// Copy of everything currently stored.
    pub fn snapshot(&self) -> BridgeSettings {
        self.inner.read().clone()
    }

    pub fn transport(&self) -> TransportSettings {
        self.inner.read().transport.clone()
    }

    /// Borrow the settings under the read lock.
    pub fn with<R>(&self, f: impl FnOnce(&BridgeSettings) -> R) -> R {
        f(&self.inner.read())
    }

    /// Whole section as a JSON object.
    pub fn get_section(&self, section: &str) -> Result<Json, BridgeError> {
        section_json(&self.inner.read(), section)
    }

    pub fn get_value(&self, section: &str, key: &str) -> Result<Json, BridgeError> {
        let doc = self.get_section(section)?;
        doc.get(key)
            .cloned()
            .ok_or_else(|| BridgeError::Config(format!("unknown setting {section}.{key}")))
    }

    pub fn set_value(&self, section: &str, key: &str, value: Json) -> Result<(), BridgeError> {
        let mut updates = Map::new();
        updates.insert(key.to_string(), value);
        self.batch_update(section, updates)
    }

    /// Apply several keys of one section atomically.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Config`] for an unknown section or key, or when the
    /// patched section no longer deserializes.  Nothing is applied then.
    pub fn batch_update(&self, section: &str, updates: Map<String, Json>) -> Result<(), BridgeError> {
        let mut guard = self.inner.write();
        let mut doc = section_json(&guard, section)?;
        let Some(fields) = doc.as_object_mut() else {
            return Err(BridgeError::Config(format!("section {section} is not a table")));
        };
        for (key, value) in updates {
            if !fields.contains_key(&key) {
                return Err(BridgeError::Config(format!("unknown setting {section}.{key}")));
            }
            fields.insert(key, value);
        }
        let mut next = guard.clone();
        apply_section(&mut next, section, doc)?;
        *guard = next;
        info!(%section, "settings updated");
        Ok(())
    }

    /// Put `section` back to its defaults.
    pub fn reset_section(&self, section: &str) -> Result<(), BridgeError> {
        let mut guard = self.inner.write();
        match section {
            "transport" => guard.transport = TransportSettings::default(),
            "rosbridge" => guard.rosbridge = RosbridgeSettings::default(),
            "network" => guard.network = NetworkSettings::default(),
            other => return Err(unknown_section(other)),
        }
        info!(%section, "settings reset to defaults");
        Ok(())
    }

    /// Replace everything, e.g. after an external edit was validated.
    pub fn replace(&self, settings: BridgeSettings) {
        *self.inner.write() = settings;
    }

    /// Resolve where `channel` should be wired with the current settings.
    pub fn resolve_endpoint(&self, channel: &ChannelConfig) -> Result<EndpointConfig, BridgeError> {
        resolve_endpoint(channel, &self.inner.read())
    }
}

fn unknown_section(section: &str) -> BridgeError {
    BridgeError::Config(format!(
        "unknown settings section {section} (expected one of {})",
        SECTIONS.join(", ")
    ))
}

fn section_json(settings: &BridgeSettings, section: &str) -> Result<Json, BridgeError> {
    let doc = match section {
        "transport" => serde_json::to_value(&settings.transport),
        "rosbridge" => serde_json::to_value(&settings.rosbridge),
        "network" => serde_json::to_value(&settings.network),
        other => return Err(unknown_section(other)),
    };
    doc.map_err(|e| BridgeError::Config(format!("section {section}: {e}")))
}

fn apply_section(settings: &mut BridgeSettings, section: &str, doc: Json) -> Result<(), BridgeError> {
    let invalid = |e: serde_json::Error| BridgeError::Config(format!("invalid {section} settings: {e}"));
    match section {
        "transport" => settings.transport = serde_json::from_value(doc).map_err(invalid)?,
        "rosbridge" => settings.rosbridge = serde_json::from_value(doc).map_err(invalid)?,
        "network" => settings.network = serde_json::from_value(doc).map_err(invalid)?,
        other => return Err(unknown_section(other)),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Endpoint resolution
// ---------------------------------------------------------------------------

/// Work out the endpoint a channel is wired to.
///
/// `channel.endpoint` is either the name of an `[[endpoints]]` entry or a
/// literal `tcp://` / `inproc://` address.  Without it the direction's
/// default pattern is used on the transport's default port.
///
/// # Errors
///
/// [`BridgeError::Config`] for an unknown name or a malformed address,
/// [`BridgeError::InvalidDirection`] when the endpoint's pattern cannot carry
/// the channel's direction.
pub fn resolve_endpoint(channel: &ChannelConfig, settings: &BridgeSettings) -> Result<EndpointConfig, BridgeError> {
    let transport = &settings.transport;
    let pattern = channel.direction.default_pattern();
    let config = match channel.endpoint.as_deref() {
        Some(raw) if raw.contains("://") => {
            let address = Address::parse(raw)
                .map_err(|e| BridgeError::Config(format!("channel {}: {e}", channel.key)))?;
            EndpointConfig::new(pattern, address, transport)
        }
        Some(name) => {
            let spec = settings
                .endpoints
                .iter()
                .find(|e| e.name == name)
                .ok_or_else(|| BridgeError::Config(format!("channel {}: unknown endpoint {name}", channel.key)))?;
            EndpointConfig::from_spec(spec, transport)?
        }
        None => {
            let raw = transport.default_address(pattern);
            let address = Address::parse(&raw)
                .map_err(|e| BridgeError::Config(format!("channel {}: {e}", channel.key)))?;
            EndpointConfig::new(pattern, address, transport)
        }
    };
    if !channel.direction.compatible_patterns().contains(&config.pattern) {
        return Err(BridgeError::InvalidDirection {
            key: channel.key.clone(),
            reason: format!("{} cannot run over a {} endpoint", channel.direction, config.pattern),
        });
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use zros_types::{Direction, EndpointSpec, Pattern};

    use super::*;

    fn store() -> SettingsStore {
        SettingsStore::new(BridgeSettings::default())
    }

    #[test]
    fn get_and_set_round_trip() {
        let s = store();
        assert_eq!(s.get_value("transport", "req_port").unwrap(), json!(5555));
        s.set_value("transport", "req_port", json!(6000)).unwrap();
        assert_eq!(s.transport().req_port, 6000);
    }

    #[test]
    fn unknown_key_and_section_are_rejected() {
        let s = store();
        assert!(matches!(s.get_value("transport", "colour"), Err(BridgeError::Config(_))));
        assert!(matches!(s.get_section("channels"), Err(BridgeError::Config(_))));
        assert!(matches!(s.set_value("transport", "colour", json!(1)), Err(BridgeError::Config(_))));
    }

    #[test]
    fn batch_update_is_all_or_nothing() {
        let s = store();
        let mut updates = Map::new();
        updates.insert("pub_port".to_string(), json!(7000));
        updates.insert("high_water_mark".to_string(), json!("lots"));
        assert!(s.batch_update("transport", updates).is_err());
        assert_eq!(s.transport().pub_port, 5556);

        let mut updates = Map::new();
        updates.insert("pub_port".to_string(), json!(7000));
        updates.insert("host".to_string(), json!("robot.local"));
        s.batch_update("transport", updates).unwrap();
        let t = s.transport();
        assert_eq!((t.pub_port, t.host.as_str()), (7000, "robot.local"));
    }

    #[test]
    fn reset_restores_defaults() {
        let s = store();
        s.set_value("rosbridge", "url", json!("ws://robot:9090")).unwrap();
        s.reset_section("rosbridge").unwrap();
        assert_eq!(s.snapshot().rosbridge, RosbridgeSettings::default());
    }

    #[test]
    fn default_endpoint_follows_direction() {
        let settings = BridgeSettings::default();
        let ch = ChannelConfig::new("chatter", Direction::SubscribeFromBus, "/chatter", "chatter");
        let ep = resolve_endpoint(&ch, &settings).unwrap();
        assert_eq!(ep.pattern, Pattern::Pub);
        assert_eq!(ep.address.to_string(), "tcp://*:5556");
        assert!(ep.bind);

        let ch = ChannelConfig::new("add", Direction::ServiceCall, "/add", "add");
        let ep = resolve_endpoint(&ch, &settings).unwrap();
        assert_eq!(ep.pattern, Pattern::Req);
        assert_eq!(ep.address.to_string(), "tcp://localhost:5555");
        assert!(!ep.bind);
    }

    #[test]
    fn named_endpoint_must_fit_direction() {
        let mut settings = BridgeSettings::default();
        settings.endpoints.push(EndpointSpec {
            name: "robot-pub".to_string(),
            pattern: Pattern::Pub,
            address: Some("inproc://robot".to_string()),
            bind: None,
            high_water_mark: Some(10),
            linger_millis: None,
            backpressure: None,
        });
        let ok = ChannelConfig::new("a", Direction::SubscribeFromBus, "/a", "a").with_endpoint("robot-pub");
        let ep = resolve_endpoint(&ok, &settings).unwrap();
        assert_eq!(ep.name, "robot-pub");
        assert_eq!(ep.high_water_mark, 10);

        let bad = ChannelConfig::new("b", Direction::PublishToBus, "/b", "b").with_endpoint("robot-pub");
        assert!(matches!(resolve_endpoint(&bad, &settings), Err(BridgeError::InvalidDirection { .. })));

        let missing = ChannelConfig::new("c", Direction::PublishToBus, "/c", "c").with_endpoint("nowhere");
        assert!(matches!(resolve_endpoint(&missing, &settings), Err(BridgeError::Config(_))));
    }

    #[test]
    fn literal_address_uses_default_pattern() {
        let settings = BridgeSettings::default();
        let ch = ChannelConfig::new("cmd", Direction::PublishToBus, "/cmd", "cmd").with_endpoint("tcp://robot:6001");
        let ep = resolve_endpoint(&ch, &settings).unwrap();
        assert_eq!(ep.pattern, Pattern::Sub);
        assert_eq!(ep.name, "sub@tcp://robot:6001");

        let bad = ChannelConfig::new("cmd", Direction::PublishToBus, "/cmd", "cmd").with_endpoint("udp://robot:1");
        assert!(matches!(resolve_endpoint(&bad, &settings), Err(BridgeError::Config(_))));
    }
}
