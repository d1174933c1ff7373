//! Config file – reads/writes `~/.zros/config.toml` (or JSON / YAML).

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use zros_types::{BridgeSettings, ChannelConfig, Direction};

/// On-disk encoding, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Toml,
    Json,
    Yaml,
}

impl FileFormat {
    /// Unknown or missing extensions read as TOML.
    pub fn of(path: &Path) -> Result<Self, String> {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
            None | Some("toml") => Ok(FileFormat::Toml),
            Some("json") => Ok(FileFormat::Json),
            Some("yaml" | "yml") => Ok(FileFormat::Yaml),
            Some(other) => Err(format!(
                "Unsupported config extension .{other} (use .toml, .json, .yaml or .yml)"
            )),
        }
    }

    pub fn parse(self, raw: &str) -> Result<BridgeSettings, String> {
        match self {
            FileFormat::Toml => toml::from_str(raw).map_err(|e| e.to_string()),
            FileFormat::Json => serde_json::from_str(raw).map_err(|e| e.to_string()),
            FileFormat::Yaml => serde_yaml::from_str(raw).map_err(|e| e.to_string()),
        }
    }

    pub fn render(self, settings: &BridgeSettings) -> Result<String, String> {
        match self {
            FileFormat::Toml => toml::to_string_pretty(settings).map_err(|e| e.to_string()),
            FileFormat::Json => serde_json::to_string_pretty(settings).map_err(|e| e.to_string()),
            FileFormat::Yaml => serde_yaml::to_string(settings).map_err(|e| e.to_string()),
        }
    }
}

/// Return the path to `~/.zros/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".zros").join("config.toml")
}

/// Load the settings at `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<BridgeSettings>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let format = FileFormat::of(path)?;
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut settings = format
        .parse(&raw)
        .map_err(|e| format!("Failed to parse config at {}: {}", path.display(), e))?;
    apply_env_overrides(&mut settings);
    Ok(Some(settings))
}

/// Apply `ZROS_*` environment variable overrides to `settings`.
///
/// | Variable | Setting |
/// |---|---|
/// | `ZROS_HOST` | `transport.host` |
/// | `ZROS_ROSBRIDGE_URL` | `rosbridge.url` |
/// | `ZROS_HIGH_WATER_MARK` | `transport.high_water_mark` |
/// | `ZROS_MAX_RECONNECT_ATTEMPTS` | `transport.max_reconnect_attempts` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(settings: &mut BridgeSettings) {
    if let Ok(v) = std::env::var("ZROS_HOST") {
        settings.transport.host = v;
    }
    if let Ok(v) = std::env::var("ZROS_ROSBRIDGE_URL") {
        settings.rosbridge.url = v;
    }
    if let Ok(v) = std::env::var("ZROS_HIGH_WATER_MARK")
        && let Ok(hwm) = v.parse::<usize>()
    {
        settings.transport.high_water_mark = hwm;
    }
    if let Ok(v) = std::env::var("ZROS_MAX_RECONNECT_ATTEMPTS")
        && let Ok(attempts) = v.parse::<i64>()
    {
        settings.transport.max_reconnect_attempts = attempts;
    }
}

/// Save `settings` to `path` in the format its extension names.
pub fn save_to(settings: &BridgeSettings, path: &Path) -> Result<(), String> {
    let raw = FileFormat::of(path)?
        .render(settings)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

/// Starter configuration written by `zros init`.
pub fn sample_settings() -> BridgeSettings {
    BridgeSettings {
        channels: vec![
            ChannelConfig::new("chatter", Direction::SubscribeFromBus, "/chatter", "chatter")
                .with_type("std_msgs/String"),
            ChannelConfig::new("cmd_vel", Direction::PublishToBus, "/cmd_vel", "cmd_vel")
                .with_type("geometry_msgs/Twist")
                .with_rate_limit(20.0),
            ChannelConfig::new("heartbeat", Direction::SubscribeFromBus, "/heartbeat", "heartbeat")
                .with_type("std_msgs/String")
                .with_frequency(1.0, json!({ "data": "alive" })),
            ChannelConfig::new("add_two_ints", Direction::ServiceCall, "/add_two_ints", "add_two_ints")
                .with_type("example_interfaces/AddTwoInts"),
        ],
        ..BridgeSettings::default()
    }
}

#[cfg(test)]
mod tests {
    use zros_middleware::validate_settings;

    use super::*;

    #[test]
    fn config_path_points_to_zros_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".zros"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(FileFormat::of(Path::new("a/config.toml")), Ok(FileFormat::Toml));
        assert_eq!(FileFormat::of(Path::new("config.JSON")), Ok(FileFormat::Json));
        assert_eq!(FileFormat::of(Path::new("config.yml")), Ok(FileFormat::Yaml));
        assert_eq!(FileFormat::of(Path::new("config")), Ok(FileFormat::Toml));
        assert!(FileFormat::of(Path::new("config.ini")).is_err());
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert_eq!(load_from(&path).expect("no error"), None);
    }

    #[test]
    fn sample_round_trips_in_every_format() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let sample = sample_settings();
        for name in ["config.toml", "config.json", "config.yaml"] {
            let path = dir.path().join(name);
            save_to(&sample, &path).expect("save");
            let loaded = FileFormat::of(&path)
                .and_then(|f| f.parse(&std::fs::read_to_string(&path).expect("read")))
                .expect("parse");
            assert_eq!(loaded, sample, "{name}");
        }
    }

    #[test]
    fn sample_is_a_valid_configuration() {
        assert_eq!(validate_settings(&sample_settings()), Ok(()));
    }

    #[test]
    fn minimal_toml_fills_defaults() {
        let raw = r#"
            [transport]
            host = "robot.local"

            [[channels]]
            key = "odom"
            direction = "publish_to_bus"
            bus_name = "/odom"
            remote_topic = "odom"
        "#;
        let settings = FileFormat::Toml.parse(raw).expect("parse");
        assert_eq!(settings.transport.host, "robot.local");
        assert_eq!(settings.transport.pub_port, 5556);
        assert_eq!(settings.channels.len(), 1);
        assert_eq!(settings.channels[0].direction, Direction::PublishToBus);
    }

    #[test]
    fn malformed_file_reports_its_path() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[[channels]]\nkey = 3\n").expect("write");
        let err = load_from(&path).unwrap_err();
        assert!(err.contains("broken.toml"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&BridgeSettings::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap()).expect("dir metadata").permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        // SAFETY: the only test touching these variables.
        unsafe {
            std::env::set_var("ZROS_HOST", "robot-host");
            std::env::set_var("ZROS_HIGH_WATER_MARK", "not-a-number");
            std::env::set_var("ZROS_MAX_RECONNECT_ATTEMPTS", "-1");
        }
        let mut settings = BridgeSettings::default();
        apply_env_overrides(&mut settings);
        assert_eq!(settings.transport.host, "robot-host");
        assert_eq!(settings.transport.high_water_mark, 1000);
        assert_eq!(settings.transport.max_reconnect_attempts, -1);
        unsafe {
            std::env::remove_var("ZROS_HOST");
            std::env::remove_var("ZROS_HIGH_WATER_MARK");
            std::env::remove_var("ZROS_MAX_RECONNECT_ATTEMPTS");
        }
    }
}
