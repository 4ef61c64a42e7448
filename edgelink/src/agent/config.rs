//! On-disk configuration of the device manager.
//!
//! Two JSON files live in the configuration directory:
//! `iot-device-manager.cfg` with the runtime directory, log level and the
//! per-action enablement map, and `iot-proxy.cfg` with an optional outbound
//! proxy.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::status::{AgentError, ErrorKind, Result};
use crate::transport::{ProxyOptions, ProxyType};

pub const DEVICE_MANAGER_CFG: &str = "iot-device-manager.cfg";
pub const PROXY_CFG: &str = "iot-proxy.cfg";

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/var/lib/iot")
}

/// Connection details of the cloud instance this device reports to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Application token presented when the session is established.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub validate_cert: Option<bool>,
    #[serde(default)]
    pub ca_bundle_file: Option<PathBuf>,
}

/// Contents of `iot-device-manager.cfg`. Missing fields fall back to their
/// defaults so a partial file stays valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceManagerConfig {
    #[serde(default)]
    pub actions_enabled: HashMap<String, bool>,
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub cloud: Option<CloudConfig>,
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        DeviceManagerConfig {
            actions_enabled: HashMap::new(),
            runtime_dir: default_runtime_dir(),
            log_level: None,
            cloud: None,
        }
    }
}

impl DeviceManagerConfig {
    pub fn load(path: &Path) -> Result<DeviceManagerConfig> {
        let content = fs::read_to_string(path).map_err(|e| {
            AgentError::new(
                ErrorKind::FileOpenFailed,
                format!("unable to read {path:?}: {e}"),
            )
        })?;
        serde_json::from_str(&content)
            .map_err(|e| AgentError::new(ErrorKind::ParseError, format!("{path:?}: {e}")))
    }

    /// Whether the action with the given identifier should be registered.
    /// Unlisted actions are enabled.
    pub fn action_enabled(&self, id: &str) -> bool {
        self.actions_enabled.get(id).copied().unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProxyFileEntry {
    host: String,
    port: u16,
    #[serde(rename = "type")]
    proxy_type: ProxyType,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProxyFile {
    #[serde(default)]
    proxy: Option<ProxyFileEntry>,
}

/// Reads `iot-proxy.cfg`. A missing file means no proxy.
pub fn load_proxy_config(config_dir: &Path) -> Result<Option<ProxyOptions>> {
    let path = config_dir.join(PROXY_CFG);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path).map_err(|e| {
        AgentError::new(
            ErrorKind::FileOpenFailed,
            format!("unable to read {path:?}: {e}"),
        )
    })?;
    let file: ProxyFile = serde_json::from_str(&content)
        .map_err(|e| AgentError::new(ErrorKind::ParseError, format!("{path:?}: {e}")))?;

    Ok(file.proxy.map(|entry| ProxyOptions {
        host: entry.host,
        port: entry.port,
        proxy_type: entry.proxy_type,
        username: entry.username,
        password: entry.password,
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEVICE_MANAGER_CFG);
        fs::write(&path, r#"{ "log_level": "debug" }"#).unwrap();

        let config = DeviceManagerConfig::load(&path).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.runtime_dir, default_runtime_dir());
        assert!(config.action_enabled("software_update"));
    }

    #[test]
    fn actions_enabled_map_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEVICE_MANAGER_CFG);
        fs::write(
            &path,
            r#"{
                "actions_enabled": { "software_update": false, "file_download": true },
                "runtime_dir": "/tmp/iot"
            }"#,
        )
        .unwrap();

        let config = DeviceManagerConfig::load(&path).unwrap();
        assert!(!config.action_enabled("software_update"));
        assert!(config.action_enabled("file_download"));
        assert!(config.action_enabled("ping"));
        assert_eq!(config.runtime_dir, PathBuf::from("/tmp/iot"));
    }

    #[test]
    fn config_roundtrips_through_serde() {
        let mut config = DeviceManagerConfig::default();
        config.actions_enabled.insert("ping".into(), false);
        config.log_level = Some("info".into());

        let text = serde_json::to_string(&config).unwrap();
        let back: DeviceManagerConfig = serde_json::from_str(&text).unwrap();
        assert!(!back.action_enabled("ping"));
        assert_eq!(back.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn malformed_config_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEVICE_MANAGER_CFG);
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(
            DeviceManagerConfig::load(&path).unwrap_err().kind(),
            ErrorKind::ParseError
        );
    }

    #[test]
    fn proxy_config_parses_http_and_socks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(PROXY_CFG),
            r#"{ "proxy": { "host": "proxy.local", "port": 3128, "type": "HTTP",
                 "username": "u", "password": "p" } }"#,
        )
        .unwrap();

        let proxy = load_proxy_config(dir.path()).unwrap().unwrap();
        assert_eq!(proxy.host, "proxy.local");
        assert_eq!(proxy.port, 3128);
        assert_eq!(proxy.proxy_type, ProxyType::Http);
        assert_eq!(proxy.username.as_deref(), Some("u"));

        fs::write(
            dir.path().join(PROXY_CFG),
            r#"{ "proxy": { "host": "socks.local", "port": 1080, "type": "SOCKS5" } }"#,
        )
        .unwrap();
        let proxy = load_proxy_config(dir.path()).unwrap().unwrap();
        assert_eq!(proxy.proxy_type, ProxyType::Socks5);
        assert_eq!(proxy.username, None);
    }

    #[test]
    fn missing_proxy_file_means_no_proxy() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_proxy_config(dir.path()).unwrap().is_none());
    }
}
