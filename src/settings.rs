//! User preferences
//!
//! Five settings, loaded once when the client starts and written back after
//! every change. The file is plain JSON:
//! `{"protocol":"wireguard","killswitch":false,"autoconnect":false,"dns":true,"notifications":true}`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SdkError;
use crate::vpn::protocol::Protocol;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub protocol: Protocol,
    pub killswitch: bool,
    pub autoconnect: bool,
    /// DNS leak protection
    pub dns: bool,
    pub notifications: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            protocol: Protocol::Wireguard,
            killswitch: false,
            autoconnect: false,
            dns: true,
            notifications: true,
        }
    }
}

/// Settings keys accepted by [`SettingsStore::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    Protocol,
    Killswitch,
    Autoconnect,
    Dns,
    Notifications,
}

impl SettingKey {
    pub const ALL: [SettingKey; 5] = [
        SettingKey::Protocol,
        SettingKey::Killswitch,
        SettingKey::Autoconnect,
        SettingKey::Dns,
        SettingKey::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::Protocol => "protocol",
            SettingKey::Killswitch => "killswitch",
            SettingKey::Autoconnect => "autoconnect",
            SettingKey::Dns => "dns",
            SettingKey::Notifications => "notifications",
        }
    }
}

impl std::str::FromStr for SettingKey {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SdkError::InvalidParam(format!("Unknown setting: {}", s)))
    }
}

impl Settings {
    /// Apply one typed value. Fails without changing anything if `value` has
    /// the wrong type for `key`.
    fn apply(&mut self, key: SettingKey, value: &Value) -> Result<(), SdkError> {
        let wrong_type =
            || SdkError::InvalidParam(format!("Invalid value for {}: {}", key.as_str(), value));
        match key {
            SettingKey::Protocol => {
                self.protocol = value
                    .as_str()
                    .ok_or_else(wrong_type)?
                    .parse()
                    .map_err(|_| wrong_type())?;
            }
            SettingKey::Killswitch => self.killswitch = value.as_bool().ok_or_else(wrong_type)?,
            SettingKey::Autoconnect => self.autoconnect = value.as_bool().ok_or_else(wrong_type)?,
            SettingKey::Dns => self.dns = value.as_bool().ok_or_else(wrong_type)?,
            SettingKey::Notifications => {
                self.notifications = value.as_bool().ok_or_else(wrong_type)?
            }
        }
        Ok(())
    }

    pub fn get(&self, key: SettingKey) -> Value {
        match key {
            SettingKey::Protocol => Value::from(self.protocol.as_str()),
            SettingKey::Killswitch => Value::from(self.killswitch),
            SettingKey::Autoconnect => Value::from(self.autoconnect),
            SettingKey::Dns => Value::from(self.dns),
            SettingKey::Notifications => Value::from(self.notifications),
        }
    }

    /// Defaults overlaid with whichever keys in `raw` are known and well
    /// typed.
    pub fn merged(raw: &Value) -> Self {
        let mut settings = Settings::default();
        let Some(object) = raw.as_object() else {
            log::warn!("Settings file is not a JSON object, using defaults");
            return settings;
        };

        for (name, value) in object {
            let Ok(key) = name.parse::<SettingKey>() else {
                log::debug!("Ignoring unknown setting '{}'", name);
                continue;
            };
            if let Err(e) = settings.apply(key, value) {
                log::warn!("{}; keeping default", e);
            }
        }
        settings
    }
}

/// Default settings location
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("aureo-vpn").join("settings.json"))
}

/// Owns the in-memory settings and their file.
#[derive(Debug)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    settings: Settings,
}

impl SettingsStore {
    /// Memory-only store, nothing is persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            settings: Settings::default(),
        }
    }

    /// Load from `path`. A missing, unreadable or corrupt file yields
    /// defaults.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = read_settings(&path);
        Self {
            path: Some(path),
            settings,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn get(&self, key: &str) -> Result<Value, SdkError> {
        Ok(self.settings.get(key.parse()?))
    }

    /// Validate, persist, then update memory. A failed write leaves the
    /// current values in place.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), SdkError> {
        let key: SettingKey = key.parse()?;
        let mut next = self.settings.clone();
        next.apply(key, &value)?;
        self.commit(next)?;
        log::info!("Setting {} = {}", key.as_str(), value);
        Ok(())
    }

    pub fn set_protocol(&mut self, protocol: Protocol) -> Result<(), SdkError> {
        self.commit(Settings {
            protocol,
            ..self.settings.clone()
        })
    }

    pub fn set_killswitch(&mut self, enabled: bool) -> Result<(), SdkError> {
        self.commit(Settings {
            killswitch: enabled,
            ..self.settings.clone()
        })
    }

    pub fn set_autoconnect(&mut self, enabled: bool) -> Result<(), SdkError> {
        self.commit(Settings {
            autoconnect: enabled,
            ..self.settings.clone()
        })
    }

    pub fn set_dns(&mut self, enabled: bool) -> Result<(), SdkError> {
        self.commit(Settings {
            dns: enabled,
            ..self.settings.clone()
        })
    }

    pub fn set_notifications(&mut self, enabled: bool) -> Result<(), SdkError> {
        self.commit(Settings {
            notifications: enabled,
            ..self.settings.clone()
        })
    }

    fn commit(&mut self, next: Settings) -> Result<(), SdkError> {
        if let Some(path) = &self.path {
            write_settings(path, &next)?;
        }
        self.settings = next;
        Ok(())
    }
}

fn read_settings(path: &Path) -> Settings {
    if !path.exists() {
        log::debug!("Settings file does not exist: {:?}", path);
        return Settings::default();
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("Failed to read settings file: {}", e);
            return Settings::default();
        }
    };

    match serde_json::from_str::<Value>(&content) {
        Ok(raw) => {
            log::info!("Loaded settings from {:?}", path);
            Settings::merged(&raw)
        }
        Err(e) => {
            log::warn!("Failed to parse settings file, using defaults: {}", e);
            Settings::default()
        }
    }
}

/// Write to a sibling temp file and rename it over the target.
fn write_settings(path: &Path, settings: &Settings) -> Result<(), SdkError> {
    let storage = |e: std::io::Error| SdkError::Storage(format!("{:?}: {}", path, e));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(storage)?;
    }

    let content = serde_json::to_string_pretty(settings)
        .map_err(|e| SdkError::Storage(format!("Failed to serialize settings: {}", e)))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, content).map_err(storage)?;
    std::fs::rename(&tmp, path).map_err(storage)?;
    log::debug!("Saved settings to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.protocol, Protocol::Wireguard);
        assert!(!s.killswitch);
        assert!(!s.autoconnect);
        assert!(s.dns);
        assert!(s.notifications);
    }

    #[test]
    fn setting_protocol_leaves_other_keys_at_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut store = SettingsStore::load(&path);
        store.set("protocol", json!("openvpn")).unwrap();

        let reloaded = SettingsStore::load(&path);
        let expected = Settings {
            protocol: Protocol::Openvpn,
            ..Settings::default()
        };
        assert_eq!(reloaded.settings(), &expected);
        assert_eq!(reloaded.get("protocol").unwrap(), json!("openvpn"));
        assert_eq!(reloaded.get("killswitch").unwrap(), json!(false));
        assert_eq!(reloaded.get("autoconnect").unwrap(), json!(false));
        assert_eq!(reloaded.get("dns").unwrap(), json!(true));
        assert_eq!(reloaded.get("notifications").unwrap(), json!(true));
    }

    #[test]
    fn settings_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut store = SettingsStore::load(&path);
        store.set("protocol", json!("openvpn")).unwrap();
        store.set("killswitch", json!(true)).unwrap();
        store.set_notifications(false).unwrap();

        let reloaded = SettingsStore::load(&path);
        assert_eq!(reloaded.settings(), store.settings());
        assert_eq!(reloaded.get("protocol").unwrap(), json!("openvpn"));
        assert_eq!(reloaded.get("killswitch").unwrap(), json!(true));
        assert_eq!(reloaded.get("notifications").unwrap(), json!(false));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn unknown_key_and_wrong_type_are_rejected() {
        let mut store = SettingsStore::in_memory();
        assert!(matches!(
            store.set("theme", json!("dark")),
            Err(SdkError::InvalidParam(_))
        ));
        assert!(matches!(
            store.set("dns", json!("yes")),
            Err(SdkError::InvalidParam(_))
        ));
        assert!(matches!(
            store.set("protocol", json!("ipsec")),
            Err(SdkError::InvalidParam(_))
        ));
        assert_eq!(store.settings(), &Settings::default());
    }

    #[test]
    fn load_merges_valid_keys_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"autoconnect":true,"dns":"sometimes","theme":"dark","protocol":"openvpn"}"#,
        )
        .unwrap();

        let store = SettingsStore::load(&path);
        let s = store.settings();
        assert!(s.autoconnect);
        assert!(s.dns);
        assert_eq!(s.protocol, Protocol::Openvpn);
        assert!(s.notifications);
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(SettingsStore::load(&path).settings(), &Settings::default());
    }

    #[test]
    fn failed_persist_keeps_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("settings.json");
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        let mut store = SettingsStore::load(&path);
        let err = store.set_killswitch(true).unwrap_err();
        assert!(matches!(err, SdkError::Storage(_)));
        assert!(!store.settings().killswitch);
    }
}
