use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "messaging.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub socket_url: String,
    pub timeline_window: usize,
    pub max_media_bytes: u64,
    pub typing_idle_ms: u64,
    pub typing_expiry_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:5000/api".into(),
            socket_url: "ws://127.0.0.1:5000/ws".into(),
            timeline_window: 50,
            max_media_bytes: 50 * 1024 * 1024,
            typing_idle_ms: 1_500,
            typing_expiry_ms: 3_000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

impl ClientSettings {
    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// Defaults, then `messaging.toml` in the working directory, then environment.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in file_cfg {
                    let value = match value {
                        toml::Value::String(v) => v,
                        other => other.to_string(),
                    };
                    apply_setting(&mut settings, &key, &value);
                }
            }
            Err(err) => warn!(path = %path.display(), "config: ignoring unreadable settings file: {err}"),
        }
    }

    apply_env_overrides(&mut settings, env);
    normalize(&mut settings);
    settings
}

const SETTING_KEYS: [&str; 8] = [
    "api_base_url",
    "socket_url",
    "timeline_window",
    "max_media_bytes",
    "typing_idle_ms",
    "typing_expiry_ms",
    "reconnect_initial_ms",
    "reconnect_max_ms",
];

/// `MESSAGING_<KEY>` is read first, `APP__<KEY>` wins when both are set.
fn apply_env_overrides(settings: &mut ClientSettings, env: impl Fn(&str) -> Option<String>) {
    for key in SETTING_KEYS {
        let upper = key.to_ascii_uppercase();
        if let Some(v) = env(&format!("MESSAGING_{upper}")) {
            apply_setting(settings, key, &v);
        }
        if let Some(v) = env(&format!("APP__{upper}")) {
            apply_setting(settings, key, &v);
        }
    }
}

fn apply_setting(settings: &mut ClientSettings, key: &str, value: &str) {
    let value = value.trim();
    match key {
        "api_base_url" => settings.api_base_url = value.to_string(),
        "socket_url" => settings.socket_url = value.to_string(),
        "timeline_window" => parse_into(key, value, &mut settings.timeline_window),
        "max_media_bytes" => parse_into(key, value, &mut settings.max_media_bytes),
        "typing_idle_ms" => parse_into(key, value, &mut settings.typing_idle_ms),
        "typing_expiry_ms" => parse_into(key, value, &mut settings.typing_expiry_ms),
        "reconnect_initial_ms" => parse_into(key, value, &mut settings.reconnect_initial_ms),
        "reconnect_max_ms" => parse_into(key, value, &mut settings.reconnect_max_ms),
        _ => warn!(key, "config: unknown setting ignored"),
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "config: invalid value ignored"),
    }
}

fn normalize(settings: &mut ClientSettings) {
    settings.api_base_url = settings.api_base_url.trim_end_matches('/').to_string();
    if settings.api_base_url.is_empty() {
        settings.api_base_url = ClientSettings::default().api_base_url;
    }
    if settings.socket_url.is_empty() {
        settings.socket_url = ClientSettings::default().socket_url;
    }
    settings.timeline_window = settings.timeline_window.max(1);
    settings.reconnect_initial_ms = settings.reconnect_initial_ms.max(1);
    settings.reconnect_max_ms = settings.reconnect_max_ms.max(settings.reconnect_initial_ms);
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
