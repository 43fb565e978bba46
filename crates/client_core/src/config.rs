use std::{fs, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::{ClientError, ClientResult};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/api";
pub const TRANSPORT_NAMESPACE: &str = "/chat";
const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub transport_url: Option<String>,
    pub state_path: PathBuf,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub reconnect_delay_max_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.into(),
            transport_url: None,
            state_path: PathBuf::from("./data/client-state.json"),
            connect_timeout_ms: 8_000,
            reconnect_delay_ms: 500,
            reconnect_delay_max_ms: 2_000,
            request_timeout_ms: 15_000,
        }
    }
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_delays(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.reconnect_delay_ms),
            Duration::from_millis(self.reconnect_delay_max_ms),
        )
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    transport_url: Option<String>,
    state_path: Option<PathBuf>,
    connect_timeout_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    reconnect_delay_max_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> ClientSettings {
    let file = fs::read_to_string(SETTINGS_FILE).ok();
    load_settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Some(raw) = file {
        match toml::from_str::<FileSettings>(raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.api_base_url {
                    settings.api_base_url = v;
                }
                if let Some(v) = file_cfg.transport_url {
                    settings.transport_url = Some(v);
                }
                if let Some(v) = file_cfg.state_path {
                    settings.state_path = v;
                }
                if let Some(v) = file_cfg.connect_timeout_ms {
                    settings.connect_timeout_ms = v;
                }
                if let Some(v) = file_cfg.reconnect_delay_ms {
                    settings.reconnect_delay_ms = v;
                }
                if let Some(v) = file_cfg.reconnect_delay_max_ms {
                    settings.reconnect_delay_max_ms = v;
                }
                if let Some(v) = file_cfg.request_timeout_ms {
                    settings.request_timeout_ms = v;
                }
            }
            Err(err) => warn!("config: ignoring unreadable {SETTINGS_FILE}: {err}"),
        }
    }

    for key in ["CHAT_API_URL", "APP__API_URL"] {
        if let Some(v) = env(key) {
            settings.api_base_url = v;
        }
    }
    for key in ["CHAT_TRANSPORT_URL", "APP__TRANSPORT_URL"] {
        if let Some(v) = env(key) {
            settings.transport_url = Some(v);
        }
    }
    for key in ["CHAT_STATE_PATH", "APP__STATE_PATH"] {
        if let Some(v) = env(key) {
            settings.state_path = PathBuf::from(v);
        }
    }
    if let Some(parsed) = env("APP__CONNECT_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        settings.connect_timeout_ms = parsed;
    }

    settings.api_base_url = normalize_api_base_url(&settings.api_base_url);
    if settings.reconnect_delay_ms > settings.reconnect_delay_max_ms {
        warn!(
            min = settings.reconnect_delay_ms,
            max = settings.reconnect_delay_max_ms,
            "config: reconnect delay bounds inverted; swapping"
        );
        std::mem::swap(
            &mut settings.reconnect_delay_ms,
            &mut settings.reconnect_delay_max_ms,
        );
    }

    settings
}

pub fn normalize_api_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_API_BASE_URL.to_string();
    }
    trimmed.to_string()
}

/// The realtime namespace URL: explicit when configured, otherwise derived
/// from the API base (`http://host/api` becomes `ws://host/chat`).
pub fn transport_endpoint(settings: &ClientSettings) -> ClientResult<Url> {
    if let Some(explicit) = settings
        .transport_url
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Url::parse(explicit)
            .map_err(|err| ClientError::Config(format!("transport_url '{explicit}': {err}")));
    }

    let base = normalize_api_base_url(&settings.api_base_url);
    let base = match base.to_ascii_lowercase().rfind("/api") {
        Some(idx) if idx + 4 == base.len() => base[..idx].to_string(),
        _ => base,
    };
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ClientError::Config(format!(
            "api_base_url must start with http:// or https:// (got '{base}')"
        )));
    };
    let endpoint = if ws_base.ends_with(TRANSPORT_NAMESPACE) {
        ws_base
    } else {
        format!("{ws_base}{TRANSPORT_NAMESPACE}")
    };
    Url::parse(&endpoint).map_err(|err| ClientError::Config(format!("{endpoint}: {err}")))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
