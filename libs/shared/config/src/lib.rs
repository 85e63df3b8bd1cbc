use std::env;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CHAT_SERVER_HOST: &str = "localhost:8080";
pub const DEFAULT_CHAT_WS_ENDPOINT: &str = "ws/chat";
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub chat_server_host: String,
    pub chat_server_tls: bool,
    pub chat_ws_endpoint: String,
    pub chat_ws_endpoint_candidates: Vec<String>,
    pub chat_ws_probe_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chat_server_host: DEFAULT_CHAT_SERVER_HOST.to_string(),
            chat_server_tls: false,
            chat_ws_endpoint: DEFAULT_CHAT_WS_ENDPOINT.to_string(),
            chat_ws_endpoint_candidates: Vec::new(),
            chat_ws_probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            chat_server_host: env::var("CHAT_SERVER_HOST")
                .unwrap_or_else(|_| {
                    warn!("CHAT_SERVER_HOST not set, using default");
                    DEFAULT_CHAT_SERVER_HOST.to_string()
                }),
            chat_server_tls: env::var("CHAT_SERVER_TLS")
                .map(|value| parse_flag(&value))
                .unwrap_or_else(|_| {
                    warn!("CHAT_SERVER_TLS not set, assuming plain ws://");
                    false
                }),
            chat_ws_endpoint: env::var("CHAT_WS_ENDPOINT")
                .unwrap_or_else(|_| {
                    warn!("CHAT_WS_ENDPOINT not set, using default");
                    DEFAULT_CHAT_WS_ENDPOINT.to_string()
                }),
            chat_ws_endpoint_candidates: env::var("CHAT_WS_ENDPOINT_CANDIDATES")
                .map(|value| parse_list(&value))
                .unwrap_or_default(),
            chat_ws_probe_timeout_ms: env::var("CHAT_WS_PROBE_TIMEOUT_MS")
                .ok()
                .and_then(|value| match value.trim().parse::<u64>() {
                    Ok(ms) if ms > 0 => Some(ms),
                    _ => {
                        warn!("CHAT_WS_PROBE_TIMEOUT_MS is invalid ({}), using default", value);
                        None
                    }
                })
                .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
        };

        if !config.is_configured() {
            warn!("Chat transport not fully configured - missing server host");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.host().is_empty()
    }

    /// Host (and optional port/path prefix) with any scheme prefix removed.
    pub fn host(&self) -> &str {
        let host = self.chat_server_host.trim();
        ["https://", "http://", "wss://", "ws://"]
            .iter()
            .find_map(|prefix| host.strip_prefix(prefix))
            .unwrap_or(host)
            .trim_end_matches('/')
    }

    /// `wss` when the hosting page is served over TLS, `ws` otherwise. An
    /// explicit scheme on the host wins over the TLS flag.
    pub fn websocket_scheme(&self) -> &'static str {
        let host = self.chat_server_host.trim();
        if host.starts_with("https://") || host.starts_with("wss://") {
            "wss"
        } else if host.starts_with("http://") || host.starts_with("ws://") {
            "ws"
        } else if self.chat_server_tls {
            "wss"
        } else {
            "ws"
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.chat_ws_probe_timeout_ms)
    }

    pub fn has_endpoint_candidates(&self) -> bool {
        !self.chat_ws_endpoint_candidates.is_empty()
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
