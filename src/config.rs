use crate::error::ConfigError;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const CSRF_COOKIE: &str = "csrftoken";

/// Characters escaped when a vehicle id is placed in a URL path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Agent configuration.
///
/// Every field has a default, so a config file only needs the values that
/// differ. CLI flags in the binary override whatever the file sets.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Backend origin, e.g. `http://localhost:8000`
    pub base_url: String,
    pub bus_id: String,
    /// Raw `Cookie` header value; the CSRF token is read from `csrftoken`
    pub cookie: String,
    pub reconnect_delay_ms: u64,
    /// Upper bound on one channel connect, upgrade handshake included
    pub connect_timeout_ms: u64,
    pub watch_timeout_ms: u64,
    pub sample_once_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Attach a monotonically increasing `sequence` to location reports
    pub sequence_reports: bool,
    pub user_agent: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            base_url: "http://localhost:8000".to_string(),
            bus_id: String::new(),
            cookie: String::new(),
            reconnect_delay_ms: 5000,
            connect_timeout_ms: 10_000,
            watch_timeout_ms: 5000,
            sample_once_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            sequence_reports: false,
            user_agent: format!("driver-telemetry/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl AgentConfig {
    pub fn new(base_url: &str, bus_id: &str) -> Self {
        AgentConfig {
            base_url: base_url.to_string(),
            bus_id: bus_id.to_string(),
            ..Default::default()
        }
    }

    /// Load from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bus_id = self.bus_id.trim();
        if bus_id.is_empty() {
            return Err(ConfigError::Invalid("bus_id must not be empty".to_string()));
        }
        if bus_id == "." || bus_id == ".." {
            return Err(ConfigError::Invalid(format!("bus_id {:?} is not a valid path segment", bus_id)));
        }
        self.base_url()?;

        let durations = [
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("watch_timeout_ms", self.watch_timeout_ms),
            ("sample_once_timeout_ms", self.sample_once_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::Invalid(format!("base_url {}: {}", self.base_url, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::Invalid(format!(
                "base_url scheme must be http or https, got {}",
                other
            ))),
        }
    }

    /// WebSocket endpoint for this vehicle's channel
    pub fn channel_endpoint(&self) -> Result<Url, ConfigError> {
        let mut url = self
            .base_url()?
            .join(&format!("/ws/tracking/bus/{}/", path_segment(&self.bus_id)))
            .map_err(|e| ConfigError::Invalid(format!("channel endpoint: {}", e)))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::Invalid(format!("cannot use {} scheme", scheme)))?;
        Ok(url)
    }

    pub fn csrf_token(&self) -> Option<String> {
        csrf_from_cookie(&self.cookie)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_timeout_ms)
    }

    pub fn sample_once_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_once_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Escape a vehicle id so it stays a single URL path segment.
pub fn path_segment(id: &str) -> String {
    utf8_percent_encode(id, PATH_SEGMENT).to_string()
}

/// Extract the percent-decoded `csrftoken` value from a cookie header.
pub fn csrf_from_cookie(cookie: &str) -> Option<String> {
    let prefix = format!("{}=", CSRF_COOKIE);
    cookie
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix(prefix.as_str()))
        .map(|raw| percent_decode_str(raw).decode_utf8_lossy().into_owned())
}
