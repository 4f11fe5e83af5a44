//! Client configuration loading.
//!
//! TOML is the sole file source; library users and tests construct
//! [`ClientConfig`] programmatically via [`ClientConfig::new`].
//!
//! # Required fields
//! - `ws.uri`
//! - `[auth]` with `key` and `secret` when `authorize = true`
//!
//! Timeout defaults follow the exchange protocol: the server heartbeats
//! roughly every 15 seconds, so a liveness window of 18 seconds covers one
//! missed heartbeat plus protocol slack.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Connect/send/recv timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on a single protocol exchange (greeting, auth response).
pub const PROTOCOL_TIMEOUT: Duration = Duration::from_secs(3);
/// Max interval without any inbound frame before the connection is
/// considered dead.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(18);

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Full client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URI of the realtime endpoint, e.g. `wss://ws.example.com/ws/`.
    pub uri: String,
    /// Whether to authenticate after the connection greeting.
    pub authorize: bool,
    pub auth: Option<AuthConfig>,
    /// Base URI for the REST helper, when used.
    pub rest_uri: Option<String>,
    pub timeout: Duration,
    pub protocol_timeout: Duration,
    pub liveness_window: Duration,
    /// Reconnect automatically after a lost connection.
    pub reconnect: bool,
    /// Replay recorded subscriptions after a reconnect.
    pub resend_subscriptions: bool,
    /// `User-Agent` presented on the upgrade request and REST calls.
    pub user_agent: String,
}

#[derive(Clone)]
pub struct AuthConfig {
    pub key: String,
    pub secret: String,
    /// Required by the REST helper's signature; unused on the realtime side.
    pub user_id: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("key", &self.key)
            .field("secret", &"{***}")
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl ClientConfig {
    /// A config with protocol-default timeouts, reconnection and replay on,
    /// and no authentication.
    pub fn new(uri: impl Into<String>) -> Self {
        ClientConfig {
            uri: uri.into(),
            authorize: false,
            auth: None,
            rest_uri: None,
            timeout: DEFAULT_TIMEOUT,
            protocol_timeout: PROTOCOL_TIMEOUT,
            liveness_window: LIVENESS_WINDOW,
            reconnect: true,
            resend_subscriptions: true,
            user_agent: default_user_agent(),
        }
    }

    pub fn with_auth(mut self, key: impl Into<String>, secret: impl Into<String>) -> Self {
        self.authorize = true;
        self.auth = Some(AuthConfig {
            key: key.into(),
            secret: secret.into(),
            user_id: None,
        });
        self
    }
}

pub fn default_user_agent() -> String {
    format!("tradewire/{}", env!("CARGO_PKG_VERSION"))
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    authorize: Option<bool>,
    user_agent: Option<String>,
    ws: Option<RawWsConfig>,
    auth: Option<RawAuthConfig>,
    rest: Option<RawRestConfig>,
    timeouts: Option<RawTimeouts>,
}

#[derive(Debug, Deserialize)]
struct RawWsConfig {
    uri: Option<String>,
    reconnect: Option<bool>,
    resend_subscriptions: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    key: Option<String>,
    secret: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRestConfig {
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTimeouts {
    timeout_secs: Option<u64>,
    protocol_timeout_secs: Option<u64>,
    liveness_window_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load client config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load client config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ClientConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_ws = raw
        .ws
        .ok_or_else(|| ConfigError::MissingField("ws".to_owned()))?;
    let uri = raw_ws
        .uri
        .ok_or_else(|| ConfigError::MissingField("ws.uri".to_owned()))?;

    let authorize = raw.authorize.unwrap_or(false);
    let auth = match raw.auth {
        Some(a) => Some(AuthConfig {
            key: a
                .key
                .ok_or_else(|| ConfigError::MissingField("auth.key".to_owned()))?,
            secret: a
                .secret
                .ok_or_else(|| ConfigError::MissingField("auth.secret".to_owned()))?,
            user_id: a.user_id,
        }),
        None => None,
    };
    if authorize && auth.is_none() {
        return Err(ConfigError::MissingField("auth".to_owned()));
    }

    let (timeout, protocol_timeout, liveness_window) = match raw.timeouts {
        Some(t) => (
            t.timeout_secs.map_or(DEFAULT_TIMEOUT, Duration::from_secs),
            t.protocol_timeout_secs.map_or(PROTOCOL_TIMEOUT, Duration::from_secs),
            t.liveness_window_secs.map_or(LIVENESS_WINDOW, Duration::from_secs),
        ),
        None => (DEFAULT_TIMEOUT, PROTOCOL_TIMEOUT, LIVENESS_WINDOW),
    };

    Ok(ClientConfig {
        uri,
        authorize,
        auth,
        rest_uri: raw.rest.and_then(|r| r.uri),
        timeout,
        protocol_timeout,
        liveness_window,
        reconnect: raw_ws.reconnect.unwrap_or(true),
        resend_subscriptions: raw_ws.resend_subscriptions.unwrap_or(true),
        user_agent: raw.user_agent.unwrap_or_else(default_user_agent),
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
