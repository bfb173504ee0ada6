use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub const DEFAULT_LISTEN_PATH: &str = "/proxy/bages/measure";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Listen path must start with '/': {0:?}")]
    InvalidListenPath(String),

    #[error("Upstream URL cannot be used as a base: {0}")]
    UpstreamNotBase(Url),

    #[error("Cache TTL cannot be 0")]
    ZeroCacheTtl,

    #[error("Upstream timeout cannot be 0")]
    ZeroUpstreamTimeout,

    #[error("Read timeout cannot be 0")]
    ZeroReadTimeout,

    #[error("Proxy token cannot be empty")]
    EmptyProxyToken,

    #[error("Upstream token cannot be empty")]
    EmptyUpstreamToken,
}

/// Proxy configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for badge requests
    #[serde(default)]
    pub listener: Listener,
    /// Path under which badge requests are accepted; every other path is a 404
    #[serde(default = "default_listen_path")]
    pub listen_path: String,
    /// Optional listener serving `/health` and `/ready`
    #[serde(default)]
    pub admin_listener: Option<Listener>,
    /// Time allowed for a client to send request headers, and separately the
    /// request body, on the main listener
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// The metrics server badges are fetched from
    pub upstream: UpstreamConfig,
    /// Shared secret callers must pass as the `proxy_token` query parameter
    #[serde(default)]
    pub proxy_token: Option<String>,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Validates the proxy configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        if let Some(admin) = &self.admin_listener {
            admin.validate()?;
        }

        if !self.listen_path.starts_with('/') {
            return Err(ValidationError::InvalidListenPath(self.listen_path.clone()));
        }

        if self.upstream.url.cannot_be_a_base() {
            return Err(ValidationError::UpstreamNotBase(self.upstream.url.clone()));
        }

        if self.proxy_token.as_deref() == Some("") {
            return Err(ValidationError::EmptyProxyToken);
        }

        if self.upstream.token.as_deref() == Some("") {
            return Err(ValidationError::EmptyUpstreamToken);
        }

        if self.cache.ttl_secs == 0 {
            return Err(ValidationError::ZeroCacheTtl);
        }

        if self.upstream.timeout_secs == 0 {
            return Err(ValidationError::ZeroUpstreamTimeout);
        }

        if self.read_timeout_secs == 0 {
            return Err(ValidationError::ZeroReadTimeout);
        }

        Ok(())
    }
}

fn default_listen_path() -> String {
    DEFAULT_LISTEN_PATH.to_string()
}

fn default_read_timeout_secs() -> u64 {
    15
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Upstream metrics server configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL of the metrics server. A path component is kept as a prefix
    /// for every upstream endpoint.
    pub url: Url,
    /// Static credential used for every token fetch. When unset, each caller
    /// must pass their own credential as the `token` query parameter.
    #[serde(default)]
    pub token: Option<String>,
    /// Accept self-signed or otherwise invalid upstream certificates
    #[serde(default)]
    pub insecure: bool,
    /// Timeout applied to every upstream request
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    15
}

/// Badge token cache configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// How long a fetched badge token is reused
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// How long a fetch in progress holds off other fetches for the same
    /// project. 0 turns fetch coalescing off.
    #[serde(default = "default_pending_ttl_ms")]
    pub pending_ttl_ms: u64,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_secs: default_ttl_secs(),
            pending_ttl_ms: default_pending_ttl_ms(),
            max_capacity: default_max_capacity(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_pending_ttl_ms() -> u64 {
    1000
}

fn default_max_capacity() -> u64 {
    1000
}
