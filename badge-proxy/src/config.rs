use clap::Parser;
use proxy::config::{
    CacheConfig, Config as ProxyConfig, DEFAULT_LISTEN_PATH, Listener, UpstreamConfig,
};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub sentry_dsn: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CommonConfig {
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub proxy: ProxyConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid listen address {0:?}, expected [host]:port")]
    ListenAddress(String),
}

/// Reverse proxy serving SonarQube project badges without exposing an API token.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// YAML config file. When given, the proxy flags below are ignored.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to listen for badge requests on.
    #[arg(long, alias = "listen_address", default_value = ":8080")]
    pub listen_address: String,

    /// Path under which badge requests are proxied to SonarQube.
    #[arg(long, alias = "listen_endpoint", default_value = DEFAULT_LISTEN_PATH)]
    pub listen_endpoint: String,

    /// SonarQube base URL.
    #[arg(long, alias = "sonar_url", default_value = "http://127.0.0.1:9000")]
    pub sonar_url: Url,

    /// SonarQube token used to issue badge tokens. Without it every request
    /// must carry its own `token` parameter.
    #[arg(long, alias = "sonar_token")]
    pub sonar_token: Option<String>,

    /// Allow self-signed SonarQube certificates.
    #[arg(long)]
    pub insecure: bool,

    /// Proxy authorization token expected in the `proxy_token` parameter.
    #[arg(long, alias = "proxy_token")]
    pub proxy_token: Option<String>,

    /// Seconds a badge token stays cached.
    #[arg(long, alias = "cache_expire", default_value_t = 60)]
    pub cache_expire: u64,

    /// Milliseconds other requests wait on a token fetch in flight. 0 disables waiting.
    #[arg(long, default_value_t = 1000)]
    pub pending_ttl_ms: u64,

    /// Maximum number of cached projects.
    #[arg(long, default_value_t = 1000)]
    pub cache_size: u64,

    /// Timeout for SonarQube requests in seconds.
    #[arg(long, default_value_t = 15)]
    pub upstream_timeout: u64,

    /// Seconds a client gets to send request headers, and again the body.
    #[arg(long, default_value_t = 15)]
    pub read_timeout: u64,

    /// Address for the /health and /ready endpoints.
    #[arg(long)]
    pub admin_address: Option<String>,

    /// StatsD `host:port` to send metrics to.
    #[arg(long)]
    pub statsd_address: Option<String>,

    /// Sentry DSN for error reporting.
    #[arg(long)]
    pub sentry_dsn: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Builds the full configuration from the config file or the flags.
    pub fn into_config(self) -> Result<Config, ConfigError> {
        if let Some(path) = &self.config {
            let mut config = Config::from_file(path)?;
            config.common.logging.debug |= self.debug;
            return Ok(config);
        }

        let admin_listener = self
            .admin_address
            .as_deref()
            .map(parse_listen_address)
            .transpose()?;
        let metrics = self
            .statsd_address
            .as_deref()
            .map(parse_listen_address)
            .transpose()?
            .map(|statsd| MetricsConfig {
                statsd_host: statsd.host,
                statsd_port: statsd.port,
            });

        Ok(Config {
            common: CommonConfig {
                metrics,
                logging: LoggingConfig {
                    sentry_dsn: self.sentry_dsn.filter(|dsn| !dsn.is_empty()),
                    debug: self.debug,
                },
            },
            proxy: ProxyConfig {
                listener: parse_listen_address(&self.listen_address)?,
                listen_path: self.listen_endpoint,
                admin_listener,
                read_timeout_secs: self.read_timeout,
                upstream: UpstreamConfig {
                    url: self.sonar_url,
                    token: self.sonar_token.filter(|t| !t.is_empty()),
                    insecure: self.insecure,
                    timeout_secs: self.upstream_timeout,
                },
                proxy_token: self.proxy_token.filter(|t| !t.is_empty()),
                cache: CacheConfig {
                    ttl_secs: self.cache_expire,
                    pending_ttl_ms: self.pending_ttl_ms,
                    max_capacity: self.cache_size,
                },
            },
        })
    }
}

/// Parses `host:port`; an empty host binds every interface.
fn parse_listen_address(address: &str) -> Result<Listener, ConfigError> {
    let invalid = || ConfigError::ListenAddress(address.to_string());

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };

    Ok(Listener {
        host: host.to_string(),
        port,
    })
}
