pub mod config;
pub mod errors;
pub mod handler;
pub mod metrics_defs;
mod proxy_service;
#[cfg(test)]
mod testutils;
pub mod token_cache;
pub mod upstream;

use config::Config;
use errors::ProxyError;
use proxy_service::ProxyService;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;
use token_cache::{CacheSettings, TokenCache};
use upstream::UpstreamClient;

/// Validates `config`, builds the token cache and serves badge requests until
/// a listener fails.
pub async fn run(config: Config) -> Result<(), ProxyError> {
    config.validate()?;

    let upstream = UpstreamClient::new(&config.upstream)?;
    let tokens = Arc::new(TokenCache::new(
        CacheSettings::from(&config.cache),
        Arc::new(upstream.clone()),
    ));

    tracing::info!(
        upstream = %config.upstream.url,
        path = %config.listen_path,
        per_caller_credential = config.upstream.token.is_none(),
        "Starting badge proxy"
    );

    let read_timeout = Duration::from_secs(config.read_timeout_secs);
    let proxy_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        read_timeout,
        ProxyService::new(&config, tokens, upstream),
    );

    match &config.admin_listener {
        Some(admin) => {
            let admin_task = run_http_service(
                &admin.host,
                admin.port,
                read_timeout,
                AdminService::<ProxyError>::new(),
            );
            tokio::try_join!(proxy_task, admin_task)?;
        }
        None => proxy_task.await?,
    }

    Ok(())
}
