use crate::config::UpstreamConfig;
use crate::errors::ProxyError;
use crate::handler::ForwardInstruction;
use crate::metrics_defs::TOKEN_FETCH_MALFORMED;
use crate::token_cache::{TokenError, TokenSource};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, HeaderValue};
use http::{HeaderMap, Response, Version};
use serde::Deserialize;
use shared::counter;
use shared::http::{add_via_header, filter_hop_by_hop};
use std::time::Duration;
use url::Url;

pub const BADGE_PATH: &str = "/api/project_badges/measure";
pub const BADGE_TOKEN_PATH: &str = "/api/project_badges/token";

/// Body of the badge token endpoint.
#[derive(Deserialize, Debug)]
struct BadgeToken {
    #[serde(rename = "Token", alias = "token")]
    token: String,
}

/// Joins `path` onto the upstream base URL, keeping any path prefix of the base.
pub fn upstream_endpoint(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let joined = format!("{}{}", base.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    url.set_query(None);
    url.set_fragment(None);
    url
}

/// HTTP client for the metrics server: fetches badge tokens and carries
/// rewritten badge requests.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: Url,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(UpstreamClient {
            client,
            base_url: config.url.clone(),
        })
    }

    /// Sends the rewritten request and buffers the upstream response.
    /// Status, headers and body are passed back untouched apart from
    /// hop-by-hop headers and Via.
    pub async fn forward(
        &self,
        instruction: &ForwardInstruction,
        mut headers: HeaderMap,
        version: Version,
        body: Bytes,
    ) -> Result<Response<Bytes>, ProxyError> {
        filter_hop_by_hop(&mut headers, version);
        // The client recomputes the length from the buffered body.
        headers.remove(CONTENT_LENGTH);
        match HeaderValue::from_str(&instruction.host) {
            Ok(host) => {
                headers.insert(HOST, host);
            }
            Err(_) => {
                headers.remove(HOST);
            }
        }
        add_via_header(&mut headers, version);

        let mut request = self
            .client
            .request(instruction.method.clone(), instruction.url.clone())
            .headers(headers);
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;

        let status = response.status();
        let response_version = response.version();
        let mut response_headers = response.headers().clone();
        let body = response.bytes().await?;

        filter_hop_by_hop(&mut response_headers, response_version);
        add_via_header(&mut response_headers, response_version);

        let mut forwarded = Response::new(body);
        *forwarded.status_mut() = status;
        *forwarded.headers_mut() = response_headers;
        Ok(forwarded)
    }
}

#[async_trait]
impl TokenSource for UpstreamClient {
    async fn fetch_token(&self, project: &str, credential: &str) -> Result<String, TokenError> {
        let url = upstream_endpoint(&self.base_url, BADGE_TOKEN_PATH);

        let response = self
            .client
            .get(url)
            .query(&[("project", project)])
            .basic_auth(credential, None::<&str>)
            .send()
            .await
            .map_err(|e| TokenError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TokenError::UpstreamUnavailable(e.to_string()))?;

        match serde_json::from_slice::<BadgeToken>(&body) {
            Ok(badge_token) => Ok(badge_token.token),
            Err(e) => {
                tracing::error!(project, %status, error = %e, "Can not parse badge token response");
                counter!(TOKEN_FETCH_MALFORMED).increment(1);
                Ok(String::new())
            }
        }
    }
}
