use crate::config::Config;
use crate::token_cache::{TokenCache, TokenError};
use crate::upstream::{BADGE_PATH, upstream_endpoint};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, HeaderValue};
use http::request::Parts;
use http::{Method, StatusCode};
use http_body_util::combinators::BoxBody;
use hyper::Response;
use serde::Serialize;
use shared::http::full_body;
use std::sync::Arc;
use url::Url;
use url::form_urlencoded;

const PROJECT_PARAM: &str = "project";
const TOKEN_PARAM: &str = "token";
const PROXY_TOKEN_PARAM: &str = "proxy_token";

const WRONG_PARAMS: &str = "Wrong params";

/// The parts of an inbound request the handler looks at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundRequest {
    pub method: Method,
    pub host: Option<String>,
    pub path: String,
    /// Decoded query parameters in their original order
    pub query: Vec<(String, String)>,
}

impl InboundRequest {
    pub fn from_parts(parts: &Parts) -> Self {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()));

        let query = parts
            .uri
            .query()
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        InboundRequest {
            method: parts.method.clone(),
            host,
            path: parts.uri.path().to_string(),
            query,
        }
    }

    /// First value of a query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Where and how to send the rewritten badge request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardInstruction {
    pub method: Method,
    /// Value of the outbound Host header
    pub host: String,
    pub url: Url,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

/// Failure outcome of the handler. A `None` message produces an empty body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub message: Option<String>,
}

impl ErrorResponse {
    pub fn unauthorized() -> Self {
        ErrorResponse {
            status: StatusCode::UNAUTHORIZED,
            message: None,
        }
    }

    pub fn wrong_params() -> Self {
        ErrorResponse {
            status: StatusCode::BAD_REQUEST,
            message: Some(WRONG_PARAMS.to_string()),
        }
    }

    pub fn into_response<E>(self) -> Response<BoxBody<Bytes, E>>
    where
        E: 'static,
    {
        let mut response = match &self.message {
            Some(message) => {
                let body = serde_json::to_vec(&ErrorBody { message })
                    .unwrap_or_else(|_| br#"{"message":"internal error"}"#.to_vec());
                let mut response = Response::new(full_body(body));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
            None => Response::new(full_body(Bytes::new())),
        };
        *response.status_mut() = self.status;
        response
    }
}

impl From<TokenError> for ErrorResponse {
    fn from(error: TokenError) -> Self {
        ErrorResponse {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: Some(error.to_string()),
        }
    }
}

/// Validates badge requests, resolves the project's badge token and rewrites
/// the request to target the upstream badge endpoint.
pub struct BadgeHandler {
    badge_url: Url,
    upstream_host: String,
    proxy_token: Option<String>,
    upstream_token: Option<String>,
    tokens: Arc<TokenCache>,
}

impl BadgeHandler {
    pub fn new(config: &Config, tokens: Arc<TokenCache>) -> Self {
        let upstream = &config.upstream.url;
        let upstream_host = match (upstream.host_str(), upstream.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };

        BadgeHandler {
            badge_url: upstream_endpoint(upstream, BADGE_PATH),
            upstream_host,
            proxy_token: config.proxy_token.clone(),
            upstream_token: config.upstream.token.clone(),
            tokens,
        }
    }

    pub async fn handle(
        &self,
        request: &InboundRequest,
    ) -> Result<ForwardInstruction, ErrorResponse> {
        tracing::debug!(host = ?request.host, path = %request.path, "Receive request");

        if let Some(expected) = &self.proxy_token {
            if request.param(PROXY_TOKEN_PARAM) != Some(expected.as_str()) {
                tracing::debug!("Authorization error");
                return Err(ErrorResponse::unauthorized());
            }
            tracing::debug!("Authorization success");
        }

        let project = request.param(PROJECT_PARAM).filter(|p| !p.is_empty());
        let credential = match &self.upstream_token {
            Some(token) => Some(token.as_str()),
            None => request.param(TOKEN_PARAM).filter(|t| !t.is_empty()),
        };
        let (Some(project), Some(credential)) = (project, credential) else {
            tracing::warn!(path = %request.path, "Wrong params");
            return Err(ErrorResponse::wrong_params());
        };

        tracing::debug!(project, "Get badge token for project");
        let badge_token = self.tokens.get_or_fetch(project, credential).await?;

        let instruction = self.rewrite(request, &badge_token);
        tracing::debug!(host = %instruction.host, path = instruction.url.path(), "Proxy request");
        Ok(instruction)
    }

    /// Points the request at the upstream badge endpoint and replaces every
    /// `token` value with the badge token. Parameters are encoded sorted by key.
    fn rewrite(&self, request: &InboundRequest, badge_token: &str) -> ForwardInstruction {
        let mut params: Vec<(&str, &str)> = request
            .query
            .iter()
            .filter(|(key, _)| key != TOKEN_PARAM)
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        params.push((TOKEN_PARAM, badge_token));
        params.sort_by_key(|(key, _)| *key);

        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();

        let mut url = self.badge_url.clone();
        url.set_query(Some(&query));

        ForwardInstruction {
            method: request.method.clone(),
            host: self.upstream_host.clone(),
            url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, Listener, UpstreamConfig};
    use crate::testutils::MockUpstream;
    use crate::token_cache::CacheSettings;
    use crate::upstream::UpstreamClient;
    use http::Request;
    use http_body_util::BodyExt;
    use std::convert::Infallible;

    fn config(upstream: &str, upstream_token: Option<&str>, proxy_token: Option<&str>) -> Config {
        Config {
            listener: Listener::default(),
            listen_path: "/badge".into(),
            admin_listener: None,
            read_timeout_secs: 15,
            upstream: UpstreamConfig {
                url: Url::parse(upstream).unwrap(),
                token: upstream_token.map(str::to_string),
                insecure: false,
                timeout_secs: 2,
            },
            proxy_token: proxy_token.map(str::to_string),
            cache: CacheConfig::default(),
        }
    }

    fn handler(config: &Config) -> BadgeHandler {
        let client = UpstreamClient::new(&config.upstream).unwrap();
        let tokens = TokenCache::new(CacheSettings::from(&config.cache), Arc::new(client));
        BadgeHandler::new(config, Arc::new(tokens))
    }

    fn inbound(uri: &str) -> InboundRequest {
        let (parts, _) = Request::get(uri)
            .header(HOST, "badges.example.com")
            .body(())
            .unwrap()
            .into_parts();
        InboundRequest::from_parts(&parts)
    }

    #[test]
    fn test_inbound_request_from_parts() {
        let request = inbound("/badge?project=foo%20bar&metric=coverage&metric=bugs");

        assert_eq!(request.host.as_deref(), Some("badges.example.com"));
        assert_eq!(request.path, "/badge");
        assert_eq!(request.param("project"), Some("foo bar"));
        assert_eq!(request.param("metric"), Some("coverage"));
        assert_eq!(request.param("token"), None);
        assert_eq!(request.query.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_project() {
        let upstream = MockUpstream::start(r#"{"Token":"abc"}"#).await;
        let handler = handler(&config(&upstream.url(), Some("cred"), None));

        let error = handler.handle(&inbound("/badge?metric=coverage")).await.unwrap_err();
        assert_eq!(error, ErrorResponse::wrong_params());

        let error = handler.handle(&inbound("/badge?project=")).await.unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        assert!(upstream.token_requests().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_params_body() {
        let response = ErrorResponse::wrong_params().into_response::<Infallible>();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), br#"{"message":"Wrong params"}"#);
    }

    #[tokio::test]
    async fn test_unauthorized_has_empty_body() {
        let response = ErrorResponse::unauthorized().into_response::<Infallible>();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_per_caller_credential_required() {
        let upstream = MockUpstream::start(r#"{"Token":"abc"}"#).await;
        let handler = handler(&config(&upstream.url(), None, None));

        let error = handler.handle(&inbound("/badge?project=foo")).await.unwrap_err();
        assert_eq!(error, ErrorResponse::wrong_params());
        assert!(upstream.token_requests().is_empty());

        let instruction = handler
            .handle(&inbound("/badge?project=foo&token=cred"))
            .await
            .unwrap();
        assert_eq!(instruction.url.query(), Some("project=foo&token=abc"));

        let calls = upstream.token_requests();
        assert_eq!(calls.len(), 1);
        // "cred:" in base64
        assert_eq!(calls[0].authorization.as_deref(), Some("Basic Y3JlZDo="));
    }

    #[tokio::test]
    async fn test_proxy_token() {
        let upstream = MockUpstream::start(r#"{"Token":"abc"}"#).await;
        let handler = handler(&config(&upstream.url(), Some("cred"), Some("secret")));

        for uri in ["/badge?project=foo&proxy_token=wrong", "/badge?project=foo"] {
            let error = handler.handle(&inbound(uri)).await.unwrap_err();
            assert_eq!(error, ErrorResponse::unauthorized());
        }
        assert!(upstream.token_requests().is_empty());
        assert!(upstream.badge_requests().is_empty());

        let instruction = handler
            .handle(&inbound("/badge?project=foo&proxy_token=secret"))
            .await
            .unwrap();
        assert_eq!(
            instruction.url.query(),
            Some("project=foo&proxy_token=secret&token=abc")
        );
    }

    #[tokio::test]
    async fn test_rewrite_and_cache() {
        let upstream = MockUpstream::start(r#"{"Token":"abc"}"#).await;
        let handler = handler(&config(&upstream.url(), Some("cred"), None));

        let first = handler
            .handle(&inbound("/badge?project=foo&token=caller&metric=coverage"))
            .await
            .unwrap();
        assert_eq!(first.method, Method::GET);
        assert_eq!(first.host, upstream.authority());
        assert_eq!(first.url.path(), BADGE_PATH);
        assert_eq!(first.url.query(), Some("metric=coverage&project=foo&token=abc"));

        let second = handler
            .handle(&inbound("/badge?project=foo&token=caller&metric=coverage"))
            .await
            .unwrap();
        assert_eq!(first, second);

        let calls = upstream.token_requests();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path_and_query, "/api/project_badges/token?project=foo");
    }

    #[tokio::test]
    async fn test_upstream_prefix_is_kept() {
        let upstream = MockUpstream::start(r#"{"Token":"abc"}"#).await;
        let base = format!("{}/sonar/", upstream.url());
        let handler = handler(&config(&base, Some("cred"), None));

        let instruction = handler.handle(&inbound("/badge?project=foo")).await.unwrap();
        assert_eq!(instruction.url.path(), "/sonar/api/project_badges/measure");
        assert_eq!(
            upstream.token_requests()[0].path_and_query,
            "/sonar/api/project_badges/token?project=foo"
        );
    }

    #[tokio::test]
    async fn test_upstream_unavailable() {
        let handler = handler(&config("http://127.0.0.1:9", Some("cred"), None));

        let error = handler.handle(&inbound("/badge?project=foo")).await.unwrap_err();
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(error.message.is_some_and(|m| !m.is_empty()));
    }

    #[tokio::test]
    async fn test_slow_upstream_fails_and_is_retried() {
        let upstream = MockUpstream::start_with_delay(
            r#"{"Token":"abc"}"#,
            std::time::Duration::from_secs(3),
        )
        .await;
        let mut config = config(&upstream.url(), Some("cred"), None);
        config.upstream.timeout_secs = 1;
        let handler = handler(&config);

        let error = handler.handle(&inbound("/badge?project=foo")).await.unwrap_err();
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(upstream.token_requests().len(), 1);

        // The failed fetch left nothing behind, so the next request fetches again.
        let error = handler.handle(&inbound("/badge?project=foo")).await.unwrap_err();
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(upstream.token_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_fetch_once() {
        let upstream = MockUpstream::start_with_delay(
            r#"{"Token":"abc"}"#,
            std::time::Duration::from_millis(100),
        )
        .await;
        let handler = Arc::new(handler(&config(&upstream.url(), Some("cred"), None)));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let handler = handler.clone();
                tokio::spawn(async move { handler.handle(&inbound("/badge?project=foo")).await })
            })
            .collect();

        for task in tasks {
            let instruction = task.await.unwrap().unwrap();
            assert_eq!(instruction.url.query(), Some("project=foo&token=abc"));
        }
        assert_eq!(upstream.token_requests().len(), 1);
    }
}
