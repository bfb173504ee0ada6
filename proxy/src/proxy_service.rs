use crate::config::Config;
use crate::errors::ProxyError;
use crate::handler::{BadgeHandler, InboundRequest};
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::token_cache::TokenCache;
use crate::upstream::UpstreamClient;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::service::Service as HyperService;
use hyper::{Request, Response, StatusCode};
use shared::http::{full_body, make_boxed_error_response};
use shared::{gauge, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

type ProxyResponse = Response<BoxBody<Bytes, ProxyError>>;
type BodyError = Box<dyn std::error::Error + Send + Sync>;

/// Badge requests carry everything in the query string.
const MAX_REQUEST_BODY: usize = 64 * 1024;

/// Serves badge requests on the configured listen path.
#[derive(Clone)]
pub struct ProxyService {
    inner: Arc<ProxyServiceInner>,
}

struct ProxyServiceInner {
    listen_path: String,
    read_timeout: Duration,
    handler: BadgeHandler,
    upstream: UpstreamClient,
}

impl ProxyService {
    pub fn new(config: &Config, tokens: Arc<TokenCache>, upstream: UpstreamClient) -> Self {
        Self {
            inner: Arc::new(ProxyServiceInner {
                listen_path: config.listen_path.clone(),
                read_timeout: Duration::from_secs(config.read_timeout_secs),
                handler: BadgeHandler::new(config, tokens),
                upstream,
            }),
        }
    }

    pub(crate) async fn proxy<B>(&self, req: Request<B>) -> ProxyResponse
    where
        B: Body,
        B::Error: Into<BodyError>,
    {
        let started = Instant::now();
        let _inflight = InflightGuard::new();

        let response = self.inner.dispatch(req).await;

        histogram!(REQUEST_DURATION, "status" => response.status().as_str().to_string())
            .record(started.elapsed().as_secs_f64());
        response
    }
}

impl ProxyServiceInner {
    async fn dispatch<B>(&self, req: Request<B>) -> ProxyResponse
    where
        B: Body,
        B::Error: Into<BodyError>,
    {
        if req.uri().path() != self.listen_path {
            return make_boxed_error_response(StatusCode::NOT_FOUND);
        }

        let (parts, body) = req.into_parts();
        let inbound = InboundRequest::from_parts(&parts);

        let instruction = match self.handler.handle(&inbound).await {
            Ok(instruction) => instruction,
            Err(error) => return error.into_response(),
        };

        let collect = Limited::new(body, MAX_REQUEST_BODY).collect();
        let body = match tokio::time::timeout(self.read_timeout, collect).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) => {
                let status = if e.is::<LengthLimitError>() {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                let error = ProxyError::RequestBody(e.to_string());
                tracing::warn!(error = %error, "Dropping badge request");
                return make_boxed_error_response(status);
            }
            Err(_) => {
                tracing::warn!("Timed out reading badge request body");
                return make_boxed_error_response(StatusCode::REQUEST_TIMEOUT);
            }
        };

        match self
            .upstream
            .forward(&instruction, parts.headers, parts.version, body)
            .await
        {
            Ok(response) => response.map(|body| full_body(body)),
            Err(e) => {
                tracing::warn!(url = %instruction.url, error = %e, "Error forwarding badge request");
                make_boxed_error_response(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

impl HyperService<Request<Incoming>> for ProxyService {
    type Response = ProxyResponse;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.proxy(req).await) })
    }
}

/// Keeps `requests.inflight` accurate even when the connection drops mid-request.
struct InflightGuard;

impl InflightGuard {
    fn new() -> Self {
        gauge!(REQUESTS_INFLIGHT).increment(1.0);
        InflightGuard
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        gauge!(REQUESTS_INFLIGHT).decrement(1.0);
    }
}
