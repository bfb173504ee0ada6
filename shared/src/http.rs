use http::Version;
use http::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Name used in the Via header added to proxied requests and responses.
pub const PROXY_NAME: &str = "sonar-badge-proxy";

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

/// Binds `host:port` and serves `service` on every accepted connection.
/// Clients that take longer than `header_read_timeout` to send request
/// headers are disconnected.
pub async fn run_http_service<S, E>(
    host: &str,
    port: u16,
    header_read_timeout: Duration,
    service: S,
) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "Listening");
    serve(listener, header_read_timeout, service).await
}

/// Accept loop over an already bound listener.
pub async fn serve<S, E>(
    listener: TcpListener,
    header_read_timeout: Duration,
    service: S,
) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let service_arc = Arc::new(service);

    // HTTP/1 only: the header timer then also covers idle and silent connections.
    let mut builder = Builder::new(TokioExecutor::new()).http1_only();
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();
        let builder = builder.clone();

        tokio::spawn(async move {
            if let Err(e) = builder.serve_connection(io, svc).await {
                tracing::debug!(peer = %peer_addr, error = %e, "Connection closed with error");
            }
        });
    }
}

/// Builds a plain-text response carrying the canonical reason of `status_code`.
pub fn make_boxed_error_response<E>(status_code: StatusCode) -> Response<BoxBody<Bytes, E>>
where
    E: 'static,
{
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    let mut response = Response::new(full_body(Bytes::from(message)));
    *response.status_mut() = status_code;
    response
}

/// Wraps in-memory bytes into the boxed body type used by the services.
pub fn full_body<E>(bytes: impl Into<Bytes>) -> BoxBody<Bytes, E>
where
    E: 'static,
{
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub fn is_http1(v: Version) -> bool {
    matches!(v, Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11)
}

/// Adds a Via header to indicate the request/response passed through this proxy.
/// Appends to existing if Via is already present.
pub fn add_via_header(headers: &mut HeaderMap, version: Version) {
    let version_str = match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => {
            tracing::warn!(?version, "Unknown HTTP version, skipping Via header");
            return;
        }
    };

    let via_value = format!("{version_str} {PROXY_NAME}");

    if let Some(existing) = headers.get(VIA) {
        if let Ok(existing_str) = existing.to_str() {
            let combined = format!("{existing_str}, {via_value}");
            if let Ok(new_value) = HeaderValue::from_str(&combined) {
                headers.insert(VIA, new_value);
            }
        }
    } else if let Ok(new_value) = HeaderValue::from_str(&via_value) {
        headers.insert(VIA, new_value);
    }
}

// For HTTP/1.x connections, hop-by-hop headers are removed before forwarding:
// - standard hop-by-hop headers
// - any extra headers listed in the Connection header value
// - keep-alive header for HTTP/0.9 and HTTP/1.0 only
//
// HTTP/2 and HTTP/3 don't use hop-by-hop headers, so no filtering is performed.
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) -> &mut HeaderMap {
    if !is_http1(version) {
        return headers;
    }

    let mut extra_drops = Vec::new();
    if let Some(connection) = headers.get(CONNECTION)
        && let Ok(s) = connection.to_str()
    {
        for token in s.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                extra_drops.push(name);
            }
        }
    }

    for name in HOP_BY_HOP_NAMES {
        headers.remove(name);
    }

    for name in extra_drops {
        headers.remove(&name);
    }

    if matches!(version, Version::HTTP_09 | Version::HTTP_10) {
        headers.remove(HeaderName::from_static("keep-alive"));
    }

    headers
}
