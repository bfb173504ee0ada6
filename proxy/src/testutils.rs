use crate::upstream::{BADGE_PATH, BADGE_TOKEN_PATH};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub path_and_query: String,
    pub authorization: Option<String>,
    pub host: Option<String>,
    pub custom: Option<String>,
}

impl RecordedRequest {
    fn from_request(req: &Request<Incoming>) -> Self {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        RecordedRequest {
            path_and_query: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default(),
            authorization: header("authorization"),
            host: header("host"),
            custom: header("x-custom"),
        }
    }
}

#[derive(Default)]
struct Recorded {
    tokens: Mutex<Vec<RecordedRequest>>,
    badges: Mutex<Vec<RecordedRequest>>,
}

/// In-process stand-in for the metrics server. Serves a fixed token body and
/// a fixed badge, and records every request it receives.
pub struct MockUpstream {
    addr: SocketAddr,
    recorded: Arc<Recorded>,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    pub const BADGE_BODY: &'static str = r#"<svg xmlns="http://www.w3.org/2000/svg"/>"#;

    pub async fn start(token_body: &'static str) -> Self {
        Self::start_with_delay(token_body, Duration::ZERO).await
    }

    /// Like `start`, but every token request is answered after `delay`.
    pub async fn start_with_delay(token_body: &'static str, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to address");
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Recorded::default());

        let state = recorded.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = TokioIo::new(stream);
                let state = state.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = state.clone();
                        async move {
                            Ok::<_, Infallible>(respond(&state, req, token_body, delay).await)
                        }
                    });
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        MockUpstream {
            addr,
            recorded,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    pub fn token_requests(&self) -> Vec<RecordedRequest> {
        self.recorded.tokens.lock().unwrap().clone()
    }

    pub fn badge_requests(&self) -> Vec<RecordedRequest> {
        self.recorded.badges.lock().unwrap().clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn respond(
    recorded: &Recorded,
    req: Request<Incoming>,
    token_body: &'static str,
    delay: Duration,
) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    let request = RecordedRequest::from_request(&req);

    if path.ends_with(BADGE_TOKEN_PATH) {
        recorded.tokens.lock().unwrap().push(request);
        tokio::time::sleep(delay).await;
        Response::builder()
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from_static(token_body.as_bytes())))
            .unwrap()
    } else if path.ends_with(BADGE_PATH) {
        recorded.badges.lock().unwrap().push(request);
        Response::builder()
            .header("content-type", "image/svg+xml")
            .header("cache-control", "no-cache")
            .body(Full::new(Bytes::from_static(MockUpstream::BADGE_BODY.as_bytes())))
            .unwrap()
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }
}
