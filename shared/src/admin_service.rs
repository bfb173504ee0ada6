use crate::http::{full_body, make_boxed_error_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Serves `/health` and `/ready` on the admin listener. The service holds no
/// state besides its configuration, so both answer ok for as long as the
/// process is serving.
pub struct AdminService<E> {
    _error: PhantomData<fn() -> E>,
}

impl<E> AdminService<E> {
    pub fn new() -> Self {
        Self {
            _error: PhantomData,
        }
    }
}

impl<E> Default for AdminService<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Service<Request<Incoming>> for AdminService<E>
where
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        Box::pin(async move {
            let res = match req.uri().path() {
                "/health" | "/ready" => Response::new(full_body("ok\n")),
                _ => make_boxed_error_response(StatusCode::NOT_FOUND),
            };
            Ok(res)
        })
    }
}
