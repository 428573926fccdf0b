//! Health and readiness endpoints on the worker's admin listener.

use crate::ProxyError;
use crate::state::GatewayState;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::Service as HyperService;
use hyper::{Request, Response, StatusCode};
use shared::http::make_boxed_error_response;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub struct AdminService {
    state: Arc<GatewayState>,
}

impl AdminService {
    pub fn new(state: Arc<GatewayState>) -> Self {
        AdminService { state }
    }
}

impl HyperService<Request<Incoming>> for AdminService {
    type Response = Response<BoxBody<Bytes, std::convert::Infallible>>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        // Ready once the first table snapshot has been applied.
        let ready = self.state.is_ready();

        Box::pin(async move {
            let ok = || Response::new(Full::new(Bytes::from("ok\n")).map_err(|e| match e {}).boxed());
            let response = match req.uri().path() {
                "/health" => ok(),
                "/ready" if ready => ok(),
                "/ready" => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
                _ => make_boxed_error_response(StatusCode::NOT_FOUND),
            };
            Ok(response)
        })
    }
}
