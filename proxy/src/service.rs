//! The gateway's hyper service: one request through the rewrite phase
//! (router), the balancer phase (release selector + balancer), and the
//! forwarding client.

use crate::balancer::BalanceContext;
use crate::metrics_defs::REQUEST_DURATION;
use crate::release::{self, Selection};
use crate::router::{self, RouteOutcome};
use crate::state::{GatewayState, RequestInfo};
use bytes::Bytes;
use http::header::{HeaderValue, LOCATION, SET_COOKIE};
use http::{StatusCode, Version};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::service::Service as HyperService;
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use shared::histogram;
use shared::http::{add_via_header, filter_hop_by_hop, make_boxed_error_response};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

type GatewayBody = BoxBody<Bytes, hyper::Error>;

pub struct Gateway {
    state: Arc<GatewayState>,
    client: Client<HttpConnector, Incoming>,
}

/// What the decision phase (which borrows the request) hands to the
/// forwarding phase (which consumes it).
enum Decision {
    Respond(Response<GatewayBody>),
    Forward {
        pool: String,
        endpoint: String,
        rewritten_path: Option<String>,
        cookies: Vec<String>,
    },
}

fn redirect_response(url: &str, code: u16) -> Response<GatewayBody> {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::FOUND);
    let Ok(location) = HeaderValue::from_str(url) else {
        tracing::warn!(%url, "redirect target is not a valid header value");
        return make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR);
    };
    let mut response = make_boxed_error_response(status);
    response.headers_mut().insert(LOCATION, location);
    response
}

impl Gateway {
    pub fn new(state: Arc<GatewayState>) -> Self {
        let connector = HttpConnector::new();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Gateway { state, client }
    }

    fn decide(&self, req: &Request<Incoming>, peer: SocketAddr) -> Decision {
        if !self.state.dynamic_servers_enabled() {
            return Decision::Respond(make_boxed_error_response(StatusCode::NOT_FOUND));
        }

        let snapshot = self.state.snapshot();
        let info = RequestInfo::new(req.uri(), req.headers(), peer);

        let matched = match router::route(&snapshot.servers, &info) {
            RouteOutcome::Unmatched => {
                return Decision::Respond(make_boxed_error_response(StatusCode::NOT_FOUND));
            }
            RouteOutcome::Forbidden => {
                return Decision::Respond(make_boxed_error_response(StatusCode::FORBIDDEN));
            }
            RouteOutcome::Redirect { url, code } => {
                return Decision::Respond(redirect_response(&url, code));
            }
            RouteOutcome::Proxy(matched) => matched,
        };

        let (pool, release_cookie) =
            match release::select(&snapshot, &matched.upstream, &info, &matched.location_path) {
                Selection::Unavailable => {
                    return Decision::Respond(make_boxed_error_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                    ));
                }
                Selection::Pool { name, set_cookie } => (name, set_cookie),
            };

        let Some(balancer) = snapshot.balancers.get(&pool) else {
            return Decision::Respond(make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE));
        };
        let ctx = BalanceContext {
            info: &info,
            location_path: &matched.location_path,
        };
        let Some(pick) = balancer.balance(&ctx) else {
            return Decision::Respond(make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE));
        };

        let cookies = release_cookie
            .into_iter()
            .chain(pick.set_cookie)
            .collect();

        Decision::Forward {
            pool,
            endpoint: pick.endpoint,
            rewritten_path: matched.rewritten_path,
            cookies,
        }
    }

    pub async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<GatewayBody> {
        let start = Instant::now();

        let (pool, endpoint, rewritten_path, cookies) = match self.decide(&req, peer) {
            Decision::Respond(response) => return response,
            Decision::Forward {
                pool,
                endpoint,
                rewritten_path,
                cookies,
            } => (pool, endpoint, rewritten_path, cookies),
        };

        let (mut parts, body) = req.into_parts();

        let path = rewritten_path.as_deref().unwrap_or(parts.uri.path());
        let target = match parts.uri.query() {
            Some(query) => format!("http://{endpoint}{path}?{query}"),
            None => format!("http://{endpoint}{path}"),
        };
        let uri = match target.parse() {
            Ok(uri) => uri,
            Err(err) => {
                tracing::warn!(%target, error = %err, "could not build upstream URI");
                return make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let version = parts.version;
        filter_hop_by_hop(&mut parts.headers, version);
        add_via_header(&mut parts.headers, version);
        parts.uri = uri;
        // The upstream connection speaks h1 regardless of what the client
        // negotiated with us.
        parts.version = Version::HTTP_11;

        let response = self
            .client
            .request(Request::from_parts(parts, body))
            .await;
        let rtt = start.elapsed();

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(%endpoint, error = %err, "upstream request failed");
                histogram!(REQUEST_DURATION, "status" => "502", "upstream" => pool)
                    .record(rtt.as_secs_f64());
                return make_boxed_error_response(StatusCode::BAD_GATEWAY);
            }
        };

        if let Some(balancer) = self.state.snapshot().balancers.get(&pool) {
            balancer.after_balance(&endpoint, rtt);
        }
        histogram!(
            REQUEST_DURATION,
            "status" => response.status().as_u16().to_string(),
            "upstream" => pool
        )
        .record(rtt.as_secs_f64());

        let (mut parts, body) = response.into_parts();
        let version = parts.version;
        filter_hop_by_hop(&mut parts.headers, version);
        add_via_header(&mut parts.headers, version);
        for cookie in cookies {
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    parts.headers.append(SET_COOKIE, value);
                }
                Err(err) => tracing::warn!(error = %err, "dropping unencodable cookie"),
            }
        }

        Response::from_parts(parts, body.boxed())
    }
}

/// Per-connection service: the gateway plus the connection's peer
/// address, which feeds the real-IP derivation.
pub struct GatewayService {
    pub gateway: Arc<Gateway>,
    pub peer: SocketAddr,
}

impl HyperService<Request<Incoming>> for GatewayService {
    type Response = Response<GatewayBody>;
    type Error = hyper::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let gateway = self.gateway.clone();
        let peer = self.peer;
        Box::pin(async move { Ok(gateway.handle(req, peer).await) })
    }
}
