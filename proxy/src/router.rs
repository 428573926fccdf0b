//! The rewrite-phase router: virtual-host dispatch, longest-path
//! location selection, and pre-routing policy (whitelist, redirect,
//! rewrite).

use crate::servers::{CompiledLocation, ServerRegistry, VirtualHost};
use crate::state::RequestInfo;
use shared::tables::BackendRef;

/// What the rewrite phase decided for one request.
#[derive(Debug, PartialEq)]
pub enum RouteOutcome {
    /// No virtual host or no matching location; the static fallback
    /// answers.
    Unmatched,
    /// Caller's IP failed the location whitelist.
    Forbidden,
    Redirect {
        url: String,
        code: u16,
    },
    Proxy(RouteMatch),
}

/// The variables the router publishes for the balancer phase and for
/// observability.
#[derive(Debug, PartialEq)]
pub struct RouteMatch {
    /// The primary pool (`proxy_upstream_name`).
    pub upstream: String,
    pub location_path: String,
    pub backend_ref: BackendRef,
    /// URI path after `rewrite-target` substitution, when one applied.
    pub rewritten_path: Option<String>,
}

/// Longest-path selection: of the locations whose pattern matches the
/// URI, the one with the greatest path string length wins; ties keep the
/// first seen.
fn select_location<'a>(vhost: &'a VirtualHost, uri_path: &str) -> Option<&'a CompiledLocation> {
    let mut best: Option<&CompiledLocation> = None;
    for candidate in &vhost.locations {
        if candidate.match_len(uri_path).is_none() {
            continue;
        }
        let better = match best {
            Some(current) => candidate.location.path.len() > current.location.path.len(),
            None => true,
        };
        if better {
            best = Some(candidate);
        }
    }
    best
}

pub fn route(registry: &ServerRegistry, info: &RequestInfo<'_>) -> RouteOutcome {
    let Some(vhost) = registry.lookup(&info.host) else {
        return RouteOutcome::Unmatched;
    };
    let Some(selected) = select_location(vhost, info.path) else {
        return RouteOutcome::Unmatched;
    };
    let location = &selected.location;

    tracing::debug!(
        host = %info.host,
        proxy_upstream_name = %location.backend,
        location_path = %location.path,
        namespace = %location.backend_ref.namespace,
        ingress_name = %location.backend_ref.ingress_name,
        service_name = %location.backend_ref.service_name,
        service_port = %location.backend_ref.service_port,
        "route selected"
    );

    if !registry.ip_allowed(selected, info.client_ip) {
        return RouteOutcome::Forbidden;
    }

    if let Some(redirect) = &location.redirect {
        return RouteOutcome::Redirect {
            url: redirect.url.clone(),
            code: redirect.code,
        };
    }

    let rewrite = &location.rewrite;
    if !rewrite.app_root.is_empty() && info.path == "/" {
        return RouteOutcome::Redirect {
            url: rewrite.app_root.clone(),
            code: 302,
        };
    }

    if (rewrite.force_ssl_redirect || rewrite.ssl_redirect) && !info.tls {
        return RouteOutcome::Redirect {
            url: format!("https://{}{}", info.host, info.request_uri()),
            code: 308,
        };
    }

    let rewritten_path = if rewrite.target.is_empty() {
        None
    } else {
        selected.path_regex.as_ref().map(|re| {
            re.replace(info.path, rewrite.target.as_str()).into_owned()
        })
    };

    RouteOutcome::Proxy(RouteMatch {
        upstream: location.backend.clone(),
        location_path: location.path.clone(),
        backend_ref: location.backend_ref.clone(),
        rewritten_path,
    })
}
