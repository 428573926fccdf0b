//! Per-worker state: compiled views over the published tables and the
//! registries the request path reads from.
//!
//! The reconcile tasks are the only writers. Registries sit behind
//! `ArcSwap`, and every request captures one [`Snapshot`] up front, so
//! the rewrite phase, the release selector and the balancer hook all see
//! the same tables even while a swap lands mid-request.

use crate::balancer::{Balancer, BalancerRegistry};
use crate::servers::ServerRegistry;
use arc_swap::ArcSwap;
use http::HeaderMap;
use http::Uri;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use regex::Regex;
use shared::tables::{Backend, Endpoint, MatchPattern, Server, Ticket, TrafficShapingPolicy};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub fn md5_hex(input: &str) -> String {
    Md5::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Everything the request path needs to know about one request, captured
/// once at the top of the pipeline.
pub struct RequestInfo<'a> {
    pub host: String,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub client_ip: IpAddr,
    pub tls: bool,
}

impl<'a> RequestInfo<'a> {
    pub fn new(uri: &'a Uri, headers: &'a HeaderMap, peer: SocketAddr) -> Self {
        let host = uri
            .host()
            .or_else(|| headers.get(http::header::HOST).and_then(|h| h.to_str().ok()))
            .unwrap_or("");
        // Strip any port; host matching is on the name alone.
        let host = host.split(':').next().unwrap_or("").to_ascii_lowercase();

        let client_ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or_else(|| peer.ip());

        let tls = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("https"))
            .unwrap_or(false);

        RequestInfo {
            host,
            path: uri.path(),
            query: uri.query(),
            headers,
            client_ip,
            tls,
        }
    }

    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        for header in self.headers.get_all(http::header::COOKIE) {
            let Ok(raw) = header.to_str() else { continue };
            for pair in raw.split(';') {
                let mut kv = pair.splitn(2, '=');
                if kv.next().map(str::trim) == Some(name) {
                    return Some(kv.next().unwrap_or("").trim().to_string());
                }
            }
        }
        None
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query?.split('&').find_map(|pair| {
            let mut kv = pair.splitn(2, '=');
            (kv.next() == Some(name)).then(|| kv.next().unwrap_or("").to_string())
        })
    }

    pub fn request_uri(&self) -> String {
        match self.query {
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.to_string(),
        }
    }

    /// Resolves the nginx-style request variables consistent hashing can
    /// key on. Unknown variables hash to the empty string.
    pub fn variable(&self, name: &str) -> String {
        match name {
            "$request_uri" => self.request_uri(),
            "$uri" => self.path.to_string(),
            "$host" => self.host.clone(),
            "$remote_addr" => self.client_ip.to_string(),
            _ => {
                if let Some(arg) = name.strip_prefix("$arg_") {
                    return self.query_param(arg).unwrap_or_default();
                }
                if let Some(header) = name.strip_prefix("$http_") {
                    return self.header(&header.replace('_', "-")).to_string();
                }
                if let Some(cookie) = name.strip_prefix("$cookie_") {
                    return self.cookie(cookie).unwrap_or_default();
                }
                String::new()
            }
        }
    }
}

#[derive(Debug)]
pub enum Matcher {
    Exact(String),
    Regex(Regex),
}

impl Matcher {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(expected) => value == expected,
            Matcher::Regex(re) => re.is_match(value),
        }
    }
}

#[derive(Debug)]
pub struct CompiledRule {
    pub ticket: Ticket,
    pub key: String,
    pub matcher: Matcher,
}

impl CompiledRule {
    /// Extracts this rule's request value; a missing ticket reads as the
    /// empty string.
    pub fn extract<'i>(&self, info: &RequestInfo<'i>) -> String {
        match self.ticket {
            Ticket::Header => info.header(&self.key).to_string(),
            Ticket::Cookie => info.cookie(&self.key).unwrap_or_default(),
            Ticket::Query => info.query_param(&self.key).unwrap_or_default(),
        }
    }

    pub fn evaluate(&self, info: &RequestInfo<'_>) -> bool {
        self.matcher.matches(&self.extract(info))
    }
}

#[derive(Debug, Default)]
pub struct LegacyCanary {
    pub header: String,
    pub header_value: String,
    pub header_pattern: Option<Regex>,
    pub cookie: String,
    pub weight: u32,
}

/// Release policy with its regexes compiled once at sync time, keeping
/// the request path allocation- and compile-free.
#[derive(Debug)]
pub struct Shaping {
    pub host_path: String,
    /// Sticky release cookie: MD5 hex of the host-path.
    pub cookie_name: String,
    pub service_weight: HashMap<String, u32>,
    pub rules: HashMap<String, CompiledRule>,
    pub legacy: Option<LegacyCanary>,
}

fn compile_shaping(name: &str, policy: &TrafficShapingPolicy) -> Option<Shaping> {
    if policy.is_empty() {
        return None;
    }

    let mut rules = HashMap::new();
    for (pool, rule) in &policy.service_match {
        let matcher = match &rule.pattern {
            MatchPattern::Exact(value) => Matcher::Exact(value.clone()),
            MatchPattern::Regex(value) => match Regex::new(value) {
                Ok(re) => Matcher::Regex(re),
                Err(err) => {
                    // The sibling falls back to weight-only behaviour.
                    tracing::warn!(backend = %name, pool = %pool, error = %err, "skipping match rule with invalid regex");
                    continue;
                }
            },
        };
        rules.insert(
            pool.clone(),
            CompiledRule {
                ticket: rule.ticket,
                key: rule.key.clone(),
                matcher,
            },
        );
    }

    let legacy = if !policy.is_release()
        && (!policy.header.is_empty() || !policy.cookie.is_empty() || policy.weight > 0)
    {
        let header_pattern = if policy.header_pattern.is_empty() {
            None
        } else {
            match Regex::new(&policy.header_pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::warn!(backend = %name, error = %err, "skipping canary header pattern with invalid regex");
                    None
                }
            }
        };
        Some(LegacyCanary {
            header: policy.header.clone(),
            header_value: policy.header_value.clone(),
            header_pattern,
            cookie: policy.cookie.clone(),
            weight: policy.weight,
        })
    } else {
        None
    };

    Some(Shaping {
        host_path: policy.host_path.clone(),
        cookie_name: md5_hex(&policy.host_path),
        service_weight: policy.service_weight.clone(),
        rules,
        legacy,
    })
}

/// A pool from the backend table with its policy compiled for the
/// request path.
#[derive(Debug)]
pub struct BackendView {
    pub backend: Backend,
    pub shaping: Option<Shaping>,
}

impl BackendView {
    pub fn compile(backend: Backend) -> Self {
        let shaping = compile_shaping(&backend.name, &backend.traffic_shaping_policy);
        BackendView { backend, shaping }
    }

    pub fn authorities(&self) -> Vec<String> {
        self.backend.endpoints.iter().map(Endpoint::authority).collect()
    }
}

/// The per-request view of the worker registries.
pub struct Snapshot {
    pub servers: Arc<ServerRegistry>,
    pub backends: Arc<HashMap<String, Arc<BackendView>>>,
    pub balancers: Arc<HashMap<String, Arc<dyn Balancer>>>,
}

impl Snapshot {
    pub fn backend(&self, name: &str) -> Option<&Arc<BackendView>> {
        self.backends.get(name)
    }

    /// The sibling of `name` in its release group. Follows the forward
    /// link when the pool is still published, otherwise the reverse link:
    /// a drained pool leaves the table but its partner still names it.
    pub fn sibling_of(&self, name: &str) -> Option<&Arc<BackendView>> {
        if let Some(view) = self.backends.get(name) {
            if let Some(alternative) = view.backend.alternative_backends.first() {
                return self.backends.get(alternative);
            }
        }
        self.backends
            .values()
            .find(|view| view.backend.alternative_backends.iter().any(|a| a == name))
    }

    /// A pool can serve traffic iff its balancer survived reconciliation
    /// (which evicts empty pools).
    pub fn has_peers(&self, name: &str) -> bool {
        self.balancers.contains_key(name)
    }
}

/// Worker-wide mutable state; swapped by the reconcile tasks, read by
/// every request through [`Snapshot`].
pub struct GatewayState {
    enable_dynamic_servers: bool,
    servers: ArcSwap<ServerRegistry>,
    backends: ArcSwap<HashMap<String, Arc<BackendView>>>,
    balancers: BalancerRegistry,
    /// Raw tables as last fetched, so ExternalName refresh can recompute
    /// views without re-polling the publisher.
    published: Mutex<(Vec<Backend>, Vec<Server>)>,
    /// Last successful DNS expansion per ExternalName pool.
    external_endpoints: Mutex<HashMap<String, Vec<Endpoint>>>,
    ready: AtomicBool,
}

impl GatewayState {
    pub fn new(enable_dynamic_servers: bool) -> Self {
        GatewayState {
            enable_dynamic_servers,
            servers: ArcSwap::from_pointee(ServerRegistry::default()),
            backends: ArcSwap::from_pointee(HashMap::new()),
            balancers: BalancerRegistry::new(),
            published: Mutex::new((Vec::new(), Vec::new())),
            external_endpoints: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
        }
    }

    pub fn dynamic_servers_enabled(&self) -> bool {
        self.enable_dynamic_servers
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            servers: self.servers.load_full(),
            backends: self.backends.load_full(),
            balancers: self.balancers.load(),
        }
    }

    /// Installs freshly fetched tables and reconciles every registry.
    pub fn apply_tables(&self, backends: Vec<Backend>, servers: Vec<Server>) {
        *self.published.lock() = (backends, servers);
        self.rebuild();
        self.ready.store(true, Ordering::Relaxed);
    }

    /// Installs a new DNS expansion for the ExternalName pools.
    pub fn apply_external_endpoints(&self, resolved: HashMap<String, Vec<Endpoint>>) {
        *self.external_endpoints.lock() = resolved;
        self.rebuild();
    }

    /// ExternalName pools and their published (unresolved) endpoints.
    pub fn external_name_pools(&self) -> Vec<(String, Vec<Endpoint>)> {
        let published = self.published.lock();
        published
            .0
            .iter()
            .filter(|b| b.is_external_name())
            .map(|b| (b.name.clone(), b.endpoints.clone()))
            .collect()
    }

    fn rebuild(&self) {
        let (backends, servers) = self.published.lock().clone();
        let external = self.external_endpoints.lock().clone();

        let mut views = HashMap::with_capacity(backends.len());
        for mut backend in backends {
            if backend.is_external_name() {
                if let Some(endpoints) = external.get(&backend.name) {
                    backend.endpoints = endpoints.clone();
                }
            }
            let name = backend.name.clone();
            views.insert(name, Arc::new(BackendView::compile(backend)));
        }

        let views = Arc::new(views);
        self.balancers.reconcile(&views);
        self.backends.store(views);
        self.servers.store(Arc::new(ServerRegistry::build(&servers)));
    }
}
