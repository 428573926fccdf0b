//! Load balancing: the balancer contract, algorithm resolution, and the
//! per-worker registry the reconcile task keeps in step with the backend
//! table.

mod chash;
mod ewma;
mod round_robin;
mod sticky;

pub use chash::{ConsistentHash, ConsistentHashSubset};
pub use ewma::Ewma;
pub use round_robin::RoundRobin;
pub use sticky::Sticky;

use crate::state::{BackendView, RequestInfo};
use arc_swap::ArcSwap;
use shared::tables::Backend;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Context handed to `balance`: the request plus the location that
/// routed it, for cookie scoping and hash variables.
pub struct BalanceContext<'a> {
    pub info: &'a RequestInfo<'a>,
    pub location_path: &'a str,
}

/// The outcome of a balance call: the peer to dial and, for sticky
/// algorithms, a cookie the response should carry.
#[derive(Debug, PartialEq)]
pub struct Pick {
    pub endpoint: String,
    pub set_cookie: Option<String>,
}

impl Pick {
    fn of(endpoint: String) -> Self {
        Pick {
            endpoint,
            set_cookie: None,
        }
    }
}

/// Algorithm tag; equality between a live instance's tag and the freshly
/// resolved one is the hot-swap trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    RoundRobin,
    Chash,
    ChashSubset,
    StickyBalanced,
    StickyPersistent,
    Ewma,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::RoundRobin => "round_robin",
            Kind::Chash => "chash",
            Kind::ChashSubset => "chashsubset",
            Kind::StickyBalanced => "sticky_balanced",
            Kind::StickyPersistent => "sticky_persistent",
            Kind::Ewma => "ewma",
        }
    }
}

/// One load-balancing algorithm bound to one pool.
///
/// Implementations use interior mutability: `balance` runs on the
/// request path, `sync` only from the reconcile task. `sync` must keep
/// whatever per-peer state it can so a table delta does not reset
/// statistics.
pub trait Balancer: Send + Sync {
    fn kind(&self) -> Kind;
    fn sync(&self, view: &BackendView);
    fn balance(&self, ctx: &BalanceContext<'_>) -> Option<Pick>;
    /// Called after the upstream response with the observed round trip.
    fn after_balance(&self, _endpoint: &str, _rtt: Duration) {}
}

/// Resolves which algorithm a pool runs. An explicit `load-balance`
/// value wins; cookie affinity selects a sticky variant by mode; a
/// hash-by key selects consistent hashing, subset when sized.
pub fn resolve_kind(backend: &Backend) -> Kind {
    if let Some(explicit) = backend.load_balance.as_deref() {
        match explicit {
            "round_robin" => return Kind::RoundRobin,
            "chash" => return Kind::Chash,
            "chashsubset" => return Kind::ChashSubset,
            "sticky_balanced" => return Kind::StickyBalanced,
            "sticky_persistent" => return Kind::StickyPersistent,
            "ewma" => return Kind::Ewma,
            unknown => {
                tracing::warn!(backend = %backend.name, %unknown, "unknown load-balance value, using round_robin");
                return Kind::RoundRobin;
            }
        }
    }

    if backend.session_affinity.is_cookie() {
        return if backend.session_affinity.mode == "persistent" {
            Kind::StickyPersistent
        } else {
            Kind::StickyBalanced
        };
    }

    if let Some(hash_by) = &backend.upstream_hash_by {
        if !hash_by.key.is_empty() {
            return if hash_by.subset {
                Kind::ChashSubset
            } else {
                Kind::Chash
            };
        }
    }

    Kind::RoundRobin
}

fn new_balancer(kind: Kind, view: &BackendView) -> Arc<dyn Balancer> {
    match kind {
        Kind::RoundRobin => Arc::new(RoundRobin::new(view)),
        Kind::Chash => Arc::new(ConsistentHash::new(view)),
        Kind::ChashSubset => Arc::new(ConsistentHashSubset::new(view)),
        Kind::StickyBalanced => Arc::new(Sticky::balanced(view)),
        Kind::StickyPersistent => Arc::new(Sticky::persistent(view)),
        Kind::Ewma => Arc::new(Ewma::new(view)),
    }
}

/// Pool name to balancer instance, swapped wholesale on reconcile so the
/// request path reads a plain map.
pub struct BalancerRegistry {
    map: ArcSwap<HashMap<String, Arc<dyn Balancer>>>,
}

impl BalancerRegistry {
    pub fn new() -> Self {
        BalancerRegistry {
            map: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn load(&self) -> Arc<HashMap<String, Arc<dyn Balancer>>> {
        self.map.load_full()
    }

    /// Reconciles instances against the backend views:
    /// an empty pool evicts its balancer; a missing instance is built; a
    /// kind change replaces the instance; anything else syncs in place.
    pub fn reconcile(&self, views: &HashMap<String, Arc<BackendView>>) {
        let current = self.map.load();
        let mut next: HashMap<String, Arc<dyn Balancer>> = HashMap::with_capacity(views.len());

        for (name, view) in views {
            if view.backend.endpoints.is_empty() {
                if current.contains_key(name) {
                    tracing::debug!(backend = %name, "evicting balancer for drained pool");
                }
                continue;
            }

            let kind = resolve_kind(&view.backend);
            let instance = match current.get(name) {
                Some(existing) if existing.kind() == kind => {
                    existing.sync(view);
                    existing.clone()
                }
                existing => {
                    if existing.is_some() {
                        tracing::debug!(backend = %name, kind = kind.as_str(), "replacing balancer");
                    }
                    new_balancer(kind, view)
                }
            };
            next.insert(name.clone(), instance);
        }

        self.map.store(Arc::new(next));
    }
}

impl Default for BalancerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use shared::tables::Endpoint;

    pub fn view(name: &str, addrs: &[&str]) -> Arc<BackendView> {
        Arc::new(view_of(backend(name, addrs)))
    }

    pub fn backend(name: &str, addrs: &[&str]) -> Backend {
        Backend {
            name: name.into(),
            endpoints: addrs
                .iter()
                .map(|a| {
                    let (address, port) = a.rsplit_once(':').unwrap();
                    Endpoint {
                        address: address.into(),
                        port: port.into(),
                    }
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn view_of(backend: Backend) -> BackendView {
        BackendView::compile(backend)
    }

    pub fn ctx_parts() -> (http::Uri, http::HeaderMap) {
        ("/".parse().unwrap(), http::HeaderMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use shared::tables::{
        CookieSessionAffinity, SessionAffinityConfig, UpstreamHashByConfig,
    };

    #[test]
    fn kind_resolution_precedence() {
        // Explicit value wins over everything else.
        let mut b = backend("a", &[]);
        b.load_balance = Some("ewma".into());
        b.session_affinity = SessionAffinityConfig {
            name: "cookie".into(),
            ..Default::default()
        };
        assert_eq!(resolve_kind(&b), Kind::Ewma);

        // Cookie affinity next, variant by mode.
        let mut b = backend("a", &[]);
        b.session_affinity = SessionAffinityConfig {
            name: "cookie".into(),
            mode: "persistent".into(),
            cookie: CookieSessionAffinity::default(),
        };
        assert_eq!(resolve_kind(&b), Kind::StickyPersistent);
        b.session_affinity.mode = String::new();
        assert_eq!(resolve_kind(&b), Kind::StickyBalanced);

        // Then hash-by, subset when sized.
        let mut b = backend("a", &[]);
        b.upstream_hash_by = Some(UpstreamHashByConfig {
            key: "$request_uri".into(),
            subset: false,
            subset_size: 0,
        });
        assert_eq!(resolve_kind(&b), Kind::Chash);
        b.upstream_hash_by.as_mut().unwrap().subset = true;
        assert_eq!(resolve_kind(&b), Kind::ChashSubset);

        // Default.
        assert_eq!(resolve_kind(&backend("a", &[])), Kind::RoundRobin);

        // Unknown explicit value degrades to round robin.
        let mut b = backend("a", &[]);
        b.load_balance = Some("least_conn".into());
        assert_eq!(resolve_kind(&b), Kind::RoundRobin);
    }

    #[test]
    fn reconcile_creates_evicts_and_replaces() {
        let registry = BalancerRegistry::new();

        let mut views = HashMap::new();
        views.insert("a".to_string(), view("a", &["10.0.0.1:80"]));
        registry.reconcile(&views);
        assert!(registry.load().contains_key("a"));
        assert_eq!(registry.load()["a"].kind(), Kind::RoundRobin);

        // Drained pool: evicted.
        views.insert("a".to_string(), view("a", &[]));
        registry.reconcile(&views);
        assert!(registry.load().is_empty());

        // Back with a different algorithm: fresh instance of that kind.
        let mut b = backend("a", &["10.0.0.1:80"]);
        b.load_balance = Some("ewma".into());
        views.insert("a".to_string(), Arc::new(view_of(b)));
        registry.reconcile(&views);
        assert_eq!(registry.load()["a"].kind(), Kind::Ewma);
    }

    #[test]
    fn reconcile_keeps_instance_across_sync() {
        let registry = BalancerRegistry::new();
        let mut views = HashMap::new();
        views.insert("a".to_string(), view("a", &["10.0.0.1:80"]));
        registry.reconcile(&views);
        let before = Arc::as_ptr(&registry.load()["a"]);

        views.insert(
            "a".to_string(),
            view("a", &["10.0.0.1:80", "10.0.0.2:80"]),
        );
        registry.reconcile(&views);
        let after = Arc::as_ptr(&registry.load()["a"]);
        // Same instance, synced in place.
        assert_eq!(before, after);
    }
}
