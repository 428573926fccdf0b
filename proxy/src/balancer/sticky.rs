//! Cookie session affinity. The affinity cookie carries a hash of the
//! chosen peer; requests presenting it keep landing on that peer.

use super::{BalanceContext, Balancer, Kind, Pick, RoundRobin};
use crate::state::{BackendView, md5_hex};
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn sha1_hex(input: &str) -> String {
    Sha1::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum PeerHash {
    Md5,
    Sha1,
}

impl PeerHash {
    fn digest(&self, input: &str) -> String {
        match self {
            PeerHash::Md5 => md5_hex(input),
            PeerHash::Sha1 => sha1_hex(input),
        }
    }
}

struct Config {
    cookie_name: String,
    hash: PeerHash,
    max_age: String,
    expires: String,
    /// Hostname to the paths the cookie applies to; empty means every
    /// location served by the pool.
    locations: HashMap<String, Vec<String>>,
}

impl Config {
    fn from_view(view: &BackendView) -> Self {
        let cookie = &view.backend.session_affinity.cookie;
        let hash = match cookie.hash.as_str() {
            "sha1" => PeerHash::Sha1,
            _ => PeerHash::Md5,
        };
        Config {
            cookie_name: if cookie.name.is_empty() {
                "route".to_string()
            } else {
                cookie.name.clone()
            },
            hash,
            max_age: cookie.max_age.clone(),
            expires: cookie.expires.clone(),
            locations: cookie.locations.clone(),
        }
    }

    fn applies_to(&self, host: &str, location_path: &str) -> bool {
        if self.locations.is_empty() {
            return true;
        }
        self.locations
            .get(host)
            .map(|paths| paths.iter().any(|p| p == location_path || p == "*"))
            .unwrap_or(false)
    }

    fn cookie_header(&self, digest: &str, ctx: &BalanceContext<'_>) -> String {
        let mut header = format!("{}={digest}; Path={}", self.cookie_name, ctx.location_path);
        if !self.max_age.is_empty() {
            header.push_str(&format!("; Max-Age={}", self.max_age));
        } else if !self.expires.is_empty() {
            header.push_str(&format!("; Max-Age={}", self.expires));
        }
        if ctx.info.tls {
            header.push_str("; Secure");
        }
        header.push_str("; HttpOnly");
        header
    }
}

/// Both sticky variants. `balanced` falls back to the inner balancer and
/// re-pins when the cookie's peer left the table; `persistent` honours
/// the pinned peer for as long as the table knows it, only re-pinning
/// when the peer is gone entirely.
pub struct Sticky {
    persistent: bool,
    config: RwLock<Config>,
    /// digest -> authority for the current peer set.
    peers: RwLock<HashMap<String, String>>,
    inner: Arc<dyn Balancer>,
}

impl Sticky {
    pub fn balanced(view: &BackendView) -> Self {
        Self::build(view, false, Arc::new(RoundRobin::new(view)))
    }

    pub fn persistent(view: &BackendView) -> Self {
        Self::build(view, true, Arc::new(RoundRobin::new(view)))
    }

    /// The fallback algorithm is pluggable; round robin is the default,
    /// ewma the other supported choice.
    pub fn with_inner(view: &BackendView, persistent: bool, inner: Arc<dyn Balancer>) -> Self {
        Self::build(view, persistent, inner)
    }

    fn build(view: &BackendView, persistent: bool, inner: Arc<dyn Balancer>) -> Self {
        let config = Config::from_view(view);
        let peers = Self::digest_peers(&config, view);
        Sticky {
            persistent,
            config: RwLock::new(config),
            peers: RwLock::new(peers),
            inner,
        }
    }

    fn digest_peers(config: &Config, view: &BackendView) -> HashMap<String, String> {
        view.authorities()
            .into_iter()
            .map(|authority| (config.hash.digest(&authority), authority))
            .collect()
    }
}

impl Balancer for Sticky {
    fn kind(&self) -> Kind {
        if self.persistent {
            Kind::StickyPersistent
        } else {
            Kind::StickyBalanced
        }
    }

    fn sync(&self, view: &BackendView) {
        let config = Config::from_view(view);
        *self.peers.write() = Self::digest_peers(&config, view);
        *self.config.write() = config;
        self.inner.sync(view);
    }

    fn balance(&self, ctx: &BalanceContext<'_>) -> Option<Pick> {
        let config = self.config.read();
        let peers = self.peers.read();

        if let Some(digest) = ctx.info.cookie(&config.cookie_name) {
            if let Some(authority) = peers.get(&digest) {
                return Some(Pick::of(authority.clone()));
            }
            // Pinned peer is gone from the table; re-pin below.
        }

        let fallback = self.inner.balance(ctx)?;
        let set_cookie = config.applies_to(&ctx.info.host, ctx.location_path).then(|| {
            config.cookie_header(&config.hash.digest(&fallback.endpoint), ctx)
        });
        Some(Pick {
            endpoint: fallback.endpoint,
            set_cookie,
        })
    }

    fn after_balance(&self, endpoint: &str, rtt: Duration) {
        self.inner.after_balance(endpoint, rtt);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::state::RequestInfo;
    use shared::tables::{Backend, CookieSessionAffinity, SessionAffinityConfig};

    fn sticky_backend(addrs: &[&str]) -> Backend {
        let mut b = backend("a", addrs);
        b.session_affinity = SessionAffinityConfig {
            name: "cookie".into(),
            mode: String::new(),
            cookie: CookieSessionAffinity {
                name: "route".into(),
                hash: "md5".into(),
                max_age: "3600".into(),
                ..Default::default()
            },
        };
        b
    }

    #[test]
    fn pins_to_cookie_peer() {
        let view = view_of(sticky_backend(&["10.0.0.1:80", "10.0.0.2:80"]));
        let sticky = Sticky::balanced(&view);
        let digest = md5_hex("10.0.0.2:80");

        let uri: http::Uri = "/".parse().unwrap();
        let mut headers = http::HeaderMap::new();
        headers.insert("cookie", format!("route={digest}").parse().unwrap());
        let info = RequestInfo::new(&uri, &headers, "127.0.0.1:1".parse().unwrap());
        let ctx = BalanceContext {
            info: &info,
            location_path: "/",
        };

        for _ in 0..5 {
            let pick = sticky.balance(&ctx).unwrap();
            assert_eq!(pick.endpoint, "10.0.0.2:80");
            assert!(pick.set_cookie.is_none());
        }
    }

    #[test]
    fn absent_cookie_falls_back_and_pins() {
        let view = view_of(sticky_backend(&["10.0.0.1:80"]));
        let sticky = Sticky::balanced(&view);

        let (uri, headers) = ctx_parts();
        let info = RequestInfo::new(&uri, &headers, "127.0.0.1:1".parse().unwrap());
        let pick = sticky
            .balance(&BalanceContext {
                info: &info,
                location_path: "/app",
            })
            .unwrap();

        assert_eq!(pick.endpoint, "10.0.0.1:80");
        let cookie = pick.set_cookie.unwrap();
        assert!(cookie.starts_with(&format!("route={}", md5_hex("10.0.0.1:80"))));
        assert!(cookie.contains("Path=/app"));
        assert!(cookie.contains("Max-Age=3600"));
        assert!(cookie.contains("HttpOnly"));
        assert!(!cookie.contains("Secure"));
    }

    #[test]
    fn gone_peer_repins() {
        let view = view_of(sticky_backend(&["10.0.0.1:80", "10.0.0.2:80"]));
        let sticky = Sticky::persistent(&view);
        let stale_digest = md5_hex("10.0.0.2:80");

        // The pinned peer leaves the table.
        sticky.sync(&view_of(sticky_backend(&["10.0.0.1:80"])));

        let uri: http::Uri = "/".parse().unwrap();
        let mut headers = http::HeaderMap::new();
        headers.insert("cookie", format!("route={stale_digest}").parse().unwrap());
        let info = RequestInfo::new(&uri, &headers, "127.0.0.1:1".parse().unwrap());
        let pick = sticky
            .balance(&BalanceContext {
                info: &info,
                location_path: "/",
            })
            .unwrap();

        assert_eq!(pick.endpoint, "10.0.0.1:80");
        assert!(pick.set_cookie.is_some());
    }

    #[test]
    fn sha1_hash_variant() {
        let mut b = sticky_backend(&["10.0.0.1:80"]);
        b.session_affinity.cookie.hash = "sha1".into();
        let sticky = Sticky::balanced(&view_of(b));

        let (uri, headers) = ctx_parts();
        let info = RequestInfo::new(&uri, &headers, "127.0.0.1:1".parse().unwrap());
        let pick = sticky
            .balance(&BalanceContext {
                info: &info,
                location_path: "/",
            })
            .unwrap();
        assert!(
            pick.set_cookie
                .unwrap()
                .starts_with(&format!("route={}", sha1_hex("10.0.0.1:80")))
        );
    }

    #[test]
    fn scoped_locations_gate_the_cookie() {
        let mut b = sticky_backend(&["10.0.0.1:80"]);
        b.session_affinity.cookie.locations =
            HashMap::from([("app.bar.com".to_string(), vec!["/app".to_string()])]);
        let sticky = Sticky::balanced(&view_of(b));

        let uri: http::Uri = "/".parse().unwrap();
        let mut headers = http::HeaderMap::new();
        headers.insert("host", "other.bar.com".parse().unwrap());
        let info = RequestInfo::new(&uri, &headers, "127.0.0.1:1".parse().unwrap());
        let pick = sticky
            .balance(&BalanceContext {
                info: &info,
                location_path: "/",
            })
            .unwrap();
        // Out of scope: route, but do not pin.
        assert!(pick.set_cookie.is_none());
    }
}
