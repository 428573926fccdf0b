//! The per-worker virtual-host registry, rebuilt wholesale on each
//! reconciliation.

use ipnetwork::Ipv4Network;
use moka::sync::Cache;
use regex::Regex;
use shared::tables::{Location, Server};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Verdicts for (location, client IP) pairs; the registry is replaced on
/// reload, so entries never outlive the CIDR lists they were computed
/// from.
const WHITELIST_CACHE_SIZE: u64 = 2048;

pub struct CompiledLocation {
    pub location: Location,
    /// Anchored location pattern; `None` when the path does not compile
    /// as a regex, in which case plain prefix matching applies.
    pub path_regex: Option<Regex>,
    pub whitelist: Vec<Ipv4Network>,
    /// Registry-unique id keying the whitelist verdict cache.
    id: usize,
}

impl CompiledLocation {
    fn compile(location: Location, id: usize) -> Self {
        let path_regex = match Regex::new(&format!("^(?:{})", location.path)) {
            Ok(re) => Some(re),
            Err(err) => {
                tracing::warn!(path = %location.path, error = %err, "location path is not a valid regex, using prefix match");
                None
            }
        };

        let whitelist = location
            .whitelist
            .as_ref()
            .map(|w| {
                w.cidr
                    .iter()
                    .filter_map(|cidr| match cidr.parse() {
                        Ok(network) => Some(network),
                        Err(err) => {
                            tracing::warn!(%cidr, error = %err, "dropping unparseable whitelist entry");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        CompiledLocation {
            location,
            path_regex,
            whitelist,
            id,
        }
    }

    /// Length of the regex match when this location claims the URI.
    pub fn match_len(&self, uri_path: &str) -> Option<usize> {
        match &self.path_regex {
            Some(re) => re.find(uri_path).map(|m| m.len()),
            None => uri_path
                .starts_with(&self.location.path)
                .then(|| self.location.path.len()),
        }
    }
}

pub struct VirtualHost {
    pub hostname: String,
    /// Insertion order is the tie-break order for path selection.
    pub locations: Vec<CompiledLocation>,
}

/// Hostname (literal, alias, or wildcard literal) to its location set.
#[derive(Default)]
pub struct ServerRegistry {
    hosts: HashMap<String, Arc<VirtualHost>>,
    whitelist_verdicts: Option<Cache<(usize, IpAddr), bool>>,
}

impl ServerRegistry {
    pub fn build(servers: &[Server]) -> Self {
        let mut hosts = HashMap::new();
        let mut next_id = 0;

        for server in servers {
            let locations = server
                .locations
                .iter()
                .map(|location| {
                    let compiled = CompiledLocation::compile(location.clone(), next_id);
                    next_id += 1;
                    compiled
                })
                .collect();

            let vhost = Arc::new(VirtualHost {
                hostname: server.hostname.clone(),
                locations,
            });

            hosts.insert(server.hostname.clone(), vhost.clone());
            for alias in &server.aliases {
                hosts.entry(alias.clone()).or_insert_with(|| vhost.clone());
            }
        }

        ServerRegistry {
            hosts,
            whitelist_verdicts: Some(
                Cache::builder().max_capacity(WHITELIST_CACHE_SIZE).build(),
            ),
        }
    }

    /// Exact hostname first; on a miss the first label collapses to `*`
    /// and the wildcard entry is tried once.
    pub fn lookup(&self, host: &str) -> Option<&Arc<VirtualHost>> {
        if let Some(vhost) = self.hosts.get(host) {
            return Some(vhost);
        }
        let (_, rest) = host.split_once('.')?;
        self.hosts.get(&format!("*.{rest}"))
    }

    /// Whitelist verdict for a location, memoised per client IP.
    pub fn ip_allowed(&self, location: &CompiledLocation, ip: IpAddr) -> bool {
        if location.whitelist.is_empty() {
            return true;
        }

        let test = |ip: IpAddr| match ip {
            IpAddr::V4(v4) => location.whitelist.iter().any(|n| n.contains(v4)),
            // IPv4-only whitelists cannot admit a v6 caller.
            IpAddr::V6(_) => false,
        };

        match &self.whitelist_verdicts {
            Some(cache) => cache.get_with((location.id, ip), || test(ip)),
            None => test(ip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::tables::Whitelist;

    fn server(hostname: &str, aliases: &[&str], paths: &[&str]) -> Server {
        Server {
            hostname: hostname.into(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            locations: paths
                .iter()
                .map(|p| Location {
                    path: p.to_string(),
                    backend: format!("backend{p}"),
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn literal_beats_wildcard() {
        let registry = ServerRegistry::build(&[
            server("*.bar.com", &[], &["/"]),
            server("wc.bar.com", &[], &["/special"]),
        ]);

        assert_eq!(registry.lookup("wc.bar.com").unwrap().hostname, "wc.bar.com");
        assert_eq!(registry.lookup("other.bar.com").unwrap().hostname, "*.bar.com");
        assert!(registry.lookup("bar.com").is_none());
        assert!(registry.lookup("deep.sub.bar.com").is_none());
    }

    #[test]
    fn aliases_share_the_location_set() {
        let registry = ServerRegistry::build(&[server(
            "main.example.com",
            &["alias.example.com"],
            &["/"],
        )]);
        let by_alias = registry.lookup("alias.example.com").unwrap();
        assert_eq!(by_alias.hostname, "main.example.com");
    }

    #[test]
    fn regex_location_match_lengths() {
        let registry = ServerRegistry::build(&[server("rewrite.bar.com", &[], &["/nginx/?(.*)"])]);
        let vhost = registry.lookup("rewrite.bar.com").unwrap();
        let location = &vhost.locations[0];

        assert_eq!(location.match_len("/nginx"), Some(6));
        assert_eq!(location.match_len("/nginx/admin"), Some(12));
        assert_eq!(location.match_len("/other"), None);
    }

    #[test]
    fn whitelist_verdicts() {
        let mut srv = server("ipw.bar.com", &[], &["/"]);
        srv.locations[0].whitelist = Some(Whitelist {
            cidr: vec!["100.100.100.0/24".into(), "127.0.0.1/32".into()],
        });
        let registry = ServerRegistry::build(&[srv]);
        let location = &registry.lookup("ipw.bar.com").unwrap().locations[0];

        assert!(registry.ip_allowed(location, "100.100.100.9".parse().unwrap()));
        assert!(registry.ip_allowed(location, "127.0.0.1".parse().unwrap()));
        assert!(!registry.ip_allowed(location, "203.0.113.7".parse().unwrap()));
        // Cached verdict agrees.
        assert!(!registry.ip_allowed(location, "203.0.113.7".parse().unwrap()));
        // v6 callers never pass an IPv4 whitelist.
        assert!(!registry.ip_allowed(location, "2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn empty_whitelist_admits_everyone() {
        let registry = ServerRegistry::build(&[server("open.bar.com", &[], &["/"])]);
        let location = &registry.lookup("open.bar.com").unwrap().locations[0];
        assert!(registry.ip_allowed(location, "203.0.113.7".parse().unwrap()));
    }
}
