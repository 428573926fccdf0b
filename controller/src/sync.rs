//! Table builder: turns a cluster snapshot into the backend and server
//! tables the publisher hands to the workers.

use crate::annotations::Annotations;
use crate::ingress::{ClusterSnapshot, Ingress};
use crate::release;
use crate::upstreams::{self, upstream_name};
use shared::resolve::Resolver;
use shared::tables::{
    Backend, BackendRef, Endpoint, Location, Redirect, Rewrite, Server, Service, ServiceSpec,
    ServiceType, Whitelist,
};
use std::collections::HashMap;
use std::net::Ipv6Addr;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tables {
    pub backends: Vec<Backend>,
    pub servers: Vec<Server>,
}

/// Hostname used when an ingress rule carries no host.
const DEFAULT_SERVER: &str = "_";

fn normalize_address(address: &str) -> String {
    // Snapshot addresses arrive unbracketed; the published table brackets
    // IPv6 so address and port join unambiguously.
    match address.parse::<Ipv6Addr>() {
        Ok(v6) => format!("[{v6}]"),
        Err(_) => address.to_string(),
    }
}

struct Builder<'a> {
    snapshot: &'a ClusterSnapshot,
    upstreams: HashMap<String, Backend>,
    /// Backend name to the (external host, port) still needing DNS.
    pending_dns: HashMap<String, (String, String)>,
    servers: Vec<Server>,
    server_index: HashMap<String, usize>,
    /// `(host, path)` to the pool owning that location (first-seen wins).
    location_owner: HashMap<(String, String), String>,
}

impl<'a> Builder<'a> {
    fn new(snapshot: &'a ClusterSnapshot) -> Self {
        Builder {
            snapshot,
            upstreams: HashMap::new(),
            pending_dns: HashMap::new(),
            servers: Vec::new(),
            server_index: HashMap::new(),
            location_owner: HashMap::new(),
        }
    }

    fn server_slot(&mut self, hostname: &str) -> usize {
        if let Some(&index) = self.server_index.get(hostname) {
            return index;
        }
        self.servers.push(Server {
            hostname: hostname.to_string(),
            ..Default::default()
        });
        let index = self.servers.len() - 1;
        self.server_index.insert(hostname.to_string(), index);
        index
    }

    fn server_mut(&mut self, hostname: &str) -> &mut Server {
        let index = self.server_slot(hostname);
        &mut self.servers[index]
    }

    fn ensure_upstream(
        &mut self,
        ingress: &Ingress,
        annotations: &Annotations,
        service_name: &str,
        port: &str,
    ) -> Option<String> {
        let namespace = &ingress.metadata.namespace;
        let name = upstream_name(namespace, service_name, port);
        if self.upstreams.contains_key(&name) {
            return Some(name);
        }

        let Some(entry) = self.snapshot.service(namespace, service_name) else {
            tracing::warn!(
                ingress = %format!("{namespace}/{}", ingress.metadata.name),
                service = %service_name,
                "service not found in snapshot, skipping upstream"
            );
            return None;
        };

        let mut backend = Backend {
            name: name.clone(),
            service: Service {
                spec: ServiceSpec {
                    service_type: entry.service_type,
                },
            },
            load_balance: annotations.load_balance.clone(),
            upstream_hash_by: annotations.upstream_hash_by.clone(),
            ..Default::default()
        };

        if entry.service_type == ServiceType::ExternalName {
            self.pending_dns
                .insert(name.clone(), (entry.external_name.clone(), port.to_string()));
        } else {
            backend.endpoints = entry
                .addresses
                .iter()
                .map(|address| Endpoint {
                    address: normalize_address(address),
                    port: port.to_string(),
                })
                .collect();
        }

        if let Some(affinity) = &annotations.session_affinity {
            backend.session_affinity = affinity.clone();
        }

        self.upstreams.insert(name.clone(), backend);
        Some(name)
    }

    fn add_ingress(&mut self, ingress: &Ingress, annotations: &Annotations) {
        for rule in &ingress.rules {
            let host = if rule.host.is_empty() {
                DEFAULT_SERVER
            } else {
                rule.host.as_str()
            };

            for alias in &annotations.aliases {
                let server = self.server_mut(host);
                if !server.aliases.contains(alias) {
                    server.aliases.push(alias.clone());
                }
            }

            for path in &rule.paths {
                let Some(name) = self.ensure_upstream(
                    ingress,
                    annotations,
                    &path.backend.service_name,
                    &path.backend.service_port,
                ) else {
                    continue;
                };

                let host_path = format!("{host}{}", path.path);
                if annotations.is_release() {
                    if let Some(backend) = self.upstreams.get_mut(&name) {
                        release::configure_release_policy(backend, ingress, annotations, &host_path);
                    }
                }

                if let Some(affinity_backend) = self.upstreams.get_mut(&name) {
                    if affinity_backend.session_affinity.is_cookie() {
                        let paths = affinity_backend
                            .session_affinity
                            .cookie
                            .locations
                            .entry(host.to_string())
                            .or_default();
                        if !paths.contains(&path.path) {
                            paths.push(path.path.clone());
                        }
                    }
                }

                let location_key = (host.to_string(), path.path.clone());
                if self.location_owner.contains_key(&location_key) {
                    // Release siblings share the path; the first-seen pool
                    // owns the location and the rest are reached through
                    // alternativeBackends.
                    continue;
                }
                self.location_owner.insert(location_key, name.clone());

                let location = Location {
                    path: path.path.clone(),
                    backend: name.clone(),
                    backend_ref: BackendRef {
                        namespace: ingress.metadata.namespace.clone(),
                        ingress_name: ingress.metadata.name.clone(),
                        service_name: path.backend.service_name.clone(),
                        service_port: path.backend.service_port.clone(),
                    },
                    whitelist: (!annotations.whitelist.is_empty()).then(|| Whitelist {
                        cidr: annotations.whitelist.iter().map(|n| n.to_string()).collect(),
                    }),
                    redirect: annotations.redirect.as_ref().map(|r| Redirect {
                        url: r.url.clone(),
                        code: r.code,
                    }),
                    rewrite: Rewrite {
                        target: annotations.rewrite_target.clone(),
                        app_root: annotations.app_root.clone(),
                        ssl_redirect: annotations.ssl_redirect,
                        force_ssl_redirect: annotations.force_ssl_redirect,
                    },
                };
                self.server_mut(host).locations.push(location);
            }
        }
    }

    /// Merges a legacy canary ingress: its pool becomes the alternative of
    /// whichever pool owns the same (host, path) location, and the owner
    /// inherits the canary header/cookie/weight policy.
    fn merge_canary(&mut self, ingress: &Ingress, annotations: &Annotations) {
        for rule in &ingress.rules {
            let host = if rule.host.is_empty() {
                DEFAULT_SERVER
            } else {
                rule.host.as_str()
            };

            for path in &rule.paths {
                let Some(canary_name) = self.ensure_upstream(
                    ingress,
                    annotations,
                    &path.backend.service_name,
                    &path.backend.service_port,
                ) else {
                    continue;
                };

                let owner = self
                    .location_owner
                    .get(&(host.to_string(), path.path.clone()))
                    .cloned();
                let Some(primary_name) = owner else {
                    tracing::warn!(
                        host,
                        path = %path.path,
                        "canary ingress has no primary location, skipping"
                    );
                    continue;
                };
                if primary_name == canary_name {
                    continue;
                }

                if let Some(primary) = self.upstreams.get_mut(&primary_name) {
                    if !primary.alternative_backends.contains(&canary_name) {
                        primary.alternative_backends.push(canary_name.clone());
                    }
                    let canary = &annotations.canary;
                    let policy = &mut primary.traffic_shaping_policy;
                    policy.header = canary.header.clone();
                    policy.header_value = canary.header_value.clone();
                    policy.header_pattern = canary.header_pattern.clone();
                    policy.cookie = canary.cookie.clone();
                    policy.weight = canary.weight;
                }
            }
        }
    }

    async fn finish(mut self, release_ingresses: &[&Ingress], resolver: &dyn Resolver) -> Tables {
        release::link_alternative_backends(release_ingresses, &mut self.upstreams);

        for (name, (external_name, port)) in &self.pending_dns {
            let endpoints =
                upstreams::resolve_external_name(resolver, external_name, port).await;
            if let Some(backend) = self.upstreams.get_mut(name) {
                backend.endpoints = endpoints;
            }
        }

        // Drained pools leave the table; dangling names in release links
        // read as "no live peers" on the worker side.
        let mut backends: Vec<Backend> = self
            .upstreams
            .into_values()
            .filter(|backend| !backend.endpoints.is_empty())
            .collect();
        backends.sort_by(|a, b| a.name.cmp(&b.name));

        let mut servers = self.servers;
        servers.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        Tables { backends, servers }
    }
}

/// Builds both tables from the snapshot. Per-ingress annotation problems
/// degrade only the feature involved; the sync itself never fails.
pub async fn build_tables(snapshot: &ClusterSnapshot, resolver: &dyn Resolver) -> Tables {
    let mut builder = Builder::new(snapshot);

    let parsed: Vec<(usize, Annotations)> = snapshot
        .ingresses
        .iter()
        .enumerate()
        .map(|(i, ing)| (i, Annotations::parse(ing)))
        .collect();

    for (i, annotations) in &parsed {
        if !annotations.canary.enabled {
            builder.add_ingress(&snapshot.ingresses[*i], annotations);
        }
    }
    // Canary pools merge after every primary location exists.
    for (i, annotations) in &parsed {
        if annotations.canary.enabled {
            builder.merge_canary(&snapshot.ingresses[*i], annotations);
        }
    }

    let release_ingresses: Vec<&Ingress> = parsed
        .iter()
        .filter(|(_, annotations)| annotations.is_release())
        .map(|(i, _)| &snapshot.ingresses[*i])
        .collect();

    builder.finish(&release_ingresses, resolver).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::ClusterSnapshot;
    use async_trait::async_trait;
    use std::net::IpAddr;

    struct NullResolver;

    #[async_trait]
    impl Resolver for NullResolver {
        async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
            match host {
                "db.external.example" => Ok(vec!["192.0.2.10".parse().unwrap()]),
                _ => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "nx")),
            }
        }
    }

    fn snapshot(yaml: &str) -> ClusterSnapshot {
        serde_yaml::from_str(yaml).unwrap()
    }

    const RELEASE_SNAPSHOT: &str = r#"
ingresses:
  - metadata:
      namespace: default
      name: bg50
      annotations:
        nginx.ingress.kubernetes.io/service-weight: "old: 50, new: 50"
    rules:
      - host: bg50.release.com
        paths:
          - path: /
            backend: { serviceName: old, servicePort: "80" }
          - path: /
            backend: { serviceName: new, servicePort: "80" }
services:
  default/old:
    addresses: ["10.0.0.1", "10.0.0.2"]
  default/new:
    addresses: ["10.0.1.1"]
"#;

    #[tokio::test]
    async fn release_group_builds_linked_pools() {
        let tables = build_tables(&snapshot(RELEASE_SNAPSHOT), &NullResolver).await;

        assert_eq!(tables.backends.len(), 2);
        let new = tables.backends.iter().find(|b| b.name == "default-new-80").unwrap();
        let old = tables.backends.iter().find(|b| b.name == "default-old-80").unwrap();
        assert_eq!(new.alternative_backends, vec!["default-old-80"]);
        assert_eq!(old.alternative_backends, vec!["default-new-80"]);
        assert_eq!(old.endpoints.len(), 2);

        // Both carry the shaping policy keyed by canonical names.
        assert_eq!(old.traffic_shaping_policy.host_path, "bg50.release.com/");
        assert_eq!(old.traffic_shaping_policy.service_weight["default-new-80"], 50);

        // One location, owned by the first-seen pool.
        assert_eq!(tables.servers.len(), 1);
        let server = &tables.servers[0];
        assert_eq!(server.hostname, "bg50.release.com");
        assert_eq!(server.locations.len(), 1);
        assert_eq!(server.locations[0].backend, "default-old-80");
        assert_eq!(server.locations[0].backend_ref.service_name, "old");
    }

    #[tokio::test]
    async fn drained_pool_leaves_the_table() {
        const DRAINED: &str = r#"
ingresses:
  - metadata:
      namespace: default
      name: bg
      annotations:
        nginx.ingress.kubernetes.io/service-weight: "old: 50, tomcat: 50"
    rules:
      - host: bg.endpoint.release.com
        paths:
          - path: /
            backend: { serviceName: old, servicePort: "80" }
          - path: /
            backend: { serviceName: tomcat, servicePort: "8080" }
services:
  default/old:
    addresses: []
  default/tomcat:
    addresses: ["10.0.2.1"]
"#;
        let tables = build_tables(&snapshot(DRAINED), &NullResolver).await;

        assert_eq!(tables.backends.len(), 1);
        let tomcat = &tables.backends[0];
        assert_eq!(tomcat.name, "default-tomcat-8080");
        // The link still names the drained sibling; workers treat the
        // dangling name as an empty pool.
        assert_eq!(tomcat.alternative_backends, vec!["default-old-80"]);
        // The location still points at the drained pool.
        assert_eq!(tables.servers[0].locations[0].backend, "default-old-80");
    }

    #[tokio::test]
    async fn external_name_is_resolved() {
        const EXTERNAL: &str = r#"
ingresses:
  - metadata:
      namespace: prod
      name: db
    rules:
      - host: db.bar.com
        paths:
          - path: /
            backend: { serviceName: db, servicePort: "5432" }
services:
  prod/db:
    service_type: ExternalName
    external_name: db.external.example
"#;
        let tables = build_tables(&snapshot(EXTERNAL), &NullResolver).await;
        assert_eq!(tables.backends.len(), 1);
        let backend = &tables.backends[0];
        assert!(backend.is_external_name());
        assert_eq!(backend.endpoints[0].address, "192.0.2.10");
        assert_eq!(backend.endpoints[0].port, "5432");
    }

    #[tokio::test]
    async fn dns_failure_drops_the_pool() {
        const EXTERNAL: &str = r#"
ingresses:
  - metadata:
      namespace: prod
      name: gone
    rules:
      - host: gone.bar.com
        paths:
          - path: /
            backend: { serviceName: gone, servicePort: "80" }
services:
  prod/gone:
    service_type: ExternalName
    external_name: gone.external.example
"#;
        let tables = build_tables(&snapshot(EXTERNAL), &NullResolver).await;
        assert!(tables.backends.is_empty());
        // The server table still routes the host; requests meet an empty
        // pool and fail over at the worker.
        assert_eq!(tables.servers.len(), 1);
    }

    #[tokio::test]
    async fn canary_ingress_merges_into_primary() {
        const CANARY: &str = r#"
ingresses:
  - metadata:
      namespace: default
      name: main
    rules:
      - host: canary.bar.com
        paths:
          - path: /
            backend: { serviceName: main, servicePort: "80" }
  - metadata:
      namespace: default
      name: main-canary
      annotations:
        nginx.ingress.kubernetes.io/canary: "true"
        nginx.ingress.kubernetes.io/canary-by-header: "X-Canary"
        nginx.ingress.kubernetes.io/canary-by-header-value: "on"
        nginx.ingress.kubernetes.io/canary-weight: "10"
    rules:
      - host: canary.bar.com
        paths:
          - path: /
            backend: { serviceName: main-canary, servicePort: "80" }
services:
  default/main:
    addresses: ["10.0.0.1"]
  default/main-canary:
    addresses: ["10.0.0.9"]
"#;
        let tables = build_tables(&snapshot(CANARY), &NullResolver).await;

        let primary = tables.backends.iter().find(|b| b.name == "default-main-80").unwrap();
        assert_eq!(primary.alternative_backends, vec!["default-main-canary-80"]);
        let policy = &primary.traffic_shaping_policy;
        assert_eq!(policy.header, "X-Canary");
        assert_eq!(policy.header_value, "on");
        assert_eq!(policy.weight, 10);
        assert!(policy.host_path.is_empty());
        assert!(!policy.is_release());

        // The canary pool never owns a location.
        assert_eq!(tables.servers[0].locations.len(), 1);
        assert_eq!(tables.servers[0].locations[0].backend, "default-main-80");
    }

    #[tokio::test]
    async fn location_policy_from_annotations() {
        const POLICY: &str = r#"
ingresses:
  - metadata:
      namespace: default
      name: rewrite
      annotations:
        nginx.ingress.kubernetes.io/rewrite-target: "/$1"
        nginx.ingress.kubernetes.io/whitelist-source-range: "100.100.100.0/24,127.0.0.1"
    rules:
      - host: rewrite.bar.com
        paths:
          - path: /nginx/?(.*)
            backend: { serviceName: old, servicePort: "80" }
services:
  default/old:
    addresses: ["10.0.0.1"]
"#;
        let tables = build_tables(&snapshot(POLICY), &NullResolver).await;
        let location = &tables.servers[0].locations[0];
        assert_eq!(location.rewrite.target, "/$1");
        let whitelist = location.whitelist.as_ref().unwrap();
        assert_eq!(whitelist.cidr, vec!["100.100.100.0/24", "127.0.0.1/32"]);
    }
}
