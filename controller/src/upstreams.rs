//! Canonical upstream naming and `ExternalName` endpoint resolution.

use shared::resolve::Resolver;
use shared::tables::Endpoint;

/// Canonical pool name for a (namespace, service, port) triple. Unique
/// per gateway instance; also the key the data plane keeps balancers by.
pub fn upstream_name(namespace: &str, service: &str, port: &str) -> String {
    format!("{namespace}-{service}-{port}")
}

/// Expands an `ExternalName` target into one endpoint per resolved IP on
/// the given port. Resolution failure drops the endpoints (and logs)
/// rather than failing the sync; the pool simply goes empty.
pub async fn resolve_external_name(
    resolver: &dyn Resolver,
    external_name: &str,
    port: &str,
) -> Vec<Endpoint> {
    match resolver.resolve(external_name).await {
        Ok(ips) => ips
            .into_iter()
            .map(|ip| Endpoint::from_ip(ip, port))
            .collect(),
        Err(err) => {
            tracing::warn!(host = %external_name, error = %err, "DNS resolution failed, dropping endpoints");
            Vec::new()
        }
    }
}
