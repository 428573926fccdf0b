//! The slice of the cluster model the table builder consumes: ingress
//! objects plus per-service endpoint data. Watch plumbing lives outside
//! this crate; a [`SnapshotSource`] hands the builder a consistent view
//! of whatever the informers currently hold.

use async_trait::async_trait;
use serde::Deserialize;
use shared::tables::ServiceType;
use std::collections::HashMap;

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Metadata {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct IngressBackend {
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(rename = "servicePort")]
    pub service_port: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct HttpPath {
    #[serde(default)]
    pub path: String,
    pub backend: IngressBackend,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct IngressRule {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub paths: Vec<HttpPath>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Ingress {
    pub metadata: Metadata,
    #[serde(default)]
    pub rules: Vec<IngressRule>,
}

impl Ingress {
    /// Canonical upstream name for the given service, if any of this
    /// ingress's paths routes to it.
    pub fn upstream_name_for(&self, service: &str) -> Option<String> {
        self.rules
            .iter()
            .flat_map(|rule| rule.paths.iter())
            .find(|path| path.backend.service_name == service)
            .map(|path| {
                crate::upstreams::upstream_name(
                    &self.metadata.namespace,
                    service,
                    &path.backend.service_port,
                )
            })
    }
}

/// Endpoint data for one service, keyed `<namespace>/<name>` in the
/// snapshot. `ExternalName` services carry the external host instead of
/// ready addresses.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ServiceEntry {
    #[serde(default)]
    pub service_type: ServiceType,
    /// Ready pod addresses (ClusterIP-style services).
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Target hostname of an `ExternalName` service.
    #[serde(default)]
    pub external_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ClusterSnapshot {
    #[serde(default)]
    pub ingresses: Vec<Ingress>,
    #[serde(default)]
    pub services: HashMap<String, ServiceEntry>,
}

impl ClusterSnapshot {
    pub fn service(&self, namespace: &str, name: &str) -> Option<&ServiceEntry> {
        self.services.get(&format!("{namespace}/{name}"))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("could not read snapshot: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse snapshot: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Hands the reconciler a consistent view of the cluster.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn load(&self) -> Result<ClusterSnapshot, SourceError>;
}

/// Reads the snapshot from a YAML file; the development and test source.
pub struct FileSource {
    path: std::path::PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        FileSource { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for FileSource {
    async fn load(&self) -> Result<ClusterSnapshot, SourceError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}
