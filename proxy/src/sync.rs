//! The publisher poller and the ExternalName refresh task.
//!
//! Cheap deltas ride on the publisher's raw-last-synced stamp; the full
//! tables are fetched only when the stamp advances, with a hard refresh
//! on a longer timer. DNS for ExternalName pools runs on its own timer
//! so a slow resolver never delays table sync.

use crate::metrics_defs::{SYNC_DURATION, SYNC_FAILURES};
use crate::state::GatewayState;
use shared::resolve::Resolver;
use shared::tables::{Backend, Endpoint, Server};
use shared::{counter, histogram};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("invalid publisher URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("publisher request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("publisher returned a malformed stamp: {0}")]
    MalformedStamp(String),
}

pub struct ConfigClient {
    http: reqwest::Client,
    base: Url,
}

impl ConfigClient {
    pub fn new(publisher_url: &str) -> Result<Self, SyncError> {
        Ok(ConfigClient {
            http: reqwest::Client::new(),
            base: Url::parse(publisher_url)?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
        Ok(self.base.join(path)?)
    }

    pub async fn raw_last_synced(&self) -> Result<u64, SyncError> {
        let url = self.endpoint("/configuration/raw-last-synced")?;
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        body.trim()
            .parse()
            .map_err(|_| SyncError::MalformedStamp(body))
    }

    pub async fn backends(&self) -> Result<Vec<Backend>, SyncError> {
        let url = self.endpoint("/configuration/backends")?;
        Ok(self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn servers(&self) -> Result<Vec<Server>, SyncError> {
        let url = self.endpoint("/configuration/servers")?;
        Ok(self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

/// Polls the publisher. On any fetch or decode failure the worker keeps
/// its previous snapshot; an empty table that arrives intact is applied
/// and drops all worker state.
pub async fn run_sync_loop(
    state: Arc<GatewayState>,
    client: ConfigClient,
    sync_interval: Duration,
    force_interval: Duration,
) {
    let mut ticker = tokio::time::interval(sync_interval);
    let mut last_stamp: Option<u64> = None;
    let mut last_full_sync = Instant::now();

    loop {
        ticker.tick().await;

        let force = last_full_sync.elapsed() >= force_interval;
        let stamp = match client.raw_last_synced().await {
            Ok(stamp) => stamp,
            Err(err) => {
                counter!(SYNC_FAILURES, "stage" => "stamp").increment(1);
                tracing::warn!(error = %err, "stamp poll failed, keeping previous snapshot");
                continue;
            }
        };

        if Some(stamp) == last_stamp && !force {
            continue;
        }

        let start = Instant::now();
        match tokio::try_join!(client.backends(), client.servers()) {
            Ok((backends, servers)) => {
                tracing::debug!(
                    stamp,
                    backends = backends.len(),
                    servers = servers.len(),
                    "applying configuration tables"
                );
                state.apply_tables(backends, servers);
                last_stamp = Some(stamp);
                last_full_sync = Instant::now();
                histogram!(SYNC_DURATION, "status" => "success")
                    .record(start.elapsed().as_secs_f64());
            }
            Err(err) => {
                counter!(SYNC_FAILURES, "stage" => "tables").increment(1);
                histogram!(SYNC_DURATION, "status" => "failure")
                    .record(start.elapsed().as_secs_f64());
                tracing::warn!(error = %err, "table fetch failed, keeping previous snapshot");
            }
        }
    }
}

fn parse_ip(address: &str) -> Option<IpAddr> {
    // Published v6 endpoints are bracketed.
    let bare = address
        .strip_prefix('[')
        .and_then(|a| a.strip_suffix(']'))
        .unwrap_or(address);
    bare.parse().ok()
}

/// Re-resolves ExternalName pools whose endpoint addresses are still
/// hostnames. Failures leave the pool's previous expansion in place for
/// that round (the pool drains only when the resolver answers empty).
pub async fn run_external_name_loop(
    state: Arc<GatewayState>,
    resolver: Arc<dyn Resolver>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let pools = state.external_name_pools();
        if pools.is_empty() {
            continue;
        }

        let mut resolved: HashMap<String, Vec<Endpoint>> = HashMap::new();
        for (name, endpoints) in pools {
            let mut expanded = Vec::new();
            for endpoint in endpoints {
                if parse_ip(&endpoint.address).is_some() {
                    expanded.push(endpoint);
                    continue;
                }
                match resolver.resolve(&endpoint.address).await {
                    Ok(ips) => expanded
                        .extend(ips.into_iter().map(|ip| Endpoint::from_ip(ip, &endpoint.port))),
                    Err(err) => {
                        counter!(SYNC_FAILURES, "stage" => "dns").increment(1);
                        tracing::warn!(pool = %name, host = %endpoint.address, error = %err, "DNS resolution failed, dropping endpoint");
                    }
                }
            }
            resolved.insert(name, expanded);
        }

        state.apply_external_endpoints(resolved);
    }
}
