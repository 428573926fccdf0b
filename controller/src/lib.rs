pub mod annotations;
pub mod config;
pub mod ingress;
pub mod metrics_defs;
pub mod publisher;
pub mod release;
pub mod store;
pub mod sync;
pub mod upstreams;

use crate::ingress::{FileSource, SnapshotSource};
use crate::metrics_defs::{SYNC_DURATION, TABLE_BACKENDS, TABLE_SERVERS};
use crate::store::TableStore;
use shared::resolve::{Resolver, SystemResolver};
use shared::{gauge, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("publisher error: {0}")]
    Publisher(#[from] publisher::PublisherError),
}

/// Runs the control plane: a reconcile loop feeding the table store, and
/// the publisher serving it.
pub async fn run(config: config::Config) -> Result<(), ControllerError> {
    let store = Arc::new(TableStore::new());

    let source: Arc<dyn SnapshotSource> = match &config.source {
        config::SourceConfig::File { path } => Arc::new(FileSource::new(path)),
    };

    let interval = Duration::from_secs(config.sync_interval_secs.max(1));
    tokio::spawn(run_sync_loop(
        source,
        Arc::new(SystemResolver),
        store.clone(),
        interval,
    ));

    publisher::serve(config.listener, store).await?;
    Ok(())
}

async fn run_sync_loop(
    source: Arc<dyn SnapshotSource>,
    resolver: Arc<dyn Resolver>,
    store: Arc<TableStore>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let start = Instant::now();
        let snapshot = match source.load().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "snapshot load failed, keeping published tables");
                histogram!(SYNC_DURATION, "status" => "failure")
                    .record(start.elapsed().as_secs_f64());
                continue;
            }
        };

        let tables = sync::build_tables(&snapshot, resolver.as_ref()).await;
        gauge!(TABLE_BACKENDS).set(tables.backends.len() as f64);
        gauge!(TABLE_SERVERS).set(tables.servers.len() as f64);

        let stamp = store.publish(tables);
        histogram!(SYNC_DURATION, "status" => "success").record(start.elapsed().as_secs_f64());
        tracing::debug!(stamp, "tables reconciled");
    }
}
