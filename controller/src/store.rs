//! The published-table store. Writers swap whole tables under a write
//! lock; readers clone `Arc`s, so the publisher handlers never hold the
//! lock across serialization.

use crate::sync::Tables;
use parking_lot::RwLock;
use shared::tables::{Backend, Server};
use std::sync::Arc;

#[derive(Clone)]
pub struct Published {
    pub backends: Arc<Vec<Backend>>,
    pub servers: Arc<Vec<Server>>,
    /// Monotonic publish stamp; advances only when the tables change, so
    /// workers can poll it for cheap change detection.
    pub raw_last_synced: u64,
}

pub struct TableStore {
    inner: RwLock<Published>,
}

impl TableStore {
    pub fn new() -> Self {
        TableStore {
            inner: RwLock::new(Published {
                backends: Arc::new(Vec::new()),
                servers: Arc::new(Vec::new()),
                raw_last_synced: 0,
            }),
        }
    }

    /// Swaps the published tables. The stamp advances only when the new
    /// tables differ from what is already published.
    pub fn publish(&self, tables: Tables) -> u64 {
        let mut guard = self.inner.write();
        if *guard.backends == tables.backends && *guard.servers == tables.servers {
            return guard.raw_last_synced;
        }

        guard.backends = Arc::new(tables.backends);
        guard.servers = Arc::new(tables.servers);
        guard.raw_last_synced += 1;
        guard.raw_last_synced
    }

    pub fn snapshot(&self) -> Published {
        self.inner.read().clone()
    }

    /// True once something has been published, for the readiness probe.
    pub fn is_ready(&self) -> bool {
        self.inner.read().raw_last_synced > 0
    }
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}
