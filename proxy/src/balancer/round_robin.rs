use super::{BalanceContext, Balancer, Kind, Pick};
use crate::state::BackendView;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Cycles through the pool's peers with an atomic cursor. The cursor
/// survives syncs, so endpoint churn does not restart the rotation.
pub struct RoundRobin {
    peers: RwLock<Vec<String>>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(view: &BackendView) -> Self {
        RoundRobin {
            peers: RwLock::new(view.authorities()),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Balancer for RoundRobin {
    fn kind(&self) -> Kind {
        Kind::RoundRobin
    }

    fn sync(&self, view: &BackendView) {
        *self.peers.write() = view.authorities();
    }

    fn balance(&self, _ctx: &BalanceContext<'_>) -> Option<Pick> {
        let peers = self.peers.read();
        if peers.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % peers.len();
        Some(Pick::of(peers[index].clone()))
    }

    fn after_balance(&self, _endpoint: &str, _rtt: Duration) {}
}
