//! Consistent hashing keyed on a request variable, full-ring and subset
//! variants.

use super::{BalanceContext, Balancer, Kind, Pick};
use crate::state::BackendView;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Ring points per peer; enough that peer churn only remaps a small
/// slice of the keyspace.
const REPLICAS: u32 = 160;

fn hash64(input: &str) -> u64 {
    let digest = Md5::digest(input.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

struct Ring {
    /// Sorted (point, peer index) pairs.
    points: Vec<(u64, usize)>,
    peers: Vec<String>,
}

impl Ring {
    fn build(mut peers: Vec<String>) -> Self {
        // Deterministic ring regardless of table order.
        peers.sort();
        let mut points = Vec::with_capacity(peers.len() * REPLICAS as usize);
        for (index, peer) in peers.iter().enumerate() {
            for replica in 0..REPLICAS {
                points.push((hash64(&format!("{peer}\u{0}{replica}")), index));
            }
        }
        points.sort_unstable();
        Ring { points, peers }
    }

    fn lookup(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let point = hash64(key);
        let index = match self.points.binary_search_by(|(p, _)| p.cmp(&point)) {
            Ok(i) => i,
            // Wrap past the last point back to the first.
            Err(i) if i == self.points.len() => 0,
            Err(i) => i,
        };
        Some(&self.peers[self.points[index].1])
    }
}

/// Full-ring consistent hash over the variable named by the pool's
/// `upstream-hash-by` config.
pub struct ConsistentHash {
    key: String,
    ring: RwLock<Ring>,
}

impl ConsistentHash {
    pub fn new(view: &BackendView) -> Self {
        ConsistentHash {
            key: hash_key(view),
            ring: RwLock::new(Ring::build(view.authorities())),
        }
    }
}

fn hash_key(view: &BackendView) -> String {
    view.backend
        .upstream_hash_by
        .as_ref()
        .map(|c| c.key.clone())
        .unwrap_or_default()
}

impl Balancer for ConsistentHash {
    fn kind(&self) -> Kind {
        Kind::Chash
    }

    fn sync(&self, view: &BackendView) {
        *self.ring.write() = Ring::build(view.authorities());
    }

    fn balance(&self, ctx: &BalanceContext<'_>) -> Option<Pick> {
        let value = ctx.info.variable(&self.key);
        self.ring
            .read()
            .lookup(&value)
            .map(|peer| Pick::of(peer.to_string()))
    }
}

struct Subsets {
    groups: Vec<Vec<String>>,
}

impl Subsets {
    fn build(mut peers: Vec<String>, subset_size: usize) -> Self {
        peers.sort();
        let size = subset_size.max(1);
        let groups = peers
            .chunks(size)
            .map(|chunk| chunk.to_vec())
            .collect();
        Subsets { groups }
    }
}

/// Subset variant: the hash key selects a fixed group of peers, and the
/// worker round-robins within it.
pub struct ConsistentHashSubset {
    key: String,
    subset_size: usize,
    subsets: RwLock<Subsets>,
    cursor: AtomicUsize,
}

impl ConsistentHashSubset {
    pub fn new(view: &BackendView) -> Self {
        let subset_size = view
            .backend
            .upstream_hash_by
            .as_ref()
            .map(|c| c.subset_size as usize)
            .filter(|n| *n > 0)
            .unwrap_or(3);
        ConsistentHashSubset {
            key: hash_key(view),
            subset_size,
            subsets: RwLock::new(Subsets::build(view.authorities(), subset_size)),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Balancer for ConsistentHashSubset {
    fn kind(&self) -> Kind {
        Kind::ChashSubset
    }

    fn sync(&self, view: &BackendView) {
        *self.subsets.write() = Subsets::build(view.authorities(), self.subset_size);
    }

    fn balance(&self, ctx: &BalanceContext<'_>) -> Option<Pick> {
        let subsets = self.subsets.read();
        if subsets.groups.is_empty() {
            return None;
        }
        let value = ctx.info.variable(&self.key);
        let group = &subsets.groups[(hash64(&value) % subsets.groups.len() as u64) as usize];
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % group.len();
        Some(Pick::of(group[index].clone()))
    }
}
