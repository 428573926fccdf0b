//! Peak-latency-aware balancing: an exponentially weighted moving
//! average of each peer's response time, decayed by the time since the
//! peer was last scored.

use super::{BalanceContext, Balancer, Kind, Pick};
use crate::state::BackendView;
use parking_lot::{Mutex, RwLock};
use rand::seq::index::sample;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Scores decay toward zero with this time constant, so an idle peer is
/// retried instead of being penalised forever.
const DECAY_TIME: Duration = Duration::from_secs(10);

/// How many random peers compete per pick.
const PICK_SET_SIZE: usize = 3;

#[derive(Clone, Copy)]
struct PeerScore {
    ewma: f64,
    last_touched: Instant,
}

impl PeerScore {
    fn decayed(&self, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.last_touched).as_secs_f64();
        self.ewma * (-elapsed / DECAY_TIME.as_secs_f64()).exp()
    }
}

pub struct Ewma {
    peers: RwLock<Vec<String>>,
    scores: Mutex<HashMap<String, PeerScore>>,
}

impl Ewma {
    pub fn new(view: &BackendView) -> Self {
        Ewma {
            peers: RwLock::new(view.authorities()),
            scores: Mutex::new(HashMap::new()),
        }
    }
}

impl Balancer for Ewma {
    fn kind(&self) -> Kind {
        Kind::Ewma
    }

    fn sync(&self, view: &BackendView) {
        let peers = view.authorities();
        // Keep statistics for peers that survive the delta.
        self.scores.lock().retain(|peer, _| peers.contains(peer));
        *self.peers.write() = peers;
    }

    fn balance(&self, _ctx: &BalanceContext<'_>) -> Option<Pick> {
        let peers = self.peers.read();
        match peers.len() {
            0 => return None,
            1 => return Some(Pick::of(peers[0].clone())),
            _ => {}
        }

        let now = Instant::now();
        let scores = self.scores.lock();
        let candidates = sample(
            &mut rand::rng(),
            peers.len(),
            PICK_SET_SIZE.min(peers.len()),
        );

        // An unscored peer reads as zero, so fresh peers get probed.
        let best = candidates
            .into_iter()
            .map(|i| &peers[i])
            .min_by(|a, b| {
                let score_a = scores.get(*a).map_or(0.0, |s| s.decayed(now));
                let score_b = scores.get(*b).map_or(0.0, |s| s.decayed(now));
                score_a.total_cmp(&score_b)
            })?;
        Some(Pick::of(best.clone()))
    }

    fn after_balance(&self, endpoint: &str, rtt: Duration) {
        let now = Instant::now();
        let rtt = rtt.as_secs_f64();
        let mut scores = self.scores.lock();
        let entry = scores.entry(endpoint.to_string()).or_insert(PeerScore {
            ewma: rtt,
            last_touched: now,
        });

        let elapsed = now.duration_since(entry.last_touched).as_secs_f64();
        let weight = (-elapsed / DECAY_TIME.as_secs_f64()).exp();
        entry.ewma = entry.ewma * weight + rtt * (1.0 - weight);
        entry.last_touched = now;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::state::RequestInfo;

    #[test]
    fn prefers_the_faster_peer() {
        let view = view("a", &["10.0.0.1:80", "10.0.0.2:80"]);
        let ewma = Ewma::new(&view);

        for _ in 0..10 {
            ewma.after_balance("10.0.0.1:80", Duration::from_millis(5));
            ewma.after_balance("10.0.0.2:80", Duration::from_millis(500));
        }

        let (uri, headers) = ctx_parts();
        let info = RequestInfo::new(&uri, &headers, "127.0.0.1:1".parse().unwrap());
        let ctx = BalanceContext {
            info: &info,
            location_path: "/",
        };

        // With two peers the whole pool is sampled every pick.
        let fast_picks = (0..50)
            .filter(|_| ewma.balance(&ctx).unwrap().endpoint == "10.0.0.1:80")
            .count();
        assert_eq!(fast_picks, 50);
    }

    #[test]
    fn sync_retains_surviving_scores() {
        let view3 = view("a", &["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
        let ewma = Ewma::new(&view3);
        ewma.after_balance("10.0.0.1:80", Duration::from_millis(5));
        ewma.after_balance("10.0.0.3:80", Duration::from_millis(7));

        ewma.sync(&view("a", &["10.0.0.1:80", "10.0.0.2:80"]));

        let scores = ewma.scores.lock();
        assert!(scores.contains_key("10.0.0.1:80"));
        assert!(!scores.contains_key("10.0.0.3:80"));
    }

    #[test]
    fn single_peer_short_circuits() {
        let view = view("a", &["10.0.0.1:80"]);
        let ewma = Ewma::new(&view);
        let (uri, headers) = ctx_parts();
        let info = RequestInfo::new(&uri, &headers, "127.0.0.1:1".parse().unwrap());
        assert_eq!(
            ewma.balance(&BalanceContext {
                info: &info,
                location_path: "/",
            })
            .unwrap()
            .endpoint,
            "10.0.0.1:80"
        );
    }
}
