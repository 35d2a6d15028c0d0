//! Background low-priority ping scheduler.
//!
//! Marginal peers (an inbound request from a peer with no reputation yet,
//! or a bucket's stalest occupant during refresh) get probed here instead
//! of being added to the routing table directly, so a single spoofed or
//! dead contact can't displace a known-good one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace};

use super::clock::SharedClock;
use super::constants::MAYBE_PING_DELAY;
use super::peer_info::PeerInfo;
use super::peer_manager::PeerManager;

#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, peer: PeerInfo) -> bool;
}

struct ScheduledPing {
    peer: PeerInfo,
    due_at: Instant,
}

pub struct PingQueue {
    clock: SharedClock,
    pinger: Arc<dyn Pinger>,
    peer_manager: Arc<std::sync::Mutex<PeerManager>>,
    queue: Mutex<VecDeque<ScheduledPing>>,
    last_enqueued: Mutex<HashMap<PeerInfo, Instant>>,
}

impl PingQueue {
    pub fn new(clock: SharedClock, pinger: Arc<dyn Pinger>, peer_manager: Arc<std::sync::Mutex<PeerManager>>) -> Self {
        Self {
            clock,
            pinger,
            peer_manager,
            queue: Mutex::new(VecDeque::new()),
            last_enqueued: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue each of `peers` to be pinged after `delay`, deduplicated
    /// within `MAYBE_PING_DELAY` of the last time the same peer was queued.
    pub async fn enqueue_maybe_ping(&self, peers: Vec<PeerInfo>, delay: Duration) {
        let now = self.clock.now();
        let mut last_enqueued = self.last_enqueued.lock().await;
        let mut queue = self.queue.lock().await;
        for peer in peers {
            let should_enqueue = match last_enqueued.get(&peer) {
                Some(&last) => now.saturating_duration_since(last) >= MAYBE_PING_DELAY,
                None => true,
            };
            if should_enqueue {
                last_enqueued.insert(peer, now);
                queue.push_back(ScheduledPing { peer, due_at: now + delay });
                trace!(target: "dht::ping_queue", peer = %peer, "enqueued maybe-ping");
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drain and fire every ping whose delay has elapsed, recording the
    /// outcome into `PeerManager`. Returns the number of pings sent.
    pub async fn pump_once(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<PeerInfo> = {
            let mut queue = self.queue.lock().await;
            let mut due = Vec::new();
            let mut remaining = VecDeque::with_capacity(queue.len());
            while let Some(entry) = queue.pop_front() {
                if entry.due_at <= now {
                    due.push(entry.peer);
                } else {
                    remaining.push_back(entry);
                }
            }
            *queue = remaining;
            due
        };

        let outcomes = futures::future::join_all(due.iter().copied().map(|peer| {
            let pinger = self.pinger.clone();
            async move { (peer, pinger.ping(peer).await) }
        }))
        .await;

        let sent = outcomes.len();
        let mut peer_manager = self.peer_manager.lock().expect("peer manager mutex poisoned");
        for (peer, ok) in outcomes {
            match (ok, peer.udp_endpoint()) {
                (true, Some(endpoint)) => {
                    peer_manager.report_last_replied(endpoint);
                    debug!(target: "dht::ping_queue", peer = %peer, "maybe-ping succeeded");
                }
                (false, Some(endpoint)) => {
                    peer_manager.report_failure(endpoint);
                    debug!(target: "dht::ping_queue", peer = %peer, "maybe-ping failed");
                }
                (_, None) => {}
            }
        }
        sent
    }

    /// Pump on a fixed tick until `shutdown` fires.
    pub async fn run(self: Arc<Self>, tick: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.pump_once().await;
                }
                _ = shutdown.recv() => {
                    debug!(target: "dht::ping_queue", "shutting down");
                    return;
                }
            }
        }
    }
}
