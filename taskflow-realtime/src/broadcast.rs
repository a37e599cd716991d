//! Relay fan-out with backpressure.
//!
//! Every connection holds one receiver on a shared tokio broadcast channel
//! and filters by its own subscriptions before writing to the socket. Frames
//! are shared as `Arc<Frame>`, so a publish costs one allocation no matter
//! how many connections see it. A receiver that falls more than `capacity`
//! frames behind skips ahead and the gap is counted as dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::Frame;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_peers: usize,
}

/// Hot-path counters, read via [`BroadcastGroup::stats`].
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// A connected relay client.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSession {
    pub connection_id: Uuid,
    pub addr: Option<SocketAddr>,
}

impl PeerSession {
    pub fn new(addr: Option<SocketAddr>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            addr,
        }
    }
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    peers: Arc<RwLock<HashMap<Uuid, PeerSession>>>,
    /// Frames buffered per receiver before it starts lagging.
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a peer and hand back its receiver.
    pub async fn add_peer(&self, session: PeerSession) -> broadcast::Receiver<Arc<Frame>> {
        let mut peers = self.peers.write().await;
        peers.insert(session.connection_id, session);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<PeerSession> {
        self.peers.write().await.remove(connection_id)
    }

    /// Fan `frame` out to every connected peer, the publisher included.
    ///
    /// Returns the number of receivers it was queued for.
    pub fn broadcast(&self, frame: Frame) -> usize {
        self.broadcast_shared(Arc::new(frame))
    }

    pub fn broadcast_shared(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .frames_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerSession> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, connection_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.atomic_stats.frames_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
