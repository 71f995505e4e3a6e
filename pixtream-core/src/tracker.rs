//! Tracker payload types and the local database of peers the tracker knows about.
//! The HTTP client lives in the host.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// A swarm member as returned by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerPeer {
    pub id: PeerId,
    pub ip: IpAddr,
    pub port: u16,
}

impl TrackerPeer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Body of a tracker `/announce` (and `/utility`) response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnnounceResponse {
    #[serde(default)]
    pub peers: Vec<TrackerPeer>,
    /// Seconds until the next announce.
    #[serde(default)]
    pub request_interval: Option<u64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Peers indexed by ID.
#[derive(Debug, Default)]
pub struct PeerDatabase {
    by_id: HashMap<PeerId, TrackerPeer>,
}

impl PeerDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, peer: TrackerPeer) {
        self.by_id.insert(peer.id, peer);
    }

    pub fn remove_peer(&mut self, id: &PeerId) -> Option<TrackerPeer> {
        self.by_id.remove(id)
    }

    /// Replace the whole set with a fresh tracker list.
    pub fn update_peers(&mut self, peers: impl IntoIterator<Item = TrackerPeer>) {
        self.by_id.clear();
        for p in peers {
            self.add_peer(p);
        }
    }

    pub fn get_peer(&self, id: &PeerId) -> Option<&TrackerPeer> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn peer_ids(&self) -> BTreeSet<PeerId> {
        self.by_id.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
