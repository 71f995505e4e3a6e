//! Per-partner utility: useful payload bytes received, reported to the tracker.

use std::collections::BTreeMap;

use crate::identity::PeerId;

#[derive(Debug, Default)]
pub struct UtilityTracker {
    by_peer: BTreeMap<PeerId, u64>,
}

impl UtilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: PeerId, bytes: u64) {
        let total = self.by_peer.entry(peer).or_insert(0);
        *total = total.saturating_add(bytes);
    }

    pub fn get(&self, peer: &PeerId) -> u64 {
        self.by_peer.get(peer).copied().unwrap_or(0)
    }

    /// Totals per peer, sorted by ID.
    pub fn snapshot(&self) -> Vec<(PeerId, u64)> {
        self.by_peer.iter().map(|(p, b)| (*p, *b)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }
}
