//! Piece store and rarest-first scheduler.
//!
//! Tracks pieces we own, pieces each partner claims, and the two request ledgers. The
//! partner→pieces index and its inverse (piece→holders) are only ever updated together.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use bytes::Bytes;

use crate::identity::PeerId;

#[derive(Debug, Default)]
pub struct PieceManager {
    own_pieces: BTreeMap<u32, Bytes>,
    /// Highest sequence for which every lower sequence is owned.
    last_contiguous: Option<u32>,
    partner_pieces: HashMap<PeerId, BTreeSet<u32>>,
    /// Inverse of `partner_pieces`. Never holds an empty set.
    holders: BTreeMap<u32, BTreeSet<PeerId>>,
    /// Pieces we asked each partner for, with the (virtual) time the request was issued.
    requested_to: HashMap<PeerId, BTreeMap<u32, Duration>>,
    /// Pieces each partner asked us for.
    requested_from: HashMap<PeerId, BTreeSet<u32>>,
}

impl PieceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a piece we now own. Returns false if it was already owned.
    pub fn add_own_piece(&mut self, sequence: u32, data: Bytes) -> bool {
        if self.own_pieces.contains_key(&sequence) {
            return false;
        }
        self.own_pieces.insert(sequence, data);
        for pending in self.requested_to.values_mut() {
            pending.remove(&sequence);
        }
        self.advance_contiguous();
        true
    }

    fn advance_contiguous(&mut self) {
        let mut next = match self.last_contiguous {
            Some(last) => match last.checked_add(1) {
                Some(n) => n,
                None => return,
            },
            None => 0,
        };
        while self.own_pieces.contains_key(&next) {
            self.last_contiguous = Some(next);
            next = match next.checked_add(1) {
                Some(n) => n,
                None => break,
            };
        }
    }

    pub fn has_piece(&self, sequence: u32) -> bool {
        self.own_pieces.contains_key(&sequence)
    }

    pub fn piece(&self, sequence: u32) -> Option<&Bytes> {
        self.own_pieces.get(&sequence)
    }

    pub fn own_sequences(&self) -> BTreeSet<u32> {
        self.own_pieces.keys().copied().collect()
    }

    /// Reassembly watermark; `None` until piece 0 is owned.
    pub fn last_contiguous(&self) -> Option<u32> {
        self.last_contiguous
    }

    pub fn record_partner_piece(&mut self, partner: PeerId, sequence: u32) {
        self.partner_pieces
            .entry(partner)
            .or_default()
            .insert(sequence);
        self.holders.entry(sequence).or_default().insert(partner);
    }

    pub fn record_partner_pieces(&mut self, partner: PeerId, pieces: impl IntoIterator<Item = u32>) {
        for sequence in pieces {
            self.record_partner_piece(partner, sequence);
        }
    }

    pub fn partner_pieces(&self, partner: &PeerId) -> Option<&BTreeSet<u32>> {
        self.partner_pieces.get(partner)
    }

    /// Forget everything about a partner: ownership, inverse index and both ledgers.
    pub fn drop_partner(&mut self, partner: &PeerId) {
        if let Some(pieces) = self.partner_pieces.remove(partner) {
            for sequence in pieces {
                if let Some(set) = self.holders.get_mut(&sequence) {
                    set.remove(partner);
                    if set.is_empty() {
                        self.holders.remove(&sequence);
                    }
                }
            }
        }
        self.requested_to.remove(partner);
        self.requested_from.remove(partner);
    }

    /// Rarest-first: pieces some partner holds and we lack, ordered by number of holders,
    /// ties broken by lower sequence. Returns at most `limit`.
    pub fn select_pieces_to_request(&self, limit: usize) -> Vec<u32> {
        let mut candidates: Vec<(usize, u32)> = self
            .holders
            .iter()
            .filter(|(seq, _)| !self.own_pieces.contains_key(*seq))
            .map(|(&seq, holders)| (holders.len(), seq))
            .collect();
        candidates.sort_unstable();
        candidates
            .into_iter()
            .take(limit)
            .map(|(_, seq)| seq)
            .collect()
    }

    /// The lowest-ID partner holding `sequence` that we may ask now: no request for it is
    /// outstanding to that partner and `usable` accepts it.
    pub fn best_partner_for(
        &self,
        sequence: u32,
        mut usable: impl FnMut(&PeerId) -> bool,
    ) -> Option<PeerId> {
        self.holders
            .get(&sequence)?
            .iter()
            .find(|partner| self.can_request(partner, sequence) && usable(partner))
            .copied()
    }

    /// False if a request for `sequence` to `partner` is already outstanding.
    /// A pending request to a different partner does not block this one.
    pub fn can_request(&self, partner: &PeerId, sequence: u32) -> bool {
        !self.is_requested(partner, sequence)
    }

    /// We asked `partner` for `sequence` and have not received or cancelled it yet.
    pub fn is_requested(&self, partner: &PeerId, sequence: u32) -> bool {
        self.requested_to
            .get(partner)
            .is_some_and(|pending| pending.contains_key(&sequence))
    }

    pub fn mark_requested(&mut self, partner: PeerId, sequence: u32, issued_at: Duration) {
        self.requested_to
            .entry(partner)
            .or_default()
            .insert(sequence, issued_at);
    }

    pub fn outstanding_requests(&self, partner: &PeerId) -> usize {
        self.requested_to.get(partner).map_or(0, BTreeMap::len)
    }

    /// Drop requests issued more than `timeout` before `now`. Returns what was dropped.
    pub fn expire_requests(&mut self, now: Duration, timeout: Duration) -> Vec<(PeerId, u32)> {
        let mut expired = Vec::new();
        for (partner, pending) in self.requested_to.iter_mut() {
            pending.retain(|&sequence, &mut issued_at| {
                let keep = now.saturating_sub(issued_at) <= timeout;
                if !keep {
                    expired.push((*partner, sequence));
                }
                keep
            });
        }
        expired.sort();
        expired
    }

    /// Partner asked us for `sequence`.
    pub fn mark_partner_request(&mut self, partner: PeerId, sequence: u32) {
        self.requested_from
            .entry(partner)
            .or_default()
            .insert(sequence);
    }

    /// Partner withdrew a request.
    pub fn cancel_partner_request(&mut self, partner: &PeerId, sequence: u32) {
        if let Some(pending) = self.requested_from.get_mut(partner) {
            pending.remove(&sequence);
        }
    }

    /// Requests from partners that we can serve now (we own the piece), sorted.
    pub fn pieces_pending_send(&self) -> Vec<(PeerId, u32)> {
        let mut out: Vec<(PeerId, u32)> = self
            .requested_from
            .iter()
            .flat_map(|(partner, seqs)| {
                seqs.iter()
                    .filter(|seq| self.own_pieces.contains_key(*seq))
                    .map(move |&seq| (*partner, seq))
            })
            .collect();
        out.sort();
        out
    }

    pub fn mark_sent(&mut self, partner: &PeerId, sequence: u32) {
        if let Some(pending) = self.requested_from.get_mut(partner) {
            pending.remove(&sequence);
        }
    }

    pub fn partner_requests(&self, partner: &PeerId) -> Option<&BTreeSet<u32>> {
        self.requested_from.get(partner)
    }
}
