//! Connection pool: arena of live connections, inbound/outbound partner indexes,
//! in-flight dials, and the tracker's peer database.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::connection::{ConnId, Direction, PeerConnection};
use crate::identity::PeerId;
use crate::tracker::{PeerDatabase, TrackerPeer};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("already connected to {0}")]
    AlreadyConnected(PeerId),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),
}

/// A connection taken out of the pool.
#[derive(Debug)]
pub struct Removed {
    pub conn: PeerConnection,
    /// The connection owned its partner's slot in the inbound or outbound index.
    pub registered: bool,
}

pub struct ConnectionManager {
    own_id: PeerId,
    next_id: u64,
    conns: HashMap<ConnId, PeerConnection>,
    inbound: HashMap<PeerId, ConnId>,
    outbound: HashMap<PeerId, ConnId>,
    dialing: HashSet<PeerId>,
    peers: PeerDatabase,
}

impl ConnectionManager {
    pub fn new(own_id: PeerId) -> Self {
        Self {
            own_id,
            next_id: 0,
            conns: HashMap::new(),
            inbound: HashMap::new(),
            outbound: HashMap::new(),
            dialing: HashSet::new(),
            peers: PeerDatabase::new(),
        }
    }

    fn alloc(&mut self, direction: Direction, addr: Option<SocketAddr>) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.conns.insert(id, PeerConnection::new(id, direction, addr));
        id
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.inbound.contains_key(peer) || self.outbound.contains_key(peer)
    }

    /// Admission policy: not ourselves, not connected in either direction, no dial in flight.
    pub fn connection_allowed(&self, peer: &PeerId) -> bool {
        *peer != self.own_id && !self.is_connected(peer) && !self.dialing.contains(peer)
    }

    /// Accepted socket; unregistered until its handshake passes.
    pub fn open_inbound(&mut self, addr: Option<SocketAddr>) -> ConnId {
        self.alloc(Direction::Inbound, addr)
    }

    /// Mark a dial to `peer` as in flight. Returns false when one is not allowed.
    pub fn begin_dial(&mut self, peer: PeerId) -> bool {
        if !self.connection_allowed(&peer) {
            return false;
        }
        self.dialing.insert(peer)
    }

    /// Transport connected: the in-flight marker is cleared before any handshake, so a later
    /// handshake failure does not block the target.
    pub fn dial_established(&mut self, peer: PeerId, addr: Option<SocketAddr>) -> ConnId {
        self.dialing.remove(&peer);
        self.alloc(Direction::Outbound { target: peer }, addr)
    }

    pub fn dial_failed(&mut self, peer: &PeerId) {
        self.dialing.remove(peer);
    }

    pub fn is_dialing(&self, peer: &PeerId) -> bool {
        self.dialing.contains(peer)
    }

    /// Bind a handshaked connection to its partner. A partner already present in either
    /// collection is rejected; the caller drops the new connection.
    pub fn register(&mut self, id: ConnId, partner: PeerId) -> Result<(), AdmissionError> {
        if self.is_connected(&partner) {
            return Err(AdmissionError::AlreadyConnected(partner));
        }
        let conn = self
            .conns
            .get(&id)
            .ok_or(AdmissionError::UnknownConnection(id))?;
        match conn.direction() {
            Direction::Inbound => self.inbound.insert(partner, id),
            Direction::Outbound { .. } => self.outbound.insert(partner, id),
        };
        Ok(())
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Removed> {
        let conn = self.conns.remove(&id)?;
        let mut registered = false;
        if let Some(partner) = conn.partner_id() {
            let index = if conn.is_inbound() {
                &mut self.inbound
            } else {
                &mut self.outbound
            };
            if index.get(&partner) == Some(&id) {
                index.remove(&partner);
                registered = true;
            }
        }
        Some(Removed { conn, registered })
    }

    pub fn get(&self, id: ConnId) -> Option<&PeerConnection> {
        self.conns.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut PeerConnection> {
        self.conns.get_mut(&id)
    }

    /// Live connection to `partner`, in either direction.
    pub fn get_connection(&self, partner: &PeerId) -> Option<ConnId> {
        self.inbound
            .get(partner)
            .or_else(|| self.outbound.get(partner))
            .copied()
    }

    /// Registered connections that completed both handshakes, sorted by id.
    pub fn handshaked(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self
            .inbound
            .values()
            .chain(self.outbound.values())
            .copied()
            .filter(|id| self.conns.get(id).is_some_and(|c| c.handshaked()))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Tracker peers with no connection and no dial in flight, sorted by id.
    pub fn peers_to_dial(&self) -> Vec<TrackerPeer> {
        self.peers
            .peer_ids()
            .into_iter()
            .filter(|id| self.connection_allowed(id))
            .filter_map(|id| self.peers.get_peer(&id).cloned())
            .collect()
    }

    pub fn incoming_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.inbound.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn outgoing_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.outbound.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Replace the tracker view; our own entry is dropped.
    pub fn update_peers(&mut self, peers: Vec<TrackerPeer>) {
        let own = self.own_id;
        self.peers
            .update_peers(peers.into_iter().filter(|p| p.id != own));
    }

    pub fn peer_database(&self) -> &PeerDatabase {
        &self.peers
    }

    /// All connections in the arena, registered or not.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
