//! Per-connection protocol state machine: handshake gating, choke/interest flags,
//! message dispatch. Owns no sockets; the node feeds it decoded messages.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::identity::PeerId;
use crate::protocol::{Handshake, Message};
use crate::wire::FrameReader;

/// Arena handle for a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted on our listening socket.
    Inbound,
    /// Dialed by us; the partner must answer with `target`'s ID.
    Outbound { target: PeerId },
}

/// Reasons a connection is dropped. No error is echoed to the partner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("message received before handshake completed")]
    NotHandshaked,
    #[error("double handshake")]
    DoubleHandshake,
    #[error("invalid handshake")]
    InvalidHandshake,
    #[error("connection with {0} not allowed")]
    NotAllowed(PeerId),
    #[error("handshake received before our own was sent")]
    UnrequestedHandshake,
    #[error("expected peer {expected}, got {got}")]
    UnexpectedPeer { expected: PeerId, got: PeerId },
}

/// What the node must do after a steady-state message was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Flags updated or liveness only.
    Nothing,
    GotPiece(u32),
    Bitfield(BTreeSet<u32>),
    PieceRequested(u32),
    RequestCancelled(u32),
    PieceArrived { sequence: u32, data: Bytes },
    BitfieldRequested,
}

#[derive(Debug)]
pub struct PeerConnection {
    id: ConnId,
    direction: Direction,
    addr: Option<SocketAddr>,
    partner_id: Option<PeerId>,
    outgoing_handshaked: bool,
    incoming_handshaked: bool,
    /// We are choking the partner.
    pub choked: bool,
    /// The partner is choking us.
    pub partner_choked: bool,
    pub interested: bool,
    pub partner_interested: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    reader: FrameReader,
}

impl PeerConnection {
    pub fn new(id: ConnId, direction: Direction, addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            direction,
            addr,
            partner_id: None,
            outgoing_handshaked: false,
            incoming_handshaked: false,
            choked: false,
            partner_choked: false,
            interested: false,
            partner_interested: false,
            bytes_sent: 0,
            bytes_received: 0,
            reader: FrameReader::new(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Unset until the partner's handshake is accepted.
    pub fn partner_id(&self) -> Option<PeerId> {
        self.partner_id
    }

    pub fn outgoing_handshaked(&self) -> bool {
        self.outgoing_handshaked
    }

    pub fn incoming_handshaked(&self) -> bool {
        self.incoming_handshaked
    }

    /// Both directions have exchanged handshakes.
    pub fn handshaked(&self) -> bool {
        self.outgoing_handshaked && self.incoming_handshaked
    }

    pub fn reader_mut(&mut self) -> &mut FrameReader {
        &mut self.reader
    }

    /// Our handshake went out.
    pub fn mark_outgoing_handshake(&mut self) {
        self.outgoing_handshaked = true;
    }

    /// Validate the partner's handshake, in order: no double handshake, structural validity,
    /// admission (`allowed` is the manager's verdict), then for outbound links our own
    /// handshake must be out and the responder must be the peer we dialed.
    pub fn check_incoming_handshake(
        &self,
        hs: &Handshake,
        allowed: bool,
    ) -> Result<PeerId, ProtocolViolation> {
        if self.incoming_handshaked {
            return Err(ProtocolViolation::DoubleHandshake);
        }
        if !hs.is_valid() {
            return Err(ProtocolViolation::InvalidHandshake);
        }
        if !allowed {
            return Err(ProtocolViolation::NotAllowed(hs.peer_id));
        }
        if let Direction::Outbound { target } = self.direction {
            if !self.outgoing_handshaked {
                return Err(ProtocolViolation::UnrequestedHandshake);
            }
            if hs.peer_id != target {
                return Err(ProtocolViolation::UnexpectedPeer {
                    expected: target,
                    got: hs.peer_id,
                });
            }
        }
        Ok(hs.peer_id)
    }

    /// Partner's handshake accepted and the connection registered.
    pub fn complete_incoming_handshake(&mut self, partner: PeerId) {
        self.partner_id = Some(partner);
        self.incoming_handshaked = true;
    }

    /// Steady-state dispatch. Anything before both handshakes is fatal, as is a second
    /// handshake. Choke and interest messages mirror the partner's state into our flags.
    pub fn handle(&mut self, msg: Message) -> Result<Dispatch, ProtocolViolation> {
        let dispatch = match msg {
            Message::Handshake(_) => return Err(ProtocolViolation::DoubleHandshake),
            _ if !self.handshaked() => return Err(ProtocolViolation::NotHandshaked),
            Message::Choke => {
                self.partner_choked = true;
                Dispatch::Nothing
            }
            Message::Unchoke => {
                self.partner_choked = false;
                Dispatch::Nothing
            }
            Message::Interested => {
                self.partner_interested = true;
                Dispatch::Nothing
            }
            Message::NotInterested => {
                self.partner_interested = false;
                Dispatch::Nothing
            }
            Message::HeartBeat => Dispatch::Nothing,
            Message::GotPiece { sequence } => Dispatch::GotPiece(sequence),
            Message::PieceBitfield { pieces } => Dispatch::Bitfield(pieces),
            Message::RequestPiece { sequence } => Dispatch::PieceRequested(sequence),
            Message::CancelRequest { sequence } => Dispatch::RequestCancelled(sequence),
            Message::DataPacket { sequence, data } => {
                self.bytes_received = self.bytes_received.saturating_add(data.len() as u64);
                Dispatch::PieceArrived { sequence, data }
            }
            Message::RequestBitfield => Dispatch::BitfieldRequested,
        };
        Ok(dispatch)
    }
}
