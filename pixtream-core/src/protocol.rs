//! Pixtream wire protocol: message types, tags and handshake constants.

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::identity::PeerId;

/// Literal protocol identifier carried in every handshake (17 bytes).
pub const PROTOCOL_ID: &[u8; 17] = b"Pixtream Protocol";

/// Reserved handshake field. Sent as ASCII zeros; never checked on receive.
pub const RESERVED: &[u8; 8] = b"00000000";

/// One-byte message tags.
pub mod tag {
    pub const HANDSHAKE: u8 = b'H';
    pub const DATA_PACKET: u8 = b'D';
    pub const REQUEST_PIECE: u8 = b'Q';
    pub const CANCEL_REQUEST: u8 = b'X';
    pub const HEART_BEAT: u8 = b'B';
    pub const CHOKE: u8 = b'C';
    pub const UNCHOKE: u8 = b'U';
    pub const INTERESTED: u8 = b'I';
    pub const NOT_INTERESTED: u8 = b'N';
    pub const GOT_PIECE: u8 = b'G';
    pub const PIECE_BITFIELD: u8 = b'F';
    pub const REQUEST_BITFIELD: u8 = b'R';
}

/// First message on every connection, once per direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_id: [u8; 17],
    pub reserved: [u8; 8],
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            protocol_id: *PROTOCOL_ID,
            reserved: *RESERVED,
            peer_id,
        }
    }

    /// Structural validity. The 20-byte peer ID is guaranteed by the fixed layout.
    pub fn is_valid(&self) -> bool {
        &self.protocol_id == PROTOCOL_ID
    }
}

/// All wire message types. Encoding is the fixed big-endian layout in the wire module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    /// A piece of the stream; payload is the rest of the frame.
    DataPacket { sequence: u32, data: Bytes },
    RequestPiece { sequence: u32 },
    CancelRequest { sequence: u32 },
    /// Liveness only.
    HeartBeat,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Sender now owns `sequence`.
    GotPiece { sequence: u32 },
    /// Full ownership set of the sender.
    PieceBitfield { pieces: BTreeSet<u32> },
    /// Ask the partner to resend its PieceBitfield.
    RequestBitfield,
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Handshake(_) => tag::HANDSHAKE,
            Message::DataPacket { .. } => tag::DATA_PACKET,
            Message::RequestPiece { .. } => tag::REQUEST_PIECE,
            Message::CancelRequest { .. } => tag::CANCEL_REQUEST,
            Message::HeartBeat => tag::HEART_BEAT,
            Message::Choke => tag::CHOKE,
            Message::Unchoke => tag::UNCHOKE,
            Message::Interested => tag::INTERESTED,
            Message::NotInterested => tag::NOT_INTERESTED,
            Message::GotPiece { .. } => tag::GOT_PIECE,
            Message::PieceBitfield { .. } => tag::PIECE_BITFIELD,
            Message::RequestBitfield => tag::REQUEST_BITFIELD,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "Handshake",
            Message::DataPacket { .. } => "DataPacket",
            Message::RequestPiece { .. } => "RequestPiece",
            Message::CancelRequest { .. } => "CancelRequest",
            Message::HeartBeat => "HeartBeat",
            Message::Choke => "Choke",
            Message::Unchoke => "UnChoke",
            Message::Interested => "Interested",
            Message::NotInterested => "NotInterested",
            Message::GotPiece { .. } => "GotPiece",
            Message::PieceBitfield { .. } => "PieceBitfield",
            Message::RequestBitfield => "RequestBitfield",
        }
    }
}
