//! Pixtream peer-to-peer live streaming protocol core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod bitfield;
pub mod chunk;
pub mod connection;
pub mod core;
pub mod identity;
pub mod manager;
pub mod piece_manager;
pub mod protocol;
pub mod timer;
pub mod tracker;
pub mod utility;
pub mod wire;

pub use crate::core::{ConnectionError, Node, NodeConfig, OutboundAction};
pub use chunk::{Joiner, Piece, Splitter, DEFAULT_PIECE_SIZE};
pub use connection::{ConnId, ProtocolViolation};
pub use identity::PeerId;
pub use manager::AdmissionError;
pub use protocol::{Handshake, Message};
pub use tracker::{AnnounceResponse, PeerDatabase, TrackerPeer};
pub use wire::{decode_frame, encode_frame, DecodeError, FrameDecodeError, FrameEncodeError};
