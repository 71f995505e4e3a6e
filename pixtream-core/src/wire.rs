//! Framing: length-prefix (4 bytes BE) + tagged message body.
//!
//! Every message starts with a one-byte tag. Fixed-layout messages have a known total size;
//! variable-layout messages have a fixed header and a payload that runs to the end of the frame.
//! Decoding goes through a registry keyed by tag, so adding a message means adding one entry.

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::bitfield::{decode_bitfield, encode_bitfield};
use crate::identity::{PeerId, PEER_ID_LEN};
use crate::protocol::{tag, Handshake, Message};

const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Total size of a handshake including the tag.
pub const HANDSHAKE_LEN: usize = 1 + 17 + 8 + PEER_ID_LEN;

type Decoder = fn(&[u8]) -> Result<Message, DecodeError>;

/// Registry entry: layout of one tag and its decoder. `size` counts the tag byte; for variable
/// messages it is the header size.
struct Layout {
    tag: u8,
    size: usize,
    variable: bool,
    decode: Decoder,
}

const REGISTRY: &[Layout] = &[
    Layout { tag: tag::HANDSHAKE, size: HANDSHAKE_LEN, variable: false, decode: decode_handshake },
    Layout { tag: tag::DATA_PACKET, size: 5, variable: true, decode: decode_data_packet },
    Layout { tag: tag::REQUEST_PIECE, size: 5, variable: false, decode: decode_request_piece },
    Layout { tag: tag::CANCEL_REQUEST, size: 5, variable: false, decode: decode_cancel_request },
    Layout { tag: tag::HEART_BEAT, size: 1, variable: false, decode: decode_heart_beat },
    Layout { tag: tag::CHOKE, size: 1, variable: false, decode: decode_choke },
    Layout { tag: tag::UNCHOKE, size: 1, variable: false, decode: decode_unchoke },
    Layout { tag: tag::INTERESTED, size: 1, variable: false, decode: decode_interested },
    Layout { tag: tag::NOT_INTERESTED, size: 1, variable: false, decode: decode_not_interested },
    Layout { tag: tag::GOT_PIECE, size: 5, variable: false, decode: decode_got_piece },
    Layout { tag: tag::PIECE_BITFIELD, size: 9, variable: true, decode: decode_piece_bitfield },
    Layout { tag: tag::REQUEST_BITFIELD, size: 1, variable: false, decode: decode_request_bitfield },
];

fn layout_for(t: u8) -> Option<&'static Layout> {
    REGISTRY.iter().find(|l| l.tag == t)
}

/// Error decoding a single message body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("malformed message {tag:#04x}: {reason}")]
    Malformed { tag: u8, reason: &'static str },
}

/// Decode one message body (no length prefix).
pub fn decode_message(bytes: &[u8]) -> Result<Message, DecodeError> {
    let &t = bytes.first().ok_or(DecodeError::Empty)?;
    let layout = layout_for(t).ok_or(DecodeError::UnknownTag(t))?;
    if layout.variable {
        if bytes.len() < layout.size {
            return Err(DecodeError::Malformed {
                tag: t,
                reason: "shorter than message header",
            });
        }
    } else if bytes.len() != layout.size {
        return Err(DecodeError::Malformed {
            tag: t,
            reason: "length does not match fixed size",
        });
    }
    (layout.decode)(&bytes[1..])
}

/// Encode one message body (no length prefix).
pub fn encode_message(msg: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(msg.tag());
    match msg {
        Message::Handshake(hs) => {
            buf.reserve(HANDSHAKE_LEN - 1);
            buf.put_slice(&hs.protocol_id);
            buf.put_slice(&hs.reserved);
            buf.put_slice(hs.peer_id.as_bytes());
        }
        Message::DataPacket { sequence, data } => {
            buf.reserve(4 + data.len());
            buf.put_u32(*sequence);
            buf.put_slice(data);
        }
        Message::RequestPiece { sequence }
        | Message::CancelRequest { sequence }
        | Message::GotPiece { sequence } => buf.put_u32(*sequence),
        Message::PieceBitfield { pieces } => {
            let (first, last, bits) = encode_bitfield(pieces);
            buf.reserve(8 + bits.len());
            buf.put_u32(first);
            buf.put_u32(last);
            buf.put_slice(&bits);
        }
        Message::HeartBeat
        | Message::Choke
        | Message::Unchoke
        | Message::Interested
        | Message::NotInterested
        | Message::RequestBitfield => {}
    }
    buf.freeze()
}

fn decode_heart_beat(_: &[u8]) -> Result<Message, DecodeError> {
    Ok(Message::HeartBeat)
}

fn decode_choke(_: &[u8]) -> Result<Message, DecodeError> {
    Ok(Message::Choke)
}

fn decode_unchoke(_: &[u8]) -> Result<Message, DecodeError> {
    Ok(Message::Unchoke)
}

fn decode_interested(_: &[u8]) -> Result<Message, DecodeError> {
    Ok(Message::Interested)
}

fn decode_not_interested(_: &[u8]) -> Result<Message, DecodeError> {
    Ok(Message::NotInterested)
}

fn decode_request_bitfield(_: &[u8]) -> Result<Message, DecodeError> {
    Ok(Message::RequestBitfield)
}

fn decode_handshake(mut body: &[u8]) -> Result<Message, DecodeError> {
    let mut protocol_id = [0u8; 17];
    body.copy_to_slice(&mut protocol_id);
    let mut reserved = [0u8; 8];
    body.copy_to_slice(&mut reserved);
    let peer_id = PeerId::from_bytes(body).map_err(|_| DecodeError::Malformed {
        tag: tag::HANDSHAKE,
        reason: "peer id is not 20 bytes",
    })?;
    Ok(Message::Handshake(Handshake {
        protocol_id,
        reserved,
        peer_id,
    }))
}

fn decode_data_packet(mut body: &[u8]) -> Result<Message, DecodeError> {
    let sequence = body.get_u32();
    Ok(Message::DataPacket {
        sequence,
        data: Bytes::copy_from_slice(body),
    })
}

fn decode_request_piece(mut body: &[u8]) -> Result<Message, DecodeError> {
    Ok(Message::RequestPiece {
        sequence: body.get_u32(),
    })
}

fn decode_cancel_request(mut body: &[u8]) -> Result<Message, DecodeError> {
    Ok(Message::CancelRequest {
        sequence: body.get_u32(),
    })
}

fn decode_got_piece(mut body: &[u8]) -> Result<Message, DecodeError> {
    Ok(Message::GotPiece {
        sequence: body.get_u32(),
    })
}

fn decode_piece_bitfield(mut body: &[u8]) -> Result<Message, DecodeError> {
    let first = body.get_u32();
    let last = body.get_u32();
    let pieces: BTreeSet<u32> = decode_bitfield(first, last, body)?;
    Ok(Message::PieceBitfield { pieces })
}

/// Encode a message into a single frame: 4 bytes BE length + message body.
pub fn encode_frame(msg: &Message) -> Result<Bytes, FrameEncodeError> {
    let body = encode_message(msg);
    let len = u32::try_from(body.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = BytesMut::with_capacity(LEN_SIZE + body.len());
    out.put_u32(len);
    out.put_slice(&body);
    Ok(out.freeze())
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let len = frame_len(bytes)?;
    let msg = decode_message(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

fn frame_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok(len)
}

/// Error decoding a frame (need more bytes, too large, or a bad message body).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Incremental length-prefixed record reader, independent of message semantics.
/// Buffers transport bytes and hands out one complete record body at a time.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete record body, `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameDecodeError> {
        match frame_len(&self.buf) {
            Ok(len) => {
                self.buf.advance(LEN_SIZE);
                Ok(Some(self.buf.split_to(len).freeze()))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
