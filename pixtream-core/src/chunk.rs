//! Stream boundary: split an outbound byte stream into sequenced pieces, join pieces back in order.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

/// Default piece size in bytes.
pub const DEFAULT_PIECE_SIZE: usize = 64_000;

/// A sequenced chunk of the stream. Immutable once created at the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub sequence: u32,
    pub data: Bytes,
}

impl Piece {
    pub fn new(sequence: u32, data: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            data: data.into(),
        }
    }
}

/// Chunks a continuous byte stream into fixed-size pieces, numbering them from 0.
#[derive(Debug)]
pub struct Splitter {
    piece_size: usize,
    buffer: BytesMut,
    next_sequence: u32,
}

impl Splitter {
    pub fn new(piece_size: usize) -> Self {
        let piece_size = if piece_size == 0 {
            DEFAULT_PIECE_SIZE
        } else {
            piece_size
        };
        Self {
            piece_size,
            buffer: BytesMut::new(),
            next_sequence: 0,
        }
    }

    /// Buffer `data`; return every full piece now available.
    pub fn push_stream(&mut self, data: &[u8]) -> Vec<Piece> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();
        while self.buffer.len() >= self.piece_size {
            let chunk = self.buffer.split_to(self.piece_size).freeze();
            out.push(self.make_piece(chunk));
        }
        out
    }

    /// Flush whatever is left as a final, shorter piece.
    pub fn end_stream(&mut self) -> Option<Piece> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split().freeze();
        Some(self.make_piece(rest))
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    fn make_piece(&mut self, data: Bytes) -> Piece {
        let piece = Piece::new(self.next_sequence, data);
        self.next_sequence = self.next_sequence.wrapping_add(1);
        piece
    }
}

/// Reassembles pieces delivered out of order into the original contiguous stream.
#[derive(Debug, Default)]
pub struct Joiner {
    next_sequence: u32,
    pending: BTreeMap<u32, Bytes>,
    finished: bool,
}

impl Joiner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a piece; return the bytes that became contiguous, if any.
    /// Pieces below the join point and duplicates are ignored.
    pub fn push_piece(&mut self, piece: Piece) -> Option<Bytes> {
        if self.finished || piece.sequence < self.next_sequence {
            return None;
        }
        self.pending.entry(piece.sequence).or_insert(piece.data);

        let mut out = BytesMut::new();
        let mut joined_any = false;
        while let Some(data) = self.pending.remove(&self.next_sequence) {
            out.extend_from_slice(&data);
            joined_any = true;
            match self.next_sequence.checked_add(1) {
                Some(next) => self.next_sequence = next,
                None => {
                    self.finished = true;
                    break;
                }
            }
        }
        joined_any.then(|| out.freeze())
    }

    /// Stop joining. Pieces still pending (a gap was never filled) are discarded.
    pub fn end_join(&mut self) -> usize {
        self.finished = true;
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Sequences received but not yet joined.
    pub fn pending_sequences(&self) -> impl Iterator<Item = u32> + '_ {
        self.pending.keys().copied()
    }

    /// Next sequence the joiner is waiting for.
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }
}
