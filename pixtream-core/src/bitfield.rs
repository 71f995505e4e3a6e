//! Piece bitfield: one bit per sequence from `first` to `last` inclusive, MSB-first.

use std::collections::BTreeSet;

use crate::wire::DecodeError;

/// Widest range of sequences a bitfield message covers; 128 KiB of bits.
pub const MAX_BITFIELD_SPAN: u32 = 1 << 20;

/// Encode a set of sequences. Returns `(first, last, bits)`; the empty set is `(0, 0, [])`.
pub fn encode_bitfield(pieces: &BTreeSet<u32>) -> (u32, u32, Vec<u8>) {
    let (first, last) = match (pieces.first(), pieces.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => return (0, 0, Vec::new()),
    };
    let mut bits = vec![0u8; byte_len(first, last)];
    for &seq in pieces {
        let i = (seq - first) as usize;
        bits[i / 8] |= 0x80 >> (i % 8);
    }
    (first, last, bits)
}

/// Decode a bitfield payload back into the set of sequences it marks.
pub fn decode_bitfield(first: u32, last: u32, bits: &[u8]) -> Result<BTreeSet<u32>, DecodeError> {
    if bits.is_empty() {
        return Ok(BTreeSet::new());
    }
    if last < first {
        return Err(DecodeError::Malformed {
            tag: crate::protocol::tag::PIECE_BITFIELD,
            reason: "bitfield range is inverted",
        });
    }
    if bits.len() != byte_len(first, last) {
        return Err(DecodeError::Malformed {
            tag: crate::protocol::tag::PIECE_BITFIELD,
            reason: "bitfield length does not match range",
        });
    }
    let span = u64::from(last - first) + 1;
    let mut out = BTreeSet::new();
    for (byte_index, &byte) in bits.iter().enumerate() {
        if byte == 0 {
            continue;
        }
        for bit in 0..8u64 {
            let i = byte_index as u64 * 8 + bit;
            // Padding bits past `last` are ignored.
            if i >= span {
                break;
            }
            if byte & (0x80 >> bit) != 0 {
                out.insert(first + i as u32);
            }
        }
    }
    Ok(out)
}

fn byte_len(first: u32, last: u32) -> usize {
    let span = u64::from(last - first) + 1;
    span.div_ceil(8) as usize
}
