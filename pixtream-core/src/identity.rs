//! Peer identity: 20-byte peer ID used as the key for connection dedup and piece ownership.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a peer ID on the wire and in the tracker payload.
pub const PEER_ID_LEN: usize = 20;

/// Length of the hex text form used for IDs that are not printable.
const PEER_ID_HEX_LEN: usize = 2 * PEER_ID_LEN;

/// Prefix of every generated ID (client tag + version).
const PEER_ID_PREFIX: &str = "PX0001";

/// Opaque, immutable peer identifier. Ordering is byte-lexicographic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Generate a fresh printable ID: `PX0001` + 14 hex chars of a random v4 UUID.
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        let mut id = [0u8; PEER_ID_LEN];
        id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX.as_bytes());
        id[PEER_ID_PREFIX.len()..].copy_from_slice(&hex.as_bytes()[..PEER_ID_LEN - PEER_ID_PREFIX.len()]);
        PeerId(id)
    }

    pub const fn new(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId(bytes)
    }

    /// Build from a slice; anything other than exactly 20 bytes is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidPeerId> {
        let arr: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| InvalidPeerId(bytes.len()))?;
        Ok(PeerId(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    fn is_printable(&self) -> bool {
        self.0.iter().all(|b| b.is_ascii_graphic())
    }
}

/// Text form: the raw bytes when all are ASCII graphic, else 40 lowercase hex digits.
/// `FromStr` accepts both, so the text form always parses back to the same ID.
impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if self.is_printable() => f.write_str(s),
            _ => f.write_str(&hex::encode(self.0)),
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl std::str::FromStr for PeerId {
    type Err = InvalidPeerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == PEER_ID_HEX_LEN {
            let mut id = [0u8; PEER_ID_LEN];
            hex::decode_to_slice(s, &mut id).map_err(|_| InvalidPeerId(s.len()))?;
            return Ok(PeerId(id));
        }
        PeerId::from_bytes(s.as_bytes())
    }
}

// Tracker JSON and query strings carry IDs in their text form.
impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Text that is neither 20 raw bytes nor 40 hex digits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("peer id must be {PEER_ID_LEN} bytes or {PEER_ID_HEX_LEN} hex digits, got {0} bytes")]
pub struct InvalidPeerId(pub usize);
