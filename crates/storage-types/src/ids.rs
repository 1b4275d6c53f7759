//! Storage indices, share numbers and node identifiers.
//!
//! Storage indices are rendered with Tahoe-LAFS's base32 alphabet (lowercase
//! RFC 4648, unpadded) for filesystem sharding: see `SPEC_FULL.md` §3.1a.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use data_encoding::{DecodeError, Encoding, Specification};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

/// Length in bytes of a storage index.
pub const STORAGE_INDEX_LEN: usize = 16;

/// Length in bytes of a server node identifier.
pub const NODE_ID_LEN: usize = 20;

/// The 32-symbol alphabet storage indices are rendered with. Also the
/// alphabet the crawler (`storage-crawler`) draws its 1,024 two-character
/// prefixes from (spec.md §3.5).
pub const BASE32_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz234567";

fn base32_tahoe() -> &'static Encoding {
    static ENC: OnceLock<Encoding> = OnceLock::new();
    ENC.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols.push_str(BASE32_ALPHABET);
        spec.padding = None;
        spec.encoding().expect("tahoe base32 alphabet is valid")
    })
}

/// 16-byte opaque identifier of a share-set (one immutable file or mutable slot).
///
/// Used as the filesystem sharding key: `<basedir>/shares/<prefix>/<si>/`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageIndex(pub [u8; STORAGE_INDEX_LEN]);

impl StorageIndex {
    pub fn new(bytes: [u8; STORAGE_INDEX_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; STORAGE_INDEX_LEN] {
        &self.0
    }

    /// Full base32 rendering of this storage index (26 characters, unpadded).
    pub fn to_base32(&self) -> String {
        base32_tahoe().encode(&self.0)
    }

    /// The two-character directory prefix used to shard shares on disk.
    pub fn prefix(&self) -> String {
        let full = self.to_base32();
        full[..2].to_string()
    }

    pub fn from_base32(s: &str) -> Result<Self, DecodeError> {
        let decoded = base32_tahoe().decode(s.as_bytes())?;
        let mut bytes = [0u8; STORAGE_INDEX_LEN];
        let n = decoded.len().min(STORAGE_INDEX_LEN);
        bytes[..n].copy_from_slice(&decoded[..n]);
        Ok(Self(bytes))
    }
}

impl fmt::Debug for StorageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageIndex({})", self.to_base32())
    }
}

impl fmt::Display for StorageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base32())
    }
}

impl FromStr for StorageIndex {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base32(s)
    }
}

// Serialized as base32 so crawler/lease-checker state files and
// corruption-advisory records stay human-readable JSON.
impl Serialize for StorageIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for StorageIndex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base32(&s).map_err(D::Error::custom)
    }
}

/// Non-negative share number, at most 255 (one of up to 256 shares per
/// storage index).
pub type ShareNumber = u8;

/// Maximum number of shares a single storage index may hold.
pub const MAX_SHARES_PER_SI: usize = 256;

/// 20-byte server identity, derived from the server's signing key.
///
/// Stamped into the write-enabler of mutable shares a server originally
/// accepts, so a future `BadWriteEnablerError` can hint at the node that
/// actually holds the share.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_base32(&self) -> String {
        base32_tahoe().encode(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_base32())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_index_base32_roundtrip() {
        let si = StorageIndex::new([0x42; STORAGE_INDEX_LEN]);
        let encoded = si.to_base32();
        assert_eq!(encoded.len(), 26);
        let decoded = StorageIndex::from_base32(&encoded).unwrap();
        assert_eq!(si, decoded);
    }

    #[test]
    fn prefix_is_first_two_chars() {
        let si = StorageIndex::new([0u8; STORAGE_INDEX_LEN]);
        assert_eq!(si.prefix(), si.to_base32()[..2].to_string());
        assert_eq!(si.prefix().len(), 2);
    }

    #[test]
    fn alphabet_is_lowercase_unpadded() {
        let si = StorageIndex::new([0xff; STORAGE_INDEX_LEN]);
        let encoded = si.to_base32();
        assert!(encoded.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(!encoded.contains('='));
    }
}
