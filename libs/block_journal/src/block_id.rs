use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The one hash type currently in use. Kept as an explicit prefix byte so the
/// on-disk format and the wire format survive a future hash migration.
const HASH_TYPE_SHA256: u8 = 0x01;

const DIGEST_LEN: usize = 32;

/// Content hash identifying a block: a one-byte hash-type prefix followed by
/// the SHA-256 digest of the block bytes. Two blocks are equal iff their IDs
/// are equal. Displays and (de)serializes as a 66-character hex string, which
/// also makes it usable as a JSON map key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId([u8; 1 + DIGEST_LEN]);

#[derive(thiserror::Error, Debug)]
pub enum BlockIdParseError {
    #[error("bad block id length {0}")]
    BadLength(usize),
    #[error("unknown hash type {0:#04x}")]
    UnknownHashType(u8),
    #[error(transparent)]
    BadHex(#[from] hex::FromHexError),
}

impl BlockId {
    /// Hashes `data` into its permanent ID.
    pub fn from_data(data: &[u8]) -> BlockId {
        let digest = Sha256::digest(data);
        let mut buf = [0u8; 1 + DIGEST_LEN];
        buf[0] = HASH_TYPE_SHA256;
        buf[1..].copy_from_slice(&digest);
        BlockId(buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for BlockId {
    type Err = BlockIdParseError;

    fn from_str(s: &str) -> Result<BlockId, Self::Err> {
        if s.len() != 2 * (1 + DIGEST_LEN) {
            return Err(BlockIdParseError::BadLength(s.len()));
        }
        let mut buf = [0u8; 1 + DIGEST_LEN];
        hex::decode_to_slice(s, &mut buf)?;
        if buf[0] != HASH_TYPE_SHA256 {
            return Err(BlockIdParseError::UnknownHashType(buf[0]));
        }
        Ok(BlockId(buf))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for BlockId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlockId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_data_is_deterministic() {
        let a = BlockId::from_data(&[1, 2, 3, 4]);
        let b = BlockId::from_data(&[1, 2, 3, 4]);
        let c = BlockId::from_data(&[1, 2, 3, 4, 5]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hex_round_trip() {
        let id = BlockId::from_data(b"some block");
        let s = id.to_string();
        assert_eq!(s.len(), 66);
        assert!(s.starts_with("01"));
        assert_eq!(s.parse::<BlockId>().unwrap(), id);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            "0abc".parse::<BlockId>(),
            Err(BlockIdParseError::BadLength(_))
        ));
        let wrong_type = format!("ff{}", "00".repeat(32));
        assert!(matches!(
            wrong_type.parse::<BlockId>(),
            Err(BlockIdParseError::UnknownHashType(0xff))
        ));
    }

    #[test]
    fn usable_as_json_map_key() {
        use std::collections::HashMap;

        let id = BlockId::from_data(&[9]);
        let mut m = HashMap::new();
        m.insert(id, 1u32);
        let json = serde_json::to_string(&m).unwrap();
        let back: HashMap<BlockId, u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
