//! Opaque key material handled by the journal.
//!
//! The journal never interprets key halves; it only stores them next to
//! block data and hands them back verbatim, so the type is a thin wrapper
//! around raw bytes with binary (un)marshalling.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

pub const SERVER_HALF_LEN: usize = 32;

/// The server's half of a block crypt key. Generated randomly at block
/// creation time and uploaded alongside the block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ServerHalf([u8; SERVER_HALF_LEN]);

impl ServerHalf {
    pub fn generate() -> Self {
        let mut buf = [0u8; SERVER_HALF_LEN];
        rand::thread_rng().fill(&mut buf);
        ServerHalf(buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let arr: [u8; SERVER_HALF_LEN] = buf.try_into().ok()?;
        Some(ServerHalf(arr))
    }
}

impl fmt::Display for ServerHalf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ServerHalf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for ServerHalf {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut buf = [0u8; SERVER_HALF_LEN];
        hex::decode_to_slice(s, &mut buf)?;
        Ok(ServerHalf(buf))
    }
}

impl Serialize for ServerHalf {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServerHalf {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ServerHalf::from_str(&s).map_err(serde::de::Error::custom)
    }
}
