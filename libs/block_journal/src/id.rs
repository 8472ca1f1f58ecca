use std::fmt;
use std::str::FromStr;

use hex::FromHex;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Implements Display-backed Debug for ID-like types whose hex form is the
/// only useful rendering.
macro_rules! fmt_as_display {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Display::fmt(self, f)
        }
    };
}

/// A 128-bit random ID, used to represent folders and clients. Displays and
/// (de)serializes as a 32-character hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Id([u8; 16]);

impl Id {
    fn generate() -> Self {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill(&mut buf);
        Id(buf)
    }
}

impl FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Id, Self::Err> {
        Self::from_hex(s)
    }
}

impl FromHex for Id {
    type Error = hex::FromHexError;

    fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, Self::Error> {
        let mut buf: [u8; 16] = [0u8; 16];
        hex::decode_to_slice(hex, &mut buf)?;
        Ok(Id(buf))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Id {
    fmt_as_display!();
}

impl Serialize for Id {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::from_str(&s).map_err(serde::de::Error::custom)
    }
}

macro_rules! id_newtype {
    ($t:ident) => {
        impl $t {
            pub fn generate() -> Self {
                $t(Id::generate())
            }

            pub const fn from_array(b: [u8; 16]) -> Self {
                $t(Id(b))
            }
        }

        impl FromStr for $t {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<$t, Self::Err> {
                Ok($t(Id::from_str(s)?))
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $t {
            fmt_as_display!();
        }
    };
}

/// Identifies one synced folder; every journal instance belongs to exactly
/// one folder.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderId(Id);
id_newtype!(FolderId);

/// Identifies the device/user that created or wrote a block reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Id);
id_newtype!(ClientId);

/// Distinguishes multiple references to the same block. The all-zero nonce
/// designates the original (primary) reference created alongside the block
/// data itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefNonce([u8; 8]);

impl RefNonce {
    pub const ZERO: RefNonce = RefNonce([0; 8]);

    pub fn generate() -> Self {
        let mut buf = [0u8; 8];
        rand::thread_rng().fill(&mut buf);
        RefNonce(buf)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for RefNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RefNonce {
    fmt_as_display!();
}

impl FromStr for RefNonce {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<RefNonce, Self::Err> {
        let mut buf = [0u8; 8];
        hex::decode_to_slice(s, &mut buf)?;
        Ok(RefNonce(buf))
    }
}

impl Serialize for RefNonce {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RefNonce {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RefNonce::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// One reference to a block: who created the block, who (if anyone) wrote
/// this particular reference, and a nonce distinguishing it from the block's
/// other references.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct BlockContext {
    pub creator: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<ClientId>,
    pub nonce: RefNonce,
}

impl BlockContext {
    /// The context of the original reference, created together with the
    /// block data.
    pub fn primary(creator: ClientId) -> Self {
        BlockContext {
            creator,
            writer: None,
            nonce: RefNonce::ZERO,
        }
    }

    pub fn secondary(creator: ClientId, writer: ClientId, nonce: RefNonce) -> Self {
        BlockContext {
            creator,
            writer: Some(writer),
            nonce,
        }
    }
}
