use crate::block_id::BlockId;
use crate::crypto::ServerHalf;
use crate::server::BlockServerError;

/// Errors surfaced by the journal and its on-disk stores.
///
/// `BlockNonExistent` is the only kind callers are expected to handle as part
/// of normal operation; everything else is either a caller bug, corruption,
/// or an I/O failure propagated verbatim.
#[derive(thiserror::Error, Debug)]
pub enum JournalError {
    #[error("block {0} does not exist")]
    BlockNonExistent(BlockId),

    #[error("block {id} is corrupt: data hashes to {computed}")]
    BadHash { id: BlockId, computed: BlockId },

    #[error("block {id}: key server half mismatch: expected {expected}, got {got}")]
    ServerHalfMismatch {
        id: BlockId,
        expected: ServerHalf,
        got: ServerHalf,
    },

    #[error("corrupt journal state: {0}")]
    Corrupt(String),

    #[error("journal out of sync: {0}")]
    OutOfSync(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Server(#[from] BlockServerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// A deserialize failure of a persisted record means the record is damaged:
// there is no newer schema to fall back to, only corruption.
impl From<serde_json::Error> for JournalError {
    fn from(e: serde_json::Error) -> Self {
        JournalError::Corrupt(e.to_string())
    }
}
