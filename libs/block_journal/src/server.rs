//! The remote block server, as seen from the journal.
//!
//! [`BlockServer`] is the target of flushes. Implementations must accept
//! idempotent retries: re-putting a block that already exists and removing
//! references the server has never heard of both succeed. The trait is
//! deliberately unaware of journals and ordinals.
//!
//! [`MemBlockServer`] is the in-memory reference implementation, used by
//! tests and local tooling.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::block_id::BlockId;
use crate::crypto::ServerHalf;
use crate::id::{BlockContext, FolderId};
use crate::refs::RefStatus;

#[derive(thiserror::Error, Debug)]
pub enum BlockServerError {
    /// The requested block or reference is not held by the server. Expected
    /// and recoverable; callers rely on distinguishing this kind.
    #[error("block {0} does not exist on the server")]
    BlockNonExistent(BlockId),

    #[error("block {id}: rejected by server: {reason}")]
    BadRequest { id: BlockId, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    /// Connectivity-level failure; the operation may succeed if retried.
    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),
}

impl BlockServerError {
    /// Whether retrying the operation cannot possibly help.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, BlockServerError::Transport(_))
    }
}

#[allow(async_fn_in_trait)]
pub trait BlockServer {
    /// Stores a block and its primary reference. Re-putting an existing
    /// block succeeds as long as the key server half matches.
    async fn put_block(
        &self,
        folder: FolderId,
        id: BlockId,
        context: &BlockContext,
        data: &[u8],
        server_half: &ServerHalf,
    ) -> Result<(), BlockServerError>;

    /// Adds a reference to a block the server already holds.
    async fn add_block_reference(
        &self,
        folder: FolderId,
        id: BlockId,
        context: &BlockContext,
    ) -> Result<(), BlockServerError>;

    /// Marks the listed references as archived.
    async fn archive_block_references(
        &self,
        folder: FolderId,
        contexts: &HashMap<BlockId, Vec<BlockContext>>,
    ) -> Result<(), BlockServerError>;

    /// Removes the listed references, returning the number of references
    /// remaining per block. References the server does not know are accepted
    /// and count as already removed.
    async fn remove_block_references(
        &self,
        folder: FolderId,
        contexts: &HashMap<BlockId, Vec<BlockContext>>,
    ) -> Result<HashMap<BlockId, usize>, BlockServerError>;

    /// Fetches a block through one of its references.
    async fn get_block(
        &self,
        folder: FolderId,
        id: BlockId,
        context: &BlockContext,
    ) -> Result<(Vec<u8>, ServerHalf), BlockServerError>;
}

struct MemBlock {
    data: Vec<u8>,
    server_half: ServerHalf,
    // Keyed by the full context: distinct contexts are distinct references,
    // even when they share the zero primary nonce.
    refs: BTreeMap<BlockContext, RefStatus>,
}

/// In-memory [`BlockServer`], with the same reference-counting behavior a
/// real server exhibits: block data lives for as long as it has references.
#[derive(Default)]
pub struct MemBlockServer {
    blocks: Mutex<HashMap<(FolderId, BlockId), MemBlock>>,
}

impl MemBlockServer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockServer for MemBlockServer {
    async fn put_block(
        &self,
        folder: FolderId,
        id: BlockId,
        context: &BlockContext,
        data: &[u8],
        server_half: &ServerHalf,
    ) -> Result<(), BlockServerError> {
        if BlockId::from_data(data) != id {
            return Err(BlockServerError::BadRequest {
                id,
                reason: "data does not hash to its id".to_owned(),
            });
        }
        let mut blocks = self.blocks.lock().unwrap();
        let block = blocks.entry((folder, id)).or_insert_with(|| MemBlock {
            data: data.to_vec(),
            server_half: *server_half,
            refs: BTreeMap::new(),
        });
        if block.server_half != *server_half {
            return Err(BlockServerError::BadRequest {
                id,
                reason: "key server half mismatch on repeated put".to_owned(),
            });
        }
        block.refs.insert(*context, RefStatus::Live);
        Ok(())
    }

    async fn add_block_reference(
        &self,
        folder: FolderId,
        id: BlockId,
        context: &BlockContext,
    ) -> Result<(), BlockServerError> {
        let mut blocks = self.blocks.lock().unwrap();
        let block = blocks
            .get_mut(&(folder, id))
            .ok_or(BlockServerError::BlockNonExistent(id))?;
        block.refs.insert(*context, RefStatus::Live);
        Ok(())
    }

    async fn archive_block_references(
        &self,
        folder: FolderId,
        contexts: &HashMap<BlockId, Vec<BlockContext>>,
    ) -> Result<(), BlockServerError> {
        let mut blocks = self.blocks.lock().unwrap();
        for (id, id_contexts) in contexts {
            let block = blocks
                .get_mut(&(folder, *id))
                .ok_or(BlockServerError::BlockNonExistent(*id))?;
            for context in id_contexts {
                block.refs.insert(*context, RefStatus::Archived);
            }
        }
        Ok(())
    }

    async fn remove_block_references(
        &self,
        folder: FolderId,
        contexts: &HashMap<BlockId, Vec<BlockContext>>,
    ) -> Result<HashMap<BlockId, usize>, BlockServerError> {
        let mut blocks = self.blocks.lock().unwrap();
        let mut live_counts = HashMap::new();
        for (id, id_contexts) in contexts {
            let Some(block) = blocks.get_mut(&(folder, *id)) else {
                // Unknown references are accepted as already removed.
                live_counts.insert(*id, 0);
                continue;
            };
            for context in id_contexts {
                block.refs.remove(context);
            }
            live_counts.insert(*id, block.refs.len());
            if block.refs.is_empty() {
                blocks.remove(&(folder, *id));
            }
        }
        Ok(live_counts)
    }

    async fn get_block(
        &self,
        folder: FolderId,
        id: BlockId,
        context: &BlockContext,
    ) -> Result<(Vec<u8>, ServerHalf), BlockServerError> {
        let blocks = self.blocks.lock().unwrap();
        let block = blocks
            .get(&(folder, id))
            .ok_or(BlockServerError::BlockNonExistent(id))?;
        if !block.refs.contains_key(context) {
            return Err(BlockServerError::BlockNonExistent(id));
        }
        Ok((block.data.clone(), block.server_half))
    }
}
