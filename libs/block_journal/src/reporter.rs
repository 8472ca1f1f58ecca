//! Fire-and-forget progress notifications.
//!
//! The surrounding application (status bars, sync indicators) wants to know
//! how a flush is going; the journal must never block or fail on its
//! account, so every method is infallible and expected to return quickly.

use crate::block_id::BlockId;
use crate::entry::MdRevision;
use crate::id::FolderId;

pub trait Reporter {
    /// A batch of journal entries was applied to the server.
    fn notify_blocks_flushed(&self, _folder: FolderId, _entries: usize) {}

    /// A block's local storage was reclaimed after its last journal entry
    /// flushed.
    fn notify_block_reclaimed(&self, _folder: FolderId, _id: BlockId) {}

    /// The flusher reached a metadata revision marker.
    fn notify_md_revision_flushed(&self, _folder: FolderId, _revision: MdRevision) {}
}

/// Reporter that drops every notification.
pub struct NoopReporter;

impl Reporter for NoopReporter {}

/// Reporter that forwards notifications to the `tracing` subscriber.
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn notify_blocks_flushed(&self, folder: FolderId, entries: usize) {
        tracing::debug!("folder {folder}: flushed {entries} journal entries");
    }

    fn notify_block_reclaimed(&self, folder: FolderId, id: BlockId) {
        tracing::debug!("folder {folder}: reclaimed local storage of block {id}");
    }

    fn notify_md_revision_flushed(&self, folder: FolderId, revision: MdRevision) {
        tracing::debug!("folder {folder}: flushed blocks for metadata revision {revision}");
    }
}
