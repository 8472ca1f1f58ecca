//! Crash-safe, append-only journal of block-storage mutations, backed by a
//! content-addressed on-disk block store.
//!
//! A filesystem client creates one [`BlockJournal`] per synced folder and
//! funnels its block puts, reference adds, archivals, and removals through
//! it. The journal buffers everything durably while the block server is
//! unreachable or slow; a scheduler later drains it with
//! [`flush::flush_journal`], which applies the entries in order to a
//! [`server::BlockServer`] and reclaims local disk space as entries leave
//! the log.
//!
//! The journal is synchronous and single-writer; only the server interface
//! and the flush driver are async. See the module docs of [`journal`],
//! [`disk_store`], and [`ordinal_log`] for the on-disk formats and their
//! crash-consistency rules.

pub mod block_id;
pub mod crypto;
pub mod disk_store;
pub mod entry;
pub mod error;
pub mod flush;
pub mod id;
pub mod journal;
pub mod ordinal_log;
pub mod refs;
pub mod reporter;
pub mod server;

pub use block_id::BlockId;
pub use crypto::ServerHalf;
pub use entry::MdRevision;
pub use error::JournalError;
pub use id::{BlockContext, ClientId, FolderId, RefNonce};
pub use journal::BlockJournal;
pub use reporter::Reporter;
pub use server::{BlockServer, BlockServerError, MemBlockServer};
