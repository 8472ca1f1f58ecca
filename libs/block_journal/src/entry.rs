//! The records appended to the ordinal log.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block_id::BlockId;
use crate::error::JournalError;
use crate::id::BlockContext;

/// Revision number of the folder's metadata history. Each md-revision marker
/// in the log carries the revision whose blocks precede it; `UNINITIALIZED`
/// is the sentinel carried by every other entry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MdRevision(u64);

impl MdRevision {
    pub const UNINITIALIZED: MdRevision = MdRevision(0);
    pub const INITIAL: MdRevision = MdRevision(1);

    pub const fn new(v: u64) -> Self {
        MdRevision(v)
    }

    pub fn is_uninitialized(&self) -> bool {
        *self == Self::UNINITIALIZED
    }
}

impl fmt::Display for MdRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_uninitialized() {
            f.write_str("uninitialized")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Debug for MdRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JournalOp {
    Put,
    AddRef,
    Archive,
    Remove,
    MdRevMarker,
}

impl fmt::Display for JournalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JournalOp::Put => "put",
            JournalOp::AddRef => "addRef",
            JournalOp::Archive => "archive",
            JournalOp::Remove => "remove",
            JournalOp::MdRevMarker => "mdRevMarker",
        };
        f.write_str(s)
    }
}

/// One record in the ordinal log.
///
/// `contexts` is empty for md-revision markers and `revision` is
/// `UNINITIALIZED` for everything else. `ignored` marks an entry that must
/// still be walked (and counted) during flush but contributes no server
/// work. Unseen fields written by newer binaries ride along in `unknown`
/// and are re-emitted verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub op: JournalOp,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub contexts: HashMap<BlockId, Vec<BlockContext>>,
    #[serde(default, skip_serializing_if = "MdRevision::is_uninitialized")]
    pub revision: MdRevision,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
    #[serde(flatten)]
    pub unknown: HashMap<String, serde_json::Value>,
}

impl JournalEntry {
    fn new(op: JournalOp, contexts: HashMap<BlockId, Vec<BlockContext>>) -> Self {
        JournalEntry {
            op,
            contexts,
            revision: MdRevision::UNINITIALIZED,
            ignored: false,
            unknown: HashMap::new(),
        }
    }

    pub fn put(id: BlockId, context: BlockContext) -> Self {
        Self::new(JournalOp::Put, HashMap::from([(id, vec![context])]))
    }

    pub fn add_ref(id: BlockId, context: BlockContext) -> Self {
        Self::new(JournalOp::AddRef, HashMap::from([(id, vec![context])]))
    }

    pub fn archive(contexts: HashMap<BlockId, Vec<BlockContext>>) -> Self {
        Self::new(JournalOp::Archive, contexts)
    }

    pub fn remove(contexts: HashMap<BlockId, Vec<BlockContext>>) -> Self {
        Self::new(JournalOp::Remove, contexts)
    }

    pub fn md_rev_marker(revision: MdRevision) -> Self {
        JournalEntry {
            revision,
            ..Self::new(JournalOp::MdRevMarker, HashMap::new())
        }
    }

    /// Put and add-ref entries carry exactly one context for exactly one
    /// block; anything else in such an entry is corruption.
    pub fn single_context(&self) -> Result<(BlockId, BlockContext), JournalError> {
        if self.contexts.len() == 1 {
            let (id, contexts) = self.contexts.iter().next().expect("len checked");
            if let [context] = contexts.as_slice() {
                return Ok((*id, *context));
            }
        }
        Err(JournalError::Corrupt(format!(
            "{} entry does not have exactly one context: {:?}",
            self.op, self.contexts
        )))
    }

    /// Whether this entry mentions any of the given block IDs.
    pub fn references_any(&self, ids: &std::collections::HashSet<BlockId>) -> bool {
        self.contexts.keys().any(|id| ids.contains(id))
    }
}
