//! Per-block reference tracking.
//!
//! A block stays on disk for as long as it has references. Each reference is
//! keyed by its full context (creator, writer, ref nonce): distinct contexts
//! for the same block are distinct live references, so two clients that each
//! hold an ordinary primary reference to the same content-addressed block
//! coexist in the map. Every entry remembers a live/archived status and the
//! tag of the most recent operation that touched it. Tags gate removal: a
//! removal with a non-empty tag only takes effect if the stored tag matches,
//! so a flush of an old journal entry cannot strip a reference that a later
//! entry re-established.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::id::BlockContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefStatus {
    Live,
    Archived,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefEntry {
    pub context: BlockContext,
    pub status: RefStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(flatten)]
    pub unknown: HashMap<String, serde_json::Value>,
}

/// The set of references to one block, keyed by full context.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockRefs(BTreeMap<BlockContext, RefEntry>);

impl BlockRefs {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether a reference for `context` exists.
    pub fn check_exists(&self, context: &BlockContext) -> bool {
        self.0.contains_key(context)
    }

    /// Inserts or overwrites the reference for `context` with the given
    /// status and tag. Re-adding an existing context just refreshes it.
    pub fn put(&mut self, context: BlockContext, status: RefStatus, tag: &str) {
        let unknown = match self.0.remove(&context) {
            // Keep whatever sidecar fields a newer writer attached.
            Some(existing) => existing.unknown,
            None => HashMap::new(),
        };
        self.0.insert(
            context,
            RefEntry {
                context,
                status,
                tag: tag.to_owned(),
                unknown,
            },
        );
    }

    /// Removes the reference for `context`, if present. A non-empty `tag`
    /// removes the reference only when it matches the stored tag. No-op when
    /// the reference is absent.
    pub fn remove(&mut self, context: &BlockContext, tag: &str) {
        if let Some(entry) = self.0.get(context) {
            if tag.is_empty() || entry.tag == tag {
                self.0.remove(context);
            }
        }
    }

    pub fn has_non_archived_ref(&self) -> bool {
        self.0.values().any(|e| e.status == RefStatus::Live)
    }

    /// Drops every reference that fails `keep`; returns whether anything was
    /// dropped. Used by startup reconciliation.
    pub fn retain(&mut self, mut keep: impl FnMut(&RefEntry) -> bool) -> bool {
        let before = self.0.len();
        self.0.retain(|_, e| keep(e));
        self.0.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &RefEntry> {
        self.0.values()
    }
}

// On disk the map is a sequence of entries; the key is each entry's context.
// Two records for the same context cannot both be right, so a duplicate is
// rejected as corruption rather than resolved silently.
impl Serialize for BlockRefs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.values())
    }
}

impl<'de> Deserialize<'de> for BlockRefs {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<RefEntry>::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        for e in entries {
            let context = e.context;
            if map.insert(context, e).is_some() {
                return Err(serde::de::Error::custom(format!(
                    "conflicting duplicate records for reference context {context:?}"
                )));
            }
        }
        Ok(BlockRefs(map))
    }
}

/// Envelope for the serialized reference map, so that future fields survive
/// read/modify/write cycles of older binaries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RefInfo {
    #[serde(default, skip_serializing_if = "BlockRefs::is_empty")]
    pub refs: BlockRefs,
    #[serde(flatten)]
    pub unknown: HashMap<String, serde_json::Value>,
}
