//! The per-folder block journal.
//!
//! A journal buffers block mutations issued by the local filesystem client
//! while the block server is unreachable or slow, then lets a flusher apply
//! them in order and reclaim local disk space. It composes the block disk
//! store, the ordinal log, and a durable counter of unflushed bytes, under
//! one root directory:
//!
//! ```text
//! dir/blocks/           content-addressed block storage
//! dir/block_journal/    ordinal log of journal entries
//! dir/aggregate_info    serialized unflushed-bytes counter
//! dir/saved_blocks/     holding area, present only in save-until-md-flush mode
//! ```
//!
//! Exactly one journal owns a root directory at a time, and a journal is not
//! safe under concurrent mutation; callers serialize.
//!
//! Every store mutation is tagged with the ordinal of the entry about to
//! record it. When that entry is later flushed, only references still
//! carrying its tag are dropped, so a reference re-established by a later
//! entry survives. A block whose last reference goes away at flush time has
//! its local storage reclaimed (or parked in the holding area).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utils::crashsafe;
use utils::fs_ext::ignore_not_found;

use crate::block_id::BlockId;
use crate::crypto::ServerHalf;
use crate::disk_store::BlockDiskStore;
use crate::entry::{JournalEntry, JournalOp, MdRevision};
use crate::error::JournalError;
use crate::id::{BlockContext, FolderId};
use crate::ordinal_log::{Ordinal, OrdinalLog};
use crate::refs::{BlockRefs, RefStatus};
use crate::reporter::Reporter;

const BLOCKS_DIR: &str = "blocks";
const LOG_DIR: &str = "block_journal";
const AGGREGATE_INFO_FILENAME: &str = "aggregate_info";
const SAVED_BLOCKS_DIR: &str = "saved_blocks";

pub fn aggregate_info_path(dir: &Utf8Path) -> Utf8PathBuf {
    dir.join(AGGREGATE_INFO_FILENAME)
}

/// Durable counter of bytes put into the journal but not yet flushed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct AggregateInfo {
    #[serde(default)]
    unflushed_bytes: u64,
    #[serde(flatten)]
    unknown: HashMap<String, serde_json::Value>,
}

/// One batch of journal entries ready to be applied to the block server,
/// pre-classified so the flusher does not touch the store again. `puts`
/// carry their data and key halves; `adds` are bare references; everything
/// else (archives, removes, markers, ignored entries) stays in `other` in
/// log order. All entries of the batch, classified or not, are listed in
/// `entries` for later removal.
#[derive(Default)]
pub struct BlockEntriesToFlush {
    pub(crate) entries: Vec<(Ordinal, JournalEntry)>,
    pub(crate) puts: Vec<FlushableBlockPut>,
    pub(crate) adds: Vec<(BlockId, BlockContext)>,
    pub(crate) other: Vec<JournalEntry>,
}

pub struct FlushableBlockPut {
    pub id: BlockId,
    pub context: BlockContext,
    pub data: Vec<u8>,
    pub server_half: ServerHalf,
}

impl BlockEntriesToFlush {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn puts(&self) -> &[FlushableBlockPut] {
        &self.puts
    }

    pub fn adds(&self) -> &[(BlockId, BlockContext)] {
        &self.adds
    }

    pub fn other(&self) -> &[JournalEntry] {
        &self.other
    }
}

pub struct BlockJournal {
    dir: Utf8PathBuf,
    store: BlockDiskStore,
    log: OrdinalLog,
    aggregate: AggregateInfo,
    saved_store: Option<BlockDiskStore>,
}

impl BlockJournal {
    /// Opens (or creates) the journal rooted at `dir`, reconciling on-disk
    /// state left behind by a crash.
    pub fn new(dir: Utf8PathBuf) -> Result<Self, JournalError> {
        crashsafe::create_dir_durable(&dir)?;
        let store = BlockDiskStore::new(dir.join(BLOCKS_DIR));
        crashsafe::create_dir_durable(store.dir())?;
        let log = OrdinalLog::open(dir.join(LOG_DIR))?;

        let saved_dir = dir.join(SAVED_BLOCKS_DIR);
        let saved_store = if saved_dir.try_exists()? {
            Some(BlockDiskStore::new(saved_dir))
        } else {
            None
        };

        let mut journal = BlockJournal {
            dir,
            store,
            log,
            aggregate: AggregateInfo::default(),
            saved_store,
        };
        journal.reconcile_on_startup()?;
        Ok(journal)
    }

    /// The log decides what must still flush; the store decides what bytes
    /// exist. A crash can interleave the two: a store mutation may land
    /// without its log entry (the tag points past `latest`), or an entry
    /// removal may land without its reference cleanup (the tag points below
    /// `earliest`). Both leave references whose tag is outside the live log
    /// range; those are dropped here, and blocks left with neither
    /// references nor remaining log entries are reclaimed.
    fn reconcile_on_startup(&mut self) -> Result<(), JournalError> {
        let range = self.log.range()?;

        let mut referenced_ids = HashSet::new();
        let mut computed_bytes = 0u64;
        if let Some((earliest, latest)) = range {
            let mut ordinal = earliest;
            while ordinal <= latest {
                let entry = self.log.read_entry(ordinal)?;
                referenced_ids.extend(entry.contexts.keys().copied());
                if entry.op == JournalOp::Put && !entry.ignored {
                    let (id, _) = entry.single_context()?;
                    computed_bytes += self.store.get_data_size(id)?;
                }
                ordinal = ordinal.next();
            }
        }

        for id in self.store.all_block_ids()? {
            let remaining = self.store.retain_refs_where(id, |entry| {
                let Ok(tag_ordinal) = entry.tag.parse::<Ordinal>() else {
                    // Not a tag we issued; leave it for a human.
                    return true;
                };
                let in_range =
                    matches!(range, Some((earliest, latest)) if tag_ordinal >= earliest && tag_ordinal <= latest);
                if !in_range {
                    warn!("dropping orphaned reference to {id} (tag {})", entry.tag);
                }
                in_range
            })?;

            if remaining == 0 && !referenced_ids.contains(&id) {
                info!("reclaiming block {id} with no references and no log entries");
                self.reclaim_block(id)?;
            }
        }

        match self.read_aggregate()? {
            Some(info) => self.aggregate = info,
            None => {
                // Cold start (or first run after an upgrade): rebuild the
                // counter from the log.
                self.aggregate = AggregateInfo {
                    unflushed_bytes: computed_bytes,
                    unknown: HashMap::new(),
                };
                self.write_aggregate()?;
                info!("rebuilt aggregate info: {computed_bytes} unflushed bytes");
            }
        }
        Ok(())
    }

    fn read_aggregate(&self) -> Result<Option<AggregateInfo>, JournalError> {
        let buf = match fs::read(aggregate_info_path(&self.dir)) {
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&buf)?))
    }

    fn write_aggregate(&self) -> Result<(), JournalError> {
        let path = aggregate_info_path(&self.dir);
        crashsafe::atomic_overwrite(&path, &serde_json::to_vec(&self.aggregate)?)?;
        Ok(())
    }

    fn add_unflushed_bytes(&mut self, n: u64) -> Result<(), JournalError> {
        self.aggregate.unflushed_bytes += n;
        self.write_aggregate()
    }

    fn sub_unflushed_bytes(&mut self, n: u64) -> Result<(), JournalError> {
        if n == 0 {
            return Ok(());
        }
        if n > self.aggregate.unflushed_bytes {
            warn!(
                "unflushed byte count underflow: {} - {n}",
                self.aggregate.unflushed_bytes
            );
        }
        self.aggregate.unflushed_bytes = self.aggregate.unflushed_bytes.saturating_sub(n);
        self.write_aggregate()
    }

    fn next_ordinal(&self) -> Result<Ordinal, JournalError> {
        Ok(match self.log.read_latest_ordinal()? {
            Some(latest) => latest.next(),
            None => Ordinal::FIRST,
        })
    }

    pub fn length(&self) -> Result<u64, JournalError> {
        self.log.len()
    }

    /// Exclusive upper bound of the log: the ordinal right after the most
    /// recently appended entry, or `None` when the log is empty.
    pub fn end(&self) -> Result<Option<Ordinal>, JournalError> {
        Ok(self.log.read_latest_ordinal()?.map(|latest| latest.next()))
    }

    pub fn get_unflushed_bytes(&self) -> u64 {
        self.aggregate.unflushed_bytes
    }

    /// Stores the block data and its reference, then records the put in the
    /// log. Bytes are counted only when the data blob is newly written, so a
    /// repeated put of identical content does not double-count.
    pub fn put_data(
        &mut self,
        id: BlockId,
        context: BlockContext,
        data: &[u8],
        server_half: ServerHalf,
    ) -> Result<(), JournalError> {
        let next = self.next_ordinal()?;
        let had_data = self.store.has_data(id)?;
        self.store
            .put(id, &context, data, &server_half, &next.to_string())?;
        self.log.append(&JournalEntry::put(id, context))?;
        if !had_data {
            self.add_unflushed_bytes(data.len() as u64)?;
        }
        debug!("journaled put of block {id} ({} bytes)", data.len());
        Ok(())
    }

    /// Records a new reference to a block; the data need not be present
    /// locally.
    pub fn add_reference(
        &mut self,
        id: BlockId,
        context: BlockContext,
    ) -> Result<(), JournalError> {
        let next = self.next_ordinal()?;
        self.store.add_reference(id, &context, &next.to_string())?;
        self.log.append(&JournalEntry::add_ref(id, context))?;
        Ok(())
    }

    /// Transitions the listed references to archived status.
    pub fn archive_references(
        &mut self,
        contexts: HashMap<BlockId, Vec<BlockContext>>,
    ) -> Result<(), JournalError> {
        let next = self.next_ordinal()?;
        self.store
            .archive_references(&contexts, &next.to_string())?;
        self.log.append(&JournalEntry::archive(contexts))?;
        Ok(())
    }

    /// Removes the listed references, returning the number of references
    /// remaining per block. Data is left in place; reclamation happens when
    /// the corresponding entries flush.
    pub fn remove_references(
        &mut self,
        contexts: HashMap<BlockId, Vec<BlockContext>>,
    ) -> Result<HashMap<BlockId, usize>, JournalError> {
        let mut live_counts = HashMap::new();
        for (id, id_contexts) in &contexts {
            let remaining = self.store.remove_references(*id, id_contexts, "")?;
            live_counts.insert(*id, remaining);
        }
        self.log.append(&JournalEntry::remove(contexts))?;
        Ok(live_counts)
    }

    /// Appends a marker delimiting the blocks that belong to metadata
    /// revision `revision`.
    pub fn mark_md_revision(&mut self, revision: MdRevision) -> Result<(), JournalError> {
        self.log.append(&JournalEntry::md_rev_marker(revision))?;
        Ok(())
    }

    pub fn get_data_with_context(
        &self,
        id: BlockId,
        context: &BlockContext,
    ) -> Result<(Vec<u8>, ServerHalf), JournalError> {
        self.store.get_data_with_context(id, context)
    }

    /// Whether the block's data is present locally, in the live store or the
    /// holding area.
    pub fn has_data(&self, id: BlockId) -> Result<bool, JournalError> {
        if self.store.has_data(id)? {
            return Ok(true);
        }
        match &self.saved_store {
            Some(saved) => saved.has_data(id),
            None => Ok(false),
        }
    }

    /// Marks every log entry that references one of `ids`, plus every
    /// md-revision marker, as ignored: the entries keep their place in the
    /// log but contribute no server work when flushed. Used when a metadata
    /// branch is abandoned. Idempotent.
    pub fn ignore_blocks_and_md_rev_markers(
        &mut self,
        ids: &[BlockId],
    ) -> Result<(), JournalError> {
        let ids: HashSet<BlockId> = ids.iter().copied().collect();
        let Some((earliest, latest)) = self.log.range()? else {
            return Ok(());
        };

        let mut ordinal = earliest;
        while ordinal <= latest {
            let mut entry = self.log.read_entry(ordinal)?;
            let hit = entry.op == JournalOp::MdRevMarker || entry.references_any(&ids);
            if hit && !entry.ignored {
                entry.ignored = true;
                self.log.write_entry(ordinal, &entry)?;
                if entry.op == JournalOp::Put {
                    let (id, _) = entry.single_context()?;
                    let size = self.store.get_data_size(id)?;
                    self.sub_unflushed_bytes(size)?;
                    debug!("ignoring put of block {id} ({size} bytes)");
                }
            }
            ordinal = ordinal.next();
        }
        Ok(())
    }

    /// After this call, flush activity parks blocks in the holding area
    /// instead of deleting them, until [`Self::on_md_flush`]. The mode
    /// survives restarts.
    pub fn save_blocks_until_next_md_flush(&mut self) -> Result<(), JournalError> {
        if self.saved_store.is_none() {
            let dir = self.dir.join(SAVED_BLOCKS_DIR);
            crashsafe::create_dir_durable(&dir)?;
            self.saved_store = Some(BlockDiskStore::new(dir));
        }
        Ok(())
    }

    /// The metadata layer has durably flushed; drop the holding area.
    pub fn on_md_flush(&mut self) -> Result<(), JournalError> {
        if let Some(saved) = self.saved_store.take() {
            fs::remove_dir_all(saved.dir()).or_else(ignore_not_found)?;
        }
        Ok(())
    }

    /// Collects the next batch of entries to apply to the server: at most
    /// `max_batch` entries from the head of the log, bounded by the
    /// exclusive ordinal `up_to_end`. A non-ignored md-revision marker
    /// terminates the batch (and is included in it); its revision is
    /// returned, or `UNINITIALIZED` when no marker was reached. Ignored
    /// entries count toward the batch length but carry no server work.
    pub fn get_next_entries_to_flush(
        &self,
        up_to_end: Ordinal,
        max_batch: usize,
    ) -> Result<(BlockEntriesToFlush, MdRevision), JournalError> {
        let mut batch = BlockEntriesToFlush::default();
        let mut revision = MdRevision::UNINITIALIZED;

        let Some(earliest) = self.log.read_earliest_ordinal()? else {
            return Ok((batch, revision));
        };

        let mut ordinal = earliest;
        while ordinal < up_to_end && batch.entries.len() < max_batch {
            let entry = self.log.read_entry(ordinal)?;
            let mut stop = false;
            if entry.ignored {
                batch.other.push(entry.clone());
            } else {
                match entry.op {
                    JournalOp::Put => {
                        let (id, context) = entry.single_context()?;
                        let (data, server_half) = self.store.get_data(id)?;
                        batch.puts.push(FlushableBlockPut {
                            id,
                            context,
                            data,
                            server_half,
                        });
                    }
                    JournalOp::AddRef => {
                        batch.adds.push(entry.single_context()?);
                    }
                    JournalOp::Archive | JournalOp::Remove => {
                        batch.other.push(entry.clone());
                    }
                    JournalOp::MdRevMarker => {
                        revision = entry.revision;
                        batch.other.push(entry.clone());
                        stop = true;
                    }
                }
            }
            batch.entries.push((ordinal, entry));
            if stop {
                break;
            }
            ordinal = ordinal.next();
        }

        Ok((batch, revision))
    }

    /// Removes a flushed batch from the log and reclaims local storage. For
    /// each entry in order: the entry leaves the log, the references it had
    /// last touched (matched by tag) leave the store, and a block left with
    /// no references at all is deleted, or parked in the holding area when
    /// save-until-md-flush is active. Byte accounting for a non-ignored put
    /// is settled here, using the data size observed before any deletion.
    pub fn remove_flushed_entries(
        &mut self,
        entries: &BlockEntriesToFlush,
        folder: FolderId,
        reporter: &dyn Reporter,
    ) -> Result<(), JournalError> {
        for (ordinal, entry) in &entries.entries {
            let earliest = self.log.read_earliest_ordinal()?.ok_or_else(|| {
                JournalError::OutOfSync("removing flushed entries from an empty log".to_owned())
            })?;
            if *ordinal != earliest {
                return Err(JournalError::OutOfSync(format!(
                    "expected to remove entry {earliest}, got {ordinal}"
                )));
            }

            let mut flushed_bytes = 0;
            if entry.op == JournalOp::Put && !entry.ignored {
                let (id, _) = entry.single_context()?;
                flushed_bytes = self.store.get_data_size(id)?;
            }

            self.log.remove_prefix(*ordinal)?;

            let tag = ordinal.to_string();
            for (id, id_contexts) in &entry.contexts {
                self.store.remove_references(*id, id_contexts, &tag)?;
                if !self.store.has_any_ref(*id)? {
                    self.reclaim_block(*id)?;
                    reporter.notify_block_reclaimed(folder, *id);
                }
            }

            self.sub_unflushed_bytes(flushed_bytes)?;
        }
        reporter.notify_blocks_flushed(folder, entries.len());
        Ok(())
    }

    /// Deletes a block's local storage, or parks it in the holding area when
    /// save-until-md-flush is active and the block has data worth keeping.
    fn reclaim_block(&self, id: BlockId) -> Result<(), JournalError> {
        if let Some(saved) = &self.saved_store {
            if self.store.has_data(id)? {
                return self.store.move_block_to(id, saved);
            }
        }
        self.store.remove(id)
    }

    /// Reconciles the log, the store, and the byte counter, erroring on any
    /// drift. Expensive; meant for tests (the startup path shares its logic
    /// via [`Self::reconcile_on_startup`]).
    pub fn check_in_sync_for_test(&self) -> Result<(), JournalError> {
        self.log.validate_contiguous()?;

        // Replay the log into the reference map it implies.
        let mut expected: HashMap<BlockId, BlockRefs> = HashMap::new();
        if let Some((earliest, latest)) = self.log.range()? {
            let mut ordinal = earliest;
            while ordinal <= latest {
                let entry = self.log.read_entry(ordinal)?;
                let tag = ordinal.to_string();
                for (id, id_contexts) in &entry.contexts {
                    let refs = expected.entry(*id).or_default();
                    for context in id_contexts {
                        match entry.op {
                            JournalOp::Put | JournalOp::AddRef => {
                                refs.put(*context, RefStatus::Live, &tag)
                            }
                            JournalOp::Archive => refs.put(*context, RefStatus::Archived, &tag),
                            JournalOp::Remove => refs.remove(context, ""),
                            JournalOp::MdRevMarker => {}
                        }
                    }
                }
                ordinal = ordinal.next();
            }
        }
        expected.retain(|_, refs| !refs.is_empty());

        let actual = self.store.get_all_refs()?;
        if expected != actual {
            return Err(JournalError::OutOfSync(format!(
                "references diverge from the log: expected {expected:?}, got {actual:?}"
            )));
        }

        // The byte counter must match both the log and the persisted file.
        let mut expected_bytes = 0u64;
        if let Some((earliest, latest)) = self.log.range()? {
            let mut ordinal = earliest;
            while ordinal <= latest {
                let entry = self.log.read_entry(ordinal)?;
                if entry.op == JournalOp::Put && !entry.ignored {
                    let (id, _) = entry.single_context()?;
                    expected_bytes += self.store.get_data_size(id)?;
                }
                ordinal = ordinal.next();
            }
        }
        if expected_bytes != self.aggregate.unflushed_bytes {
            return Err(JournalError::OutOfSync(format!(
                "unflushed bytes diverge from the log: expected {expected_bytes}, cached {}",
                self.aggregate.unflushed_bytes
            )));
        }
        if let Some(persisted) = self.read_aggregate()? {
            if persisted.unflushed_bytes != self.aggregate.unflushed_bytes {
                return Err(JournalError::OutOfSync(format!(
                    "unflushed bytes diverge from disk: persisted {}, cached {}",
                    persisted.unflushed_bytes, self.aggregate.unflushed_bytes
                )));
            }
        }
        Ok(())
    }
}
