//! Content-addressed block storage in flat files on disk.
//!
//! The directory layout looks like:
//!
//! ```text
//! dir/0100/0...01/data
//! dir/0100/0...01/id
//! dir/0100/0...01/ksh
//! dir/0100/0...01/refs
//! ...
//! dir/01ff/f...ff/id
//! dir/01ff/f...ff/refs
//! ```
//!
//! Each block has its own subdirectory with its ID truncated to 17 bytes
//! (34 characters) as a name. The block subdirectories are splayed over
//! (# of possible hash types) * 256 subdirectories, one byte for the hash
//! type plus the first byte of the hash data, using the first four characters
//! of the name to keep the number of directories in `dir` itself manageable,
//! similar to git. Truncation still leaves 16 random bytes, so the expected
//! number of blocks stored before a path collision is 2^64; the `id` file
//! always holds the full ID, and every full-store walk cross-checks it
//! against the directory name.
//!
//! Each block directory has the following files:
//!
//!   - `id`:   the full block ID in hex. Always present.
//!   - `data`: the raw block data, which must hash to the block ID.
//!             May be missing.
//!   - `ksh`:  the raw bytes of the associated key server half.
//!             May be missing, but present whenever `data` is.
//!   - `refs`: the serialized reference map. May be missing.
//!
//! Future versions of the store might add more files to a block directory,
//! so any code that moves blocks around preserves unknown files.
//!
//! The store performs no locking; exactly one journal owns it at a time.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use utils::crashsafe;
use utils::fs_ext::{ignore_not_found, PathExt};

use crate::block_id::BlockId;
use crate::crypto::ServerHalf;
use crate::error::JournalError;
use crate::id::BlockContext;
use crate::refs::{BlockRefs, RefEntry, RefInfo, RefStatus};

const ID_FILENAME: &str = "id";
const DATA_FILENAME: &str = "data";
const KSH_FILENAME: &str = "ksh";
const REFS_FILENAME: &str = "refs";

/// Characters of the block ID used in the on-disk path: 4 for the splay
/// directory, 30 more for the block directory.
const SPLAY_CHARS: usize = 4;
const BLOCK_DIR_CHARS: usize = 34;

pub struct BlockDiskStore {
    dir: Utf8PathBuf,
}

impl BlockDiskStore {
    pub fn new(dir: Utf8PathBuf) -> Self {
        BlockDiskStore { dir }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn block_path(&self, id: BlockId) -> Utf8PathBuf {
        let id_str = id.to_string();
        self.dir
            .join(&id_str[..SPLAY_CHARS])
            .join(&id_str[SPLAY_CHARS..BLOCK_DIR_CHARS])
    }

    fn data_path(&self, id: BlockId) -> Utf8PathBuf {
        self.block_path(id).join(DATA_FILENAME)
    }

    fn id_path(&self, id: BlockId) -> Utf8PathBuf {
        self.block_path(id).join(ID_FILENAME)
    }

    fn ksh_path(&self, id: BlockId) -> Utf8PathBuf {
        self.block_path(id).join(KSH_FILENAME)
    }

    fn refs_path(&self, id: BlockId) -> Utf8PathBuf {
        self.block_path(id).join(REFS_FILENAME)
    }

    fn write_small(&self, path: &Utf8Path, content: &[u8]) -> Result<(), JournalError> {
        crashsafe::atomic_overwrite(path, content)?;
        Ok(())
    }

    /// Makes the directory for the given block ID and writes the `id` file,
    /// if necessary.
    fn make_dir(&self, id: BlockId) -> Result<(), JournalError> {
        crashsafe::create_dir_durable(self.block_path(id))?;
        let id_path = self.id_path(id);
        if !id_path.try_exists()? {
            self.write_small(&id_path, id.to_string().as_bytes())?;
        }
        Ok(())
    }

    fn get_ref_info(&self, id: BlockId) -> Result<RefInfo, JournalError> {
        let buf = match fs::read(self.refs_path(id)) {
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RefInfo::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&buf)?)
    }

    fn put_ref_info(&self, id: BlockId, info: &RefInfo) -> Result<(), JournalError> {
        self.write_small(&self.refs_path(id), &serde_json::to_vec(info)?)
    }

    /// Adds references for the given contexts, all with the same status and
    /// tag. Distinct contexts coexist; an existing context is refreshed.
    fn add_refs(
        &self,
        id: BlockId,
        contexts: &[BlockContext],
        status: RefStatus,
        tag: &str,
    ) -> Result<(), JournalError> {
        let mut info = self.get_ref_info(id)?;
        for context in contexts {
            info.refs.put(*context, status, tag);
        }
        self.put_ref_info(id, &info)
    }

    /// Returns the data and server half for the given ID, revalidating the
    /// content hash.
    pub fn get_data(&self, id: BlockId) -> Result<(Vec<u8>, ServerHalf), JournalError> {
        let data = match fs::read(self.data_path(id)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(JournalError::BlockNonExistent(id))
            }
            Err(e) => return Err(e.into()),
        };
        let ksh = match fs::read(self.ksh_path(id)) {
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(JournalError::BlockNonExistent(id))
            }
            Err(e) => return Err(e.into()),
        };

        let computed = BlockId::from_data(&data);
        if computed != id {
            return Err(JournalError::BadHash { id, computed });
        }

        let server_half = ServerHalf::from_bytes(&ksh).ok_or_else(|| {
            JournalError::Corrupt(format!("block {id}: malformed key server half"))
        })?;

        Ok((data, server_half))
    }

    pub fn get_data_with_context(
        &self,
        id: BlockId,
        context: &BlockContext,
    ) -> Result<(Vec<u8>, ServerHalf), JournalError> {
        if !self.has_context(id, context)? {
            return Err(JournalError::BlockNonExistent(id));
        }
        self.get_data(id)
    }

    pub fn has_any_ref(&self, id: BlockId) -> Result<bool, JournalError> {
        Ok(!self.get_ref_info(id)?.refs.is_empty())
    }

    pub fn has_non_archived_ref(&self, id: BlockId) -> Result<bool, JournalError> {
        Ok(self.get_ref_info(id)?.refs.has_non_archived_ref())
    }

    pub fn has_context(&self, id: BlockId, context: &BlockContext) -> Result<bool, JournalError> {
        Ok(self.get_ref_info(id)?.refs.check_exists(context))
    }

    pub fn has_data(&self, id: BlockId) -> Result<bool, JournalError> {
        Ok(self.data_path(id).try_exists()?)
    }

    /// Size of the stored data, or 0 when no data is present.
    pub fn get_data_size(&self, id: BlockId) -> Result<u64, JournalError> {
        match fs::metadata(self.data_path(id)) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Puts the given data for the block, which may already exist, and adds a
    /// live reference for `context`. Repeating a put of the same
    /// `(id, context, data, server_half)` is idempotent; presenting a
    /// different server half for existing data is an error.
    pub fn put(
        &self,
        id: BlockId,
        context: &BlockContext,
        data: &[u8],
        server_half: &ServerHalf,
        tag: &str,
    ) -> Result<(), JournalError> {
        let computed = BlockId::from_data(data);
        if computed != id {
            return Err(JournalError::BadHash { id, computed });
        }

        if self.has_data(id)? {
            // Content is immutable by construction, so only the key material
            // needs checking.
            let (_, existing_half) = self.get_data(id)?;
            if existing_half != *server_half {
                return Err(JournalError::ServerHalfMismatch {
                    id,
                    expected: existing_half,
                    got: *server_half,
                });
            }
        } else {
            self.make_dir(id)?;
            self.write_small(&self.data_path(id), data)?;
            self.write_small(&self.ksh_path(id), server_half.as_bytes())?;
        }

        self.add_refs(id, &[*context], RefStatus::Live, tag)
    }

    /// Records a live reference without requiring data to be present.
    pub fn add_reference(
        &self,
        id: BlockId,
        context: &BlockContext,
        tag: &str,
    ) -> Result<(), JournalError> {
        self.make_dir(id)?;
        self.add_refs(id, &[*context], RefStatus::Live, tag)
    }

    /// Transitions the listed references to archived status, creating them
    /// (and their block directories) if absent.
    pub fn archive_references(
        &self,
        contexts: &HashMap<BlockId, Vec<BlockContext>>,
        tag: &str,
    ) -> Result<(), JournalError> {
        for (id, id_contexts) in contexts {
            self.make_dir(*id)?;
            self.add_refs(*id, id_contexts, RefStatus::Archived, tag)?;
        }
        Ok(())
    }

    /// Removes references for the given contexts. If `tag` is non-empty, a
    /// reference is removed only if its most recent tag matches. Returns the
    /// number of references remaining. Leaves `data`/`ksh` untouched.
    pub fn remove_references(
        &self,
        id: BlockId,
        contexts: &[BlockContext],
        tag: &str,
    ) -> Result<usize, JournalError> {
        let mut info = self.get_ref_info(id)?;
        if info.refs.is_empty() {
            return Ok(0);
        }

        for context in contexts {
            info.refs.remove(context, tag);
            if info.refs.is_empty() {
                break;
            }
        }

        self.put_ref_info(id, &info)?;
        Ok(info.refs.len())
    }

    /// Drops every reference of `id` that fails `keep`, rewriting the refs
    /// file only when something was dropped. Returns the number of
    /// references remaining. Used by startup reconciliation.
    pub(crate) fn retain_refs_where(
        &self,
        id: BlockId,
        keep: impl FnMut(&RefEntry) -> bool,
    ) -> Result<usize, JournalError> {
        let mut info = self.get_ref_info(id)?;
        if info.refs.retain(keep) {
            self.put_ref_info(id, &info)?;
        }
        Ok(info.refs.len())
    }

    /// Removes any existing files for the given ID, which must not have any
    /// references left.
    pub fn remove(&self, id: BlockId) -> Result<(), JournalError> {
        if self.has_any_ref(id)? {
            return Err(JournalError::OutOfSync(format!(
                "trying to remove data for referenced block {id}"
            )));
        }
        let path = self.block_path(id);
        fs::remove_dir_all(&path).or_else(ignore_not_found)?;
        self.remove_splay_dir_if_empty(&path)
    }

    fn remove_splay_dir_if_empty(&self, block_path: &Utf8Path) -> Result<(), JournalError> {
        let parent = block_path.parent().expect("block path has a splay parent");
        if let Ok(true) = parent.is_empty_dir() {
            fs::remove_dir(parent).or_else(ignore_not_found)?;
        }
        Ok(())
    }

    /// Moves the whole block directory into `dest`, preserving any unknown
    /// files. If the destination already holds this block, files present on
    /// both sides are kept from the destination (the content is identical by
    /// construction) and the source is dropped.
    pub fn move_block_to(&self, id: BlockId, dest: &BlockDiskStore) -> Result<(), JournalError> {
        let src = self.block_path(id);
        if !src.try_exists()? {
            return Ok(());
        }
        let dest_path = dest.block_path(id);

        if dest_path.try_exists()? {
            for dirent in src.read_dir_utf8()? {
                let dirent = dirent?;
                let target = dest_path.join(dirent.file_name());
                if target.try_exists()? {
                    fs::remove_file(dirent.path())?;
                } else {
                    fs::rename(dirent.path(), &target)?;
                }
            }
            fs::remove_dir(&src)?;
        } else {
            crashsafe::create_dir_durable(dest_path.parent().expect("block path has a splay parent"))?;
            fs::rename(&src, &dest_path)?;
            crashsafe::fsync_with_parent(&dest_path)?;
        }

        self.remove_splay_dir_if_empty(&src)
    }

    /// Walks every block directory, returning the full reference map of each
    /// block that has one. The directory name is cross-checked against the
    /// `id` file, so a truncated-path collision or a misplaced directory
    /// fails loudly instead of aliasing blocks.
    pub fn get_all_refs(&self) -> Result<HashMap<BlockId, BlockRefs>, JournalError> {
        let mut res = HashMap::new();
        for id in self.all_block_ids()? {
            let info = self.get_ref_info(id)?;
            if !info.refs.is_empty() {
                res.insert(id, info.refs);
            }
        }
        Ok(res)
    }

    pub fn all_block_ids(&self) -> Result<Vec<BlockId>, JournalError> {
        let mut ids = Vec::new();
        let splays = match self.dir.read_dir_utf8() {
            Ok(iter) => iter,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        for splay in splays {
            let splay = splay?;
            if !splay.file_type()?.is_dir() {
                return Err(JournalError::Corrupt(format!(
                    "unexpected non-dir {:?} in block store",
                    splay.file_name()
                )));
            }
            for block_dir in splay.path().read_dir_utf8()? {
                let block_dir = block_dir?;
                let id_buf = fs::read_to_string(block_dir.path().join(ID_FILENAME))?;
                let id: BlockId = id_buf.trim().parse().map_err(|e| {
                    JournalError::Corrupt(format!("bad id file in {}: {e}", block_dir.path()))
                })?;

                let expected_prefix = format!("{}{}", splay.file_name(), block_dir.file_name());
                if !id.to_string().starts_with(&expected_prefix) {
                    return Err(JournalError::Corrupt(format!(
                        "{expected_prefix:?} unexpectedly not a prefix of {id}"
                    )));
                }
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{ClientId, RefNonce};

    fn setup() -> (camino_tempfile::Utf8TempDir, BlockDiskStore) {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = BlockDiskStore::new(dir.path().join("blocks"));
        (dir, store)
    }

    fn put_block(store: &BlockDiskStore, data: &[u8]) -> (BlockId, BlockContext, ServerHalf) {
        let id = BlockId::from_data(data);
        let context = BlockContext::primary(ClientId::generate());
        let half = ServerHalf::generate();
        store.put(id, &context, data, &half, "1").unwrap();
        (id, context, half)
    }

    #[test]
    fn put_then_get() {
        let (_dir, store) = setup();
        let data = [1, 2, 3, 4];
        let (id, context, half) = put_block(&store, &data);

        let (got, got_half) = store.get_data_with_context(id, &context).unwrap();
        assert_eq!(got, data);
        assert_eq!(got_half, half);
        assert!(store.has_data(id).unwrap());
        assert_eq!(store.get_data_size(id).unwrap(), 4);
        assert!(store.has_non_archived_ref(id).unwrap());
    }

    #[test]
    fn put_rejects_wrong_hash() {
        let (_dir, store) = setup();
        let id = BlockId::from_data(&[1, 2, 3]);
        let context = BlockContext::primary(ClientId::generate());
        let err = store
            .put(id, &context, &[9, 9, 9], &ServerHalf::generate(), "1")
            .unwrap_err();
        assert!(matches!(err, JournalError::BadHash { .. }));
    }

    #[test]
    fn repeated_put_checks_server_half() {
        let (_dir, store) = setup();
        let data = [1, 2, 3, 4];
        let (id, context, half) = put_block(&store, &data);

        // Same everything: idempotent.
        store.put(id, &context, &data, &half, "2").unwrap();

        // Different key half for existing data: caller bug or corruption.
        let err = store
            .put(id, &context, &data, &ServerHalf::generate(), "3")
            .unwrap_err();
        assert!(matches!(err, JournalError::ServerHalfMismatch { .. }));
    }

    #[test]
    fn add_reference_without_data() {
        let (_dir, store) = setup();
        let id = BlockId::from_data(&[1, 2, 3, 4]);
        let context = BlockContext::primary(ClientId::generate());
        store.add_reference(id, &context, "1").unwrap();

        assert!(store.has_context(id, &context).unwrap());
        assert!(!store.has_data(id).unwrap());
        assert_eq!(store.get_data_size(id).unwrap(), 0);
        assert!(matches!(
            store.get_data_with_context(id, &context),
            Err(JournalError::BlockNonExistent(_))
        ));
    }

    #[test]
    fn primary_references_from_two_creators_coexist() {
        let (_dir, store) = setup();
        let data = [1, 2, 3, 4];
        let (id, first, half) = put_block(&store, &data);

        // A second client deduplicating the same content holds its own
        // primary reference: same zero nonce, different creator.
        let second = BlockContext::primary(ClientId::generate());
        store.put(id, &second, &data, &half, "2").unwrap();

        assert!(store.has_context(id, &first).unwrap());
        assert!(store.has_context(id, &second).unwrap());
        let (got, _) = store.get_data_with_context(id, &second).unwrap();
        assert_eq!(got, data);

        // Dropping one client's reference leaves the other's intact.
        assert_eq!(store.remove_references(id, &[second], "").unwrap(), 1);
        assert!(store.has_context(id, &first).unwrap());
    }

    #[test]
    fn archive_flips_status() {
        let (_dir, store) = setup();
        let (id, context, _) = put_block(&store, &[5, 6, 7]);

        store
            .archive_references(&HashMap::from([(id, vec![context])]), "2")
            .unwrap();
        assert!(store.has_any_ref(id).unwrap());
        assert!(!store.has_non_archived_ref(id).unwrap());

        // Archiving a never-seen reference records it.
        let other = BlockId::from_data(&[8, 8, 8]);
        let other_ctx = BlockContext::primary(ClientId::generate());
        store
            .archive_references(&HashMap::from([(other, vec![other_ctx])]), "3")
            .unwrap();
        assert!(store.has_context(other, &other_ctx).unwrap());
    }

    #[test]
    fn remove_references_honors_tags() {
        let (_dir, store) = setup();
        let (id, context, _) = put_block(&store, &[1, 1, 1]);
        let ctx2 = BlockContext::secondary(
            context.creator,
            ClientId::generate(),
            RefNonce::generate(),
        );
        store.add_reference(id, &ctx2, "2").unwrap();

        // Wrong tag: nothing removed.
        assert_eq!(store.remove_references(id, &[context], "99").unwrap(), 2);
        // Matching tag removes just that reference.
        assert_eq!(store.remove_references(id, &[context], "1").unwrap(), 1);
        // Empty tag is unconditional.
        assert_eq!(store.remove_references(id, &[ctx2], "").unwrap(), 0);
        // A block with no references at all reports zero live references.
        assert_eq!(store.remove_references(id, &[ctx2], "").unwrap(), 0);

        // Data sticks around for flushing.
        assert!(store.has_data(id).unwrap());
    }

    #[test]
    fn remove_refuses_referenced_block() {
        let (_dir, store) = setup();
        let (id, context, _) = put_block(&store, &[2, 2, 2]);

        assert!(store.remove(id).is_err());

        store.remove_references(id, &[context], "").unwrap();
        store.remove(id).unwrap();
        assert!(!store.has_data(id).unwrap());
        // The splayed parent went away with its last block.
        assert!(store.dir.is_empty_dir().unwrap_or(true));

        // Removing an absent block is fine.
        store.remove(id).unwrap();
    }

    #[test]
    fn all_block_ids_checks_path_prefix() {
        let (_dir, store) = setup();
        let (id, _, _) = put_block(&store, &[1, 2, 3, 4]);
        assert_eq!(store.all_block_ids().unwrap(), vec![id]);
        assert_eq!(store.get_all_refs().unwrap().len(), 1);

        // Corrupt the id file so it no longer matches its directory.
        let bogus = BlockId::from_data(&[9, 9, 9]);
        fs::write(store.id_path(id), bogus.to_string()).unwrap();
        assert!(matches!(
            store.all_block_ids(),
            Err(JournalError::Corrupt(_))
        ));
    }

    #[test]
    fn move_preserves_unknown_files() {
        let (dir, store) = setup();
        let (id, _, _) = put_block(&store, &[4, 4, 4]);
        fs::write(store.block_path(id).join("future"), b"keep me").unwrap();

        let dest = BlockDiskStore::new(dir.path().join("saved"));
        store.move_block_to(id, &dest).unwrap();

        assert!(!store.has_data(id).unwrap());
        assert!(dest.has_data(id).unwrap());
        assert_eq!(
            fs::read(dest.block_path(id).join("future")).unwrap(),
            b"keep me"
        );

        // Moving again (now absent at the source) is a no-op.
        store.move_block_to(id, &dest).unwrap();
        assert!(dest.has_data(id).unwrap());
    }
}
