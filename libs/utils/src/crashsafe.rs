//! Filesystem helpers for crash-consistent state directories.
//!
//! Every on-disk structure in this repository follows the same write
//! discipline: bytes are durable before any pointer to them moves, and small
//! state files (log pointers, reference maps, counters) are replaced through
//! a scratch file plus rename so a reader never observes a torn write. These
//! helpers implement that discipline once, for the stores and logs built on
//! top of them.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};

use crate::fs_ext::ignore_not_found;

/// Extension of the scratch file used by [`atomic_overwrite`]. Recovery
/// scans treat files carrying it as sweepable leftovers of an interrupted
/// write.
pub const TMP_EXT: &str = "tmp";

/// The scratch path used while atomically replacing `path`.
pub fn tmp_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.{TMP_EXT}"))
}

/// Opens and fsyncs `path`, which may be a file or a directory.
pub fn fsync(path: &Utf8Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Fsyncs `path` and the directory holding it. Called after a rename to make
/// the new directory entry durable along with what it names.
pub fn fsync_with_parent(path: &Utf8Path) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other(format!("{path} has no parent to fsync")))?;
    fsync(path)?;
    fsync(parent)
}

/// Like [`std::fs::create_dir_all`], except every directory this call
/// creates is fsynced, as is the pre-existing ancestor the new subtree hangs
/// off, so the tree cannot silently vanish in a crash.
pub fn create_dir_durable(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    let path = path.as_ref();

    // Walk upward until we hit something that exists.
    let mut to_create = Vec::new();
    let mut existing = None;
    for dir in path.ancestors() {
        match dir.metadata() {
            Ok(meta) if meta.is_dir() => {
                existing = Some(dir);
                break;
            }
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{dir} exists and is not a directory"),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => to_create.push(dir),
            Err(e) => return Err(e),
        }
    }
    let Some(existing) = existing else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path} has no existing ancestor"),
        ));
    };

    for dir in to_create.iter().rev() {
        fs::create_dir(dir)?;
    }
    for dir in &to_create {
        fsync(dir)?;
    }
    if !to_create.is_empty() {
        fsync(existing)?;
    }
    Ok(())
}

/// Replaces the contents of `path` atomically and durably: the bytes land in
/// [`tmp_path`] first and are fsynced, then the scratch file is renamed over
/// `path` and the parent directory fsynced. A crash at any point leaves
/// either the old contents or the new, never a torn mix — at worst a stale
/// scratch file, which the next overwrite (or a recovery sweep) clears.
///
/// Writes to a given `path` must be serialized by the caller; concurrent
/// overwrites would race on the scratch file.
pub fn atomic_overwrite(path: &Utf8Path, content: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);
    fs::remove_file(&tmp).or_else(ignore_not_found)?;
    // create_new: if something else is writing the same scratch file after
    // all, fail instead of interleaving with it.
    let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    match path.parent() {
        Some(parent) => fsync(parent),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_dir_durable_builds_nested_trees() {
        let dir = camino_tempfile::tempdir().unwrap();

        let deep = dir.path().join("blocks").join("01aa").join("bb");
        create_dir_durable(&deep).unwrap();
        assert!(deep.is_dir());

        // Creating what already exists is a no-op.
        create_dir_durable(&deep).unwrap();

        // A file in the way is an error, not a replacement.
        let file = dir.path().join("aggregate_info");
        std::fs::write(&file, b"{}").unwrap();
        let err = create_dir_durable(&file).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        create_dir_durable(file.join("child")).unwrap_err();
    }

    #[test]
    fn atomic_overwrite_replaces_whole_files() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path().join("latest");

        atomic_overwrite(&target, b"4").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"4");

        atomic_overwrite(&target, b"5").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"5");
        assert!(!tmp_path(&target).exists());
    }

    #[test]
    fn atomic_overwrite_clears_stale_scratch_files() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path().join("earliest");

        // A crash can leave a scratch file behind; the next write replaces
        // it rather than tripping over it.
        std::fs::write(tmp_path(&target), b"torn").unwrap();
        atomic_overwrite(&target, b"12").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"12");
        assert!(!tmp_path(&target).exists());
    }

    #[test]
    fn tmp_paths_are_recognizable() {
        assert_eq!(tmp_path(Utf8Path::new("/j/latest")), "/j/latest.tmp");
        assert_eq!(tmp_path(Utf8Path::new("/j/block.refs")), "/j/block.refs.tmp");
    }
}
