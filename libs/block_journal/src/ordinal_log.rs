//! Append-only on-disk log of journal entries, one file per ordinal.
//!
//! Besides the entry files the directory holds two small pointer files,
//! `earliest` and `latest`. The log is non-empty iff both pointers exist, and
//! then every ordinal in `[earliest, latest]` must have an entry file; a gap
//! is corruption. Writes follow the order "entry file, then pointer", so a
//! crash can never leave a pointer referencing a missing file. Removal
//! advances the pointer first and deletes entry files second; stragglers
//! below `earliest` are swept on open.

use std::fmt;
use std::fs;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;
use utils::crashsafe;
use utils::fs_ext::ignore_not_found;

use crate::entry::JournalEntry;
use crate::error::JournalError;

const EARLIEST_FILENAME: &str = "earliest";
const LATEST_FILENAME: &str = "latest";

/// Position of one entry in the log. Monotonic within a log; restarts from
/// [`Ordinal::FIRST`] after the log has drained completely.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ordinal(u64);

impl Ordinal {
    pub const FIRST: Ordinal = Ordinal(1);

    pub fn next(&self) -> Ordinal {
        Ordinal(self.0 + 1)
    }

    fn file_name(&self) -> String {
        format!("{:016x}", self.0)
    }

    fn from_file_name(name: &str) -> Option<Ordinal> {
        if name.len() != 16 {
            return None;
        }
        u64::from_str_radix(name, 16).ok().map(Ordinal)
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Ordinal {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Ordinal, Self::Err> {
        Ok(Ordinal(s.parse()?))
    }
}

#[derive(Debug)]
pub struct OrdinalLog {
    dir: Utf8PathBuf,
}

impl OrdinalLog {
    /// Opens the log, creating the directory if needed, and brings the
    /// on-disk state back to the invariant: pointers agree, the pointed-to
    /// range is contiguous, and straggler files from interrupted operations
    /// are swept.
    pub fn open(dir: Utf8PathBuf) -> Result<Self, JournalError> {
        crashsafe::create_dir_durable(&dir)?;
        let log = OrdinalLog { dir };
        log.recover()?;
        Ok(log)
    }

    fn entry_path(&self, ordinal: Ordinal) -> Utf8PathBuf {
        self.dir.join(ordinal.file_name())
    }

    fn pointer_path(&self, name: &str) -> Utf8PathBuf {
        self.dir.join(name)
    }

    fn read_pointer(&self, name: &str) -> Result<Option<Ordinal>, JournalError> {
        let buf = match fs::read_to_string(self.pointer_path(name)) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let ordinal = buf.trim().parse().map_err(|_| {
            JournalError::Corrupt(format!("unparseable {name} pointer: {buf:?}"))
        })?;
        Ok(Some(ordinal))
    }

    fn write_pointer(&self, name: &str, ordinal: Ordinal) -> Result<(), JournalError> {
        crashsafe::atomic_overwrite(&self.pointer_path(name), ordinal.to_string().as_bytes())?;
        Ok(())
    }

    fn remove_pointer(&self, name: &str) -> Result<(), JournalError> {
        fs::remove_file(self.pointer_path(name)).or_else(ignore_not_found)?;
        Ok(())
    }

    pub fn read_earliest_ordinal(&self) -> Result<Option<Ordinal>, JournalError> {
        self.read_pointer(EARLIEST_FILENAME)
    }

    pub fn read_latest_ordinal(&self) -> Result<Option<Ordinal>, JournalError> {
        self.read_pointer(LATEST_FILENAME)
    }

    /// `[earliest, latest]` when non-empty.
    pub fn range(&self) -> Result<Option<(Ordinal, Ordinal)>, JournalError> {
        match (self.read_earliest_ordinal()?, self.read_latest_ordinal()?) {
            (Some(earliest), Some(latest)) => Ok(Some((earliest, latest))),
            _ => Ok(None),
        }
    }

    pub fn len(&self) -> Result<u64, JournalError> {
        Ok(match self.range()? {
            Some((earliest, latest)) => latest.0 - earliest.0 + 1,
            None => 0,
        })
    }

    pub fn is_empty(&self) -> Result<bool, JournalError> {
        Ok(self.range()?.is_none())
    }

    /// Appends `entry`, returning the ordinal it was assigned. The entry file
    /// is durable before either pointer moves.
    pub fn append(&self, entry: &JournalEntry) -> Result<Ordinal, JournalError> {
        let next = match self.read_latest_ordinal()? {
            Some(latest) => latest.next(),
            None => Ordinal::FIRST,
        };
        self.write_entry(next, entry)?;
        if self.read_earliest_ordinal()?.is_none() {
            self.write_pointer(EARLIEST_FILENAME, next)?;
        }
        self.write_pointer(LATEST_FILENAME, next)?;
        Ok(next)
    }

    pub fn read_entry(&self, ordinal: Ordinal) -> Result<JournalEntry, JournalError> {
        let buf = fs::read(self.entry_path(ordinal))?;
        Ok(serde_json::from_slice(&buf)?)
    }

    /// Overwrites the entry file for `ordinal` in place. Only used to set the
    /// ignored flag; the pointers do not move.
    pub fn write_entry(&self, ordinal: Ordinal, entry: &JournalEntry) -> Result<(), JournalError> {
        let buf = serde_json::to_vec(entry)?;
        crashsafe::atomic_overwrite(&self.entry_path(ordinal), &buf)?;
        Ok(())
    }

    /// Removes entries `[earliest, up_to]`. The earliest pointer (or, when
    /// the log empties, the removal of both pointers) commits the operation;
    /// entry files are deleted afterwards, so a crash leaves only sweepable
    /// stragglers.
    pub fn remove_prefix(&self, up_to: Ordinal) -> Result<(), JournalError> {
        let Some((earliest, latest)) = self.range()? else {
            return Ok(());
        };
        if up_to < earliest {
            return Ok(());
        }
        let up_to = up_to.min(latest);

        let new_earliest = up_to.next();
        if new_earliest > latest {
            self.remove_pointer(LATEST_FILENAME)?;
            self.remove_pointer(EARLIEST_FILENAME)?;
        } else {
            self.write_pointer(EARLIEST_FILENAME, new_earliest)?;
        }

        let mut ordinal = earliest;
        while ordinal <= up_to {
            fs::remove_file(self.entry_path(ordinal)).or_else(ignore_not_found)?;
            ordinal = ordinal.next();
        }
        Ok(())
    }

    /// Checks that every ordinal in the pointed-to range has an entry file.
    pub fn validate_contiguous(&self) -> Result<(), JournalError> {
        let Some((earliest, latest)) = self.range()? else {
            return Ok(());
        };
        let mut ordinal = earliest;
        while ordinal <= latest {
            if !self.entry_path(ordinal).try_exists()? {
                return Err(JournalError::Corrupt(format!(
                    "journal entry {ordinal} missing from log range [{earliest}, {latest}]"
                )));
            }
            ordinal = ordinal.next();
        }
        Ok(())
    }

    fn recover(&self) -> Result<(), JournalError> {
        let range = match (self.read_earliest_ordinal()?, self.read_latest_ordinal()?) {
            (Some(earliest), Some(latest)) if earliest <= latest => Some((earliest, latest)),
            (Some(earliest), Some(latest)) => {
                return Err(JournalError::Corrupt(format!(
                    "log pointers are inverted: earliest {earliest} > latest {latest}"
                )));
            }
            (None, None) => None,
            // One pointer survived a crash mid-transition to empty.
            mixed => {
                warn!("log has a lone pointer ({mixed:?}), treating as empty");
                self.remove_pointer(LATEST_FILENAME)?;
                self.remove_pointer(EARLIEST_FILENAME)?;
                None
            }
        };

        self.sweep_strays(range)?;

        if range.is_some() {
            self.validate_contiguous()?;
        }
        Ok(())
    }

    /// Deletes tmp files and entry files outside the live range: leftovers of
    /// interrupted appends and prefix removals.
    fn sweep_strays(&self, range: Option<(Ordinal, Ordinal)>) -> Result<(), JournalError> {
        for dirent in self.dir.read_dir_utf8()? {
            let dirent = dirent?;
            let name = dirent.file_name();
            if name == EARLIEST_FILENAME || name == LATEST_FILENAME {
                continue;
            }
            if Utf8Path::new(name).extension() == Some(crashsafe::TMP_EXT) {
                fs::remove_file(dirent.path()).or_else(ignore_not_found)?;
                continue;
            }
            match Ordinal::from_file_name(name) {
                Some(ordinal) => {
                    let in_range =
                        matches!(range, Some((earliest, latest)) if ordinal >= earliest && ordinal <= latest);
                    if !in_range {
                        fs::remove_file(dirent.path()).or_else(ignore_not_found)?;
                    }
                }
                None => {
                    // Not ours; leave it alone but make some noise.
                    warn!("unexpected file {:?} in log dir {}", name, self.dir);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::entry::{JournalEntry, MdRevision};

    fn open_log(dir: &Utf8Path) -> OrdinalLog {
        OrdinalLog::open(dir.join("log")).unwrap()
    }

    fn marker(rev: u64) -> JournalEntry {
        JournalEntry::md_rev_marker(MdRevision::new(rev))
    }

    #[test]
    fn append_assigns_consecutive_ordinals() {
        let dir = camino_tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        assert_eq!(log.len().unwrap(), 0);
        assert!(log.read_earliest_ordinal().unwrap().is_none());

        let o1 = log.append(&marker(1)).unwrap();
        let o2 = log.append(&marker(2)).unwrap();
        assert_eq!(o1, Ordinal::FIRST);
        assert_eq!(o2, o1.next());
        assert_eq!(log.len().unwrap(), 2);

        assert_eq!(log.read_entry(o1).unwrap(), marker(1));
        assert_eq!(log.read_entry(o2).unwrap(), marker(2));
    }

    #[test]
    fn remove_prefix_advances_earliest() {
        let dir = camino_tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        let o1 = log.append(&marker(1)).unwrap();
        let o2 = log.append(&marker(2)).unwrap();
        let o3 = log.append(&marker(3)).unwrap();

        log.remove_prefix(o2).unwrap();
        assert_eq!(log.read_earliest_ordinal().unwrap(), Some(o3));
        assert_eq!(log.len().unwrap(), 1);
        assert!(log.read_entry(o1).is_err());

        // Removing everything clears both pointers...
        log.remove_prefix(o3).unwrap();
        assert_eq!(log.len().unwrap(), 0);
        assert!(log.read_latest_ordinal().unwrap().is_none());

        // ...and the next append restarts from the initial sentinel.
        let o = log.append(&marker(4)).unwrap();
        assert_eq!(o, Ordinal::FIRST);
    }

    #[test]
    fn write_entry_overwrites_in_place() {
        let dir = camino_tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        let mut entry = JournalEntry::archive(HashMap::new());
        let ordinal = log.append(&entry).unwrap();

        entry.ignored = true;
        log.write_entry(ordinal, &entry).unwrap();
        assert!(log.read_entry(ordinal).unwrap().ignored);
        assert_eq!(log.len().unwrap(), 1);
    }

    #[test]
    fn reopen_preserves_contents() {
        let dir = camino_tempfile::tempdir().unwrap();
        {
            let log = open_log(dir.path());
            log.append(&marker(1)).unwrap();
            log.append(&marker(2)).unwrap();
        }
        let log = open_log(dir.path());
        assert_eq!(log.len().unwrap(), 2);
        assert_eq!(log.read_entry(Ordinal::FIRST).unwrap(), marker(1));
    }

    #[test]
    fn lone_pointer_recovers_to_empty() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = {
            let log = open_log(dir.path());
            log.append(&marker(1)).unwrap();
            // Simulate a crash midway through emptying the log: latest is
            // gone, earliest and the entry file remain.
            fs::remove_file(log.pointer_path(LATEST_FILENAME)).unwrap();
            log.dir.clone()
        };

        let log = OrdinalLog::open(path).unwrap();
        assert_eq!(log.len().unwrap(), 0);
        assert!(log.read_earliest_ordinal().unwrap().is_none());
        // The stray entry file was swept, so a fresh append starts clean.
        assert_eq!(log.append(&marker(2)).unwrap(), Ordinal::FIRST);
        assert_eq!(log.read_entry(Ordinal::FIRST).unwrap(), marker(2));
    }

    #[test]
    fn gap_in_range_is_corruption() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = {
            let log = open_log(dir.path());
            let o1 = log.append(&marker(1)).unwrap();
            log.append(&marker(2)).unwrap();
            fs::remove_file(log.entry_path(o1)).unwrap();
            log.dir.clone()
        };

        match OrdinalLog::open(path) {
            Err(JournalError::Corrupt(_)) => {}
            other => panic!("expected corruption, got {other:?}"),
        }
    }
}
