/// Extensions to `std::fs` types.
use std::{fs, io, path::Path};

pub trait PathExt {
    /// Returns an error if `self` is not a directory.
    fn is_empty_dir(&self) -> io::Result<bool>;
}

impl<P> PathExt for P
where
    P: AsRef<Path>,
{
    fn is_empty_dir(&self) -> io::Result<bool> {
        Ok(fs::read_dir(self)?.next().is_none())
    }
}

/// Turns a `NotFound` error into a success, leaving other errors in place.
///
/// Callers use this to distinguish a missing file (treated as empty or
/// already-removed) from real I/O failures, which must surface.
pub fn ignore_not_found(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn is_empty_dir() {
        let dir = camino_tempfile::tempdir().unwrap();
        let dir_path = dir.path();

        assert!(
            dir_path.is_empty_dir().expect("test failure"),
            "new tempdir should be empty"
        );

        // invoke on a file to ensure it returns an error
        let file_path: PathBuf = dir_path.join("testfile").into();
        let f = std::fs::File::create(&file_path).unwrap();
        drop(f);
        assert!(file_path.is_empty_dir().is_err());

        // do it again on a path we know to be nonexistent
        std::fs::remove_file(&file_path).unwrap();
        assert!(file_path.is_empty_dir().is_err());
    }

    #[test]
    fn ignore_not_found_swallows_only_not_found() {
        let missing = std::fs::remove_file("no/such/file").unwrap_err();
        ignore_not_found(missing).unwrap();

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(ignore_not_found(denied).is_err());
    }
}
