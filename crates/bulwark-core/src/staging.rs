use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;

/// A fetched file sitting in the staging area, not yet committed into the
/// backup tree. Deleted on drop unless [`persist`](StagedFile::persist) or
/// [`defuse`](StagedFile::defuse) hands ownership elsewhere. Staged
/// content must never survive an aborted backup.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    armed: bool,
}

impl StagedFile {
    /// Create a fresh staging file under `dir`. Callers keep `name` unique
    /// within the staging directory.
    pub fn create(dir: &Path, name: &str) -> Result<(Self, File)> {
        let path = dir.join(format!("{name}.new"));
        let file = File::create(&path)?;
        Ok((StagedFile { path, armed: true }, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rename into the final destination. Rename-into-place keeps partial
    /// commits invisible to readers.
    pub fn persist(mut self, dest: &Path) -> Result<()> {
        std::fs::rename(&self.path, dest)?;
        self.armed = false;
        Ok(())
    }

    /// Delete the staged content now (hash-link made it redundant).
    pub fn discard(mut self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        self.armed = false;
        Ok(())
    }

    /// Release ownership without deleting; caller takes responsibility.
    pub fn defuse(mut self) -> PathBuf {
        self.armed = false;
        self.path.clone()
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "could not remove staged file");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn dropped_staged_file_is_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let (staged, mut f) = StagedFile::create(dir.path(), "x").unwrap();
            f.write_all(b"partial").unwrap();
            path = staged.path().to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists(), "staged file must not survive drop");
    }

    #[test]
    fn persist_moves_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("final");
        let (staged, mut f) = StagedFile::create(dir.path(), "final").unwrap();
        f.write_all(b"content").unwrap();
        drop(f);
        let tmp = staged.path().to_path_buf();

        staged.persist(&dest).unwrap();
        assert!(!tmp.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"content");
    }

    #[test]
    fn discard_removes() {
        let dir = tempfile::tempdir().unwrap();
        let (staged, _f) = StagedFile::create(dir.path(), "y").unwrap();
        let tmp = staged.path().to_path_buf();
        staged.discard().unwrap();
        assert!(!tmp.exists());
    }

    #[test]
    fn defuse_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        let (staged, _f) = StagedFile::create(dir.path(), "z").unwrap();
        let path = staged.defuse();
        assert!(path.exists());
    }
}
