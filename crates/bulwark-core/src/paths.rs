use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::debug;

use crate::client::SnapshotHelper;
use crate::error::{BulwarkError, Result};

/// The on-disk locations of one backup: content tree root, the mirrored
/// `.hashes` sidecar tree, the timestamp token naming this backup and the
/// client's directory hard-link pool. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPath {
    pub root: PathBuf,
    pub hashes_root: PathBuf,
    pub single: String,
    pub pool_path: PathBuf,
}

pub struct BackupPathBuilder<'a> {
    backup_folder: &'a Path,
    client_name: &'a str,
}

impl<'a> BackupPathBuilder<'a> {
    pub fn new(backup_folder: &'a Path, client_name: &'a str) -> Self {
        BackupPathBuilder {
            backup_folder,
            client_name,
        }
    }

    fn timestamp_token() -> String {
        Local::now().format("%y%m%d-%H%M").to_string()
    }

    fn assemble(&self, single: String) -> BackupPath {
        let client_dir = self.backup_folder.join(self.client_name);
        let root = client_dir.join(&single);
        BackupPath {
            hashes_root: root.join(".hashes"),
            pool_path: client_dir.join(".directory_pool"),
            root,
            single,
        }
    }

    /// Materialize the tree for a full or incremental backup. With
    /// snapshots enabled and `create_fs` set, the snapshot helper creates
    /// an empty filesystem at `<single>` and only the hashes directory is
    /// made; otherwise both directories are created normally.
    pub fn build(
        &self,
        use_snapshots: bool,
        create_fs: bool,
        snapshots: &dyn SnapshotHelper,
    ) -> Result<BackupPath> {
        let paths = self.assemble(Self::timestamp_token());
        self.materialize(&paths, use_snapshots, create_fs, snapshots)?;
        Ok(paths)
    }

    /// Materialize (or reuse) the tree for a continuous backup.
    pub fn build_continuous(&self) -> Result<BackupPath> {
        let paths = self.assemble(format!("continuous_{}", Self::timestamp_token()));
        if paths.root.is_dir() && paths.hashes_root.is_dir() {
            return Ok(paths);
        }
        self.create_dirs(&paths)?;
        Ok(paths)
    }

    fn materialize(
        &self,
        paths: &BackupPath,
        use_snapshots: bool,
        create_fs: bool,
        snapshots: &dyn SnapshotHelper,
    ) -> Result<()> {
        std::fs::create_dir_all(self.backup_folder.join(self.client_name))
            .map_err(|e| cannot_create(&paths.root, e))?;

        if use_snapshots {
            if create_fs {
                snapshots
                    .create_empty_filesystem(self.client_name, &paths.single)
                    .map_err(|e| {
                        BulwarkError::CannotCreateBackupTree(format!(
                            "snapshot creation failed: {e}"
                        ))
                    })?;
                std::fs::create_dir_all(&paths.hashes_root)
                    .map_err(|e| cannot_create(&paths.hashes_root, e))?;
            }
            debug!(root = %paths.root.display(), "backup tree on snapshot");
            return Ok(());
        }

        self.create_dirs(paths)
    }

    fn create_dirs(&self, paths: &BackupPath) -> Result<()> {
        std::fs::create_dir_all(&paths.root).map_err(|e| cannot_create(&paths.root, e))?;
        std::fs::create_dir_all(&paths.hashes_root)
            .map_err(|e| cannot_create(&paths.hashes_root, e))?;
        debug!(root = %paths.root.display(), "created backup tree");
        Ok(())
    }
}

fn cannot_create(path: &Path, e: std::io::Error) -> BulwarkError {
    BulwarkError::CannotCreateBackupTree(format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSnapshots {
        created: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl RecordingSnapshots {
        fn new(fail: bool) -> Self {
            RecordingSnapshots {
                created: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    impl SnapshotHelper for RecordingSnapshots {
        fn create_empty_filesystem(&self, client_name: &str, single: &str) -> Result<()> {
            if self.fail {
                return Err(BulwarkError::Other("no space in pool".into()));
            }
            self.created
                .lock()
                .unwrap()
                .push((client_name.into(), single.into()));
            Ok(())
        }

        fn remove_filesystem(&self, _client_name: &str, _single: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn plain_build_creates_both_trees() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = RecordingSnapshots::new(false);
        let builder = BackupPathBuilder::new(dir.path(), "client1");

        let paths = builder.build(false, true, &snapshots).unwrap();
        assert!(paths.root.is_dir());
        assert!(paths.hashes_root.is_dir());
        assert!(paths.hashes_root.ends_with(".hashes"));
        assert_eq!(paths.pool_path, dir.path().join("client1/.directory_pool"));
        assert!(snapshots.created.lock().unwrap().is_empty());
        // Token looks like %y%m%d-%H%M.
        assert_eq!(paths.single.len(), 11);
        assert_eq!(&paths.single[6..7], "-");
    }

    #[test]
    fn snapshot_build_delegates_filesystem_creation() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = RecordingSnapshots::new(false);
        let builder = BackupPathBuilder::new(dir.path(), "client1");

        let paths = builder.build(true, true, &snapshots).unwrap();
        let created = snapshots.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "client1");
        assert_eq!(created[0].1, paths.single);
        // Content root comes from the snapshot; only hashes was mkdir'd.
        assert!(paths.hashes_root.is_dir());
    }

    #[test]
    fn snapshot_failure_is_cannot_create() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = RecordingSnapshots::new(true);
        let builder = BackupPathBuilder::new(dir.path(), "client1");

        match builder.build(true, true, &snapshots) {
            Err(BulwarkError::CannotCreateBackupTree(_)) => {}
            other => panic!("expected CannotCreateBackupTree, got {other:?}"),
        }
    }

    #[test]
    fn continuous_reuses_existing_tree() {
        let dir = tempfile::tempdir().unwrap();
        let builder = BackupPathBuilder::new(dir.path(), "client1");

        let first = builder.build_continuous().unwrap();
        assert!(first.single.starts_with("continuous_"));
        // Second call within the same minute sees the same tree.
        let second = builder.build_continuous().unwrap();
        assert_eq!(first, second);
    }
}
