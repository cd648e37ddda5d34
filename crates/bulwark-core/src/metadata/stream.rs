use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use super::{dir_sidecar_path, file_sidecar_path, write_metadata, FileMetadata};
use crate::error::{BulwarkError, Result};
use crate::legalize::PathCorrections;
use crate::platform;

/// One out-of-band metadata record, keyed by the client-side path.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub client_path: String,
    pub is_dir: bool,
    pub metadata: FileMetadata,
}

/// Blocking pull source for metadata records. Implemented over the
/// client's dedicated metadata connection; `Ok(None)` signals end of
/// stream. In-process fakes implement this for the tests.
pub trait MetadataSource: Send {
    fn next_record(&mut self) -> Result<Option<MetadataRecord>>;
}

/// Worker pulling the client's metadata stream concurrently with the
/// content pipeline. Records are buffered and applied only after the
/// pipeline drains, so every path correction is visible.
pub struct MetadataStream {
    records: Arc<Mutex<Vec<MetadataRecord>>>,
    has_error: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl MetadataStream {
    pub fn start(mut source: Box<dyn MetadataSource>) -> Self {
        let records = Arc::new(Mutex::new(Vec::new()));
        let has_error = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let records2 = Arc::clone(&records);
        let has_error2 = Arc::clone(&has_error);
        let shutdown2 = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || loop {
            if shutdown2.load(Ordering::Relaxed) {
                break;
            }
            match source.next_record() {
                Ok(Some(record)) => {
                    records2.lock().unwrap().push(record);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "metadata stream read failed");
                    has_error2.store(true, Ordering::Relaxed);
                    break;
                }
            }
        });

        MetadataStream {
            records,
            has_error,
            shutdown,
            handle,
        }
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Relaxed)
    }

    /// Stop pulling and wait for the worker. `inform_end` is invoked when
    /// the worker is still running, giving the caller a chance to open the
    /// short control connection that tells the client to close the stream.
    pub fn finish<F: FnMut()>(self, mut inform_end: F) -> FinishedMetadataStream {
        if !self.handle.is_finished() {
            info!("waiting for metadata stream to finish");
            inform_end();
            self.shutdown.store(true, Ordering::Relaxed);
        }
        // A panicked worker counts as a stream error, not a coordinator crash.
        let panicked = self.handle.join().is_err();
        FinishedMetadataStream {
            records: std::mem::take(&mut *self.records.lock().unwrap()),
            has_error: panicked || self.has_error.load(Ordering::Relaxed),
        }
    }
}

/// Drained stream, ready for application after pipeline drain.
pub struct FinishedMetadataStream {
    records: Vec<MetadataRecord>,
    has_error: bool,
}

impl FinishedMetadataStream {
    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Write sidecar blobs and apply permissions/timestamps to the content
    /// tree, translating client paths through the recorded corrections.
    /// Individual failures are counted, not fatal.
    pub fn apply_metadata(
        &self,
        hashes_root: &Path,
        backup_root: &Path,
        corrections: &PathCorrections,
    ) -> Result<()> {
        let mut failures = 0usize;
        for record in &self.records {
            if let Err(e) = apply_one(record, hashes_root, backup_root, corrections) {
                warn!(path = %record.client_path, error = %e, "could not apply metadata");
                failures += 1;
            }
        }
        debug!(
            applied = self.records.len() - failures,
            failures, "metadata application finished"
        );
        if failures > 0 {
            return Err(BulwarkError::MetadataApplyError(format!(
                "{failures} of {} records failed",
                self.records.len()
            )));
        }
        Ok(())
    }
}

fn apply_one(
    record: &MetadataRecord,
    hashes_root: &Path,
    backup_root: &Path,
    corrections: &PathCorrections,
) -> Result<()> {
    let rel = corrections.translate_path(&record.client_path);

    let sidecar = if record.is_dir {
        dir_sidecar_path(hashes_root, &rel)
    } else {
        let (dir, name) = match rel.rsplit_once('/') {
            Some((d, n)) => (d, n),
            None => ("", rel.as_str()),
        };
        file_sidecar_path(hashes_root, dir, name)
    };
    write_metadata(&sidecar, &record.metadata)?;

    let target = backup_root.join(&rel);
    if target.exists() {
        if let Some(mode) = record.metadata.unix_mode {
            platform::apply_mode(&target, mode)?;
        }
        if record.metadata.modified != 0 {
            platform::set_file_mtime(&target, record.metadata.modified, 0)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::read_metadata;
    use std::collections::VecDeque;

    struct VecSource {
        records: VecDeque<MetadataRecord>,
        fail_after: Option<usize>,
        served: usize,
    }

    impl MetadataSource for VecSource {
        fn next_record(&mut self) -> Result<Option<MetadataRecord>> {
            if self.fail_after == Some(self.served) {
                return Err(BulwarkError::Transfer("connection reset".into()));
            }
            self.served += 1;
            Ok(self.records.pop_front())
        }
    }

    fn record(path: &str, is_dir: bool) -> MetadataRecord {
        MetadataRecord {
            client_path: path.into(),
            is_dir,
            metadata: FileMetadata {
                file_permissions: "a1".into(),
                unix_mode: Some(0o600),
                modified: 1_650_000_000,
                ..FileMetadata::default()
            },
        }
    }

    #[test]
    fn collects_and_applies() {
        let dir = tempfile::tempdir().unwrap();
        let backup_root = dir.path().join("backup");
        let hashes_root = dir.path().join("hashes");
        std::fs::create_dir_all(backup_root.join("A")).unwrap();
        std::fs::create_dir_all(hashes_root.join("A")).unwrap();
        std::fs::write(backup_root.join("A/x"), b"data").unwrap();

        let source = VecSource {
            records: [record("A", true), record("A/x", false)].into(),
            fail_after: None,
            served: 0,
        };
        let stream = MetadataStream::start(Box::new(source));
        let finished = stream.finish(|| {});
        assert!(!finished.has_error());
        assert_eq!(finished.record_count(), 2);

        finished
            .apply_metadata(&hashes_root, &backup_root, &PathCorrections::new())
            .unwrap();

        let dir_meta = read_metadata(&dir_sidecar_path(&hashes_root, "A")).unwrap();
        assert_eq!(dir_meta.file_permissions, "a1");
        let file_meta = read_metadata(&file_sidecar_path(&hashes_root, "A", "x")).unwrap();
        assert_eq!(file_meta.unix_mode, Some(0o600));
    }

    #[test]
    fn source_error_sets_flag() {
        let source = VecSource {
            records: [record("A", true)].into(),
            fail_after: Some(1),
            served: 0,
        };
        let stream = MetadataStream::start(Box::new(source));
        // Wait for the worker to hit the failure.
        while !stream.handle.is_finished() {
            std::thread::yield_now();
        }
        let finished = stream.finish(|| panic!("worker already finished"));
        assert!(finished.has_error());
        assert_eq!(finished.record_count(), 1);
    }

    #[test]
    fn paths_translate_through_corrections() {
        let dir = tempfile::tempdir().unwrap();
        let backup_root = dir.path().join("backup");
        let hashes_root = dir.path().join("hashes");
        std::fs::create_dir_all(&backup_root).unwrap();
        std::fs::create_dir_all(&hashes_root).unwrap();

        let mut corrections = PathCorrections::new();
        corrections.record("", "NUL", "_NUL-0123456789");

        let source = VecSource {
            records: [record("NUL", false)].into(),
            fail_after: None,
            served: 0,
        };
        let finished = MetadataStream::start(Box::new(source)).finish(|| {});
        finished
            .apply_metadata(&hashes_root, &backup_root, &corrections)
            .unwrap();

        assert!(hashes_root.join("_NUL-0123456789").exists());
    }
}
