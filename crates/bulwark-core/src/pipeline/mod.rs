pub mod commit;
pub mod prepare;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use tracing::warn;

use crate::client::BackupDao;
use crate::digest::DigestKind;
use crate::index::{HashIndex, LinkMode};
use crate::metadata::FileMetadata;
use crate::staging::StagedFile;
use bulwark_types::ContentHash;

/// A fetched file travelling through the hash pipeline towards its final
/// place in the backup tree.
#[derive(Debug)]
pub struct PipelineItem {
    pub staged: StagedFile,
    /// Client-side path, for logging and the dao row.
    pub client_path: String,
    pub dest: PathBuf,
    /// Sidecar blob path in the hashes tree.
    pub hash_dest: PathBuf,
    pub size: u64,
    pub metadata: FileMetadata,
}

/// Input to the prepare-hash worker. `Flush` is forwarded downstream;
/// `Exit` is forwarded and terminates the worker.
pub enum PrepareMsg {
    File(Box<PipelineItem>),
    Flush,
    Exit,
}

/// Input to the commit-hash worker: `Hashed` items digested by prepare,
/// `Prehashed` items enqueued directly by the coordinator when the
/// transfer already produced a digest. Both commit identically.
pub enum CommitMsg {
    Hashed {
        item: Box<PipelineItem>,
        hash: ContentHash,
    },
    Prehashed {
        item: Box<PipelineItem>,
        hash: ContentHash,
    },
    Flush,
    Exit,
}

/// Cross-thread result state. Workers record structured errors here and
/// keep draining; nothing is thrown across thread boundaries.
#[derive(Debug, Default)]
pub struct PipelineShared {
    /// Server-side I/O fault: the backup is fatal, admins get mail.
    pub disk_error: AtomicBool,
    /// Non-fatal per-entry errors.
    pub errors: AtomicUsize,
    /// Bytes satisfied from the hash index instead of transfer.
    pub linked_bytes: AtomicI64,
    pub committed_files: AtomicUsize,
    /// Items submitted but not yet finished by the commit worker. This is
    /// the drain condition; queue lengths alone miss items in flight
    /// between the two workers.
    in_flight: AtomicUsize,
}

impl PipelineShared {
    pub fn record_disk_error(&self, what: &str, e: &dyn std::fmt::Display) {
        warn!(what, error = %e, "disk error in hash pipeline");
        self.disk_error.store(true, Ordering::SeqCst);
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn has_disk_error(&self) -> bool {
        self.disk_error.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    /// Called by workers when an item leaves the pipeline for any reason.
    pub(crate) fn item_done(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            });
    }
}

/// Everything the commit worker needs to materialize files.
pub struct CommitContext {
    pub index: Arc<HashIndex>,
    pub dao: Arc<dyn BackupDao>,
    pub backup_id: i64,
    pub client_id: i64,
    pub link_mode: LinkMode,
    pub shared: Arc<PipelineShared>,
}

/// Handles to the two running hash workers plus their queues.
pub struct Pipeline {
    prepare_tx: Sender<PrepareMsg>,
    commit_tx: Sender<CommitMsg>,
    shared: Arc<PipelineShared>,
    prepare_working: Arc<AtomicBool>,
    commit_working: Arc<AtomicBool>,
    prepare_join: JoinHandle<()>,
    commit_join: JoinHandle<()>,
}

impl Pipeline {
    /// Launch the prepare-hash and commit-hash workers.
    pub fn start(digest_kind: DigestKind, ctx: CommitContext) -> Pipeline {
        let (prepare_tx, prepare_rx) = unbounded::<PrepareMsg>();
        let (commit_tx, commit_rx) = unbounded::<CommitMsg>();

        let prepare_working = Arc::new(AtomicBool::new(false));
        let commit_working = Arc::new(AtomicBool::new(false));

        let shared = Arc::clone(&ctx.shared);
        let shared_prepare = Arc::clone(&ctx.shared);
        let prepare_join = {
            let commit_tx = commit_tx.clone();
            let working = Arc::clone(&prepare_working);
            std::thread::spawn(move || {
                prepare::run(prepare_rx, commit_tx, digest_kind, shared_prepare, working)
            })
        };

        let commit_join = {
            let working = Arc::clone(&commit_working);
            std::thread::spawn(move || commit::run(commit_rx, ctx, working))
        };

        Pipeline {
            prepare_tx,
            commit_tx,
            shared,
            prepare_working,
            commit_working,
            prepare_join,
            commit_join,
        }
    }

    /// Hand a fetched (not yet hashed) file to the prepare-hash worker.
    pub fn submit_fetched(&self, item: PipelineItem) -> bool {
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.prepare_tx.send(PrepareMsg::File(Box::new(item))).is_err() {
            self.shared.item_done();
            return false;
        }
        true
    }

    /// Hand an already-hashed file straight to the commit-hash worker.
    pub fn submit_prehashed(&self, item: PipelineItem, hash: ContentHash) -> bool {
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if self
            .commit_tx
            .send(CommitMsg::Prehashed {
                item: Box::new(item),
                hash,
            })
            .is_err()
        {
            self.shared.item_done();
            return false;
        }
        true
    }

    /// Push flush markers through both queues.
    pub fn flush(&self) {
        let _ = self.prepare_tx.send(PrepareMsg::Flush);
        let _ = self.commit_tx.send(CommitMsg::Flush);
    }

    /// Whether the prepare-hash worker is digesting an item right now.
    pub fn prepare_is_working(&self) -> bool {
        self.prepare_working.load(Ordering::SeqCst)
    }

    /// Whether the commit-hash worker is mid-commit. Lets the coordinator
    /// tell "queue empty but committing" apart from fully drained.
    pub fn commit_is_working(&self) -> bool {
        self.commit_working.load(Ordering::SeqCst)
    }

    /// Queue lengths for status reporting, counting a mid-item worker as
    /// one outstanding unit.
    pub fn queue_sizes(&self) -> (usize, usize) {
        let prepare = self.prepare_tx.len() + self.prepare_is_working() as usize;
        let commit = self.commit_tx.len() + self.commit_is_working() as usize;
        (prepare, commit)
    }

    /// Drained means every submitted item has left the pipeline; "queue
    /// empty but mid-commit" is not drained.
    pub fn is_drained(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Send exit markers and join both workers. Never kills mid-commit.
    pub fn shutdown(self) {
        if self.prepare_tx.send(PrepareMsg::Exit).is_err() {
            // Prepare worker already gone; tell commit directly.
            let _ = self.commit_tx.send(CommitMsg::Exit);
        }
        if self.prepare_join.join().is_err() {
            warn!("prepare-hash worker panicked");
            let _ = self.commit_tx.send(CommitMsg::Exit);
        }
        if self.commit_join.join().is_err() {
            warn!("commit-hash worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryDao;
    use std::time::Duration;

    fn test_ctx(dir: &std::path::Path) -> CommitContext {
        CommitContext {
            index: Arc::new(HashIndex::open(&dir.join("index.mp")).unwrap()),
            dao: Arc::new(MemoryDao::default()),
            backup_id: 1,
            client_id: 1,
            link_mode: LinkMode::HardLink,
            shared: Arc::new(PipelineShared::default()),
        }
    }

    #[test]
    fn pipeline_drains_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let shared = Arc::clone(&ctx.shared);
        let pipeline = Pipeline::start(DigestKind::Sha512, ctx);

        let staging = dir.path().join("staging");
        let dest_dir = dir.path().join("backup");
        let hash_dir = dir.path().join("hashes");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(&dest_dir).unwrap();
        std::fs::create_dir_all(&hash_dir).unwrap();

        let (staged, _f) = {
            use std::io::Write;
            let (s, mut f) = StagedFile::create(&staging, "x").unwrap();
            f.write_all(b"payload").unwrap();
            (s, f)
        };

        assert!(pipeline.submit_fetched(PipelineItem {
            staged,
            client_path: "A/x".into(),
            dest: dest_dir.join("x"),
            hash_dest: hash_dir.join("x"),
            size: 7,
            metadata: FileMetadata::default(),
        }));

        pipeline.flush();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !pipeline.is_drained() {
            assert!(std::time::Instant::now() < deadline, "pipeline never drained");
            std::thread::sleep(Duration::from_millis(10));
        }
        pipeline.shutdown();

        assert_eq!(std::fs::read(dest_dir.join("x")).unwrap(), b"payload");
        assert!(hash_dir.join("x").exists());
        assert_eq!(shared.error_count(), 0);
        assert_eq!(
            shared.committed_files.load(Ordering::SeqCst),
            1,
            "one file committed"
        );
    }

    #[test]
    fn prehashed_items_bypass_prepare() {
        use crate::digest::hash_reader;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let shared = Arc::clone(&ctx.shared);
        let pipeline = Pipeline::start(DigestKind::Sha512, ctx);

        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let (staged, mut f) = StagedFile::create(&staging, "pre").unwrap();
        f.write_all(b"already hashed").unwrap();
        drop(f);

        let hash = hash_reader(DigestKind::Sha512, &b"already hashed"[..]).unwrap();
        assert!(pipeline.submit_prehashed(
            PipelineItem {
                staged,
                client_path: "B/pre".into(),
                dest: dir.path().join("pre"),
                hash_dest: dir.path().join("pre.meta"),
                size: 14,
                metadata: FileMetadata::default(),
            },
            hash,
        ));

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !pipeline.is_drained() {
            assert!(std::time::Instant::now() < deadline, "pipeline never drained");
            std::thread::sleep(Duration::from_millis(10));
        }
        pipeline.shutdown();

        assert_eq!(
            std::fs::read(dir.path().join("pre")).unwrap(),
            b"already hashed"
        );
        assert_eq!(shared.committed_files.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_with_empty_queues_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::start(DigestKind::Sha256, test_ctx(dir.path()));
        assert!(pipeline.is_drained());
        assert!(!pipeline.prepare_is_working());
        assert!(!pipeline.commit_is_working());
        pipeline.shutdown();
    }
}
