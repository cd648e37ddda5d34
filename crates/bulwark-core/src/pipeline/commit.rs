use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use super::{CommitContext, CommitMsg, PipelineItem};
use crate::error::Result;
use crate::index::{HashEntry, LinkOutcome};
use crate::metadata::write_metadata;
use bulwark_types::ContentHash;

/// Commit-hash worker loop: consult the hash index and either link an
/// existing match into place or move the staged file in and register it.
/// Errors are recorded on the shared state; the worker keeps draining so
/// the coordinator can always reach a clean shutdown.
pub fn run(rx: Receiver<CommitMsg>, ctx: CommitContext, working: Arc<AtomicBool>) {
    for msg in rx {
        match msg {
            CommitMsg::Hashed { item, hash } | CommitMsg::Prehashed { item, hash } => {
                working.store(true, Ordering::SeqCst);
                commit_one(&ctx, *item, hash);
                ctx.shared.item_done();
                working.store(false, Ordering::SeqCst);
            }
            CommitMsg::Flush => {}
            CommitMsg::Exit => return,
        }
    }
}

fn commit_one(ctx: &CommitContext, item: PipelineItem, hash: ContentHash) {
    match ctx
        .index
        .find_and_link(&hash, item.size, &item.dest, ctx.link_mode)
    {
        Ok(LinkOutcome::Linked { entry }) => {
            debug!(path = %item.client_path, "linked file");
            ctx.shared
                .linked_bytes
                .fetch_add(item.size as i64, Ordering::SeqCst);
            finish_hit(ctx, item, hash, entry, false);
        }
        Ok(LinkOutcome::Copied { entry }) => {
            debug!(path = %item.client_path, "copied file from canonical");
            ctx.shared
                .linked_bytes
                .fetch_add(item.size as i64, Ordering::SeqCst);
            finish_hit(ctx, item, hash, entry, true);
        }
        Ok(LinkOutcome::Miss) => {
            if let Err(e) = insert_new(ctx, &item, &hash) {
                ctx.shared.record_disk_error("committing new file", &e);
            }
        }
        Err(e) => {
            ctx.shared.record_disk_error("hash index lookup", &e);
        }
    }
}

/// Destination was materialized from an existing entry: drop the staged
/// copy, write the sidecar, record the link row.
fn finish_hit(
    ctx: &CommitContext,
    item: PipelineItem,
    hash: ContentHash,
    entry: HashEntry,
    copied_file: bool,
) {
    let PipelineItem {
        staged,
        client_path,
        dest,
        hash_dest,
        size,
        metadata,
    } = item;

    if let Err(e) = staged.discard() {
        warn!(path = %client_path, error = %e, "could not discard staged file");
    }
    if let Err(e) = write_metadata(&hash_dest, &metadata) {
        ctx.shared.record_disk_error("writing hashes sidecar", &e);
        return;
    }

    let rsize = if entry.rsize > 0 && entry.rsize != size as i64 {
        entry.rsize
    } else if copied_file {
        size as i64
    } else {
        0
    };
    if let Err(e) = ctx.dao.add_file_link(
        ctx.backup_id,
        ctx.client_id,
        &dest.to_string_lossy(),
        &hash_dest.to_string_lossy(),
        &hash,
        size,
        rsize,
        entry.entry_id,
        entry.client_id,
        entry.next_entry_id,
        copied_file,
    ) {
        warn!(path = %client_path, error = %e, "could not record link row");
        ctx.shared.errors.fetch_add(1, Ordering::SeqCst);
        return;
    }
    ctx.shared.committed_files.fetch_add(1, Ordering::SeqCst);
}

/// First copy of this content: move into place, write the sidecar,
/// register the index entry, record the row.
fn insert_new(ctx: &CommitContext, item: &PipelineItem, hash: &ContentHash) -> Result<()> {
    // Rename-into-place; partial content never becomes visible.
    let staged_path = item.staged.path().to_path_buf();
    std::fs::rename(&staged_path, &item.dest)?;

    write_metadata(&item.hash_dest, &item.metadata)?;

    let entry = ctx
        .index
        .insert(hash.clone(), item.size, &item.dest, ctx.client_id, 0)?;

    if let Err(e) = ctx.dao.add_file_link(
        ctx.backup_id,
        ctx.client_id,
        &item.dest.to_string_lossy(),
        &item.hash_dest.to_string_lossy(),
        hash,
        item.size,
        0,
        entry.entry_id,
        entry.client_id,
        entry.next_entry_id,
        false,
    ) {
        warn!(path = %item.client_path, error = %e, "could not record file row");
        ctx.shared.errors.fetch_add(1, Ordering::SeqCst);
    } else {
        ctx.shared.committed_files.fetch_add(1, Ordering::SeqCst);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{hash_reader, DigestKind};
    use crate::index::{HashIndex, LinkMode};
    use crate::metadata::{read_metadata, FileMetadata};
    use crate::pipeline::PipelineShared;
    use crate::staging::StagedFile;
    use crate::testutil::MemoryDao;
    use std::io::Write;
    use std::path::Path;

    fn context(dir: &Path) -> CommitContext {
        CommitContext {
            index: Arc::new(HashIndex::open(&dir.join("index.mp")).unwrap()),
            dao: Arc::new(MemoryDao::default()),
            backup_id: 5,
            client_id: 9,
            link_mode: LinkMode::HardLink,
            shared: Arc::new(PipelineShared::default()),
        }
    }

    fn staged_item(dir: &Path, name: &str, content: &[u8]) -> (PipelineItem, ContentHash) {
        let staging = dir.join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let (staged, mut f) = StagedFile::create(&staging, name).unwrap();
        f.write_all(content).unwrap();
        drop(f);
        let hash = hash_reader(DigestKind::Sha512, content).unwrap();
        (
            PipelineItem {
                staged,
                client_path: format!("A/{name}"),
                dest: dir.join(name),
                hash_dest: dir.join(format!("{name}.meta")),
                size: content.len() as u64,
                metadata: FileMetadata {
                    file_permissions: "a1".into(),
                    ..Default::default()
                },
            },
            hash,
        )
    }

    #[test]
    fn miss_inserts_and_moves() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (item, hash) = staged_item(dir.path(), "x", b"first copy");
        let staged_path = item.staged.path().to_path_buf();

        commit_one(&ctx, item, hash.clone());

        assert_eq!(std::fs::read(dir.path().join("x")).unwrap(), b"first copy");
        assert!(!staged_path.exists(), "staged file moved away");
        assert!(ctx.index.find(&hash, 10).is_some());
        let meta = read_metadata(&dir.path().join("x.meta")).unwrap();
        assert_eq!(meta.file_permissions, "a1");
        assert_eq!(ctx.shared.committed_files.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.shared.linked_bytes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hit_links_and_discards_staged() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        // Seed the index via a first commit.
        let (first, hash) = staged_item(dir.path(), "x", b"shared content");
        commit_one(&ctx, first, hash.clone());

        // Second file with identical content.
        let (second, hash2) = staged_item(dir.path(), "y", b"shared content");
        let staged_path = second.staged.path().to_path_buf();
        commit_one(&ctx, second, hash2);

        assert!(!staged_path.exists(), "staged file discarded on link");
        assert_eq!(
            std::fs::read(dir.path().join("y")).unwrap(),
            b"shared content"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            assert_eq!(
                std::fs::metadata(dir.path().join("x")).unwrap().ino(),
                std::fs::metadata(dir.path().join("y")).unwrap().ino(),
                "y must be a hard link of x"
            );
        }
        assert_eq!(
            ctx.shared.linked_bytes.load(Ordering::SeqCst),
            b"shared content".len() as i64
        );
        // No second index insertion for an overlapping (hash, size) pair.
        assert_eq!(ctx.index.len(), 1);
    }

    #[test]
    fn copy_mode_marks_rsize() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let (first, hash) = staged_item(dir.path(), "x", b"data!");
        commit_one(&ctx, first, hash);

        ctx.link_mode = LinkMode::Copy;
        let (second, hash2) = staged_item(dir.path(), "y", b"data!");
        commit_one(&ctx, second, hash2);

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            assert_eq!(std::fs::metadata(dir.path().join("y")).unwrap().nlink(), 1);
        }
        assert_eq!(ctx.shared.committed_files.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_dest_dir_records_disk_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (mut item, hash) = staged_item(dir.path(), "x", b"abc");
        item.dest = dir.path().join("no_such_dir/x");

        commit_one(&ctx, item, hash);
        assert!(ctx.shared.has_disk_error());
    }
}
