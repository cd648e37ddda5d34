use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use super::{CommitMsg, PipelineShared, PrepareMsg};
use crate::digest::{self, DigestKind};

/// Prepare-hash worker loop: digest each staged file and hand it to the
/// commit worker. Control markers pass through unchanged so a flush or
/// exit observed here is eventually observed downstream too.
pub fn run(
    rx: Receiver<PrepareMsg>,
    commit_tx: Sender<CommitMsg>,
    digest_kind: DigestKind,
    shared: Arc<PipelineShared>,
    working: Arc<AtomicBool>,
) {
    for msg in rx {
        match msg {
            PrepareMsg::File(item) => {
                working.store(true, Ordering::SeqCst);
                match digest::hash_file(digest_kind, item.staged.path()) {
                    Ok(hash) => {
                        debug!(path = %item.client_path, %hash, "prepared hash");
                        if commit_tx.send(CommitMsg::Hashed { item, hash }).is_err() {
                            // Receiver gone; the dropped item unstages itself.
                            shared.item_done();
                            working.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                    Err(e) => {
                        // Reading our own staged file failed: server-side
                        // fault. The item drops here and unstages itself.
                        shared.record_disk_error("hashing staged file", &e);
                        shared.item_done();
                    }
                }
                working.store(false, Ordering::SeqCst);
            }
            PrepareMsg::Flush => {
                let _ = commit_tx.send(CommitMsg::Flush);
            }
            PrepareMsg::Exit => {
                let _ = commit_tx.send(CommitMsg::Exit);
                return;
            }
        }
    }
    // Senders gone without an exit marker; propagate shutdown anyway.
    let _ = commit_tx.send(CommitMsg::Exit);
}
