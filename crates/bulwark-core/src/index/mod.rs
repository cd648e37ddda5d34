use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BulwarkError, Result};
use bulwark_types::ContentHash;

/// One persisted index entry. Entries for the same `(hash, size)` key are
/// chained through `next_entry_id`, newest first; superseding pushes a new
/// head and never drops an older entry (live backups may reference it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashEntry {
    pub hash: ContentHash,
    pub size: u64,
    /// Canonical on-disk file this content can be linked from.
    pub canonical_path: String,
    pub client_id: i64,
    pub entry_id: i64,
    /// Older entry for the same key, 0 when none.
    pub next_entry_id: i64,
    /// Deduplicated size attributed to this entry.
    pub rsize: i64,
}

/// Outcome of [`HashIndex::find_and_link`].
#[derive(Debug)]
pub enum LinkOutcome {
    /// Destination is a hard link to the canonical file.
    Linked { entry: HashEntry },
    /// Link was impossible (link limit, cross-device, copy preference);
    /// destination holds a fresh copy.
    Copied { entry: HashEntry },
    /// No usable entry for this key.
    Miss,
}

/// How `find_and_link` materializes a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    HardLink,
    /// Reflink preference degrades to copy; dedup bookkeeping still applies.
    Copy,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    next_id: i64,
    heads: HashMap<String, i64>,
    entries: HashMap<i64, HashEntry>,
}

fn key_of(hash: &ContentHash, size: u64) -> String {
    format!("{}:{size}", hash.to_hex())
}

/// Content-addressed lookup from `(content_hash, size)` to an existing
/// on-disk file. Shared between the coordinator and the commit worker; all
/// access goes through `&self` with internal locking, so writes are
/// linearizable with respect to reads issued after they return.
#[derive(Debug)]
pub struct HashIndex {
    path: PathBuf,
    state: Mutex<IndexState>,
}

impl HashIndex {
    /// Open the index snapshot at `path`, creating an empty index when the
    /// file does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        let state = match std::fs::read(path) {
            Ok(bytes) => rmp_serde::from_slice(&bytes)
                .map_err(|e| BulwarkError::HashIndexError(format!("corrupt index snapshot: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IndexState::default(),
            Err(e) => return Err(BulwarkError::HashIndexError(e.to_string())),
        };
        debug!(path = %path.display(), entries = state.entries.len(), "opened hash index");
        Ok(HashIndex {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a new canonical file for `(hash, size)`. Returns the new
    /// entry, already chained in front of any previous head.
    pub fn insert(
        &self,
        hash: ContentHash,
        size: u64,
        canonical_path: &Path,
        client_id: i64,
        rsize: i64,
    ) -> Result<HashEntry> {
        let mut st = self.state.lock().unwrap();
        st.next_id += 1;
        let entry_id = st.next_id;
        let key = key_of(&hash, size);
        let next_entry_id = st.heads.get(&key).copied().unwrap_or(0);
        let entry = HashEntry {
            hash,
            size,
            canonical_path: canonical_path.to_string_lossy().into_owned(),
            client_id,
            entry_id,
            next_entry_id,
            rsize,
        };
        st.heads.insert(key, entry_id);
        st.entries.insert(entry_id, entry.clone());
        Ok(entry)
    }

    /// Newest entry for the key whose canonical file still exists.
    pub fn find(&self, hash: &ContentHash, size: u64) -> Option<HashEntry> {
        let st = self.state.lock().unwrap();
        let mut id = st.heads.get(&key_of(hash, size)).copied().unwrap_or(0);
        while id != 0 {
            let entry = st.entries.get(&id)?;
            if Path::new(&entry.canonical_path).is_file() {
                return Some(entry.clone());
            }
            id = entry.next_entry_id;
        }
        None
    }

    /// Look up `(hash, size)` and materialize a hit at `dest` by hard link
    /// or copy. Entries whose canonical file has vanished are skipped; a
    /// link failure from the hard-link limit or a device boundary falls
    /// back to copying.
    pub fn find_and_link(
        &self,
        hash: &ContentHash,
        size: u64,
        dest: &Path,
        mode: LinkMode,
    ) -> Result<LinkOutcome> {
        // Take candidates under the lock, do filesystem work outside it.
        let candidates: Vec<HashEntry> = {
            let st = self.state.lock().unwrap();
            let mut id = st.heads.get(&key_of(hash, size)).copied().unwrap_or(0);
            let mut out = Vec::new();
            while id != 0 {
                match st.entries.get(&id) {
                    Some(entry) => {
                        out.push(entry.clone());
                        id = entry.next_entry_id;
                    }
                    None => break,
                }
            }
            out
        };

        for entry in candidates {
            let canonical = Path::new(&entry.canonical_path);
            if !canonical.is_file() {
                continue;
            }

            if mode == LinkMode::HardLink {
                match std::fs::hard_link(canonical, dest) {
                    Ok(()) => return Ok(LinkOutcome::Linked { entry }),
                    Err(e) if is_link_limit(&e) => {
                        warn!(path = %canonical.display(), error = %e,
                            "hard link failed, falling back to copy");
                    }
                    Err(e) => {
                        // Canonical file may have vanished between the
                        // check and the link; try the next chain entry.
                        debug!(path = %canonical.display(), error = %e, "hard link failed");
                        continue;
                    }
                }
            }

            match std::fs::copy(canonical, dest) {
                Ok(_) => return Ok(LinkOutcome::Copied { entry }),
                Err(e) => {
                    debug!(path = %canonical.display(), error = %e, "copy from canonical failed");
                    continue;
                }
            }
        }

        Ok(LinkOutcome::Miss)
    }

    /// Persist the index snapshot atomically (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let bytes = {
            let st = self.state.lock().unwrap();
            rmp_serde::to_vec(&*st)?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BulwarkError::HashIndexError(e.to_string()))?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| BulwarkError::HashIndexError(e.to_string()))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| BulwarkError::HashIndexError(e.to_string()))?;
        debug!(path = %self.path.display(), "saved hash index");
        Ok(())
    }
}

/// EMLINK (too many links) and EXDEV (cross-device) both mean "copy
/// instead"; anything else is a real failure for this candidate.
fn is_link_limit(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(e.raw_os_error(), Some(libc::EMLINK) | Some(libc::EXDEV))
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> ContentHash {
        ContentHash(vec![byte; 64])
    }

    fn new_index(dir: &Path) -> HashIndex {
        HashIndex::open(&dir.join("files_index.mp")).unwrap()
    }

    #[test]
    fn insert_then_find() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().join("store.bin");
        std::fs::write(&canonical, b"12345").unwrap();

        let index = new_index(dir.path());
        let entry = index.insert(hash(1), 5, &canonical, 7, 0).unwrap();
        assert_eq!(entry.entry_id, 1);
        assert_eq!(entry.next_entry_id, 0);

        let found = index.find(&hash(1), 5).unwrap();
        assert_eq!(found.canonical_path, canonical.to_string_lossy());
        assert!(index.find(&hash(1), 6).is_none(), "size is part of the key");
        assert!(index.find(&hash(2), 5).is_none());
    }

    #[test]
    fn superseding_chains_entries() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"xx").unwrap();
        std::fs::write(&b, b"xx").unwrap();

        let index = new_index(dir.path());
        let first = index.insert(hash(1), 2, &a, 1, 0).unwrap();
        let second = index.insert(hash(1), 2, &b, 2, 0).unwrap();
        assert_eq!(second.next_entry_id, first.entry_id);

        // Newest head wins.
        assert_eq!(index.find(&hash(1), 2).unwrap().entry_id, second.entry_id);

        // If the newest canonical file vanishes, the chain still serves.
        std::fs::remove_file(&b).unwrap();
        assert_eq!(index.find(&hash(1), 2).unwrap().entry_id, first.entry_id);
    }

    #[test]
    fn find_and_link_hardlinks() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().join("store.bin");
        std::fs::write(&canonical, b"hello").unwrap();

        let index = new_index(dir.path());
        index.insert(hash(3), 5, &canonical, 1, 0).unwrap();

        let dest = dir.path().join("dest.bin");
        match index
            .find_and_link(&hash(3), 5, &dest, LinkMode::HardLink)
            .unwrap()
        {
            LinkOutcome::Linked { entry } => assert_eq!(entry.size, 5),
            other => panic!("expected Linked, got {other:?}"),
        }
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            assert_eq!(std::fs::metadata(&dest).unwrap().nlink(), 2);
        }
    }

    #[test]
    fn find_and_link_copy_mode() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().join("store.bin");
        std::fs::write(&canonical, b"hello").unwrap();

        let index = new_index(dir.path());
        index.insert(hash(3), 5, &canonical, 1, 0).unwrap();

        let dest = dir.path().join("dest.bin");
        match index
            .find_and_link(&hash(3), 5, &dest, LinkMode::Copy)
            .unwrap()
        {
            LinkOutcome::Copied { .. } => {}
            other => panic!("expected Copied, got {other:?}"),
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            assert_eq!(std::fs::metadata(&dest).unwrap().nlink(), 1);
        }
    }

    #[test]
    fn find_and_link_miss() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path());
        let dest = dir.path().join("dest.bin");
        assert!(matches!(
            index
                .find_and_link(&hash(9), 1, &dest, LinkMode::HardLink)
                .unwrap(),
            LinkOutcome::Miss
        ));
        assert!(!dest.exists());
    }

    #[test]
    fn vanished_canonical_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().join("gone.bin");
        std::fs::write(&canonical, b"x").unwrap();

        let index = new_index(dir.path());
        index.insert(hash(4), 1, &canonical, 1, 0).unwrap();
        std::fs::remove_file(&canonical).unwrap();

        let dest = dir.path().join("dest.bin");
        assert!(matches!(
            index
                .find_and_link(&hash(4), 1, &dest, LinkMode::HardLink)
                .unwrap(),
            LinkOutcome::Miss
        ));
    }

    #[test]
    fn save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().join("store.bin");
        std::fs::write(&canonical, b"12345").unwrap();
        let index_path = dir.path().join("files_index.mp");

        {
            let index = HashIndex::open(&index_path).unwrap();
            index.insert(hash(1), 5, &canonical, 7, 0).unwrap();
            index.save().unwrap();
        }

        let reopened = HashIndex::open(&index_path).unwrap();
        assert_eq!(reopened.len(), 1);
        let entry = reopened.find(&hash(1), 5).unwrap();
        assert_eq!(entry.client_id, 7);
    }

    #[test]
    fn corrupt_snapshot_is_an_index_error() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("files_index.mp");
        std::fs::write(&index_path, b"not msgpack").unwrap();
        match HashIndex::open(&index_path) {
            Err(BulwarkError::HashIndexError(_)) => {}
            other => panic!("expected HashIndexError, got {other:?}"),
        }
    }
}
