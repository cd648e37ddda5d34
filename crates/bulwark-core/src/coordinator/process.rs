use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, warn};

use crate::client::{BackupDao, TransferClient};
use crate::digest::DigestKind;
use crate::error::{BulwarkError, Result};
use crate::eta::SpeedEstimator;
use crate::filelist::{for_each_entry, EntryKind, FileEntry};
use crate::index::{HashIndex, LinkMode, LinkOutcome};
use crate::legalize::{legalize_filename, LegalizePolicy, PathCorrections};
use crate::metadata::{dir_sidecar_path, file_sidecar_path, write_metadata, FileMetadata};
use crate::paths::BackupPath;
use crate::pipeline::{Pipeline, PipelineItem, PipelineShared};
use crate::platform;
use crate::staging::StagedFile;
use bulwark_types::ContentHash;

/// Counters from one pass over the filelist.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStats {
    pub entries: usize,
    pub files: usize,
    pub fetched: usize,
    pub linked_inline: usize,
    pub empty_files: usize,
    pub symlinks: usize,
}

/// Streams the downloaded filelist and drives the per-entry decision:
/// hash-link inline, fetch into the pipeline, or materialize directly
/// (directories, empty files, symlinks).
pub(super) struct FilelistProcessor<'a> {
    pub paths: &'a BackupPath,
    pub staging_dir: &'a Path,
    pub corrections: &'a mut PathCorrections,
    pub index: &'a HashIndex,
    pub dao: &'a dyn BackupDao,
    pub transfer: &'a dyn TransferClient,
    pub pipeline: &'a Pipeline,
    pub shared: &'a PipelineShared,
    pub policy: LegalizePolicy,
    pub digest_kind: DigestKind,
    pub link_mode: LinkMode,
    pub backup_id: i64,
    pub client_id: i64,
    /// Sum of file sizes in the filelist, for the ETA estimate.
    pub total_expected_bytes: i64,

    // Walk state.
    client_path: String,
    os_rel: String,
    folder_files: Vec<HashSet<String>>,
    staged_seq: u64,
    stats: ProcessStats,
    eta: SpeedEstimator,
    started: Instant,
    last_eta_tick_ms: i64,
}

#[allow(clippy::too_many_arguments)]
impl<'a> FilelistProcessor<'a> {
    pub fn new(
        paths: &'a BackupPath,
        staging_dir: &'a Path,
        corrections: &'a mut PathCorrections,
        index: &'a HashIndex,
        dao: &'a dyn BackupDao,
        transfer: &'a dyn TransferClient,
        pipeline: &'a Pipeline,
        shared: &'a PipelineShared,
        policy: LegalizePolicy,
        digest_kind: DigestKind,
        link_mode: LinkMode,
        backup_id: i64,
        client_id: i64,
        total_expected_bytes: i64,
    ) -> Self {
        FilelistProcessor {
            paths,
            staging_dir,
            corrections,
            index,
            dao,
            transfer,
            pipeline,
            shared,
            policy,
            digest_kind,
            link_mode,
            backup_id,
            client_id,
            total_expected_bytes,
            client_path: String::new(),
            os_rel: String::new(),
            folder_files: vec![HashSet::new()],
            staged_seq: 0,
            stats: ProcessStats::default(),
            eta: SpeedEstimator::new(),
            started: Instant::now(),
            last_eta_tick_ms: 0,
        }
    }

    pub fn process(mut self, filelist: &Path) -> Result<ProcessStats> {
        let mut reader = BufReader::new(File::open(filelist)?);
        for_each_entry(&mut reader, |entry| self.handle_entry(entry))?;
        Ok(self.stats)
    }

    fn handle_entry(&mut self, entry: FileEntry) -> Result<()> {
        self.stats.entries += 1;
        match entry.kind {
            EntryKind::Dir => self.enter_dir(&entry),
            EntryKind::UpDir => {
                self.leave_dir();
                Ok(())
            }
            EntryKind::File => {
                self.stats.files += 1;
                self.handle_file(entry)?;
                self.maybe_tick_eta();
                Ok(())
            }
        }
    }

    fn legalize(&mut self, entry: &FileEntry) -> String {
        let legal = legalize_filename(
            &entry.name,
            self.folder_files.last_mut().expect("stack never empty"),
            self.policy,
        );
        if legal.modified {
            self.corrections
                .record(&self.os_rel, &entry.name_lossy(), &legal.name);
        }
        legal.name
    }

    fn join_rel(&self, name: &str) -> String {
        if self.os_rel.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.os_rel)
        }
    }

    fn enter_dir(&mut self, entry: &FileEntry) -> Result<()> {
        let name = self.legalize(entry);
        self.folder_files.push(HashSet::new());
        self.os_rel = self.join_rel(&name);
        self.client_path = if self.client_path.is_empty() {
            entry.name_lossy()
        } else {
            format!("{}/{}", self.client_path, entry.name_lossy())
        };

        let content_dir = self.paths.root.join(&self.os_rel);
        let hashes_dir = self.paths.hashes_root.join(&self.os_rel);
        std::fs::create_dir_all(&content_dir).map_err(|e| disk_error(&content_dir, e))?;
        std::fs::create_dir_all(&hashes_dir).map_err(|e| disk_error(&hashes_dir, e))?;
        // Placeholder blob; the metadata stream overwrites it after drain.
        write_metadata(
            &dir_sidecar_path(&self.paths.hashes_root, &self.os_rel),
            &FileMetadata::default(),
        )?;
        Ok(())
    }

    fn leave_dir(&mut self) {
        if self.folder_files.len() > 1 {
            self.folder_files.pop();
        }
        self.os_rel = parent_of(&self.os_rel);
        self.client_path = parent_of(&self.client_path);
    }

    fn handle_file(&mut self, entry: FileEntry) -> Result<()> {
        let name = self.legalize(&entry);
        let rel = self.join_rel(&name);
        let dest = self.paths.root.join(&rel);
        let hash_dest = file_sidecar_path(&self.paths.hashes_root, &self.os_rel, &name);
        let client_file = if self.client_path.is_empty() {
            entry.name_lossy()
        } else {
            format!("{}/{}", self.client_path, entry.name_lossy())
        };

        if let Some(target) = entry.symlink_target() {
            self.stats.symlinks += 1;
            let depth = self.folder_files.len() - 1;
            if let Err(e) = create_client_symlink(&dest, depth, target, self.policy) {
                warn!(path = %client_file, error = %e, "could not recreate symlink");
                self.shared.errors.fetch_add(1, Ordering::SeqCst);
            }
            write_metadata(&hash_dest, &FileMetadata::default())?;
            return Ok(());
        }

        if entry.size == 0 {
            // No fetch, no index entry; just the empty file and its record.
            self.stats.empty_files += 1;
            File::create(&dest).map_err(|e| disk_error(&dest, e))?;
            write_metadata(&hash_dest, &FileMetadata::default())?;
            return Ok(());
        }

        if let Some(hash) = declared_hash(&entry, self.digest_kind) {
            if self.try_link_inline(&hash, entry.size, &dest, &hash_dest, &client_file)? {
                self.stats.linked_inline += 1;
                return Ok(());
            }
        }

        self.fetch(&client_file, entry.size, dest, hash_dest)
    }

    /// Serve the entry from the hash index without a fetch.
    fn try_link_inline(
        &mut self,
        hash: &ContentHash,
        size: u64,
        dest: &Path,
        hash_dest: &Path,
        client_file: &str,
    ) -> Result<bool> {
        let (entry, copied) = match self.index.find_and_link(hash, size, dest, self.link_mode)? {
            LinkOutcome::Linked { entry } => (entry, false),
            LinkOutcome::Copied { entry } => (entry, true),
            LinkOutcome::Miss => {
                debug!(path = client_file, "file not found via hash, loading file");
                return Ok(false);
            }
        };

        debug!(path = client_file, "linked file");
        write_metadata(hash_dest, &FileMetadata::default())?;
        self.shared
            .linked_bytes
            .fetch_add(size as i64, Ordering::SeqCst);

        let rsize = if entry.rsize > 0 && entry.rsize != size as i64 {
            entry.rsize
        } else if copied {
            size as i64
        } else {
            0
        };
        if let Err(e) = self.dao.add_file_link(
            self.backup_id,
            self.client_id,
            &dest.to_string_lossy(),
            &hash_dest.to_string_lossy(),
            hash,
            size,
            rsize,
            entry.entry_id,
            entry.client_id,
            entry.next_entry_id,
            copied,
        ) {
            warn!(path = client_file, error = %e, "could not record link row");
            self.shared.errors.fetch_add(1, Ordering::SeqCst);
        }
        Ok(true)
    }

    /// Fetch into staging and hand over to the hash pipeline.
    fn fetch(
        &mut self,
        client_file: &str,
        size: u64,
        dest: PathBuf,
        hash_dest: PathBuf,
    ) -> Result<()> {
        self.staged_seq += 1;
        let staging_name = format!("{:06}", self.staged_seq);
        let (staged, file) = StagedFile::create(self.staging_dir, &staging_name)?;
        drop(file);

        match self.transfer.fetch_file(client_file, staged.path()) {
            Ok(client_hash) => {
                self.stats.fetched += 1;
                let item = PipelineItem {
                    staged,
                    client_path: client_file.to_string(),
                    dest,
                    hash_dest,
                    size,
                    metadata: FileMetadata::default(),
                };
                let submitted = match client_hash {
                    // Blockhash transfers arrive pre-hashed; skip prepare.
                    Some(hash) => self.pipeline.submit_prehashed(item, hash),
                    None => self.pipeline.submit_fetched(item),
                };
                if !submitted {
                    return Err(BulwarkError::Other("hash pipeline is gone".into()));
                }
            }
            Err(e) => {
                warn!(path = client_file, error = %e, "cannot load file from client");
                self.shared.errors.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn maybe_tick_eta(&mut self) {
        let now_ms = self.started.elapsed().as_millis() as i64;
        if now_ms - self.last_eta_tick_ms < 1000 {
            return;
        }
        self.last_eta_tick_ms = now_ms;
        let received =
            self.transfer.received_bytes() + self.shared.linked_bytes.load(Ordering::SeqCst);
        if let Some(eta_seconds) = self.eta.tick(now_ms, received, self.total_expected_bytes) {
            debug!(eta_seconds, received_bytes = received, "backup progress");
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

fn disk_error(path: &Path, e: std::io::Error) -> BulwarkError {
    BulwarkError::DiskError(format!("{}: {e}", path.display()))
}

/// The hash the client asserted for this entry, in the session digest.
pub fn declared_hash(entry: &FileEntry, digest_kind: DigestKind) -> Option<ContentHash> {
    let hash = match digest_kind {
        DigestKind::Sha512 => entry
            .extras
            .get("sha512")
            .and_then(|s| ContentHash::from_base64_dash(s)),
        DigestKind::Sha256 => entry.extras.get("sha256").and_then(|s| {
            ContentHash::from_hex(s).or_else(|| ContentHash::from_base64_dash(s))
        }),
    }?;
    (hash.len() == digest_kind.output_len()).then_some(hash)
}

/// Recreate a client symlink: `depth` levels of `..`, then the legalized
/// target components. `.` and `..` components of the target are dropped.
pub fn create_client_symlink(
    link_path: &Path,
    depth: usize,
    sym_target: &str,
    policy: LegalizePolicy,
) -> std::io::Result<()> {
    let mut target = PathBuf::new();
    for _ in 0..depth {
        target.push("..");
    }
    for component in sym_target.split(['/', '\\']).filter(|c| !c.is_empty()) {
        let mut seen = HashSet::new();
        let legal = legalize_filename(component.as_bytes(), &mut seen, policy);
        if legal.name == "." || legal.name == ".." {
            continue;
        }
        target.push(legal.name);
    }
    platform::create_symlink(&target, link_path)
}

/// Walk the filelist against a sorted list of changed line numbers and sum
/// the sizes a transfer would move; `all` counts every file. Used to seed
/// the ETA for incremental backups.
pub fn incremental_size(filelist: &Path, diffs: &[usize], all: bool) -> Result<i64> {
    let mut reader = BufReader::new(File::open(filelist)?);

    let mut rsize = 0i64;
    let mut indirchange = all;
    let mut changelevel = 0i64;
    let mut depth = 0i64;
    let mut indir_currdepth = 0i64;
    let mut line = 0usize;

    for_each_entry(&mut reader, |cf| {
        if cf.is_dir() {
            let is_up = cf.kind == EntryKind::UpDir;
            if !indirchange && diffs.binary_search(&line).is_ok() {
                indirchange = true;
                changelevel = depth;
                indir_currdepth = 0;
            } else if indirchange {
                if !is_up {
                    indir_currdepth += 1;
                } else {
                    indir_currdepth -= 1;
                }
            }

            if is_up && indir_currdepth > 0 {
                indir_currdepth -= 1;
            }

            if !is_up {
                depth += 1;
            } else {
                depth -= 1;
                if indirchange && depth == changelevel && !all {
                    indirchange = false;
                }
            }
        } else if (indirchange || diffs.binary_search(&line).is_ok()) && cf.size > 0 {
            rsize += cf.size as i64;
        }
        line += 1;
        Ok(())
    })?;

    Ok(rsize)
}

/// Database object name for a client's filelist snapshot.
pub fn clientlist_name(group: i32, client_id: i64, new_list: bool) -> String {
    let mut name = String::from("urbackup/clientlist_");
    if group != 0 {
        name.push_str(&format!("{group}_"));
    }
    name.push_str(&client_id.to_string());
    if new_list {
        name.push_str("_new");
    }
    name.push_str(".ub");
    name
}
