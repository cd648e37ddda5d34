pub mod process;

pub use process::{clientlist_name, create_client_symlink, declared_hash, incremental_size};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::client::{
    BackupDao, ControlClient, MailSender, PingMonitor, SnapshotHelper, TransferClient,
};
use crate::config::JobContext;
use crate::error::{BulwarkError, Result};
use crate::eta::{interpolate_durations, DurationSample};
use crate::index::{HashIndex, LinkMode};
use crate::legalize::{LegalizePolicy, PathCorrections};
use crate::metadata::stream::{FinishedMetadataStream, MetadataSource, MetadataStream};
use crate::paths::{BackupPath, BackupPathBuilder};
use crate::pipeline::{CommitContext, Pipeline, PipelineShared};
use crate::protocol::{self, FilelistRequest, NegotiationTimeouts};
use crate::tokens::{remote_tokens_path, TokensFile, TOKENS_FILE_NAME};
use crate::user_view::create_user_views;
use crate::verify::Verifier;
use process::FilelistProcessor;

/// Name of the freshly built filelist on the client's file server.
const REMOTE_FILELIST: &str = "urbackup/filelist.ub";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Full,
    Incremental,
    Continuous,
}

impl BackupKind {
    pub fn is_incremental(self) -> bool {
        matches!(self, BackupKind::Incremental | BackupKind::Continuous)
    }
}

/// One backup invocation. Owned by the coordinator for its lifetime.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub client_id: i64,
    pub client_name: String,
    pub clientsubname: String,
    pub kind: BackupKind,
    pub group: i32,
    pub use_snapshots: bool,
    pub use_reflink: bool,
    pub use_tmpfiles: bool,
    pub resume: bool,
    pub log_id: i64,
}

/// Coordinator lifecycle states (terminal: Committed, EarlyError, Fatal,
/// Failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Idle,
    Preflight,
    RequestingFilelist,
    Running,
    Draining,
    Finalizing,
    Committed,
    EarlyError,
    Fatal,
    Failed,
}

/// Injected external collaborators, each behind a narrow contract.
pub struct Collaborators {
    pub control: Arc<dyn ControlClient>,
    pub transfer: Arc<dyn TransferClient>,
    pub snapshots: Arc<dyn SnapshotHelper>,
    pub dao: Arc<dyn BackupDao>,
    pub mail: Arc<dyn MailSender>,
    pub ping: Arc<dyn PingMonitor>,
    /// Connection for the out-of-band metadata stream, when the client
    /// supports one. Consumed at helper start.
    pub metadata_source: Option<Box<dyn MetadataSource>>,
}

/// The file-backup coordinator: negotiates the filelist, drives the hash
/// pipeline, finalizes the snapshot tree and commits or tears down.
pub struct FileBackup {
    job: BackupJob,
    ctx: JobContext,
    collab: Collaborators,
    index: Option<Arc<HashIndex>>,
    shared: Arc<PipelineShared>,
    corrections: PathCorrections,
    paths: Option<BackupPath>,
    state: BackupState,
    backup_id: i64,
    policy: LegalizePolicy,
    filelist_path: Option<PathBuf>,
    metadata_stream: Option<MetadataStream>,
    metadata_stream_result: Option<FinishedMetadataStream>,
    metadata_warning: bool,
    has_early_error: bool,
    /// Test override; defaults derive from the protocol version.
    pub negotiation_timeouts: Option<NegotiationTimeouts>,
    /// Status poll granularity while draining.
    pub drain_poll: Duration,
}

impl FileBackup {
    pub fn new(job: BackupJob, ctx: JobContext, collab: Collaborators) -> Self {
        FileBackup {
            job,
            ctx,
            collab,
            index: None,
            shared: Arc::new(PipelineShared::default()),
            corrections: PathCorrections::new(),
            paths: None,
            state: BackupState::Idle,
            backup_id: -1,
            policy: LegalizePolicy::host(),
            filelist_path: None,
            metadata_stream: None,
            metadata_stream_result: None,
            metadata_warning: false,
            has_early_error: false,
            negotiation_timeouts: None,
            drain_poll: Duration::from_secs(1),
        }
    }

    /// Reuse an already-open hash index (shared across backups).
    pub fn with_hash_index(mut self, index: Arc<HashIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Legalization policy override, for trees restored to foreign hosts.
    pub fn with_policy(mut self, policy: LegalizePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    pub fn backup_path(&self) -> Option<&BackupPath> {
        self.paths.as_ref()
    }

    pub fn has_early_error(&self) -> bool {
        self.has_early_error
    }

    pub fn has_disk_error(&self) -> bool {
        self.shared.has_disk_error()
    }

    /// Metadata application failed non-fatally; the backup still commits.
    pub fn has_metadata_warning(&self) -> bool {
        self.metadata_warning
    }

    /// Run the backup to completion. `true` iff a complete (and, where
    /// requested, verified) backup was committed.
    pub fn run(&mut self) -> bool {
        let started = Instant::now();
        self.state = BackupState::Preflight;
        info!(
            client = %self.job.client_name,
            log_id = self.job.log_id,
            kind = ?self.job.kind,
            "starting file backup"
        );

        let result = self.do_file_backup(started);

        match result {
            Ok(true) => {
                self.state = BackupState::Committed;
                info!(client = %self.job.client_name, log_id = self.job.log_id, "backup complete");
                true
            }
            Ok(false) => {
                self.state = BackupState::Failed;
                self.notify_client(false);
                warn!(
                    client = %self.job.client_name,
                    log_id = self.job.log_id,
                    errors = self.shared.error_count(),
                    "backup failed, partial tree retained"
                );
                false
            }
            Err(e) => {
                self.fail(&e);
                false
            }
        }
    }

    /// Classify a terminal error and tear down accordingly.
    fn fail(&mut self, e: &BulwarkError) {
        if e.is_disk_level() || self.shared.has_disk_error() {
            self.state = BackupState::Fatal;
            error!(
                client = %self.job.client_name,
                log_id = self.job.log_id,
                error = %e,
                "FATAL: backup failed because of disk problems"
            );
            self.collab.mail.send_mail_to_admins(
                "Fatal error occured during backup",
                &format!("Backup of {} failed: {e}", self.job.client_name),
            );
            // Partial tree is preserved for inspection.
            self.notify_client(false);
        } else if self.has_early_error || e.is_early() {
            self.has_early_error = true;
            self.state = BackupState::EarlyError;
            error!(
                client = %self.job.client_name,
                log_id = self.job.log_id,
                error = %e,
                "backup had an early error, deleting partial backup"
            );
            self.delete_partial_backup();
        } else {
            self.state = BackupState::Failed;
            error!(client = %self.job.client_name, log_id = self.job.log_id, error = %e, "backup failed");
            self.notify_client(false);
        }
    }

    fn do_file_backup(&mut self, started: Instant) -> Result<bool> {
        // --- Preflight -------------------------------------------------
        let backup_folder = PathBuf::from(&self.ctx.settings.backup_folder);
        let free = crate::platform::free_space(&backup_folder)?;
        if free < self.ctx.settings.free_space_min {
            return Err(BulwarkError::DiskError(format!(
                "not enough free space in {} ({free} bytes)",
                backup_folder.display()
            )));
        }

        let prior = interpolate_durations(&self.collab.dao.get_durations(self.job.client_id)?);
        if prior.duration_ms > 0 {
            debug!(
                estimated_duration_ms = prior.duration_ms,
                estimated_indexing_ms = prior.indexing_time_ms,
                "prior duration estimate"
            );
        }

        if self.index.is_none() {
            self.index = Some(Arc::new(HashIndex::open(
                &backup_folder.join(".files_index.mp"),
            )?));
        }
        let index = Arc::clone(self.index.as_ref().expect("opened above"));

        let builder = BackupPathBuilder::new(&backup_folder, &self.job.client_name);
        let paths = match self.job.kind {
            BackupKind::Continuous => builder.build_continuous()?,
            kind => builder.build(
                self.job.use_snapshots,
                !kind.is_incremental(),
                self.collab.snapshots.as_ref(),
            )?,
        };
        self.paths = Some(paths.clone());

        let staging_keeper;
        let staging_dir = if self.job.use_tmpfiles {
            staging_keeper = Some(tempfile::tempdir()?);
            staging_keeper
                .as_ref()
                .expect("created above")
                .path()
                .to_path_buf()
        } else {
            staging_keeper = None;
            let dir = backup_folder
                .join(&self.job.client_name)
                .join(format!(".staging_{}", paths.single));
            std::fs::create_dir_all(&dir)?;
            dir
        };

        self.backup_id = self.collab.dao.new_file_backup(
            self.job.client_id,
            &paths.single,
            self.job.kind.is_incremental(),
            self.job.group,
        )?;

        if self.ctx.settings.end_to_end_file_backup_verification {
            if let Err(e) = protocol::enable_end_to_end_verification(self.collab.control.as_ref())
            {
                warn!(error = %e, "client refused end to end verification");
            }
        }

        // --- StartHelpers ----------------------------------------------
        let link_mode = if self.job.use_reflink {
            LinkMode::Copy
        } else {
            LinkMode::HardLink
        };
        let pipeline = Pipeline::start(
            self.ctx.digest_kind(),
            CommitContext {
                index: Arc::clone(&index),
                dao: Arc::clone(&self.collab.dao),
                backup_id: self.backup_id,
                client_id: self.job.client_id,
                link_mode,
                shared: Arc::clone(&self.shared),
            },
        );

        // --- RequestFilelist / Process --------------------------------
        let negotiation_start = Instant::now();
        let result = self.transfer_phase(&index, &paths, &staging_dir, link_mode, &pipeline);
        let indexing_time_ms = negotiation_start.elapsed().as_millis() as i64;

        // --- Drain -----------------------------------------------------
        self.state = BackupState::Draining;
        pipeline.flush();
        while !pipeline.is_drained() {
            let (prepare, commit) = pipeline.queue_sizes();
            debug!(prepare_queue = prepare, commit_queue = commit, "waiting for hash workers");
            std::thread::sleep(self.drain_poll);
        }
        pipeline.shutdown();

        // A stream still running here means the transfer phase bailed out
        // early; stop it before deciding the terminal state.
        if let Some(stream) = self.metadata_stream.take() {
            let transfer = Arc::clone(&self.collab.transfer);
            let token = self.ctx.server_token.clone();
            self.metadata_stream_result = Some(stream.finish(move || {
                let _ = transfer.inform_metadata_stream_end(&token);
            }));
        }
        let finished_meta = self.metadata_stream_result.take();
        drop(staging_keeper);
        if !self.job.use_tmpfiles {
            let _ = std::fs::remove_dir_all(&staging_dir);
        }

        result?;

        if self.shared.has_disk_error() {
            return Err(BulwarkError::DiskError(
                "disk error while writing backup content".into(),
            ));
        }

        // --- Finalize --------------------------------------------------
        self.state = BackupState::Finalizing;
        self.finalize(&index, &paths, finished_meta)?;

        if self.shared.error_count() > 0 {
            // Some filelist entries were neither committed nor linked; the
            // backup row must not be marked complete.
            return Ok(false);
        }

        // --- Commit ----------------------------------------------------
        self.commit(started, indexing_time_ms)?;
        Ok(true)
    }

    /// Request the filelist, download it, start the metadata stream and
    /// feed every entry into the pipeline.
    fn transfer_phase(
        &mut self,
        index: &Arc<HashIndex>,
        paths: &BackupPath,
        staging_dir: &std::path::Path,
        link_mode: LinkMode,
        pipeline: &Pipeline,
    ) -> Result<()> {
        self.state = BackupState::RequestingFilelist;
        let req = FilelistRequest {
            full: matches!(self.job.kind, BackupKind::Full),
            resume: self.job.resume,
            group: self.job.group,
            clientsubname: self.job.clientsubname.clone(),
            with_token: true,
        };
        let timeouts = self
            .negotiation_timeouts
            .unwrap_or_else(|| NegotiationTimeouts::for_protocol(&self.ctx));
        protocol::request_filelist_construct(
            &self.ctx,
            &self.job.client_name,
            self.collab.control.as_ref(),
            self.collab.ping.as_ref(),
            &req,
            timeouts,
        )
        .map_err(|e| {
            self.has_early_error = true;
            e
        })?;

        let filelist = self.download_filelist()?;

        self.state = BackupState::Running;
        if self.ctx.protocol.file_meta > 0 {
            match self.collab.metadata_source.take() {
                Some(source) => {
                    self.metadata_stream = Some(MetadataStream::start(source));
                }
                None => {
                    self.has_early_error = true;
                    return Err(BulwarkError::ConnectFail(format!(
                        "{} (metadata stream)",
                        self.job.client_name
                    )));
                }
            }
        }

        let total_expected_bytes = incremental_size(&filelist, &[], true)?;
        debug!(total_expected_bytes, "filelist downloaded");

        let processor = FilelistProcessor::new(
            paths,
            staging_dir,
            &mut self.corrections,
            index,
            self.collab.dao.as_ref(),
            self.collab.transfer.as_ref(),
            pipeline,
            self.shared.as_ref(),
            self.policy,
            self.ctx.digest_kind(),
            link_mode,
            self.backup_id,
            self.job.client_id,
            total_expected_bytes,
        );
        let stats = processor.process(&filelist)?;
        info!(
            entries = stats.entries,
            files = stats.files,
            fetched = stats.fetched,
            linked = stats.linked_inline,
            "filelist processed"
        );

        // Stop pulling metadata; records apply after drain.
        if let Some(stream) = self.metadata_stream.take() {
            let transfer = Arc::clone(&self.collab.transfer);
            let token = self.ctx.server_token.clone();
            self.metadata_stream_result = Some(stream.finish(move || {
                let _ = transfer.inform_metadata_stream_end(&token);
            }));
        }
        Ok(())
    }

    /// Pull the fresh filelist into the clientlists area; it later becomes
    /// the committed client list for this group.
    fn download_filelist(&mut self) -> Result<PathBuf> {
        let dir = PathBuf::from(&self.ctx.settings.backup_folder).join("clientlists");
        std::fs::create_dir_all(&dir)?;
        let local = dir.join(
            clientlist_name(self.job.group, self.job.client_id, true)
                .rsplit('/')
                .next()
                .expect("name has a basename"),
        );
        self.collab
            .transfer
            .fetch_file(REMOTE_FILELIST, &local)
            .map_err(|e| {
                self.has_early_error = true;
                BulwarkError::FilelistRemoteError(format!("downloading filelist: {e}"))
            })?;
        self.filelist_path = Some(local.clone());
        Ok(local)
    }

    fn finalize(
        &mut self,
        index: &Arc<HashIndex>,
        paths: &BackupPath,
        finished_meta: Option<FinishedMetadataStream>,
    ) -> Result<()> {
        let filelist = self
            .filelist_path
            .clone()
            .ok_or_else(|| BulwarkError::Other("finalize without filelist".into()))?;

        // Metadata first; user views read the sidecar blobs it writes.
        if let Some(meta) = finished_meta {
            if meta.has_error() {
                warn!("metadata stream reported errors");
                self.metadata_warning = true;
            }
            if let Err(e) = meta.apply_metadata(&paths.hashes_root, &paths.root, &self.corrections)
            {
                warn!(error = %e, "metadata application failed, backup continues");
                self.metadata_warning = true;
            }
        }

        let tokens = self.fetch_token_file(paths);
        if let Some(tokens) = tokens.as_ref() {
            self.propagate_access_key(tokens);
            self.save_users_on_client(tokens);
        }

        create_user_views(
            &filelist,
            tokens.as_ref(),
            paths,
            std::path::Path::new(&self.ctx.settings.backup_folder),
            &self.job.client_name,
            self.policy,
        );

        if self.ctx.settings.verify_backups {
            let verifier = Verifier {
                backup_root: &paths.root,
                backup_id: self.backup_id,
                digest_kind: self.ctx.digest_kind(),
                policy: self.policy,
                transfer: Some(self.collab.transfer.as_ref()),
                mail: self.collab.mail.as_ref(),
            };
            if !verifier.verify_file_backup(&filelist)? {
                warn!("backup verification failed");
                self.shared
                    .errors
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                return Ok(());
            }
        }

        index.save()?;
        Ok(())
    }

    /// Download `.urbackup_tokens.properties` into the hashes root.
    fn fetch_token_file(&self, paths: &BackupPath) -> Option<TokensFile> {
        let local = paths.hashes_root.join(TOKENS_FILE_NAME);
        if let Err(e) = self
            .collab
            .transfer
            .fetch_file(&remote_tokens_path(&self.ctx.server_token), &local)
        {
            debug!(error = %e, "error getting tokens file");
            return None;
        }
        match TokensFile::load(&local) {
            Ok(tokens) => Some(tokens),
            Err(e) => {
                warn!(error = %e, "error parsing tokens file");
                None
            }
        }
    }

    /// A changed client access key is persisted and invalidates any tokens
    /// minted under the old one.
    fn propagate_access_key(&self, tokens: &TokensFile) {
        let Some(access_key) = tokens.access_key() else {
            return;
        };
        if access_key == self.ctx.settings.client_access_key {
            return;
        }
        if let Err(e) =
            self.collab
                .dao
                .update_or_insert_setting(self.job.client_id, "client_access_key", access_key)
        {
            warn!(error = %e, "could not store client access key");
            return;
        }
        if !self.ctx.settings.client_access_key.is_empty() {
            if let Err(e) = self.collab.dao.delete_used_access_tokens(self.job.client_id) {
                warn!(error = %e, "could not invalidate old access tokens");
            }
        }
    }

    fn save_users_on_client(&self, tokens: &TokensFile) {
        let dao = self.collab.dao.as_ref();
        if let Err(e) = dao.delete_all_users_on_client(self.job.client_id) {
            warn!(error = %e, "could not clear users on client");
            return;
        }
        for principal in tokens.all_principals() {
            let _ = dao.add_user_on_client(self.job.client_id, &principal.account_name);
            if let Some(token) = tokens.token_for(principal.uid) {
                let _ = dao.add_user_token(&principal.account_name, token);
            }
            for gid in &principal.gids {
                if let Some(token) = tokens.token_for(*gid) {
                    let _ = dao.add_user_token(&principal.account_name, token);
                }
            }
        }
        for token in tokens.all_tokens() {
            let _ = dao.add_client_token(self.job.client_id, token);
        }
    }

    fn commit(&mut self, started: Instant, indexing_time_ms: i64) -> Result<()> {
        self.collab.dao.set_backup_complete(self.backup_id)?;
        self.collab
            .dao
            .update_client_last_file_backup(self.backup_id, self.job.client_id)?;
        self.collab.dao.add_duration(
            self.job.client_id,
            DurationSample {
                indexing_time_ms,
                duration_ms: started.elapsed().as_millis() as i64,
            },
        )?;

        // Promote the downloaded filelist to the committed client list.
        if let Some(filelist) = &self.filelist_path {
            let committed = filelist.with_file_name(
                clientlist_name(self.job.group, self.job.client_id, false)
                    .rsplit('/')
                    .next()
                    .expect("name has a basename"),
            );
            if let Err(e) = std::fs::rename(filelist, &committed) {
                warn!(error = %e, "could not promote client list");
            } else {
                self.filelist_path = Some(committed);
            }
        }

        self.notify_client(true);
        Ok(())
    }

    /// Tell the client the backup finished; only success is retried.
    fn notify_client(&self, ok: bool) {
        if !ok {
            return;
        }
        for attempt in 0..5 {
            match self
                .collab
                .control
                .send_message("DID BACKUP", Duration::from_secs(10))
            {
                Ok(reply) if reply == "OK" => return,
                Ok(reply) => {
                    warn!(attempt, reply = %reply, "unexpected reply to DID BACKUP");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "sending status (DID BACKUP) to client failed");
                }
            }
        }
    }

    /// EarlyError teardown: drop the partially created tree, preferring
    /// snapshot removal.
    fn delete_partial_backup(&mut self) {
        let Some(paths) = self.paths.clone() else {
            return;
        };
        if self.job.use_snapshots {
            match self
                .collab
                .snapshots
                .remove_filesystem(&self.job.client_name, &paths.single)
            {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "snapshot removal failed, unlinking instead"),
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&paths.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(root = %paths.root.display(), error = %e, "could not delete partial backup");
            }
        }
    }
}
