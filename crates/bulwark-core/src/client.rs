//! Narrow contracts the coordinator requires from its external
//! collaborators: the client's control and file-transfer connections, the
//! snapshot helper, the database access layer, mail notification and the
//! ping monitor. The TCP stack, database schema and wire details live
//! behind these traits.

use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::eta::DurationSample;
use bulwark_types::ContentHash;

/// A framed command connection to the client (length-prefixed packets are
/// handled below this trait).
pub trait ControlConnection: Send {
    fn send(&mut self, cmd: &str) -> Result<()>;

    /// Read the next packet, waiting at most `timeout`. `Ok(None)` means
    /// the read timed out with the connection still alive.
    fn read_packet(&mut self, timeout: Duration) -> Result<Option<String>>;
}

pub trait ControlClient: Send + Sync {
    fn connect_control(&self, timeout: Duration) -> Result<Box<dyn ControlConnection>>;

    /// One-shot command returning the client's reply.
    fn send_message(&self, cmd: &str, timeout: Duration) -> Result<String>;
}

/// Low-level file download client. Implementations may run their own I/O
/// threads; the coordinator treats calls as synchronous.
pub trait TransferClient: Send + Sync {
    /// Download `remote_path` to `local_path`. Returns the client-computed
    /// digest when the active transfer mode provides one (blockhash).
    fn fetch_file(&self, remote_path: &str, local_path: &Path) -> Result<Option<ContentHash>>;

    /// Cumulative payload bytes received over this client.
    fn received_bytes(&self) -> i64;

    /// Tell the client to close its metadata stream for this server token.
    fn inform_metadata_stream_end(&self, server_token: &str) -> Result<()>;
}

/// Filesystem snapshot management for clients whose backup trees live on a
/// snapshot-capable volume.
pub trait SnapshotHelper: Send + Sync {
    fn create_empty_filesystem(&self, client_name: &str, single: &str) -> Result<()>;

    /// Returns `false` when no snapshot existed to remove, so the caller
    /// can fall back to a recursive unlink.
    fn remove_filesystem(&self, client_name: &str, single: &str) -> Result<bool>;
}

/// Relational bookkeeping for backups, file links, duration history and
/// per-client users/tokens.
#[allow(clippy::too_many_arguments)]
pub trait BackupDao: Send + Sync {
    fn new_file_backup(
        &self,
        client_id: i64,
        path: &str,
        incremental: bool,
        group: i32,
    ) -> Result<i64>;

    fn add_file_link(
        &self,
        backup_id: i64,
        client_id: i64,
        dest_path: &str,
        hash_path: &str,
        hash: &ContentHash,
        filesize: u64,
        rsize: i64,
        entry_id: i64,
        entry_client_id: i64,
        next_entry_id: i64,
        copied_file: bool,
    ) -> Result<()>;

    fn set_backup_complete(&self, backup_id: i64) -> Result<()>;
    fn update_client_last_file_backup(&self, backup_id: i64, client_id: i64) -> Result<()>;

    fn get_durations(&self, client_id: i64) -> Result<Vec<DurationSample>>;
    fn add_duration(&self, client_id: i64, sample: DurationSample) -> Result<()>;

    fn update_or_insert_setting(&self, client_id: i64, key: &str, value: &str) -> Result<()>;
    fn delete_used_access_tokens(&self, client_id: i64) -> Result<()>;

    fn delete_all_users_on_client(&self, client_id: i64) -> Result<()>;
    fn add_user_on_client(&self, client_id: i64, account_name: &str) -> Result<()>;
    fn add_user_token(&self, account_name: &str, token: &str) -> Result<()>;
    fn add_client_token(&self, client_id: i64, token: &str) -> Result<()>;
}

pub trait MailSender: Send + Sync {
    fn send_mail_to_admins(&self, subject: &str, body: &str);
}

/// Exposes the ping worker's view of client liveness. Checked at read
/// boundaries; flipping to timeout aborts the backup.
pub trait PingMonitor: Send + Sync {
    fn is_timeout(&self) -> bool;
}
