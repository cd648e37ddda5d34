use serde::{Deserialize, Serialize};

use crate::digest::DigestKind;

fn default_free_space_min() -> u64 {
    1024 * 1024 * 1024
}

fn default_transfer_mode() -> String {
    "raw".into()
}

/// Server-side settings relevant to one file backup. Loaded by the settings
/// collaborator; immutable for the lifetime of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Root under which all client backup trees live.
    pub backup_folder: String,
    /// Minimum free bytes required in `backup_folder` before starting.
    #[serde(default = "default_free_space_min")]
    pub free_space_min: u64,
    /// Transfer mode for local incremental backups: "raw", "hashed" or "blockhash".
    #[serde(default = "default_transfer_mode")]
    pub local_incr_file_transfer_mode: String,
    /// Transfer mode for internet incremental backups.
    #[serde(default = "default_transfer_mode")]
    pub internet_incr_file_transfer_mode: String,
    #[serde(default)]
    pub internet_mode_enabled: bool,
    /// Ask the client to hash every transferred file end to end.
    #[serde(default)]
    pub end_to_end_file_backup_verification: bool,
    /// Re-hash the finished backup tree against the filelist.
    #[serde(default)]
    pub verify_backups: bool,
    #[serde(default)]
    pub client_access_key: String,
}

impl ServerSettings {
    /// Whether the configured transfer modes imply client-side block hashing,
    /// in which case fetched files arrive with their digest already known.
    pub fn wants_blockhash(&self, internet_connection: bool) -> bool {
        if internet_connection && self.internet_mode_enabled {
            if self.internet_incr_file_transfer_mode == "blockhash" {
                return true;
            }
        }
        self.local_incr_file_transfer_mode == "blockhash"
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            backup_folder: String::new(),
            free_space_min: default_free_space_min(),
            local_incr_file_transfer_mode: default_transfer_mode(),
            internet_incr_file_transfer_mode: default_transfer_mode(),
            internet_mode_enabled: false,
            end_to_end_file_backup_verification: false,
            verify_backups: false,
            client_access_key: String::new(),
        }
    }
}

/// Protocol capabilities advertised by the connected client.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolVersions {
    pub file_protocol_version: u32,
    pub file_protocol_version_v2: u32,
    /// Nonzero when the client can compute SHA-512 filelist digests.
    pub select_sha_version: u32,
    pub eta_version: u32,
    /// Nonzero when the client serves the out-of-band metadata stream.
    pub file_meta: u32,
}

/// Immutable per-job context: global identity plus settings.
/// Constructed once, shared by reference for the job's lifetime.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub server_identity: String,
    pub server_token: String,
    /// Session identity negotiated for this client, if any; falls back to
    /// `server_identity` when empty.
    pub session_identity: String,
    pub settings: ServerSettings,
    pub protocol: ProtocolVersions,
    pub internet_connection: bool,
}

impl JobContext {
    pub fn identity(&self) -> &str {
        if self.session_identity.is_empty() {
            &self.server_identity
        } else {
            &self.session_identity
        }
    }

    /// Digest used for filelist hashes and verification.
    pub fn digest_kind(&self) -> DigestKind {
        if self.protocol.select_sha_version > 0 {
            DigestKind::Sha512
        } else {
            DigestKind::Sha256
        }
    }
}
