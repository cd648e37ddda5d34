use thiserror::Error;

pub type Result<T> = std::result::Result<T, BulwarkError>;

#[derive(Debug, Error)]
pub enum BulwarkError {
    #[error("no control connection to client '{0}'")]
    ConnectFail(String),

    #[error("filelist construction timed out")]
    FilelistTimeout,

    #[error("filelist construction failed: {0}")]
    FilelistRemoteError(String),

    #[error("client has no backup dirs configured")]
    NoBackupDirs,

    #[error("cannot create backup tree at '{0}'")]
    CannotCreateBackupTree(String),

    #[error("disk error: {0}")]
    DiskError(String),

    #[error("verification mismatch for '{path}': local {local_hash}, remote {remote_hash}")]
    VerifyMismatch {
        path: String,
        local_hash: String,
        remote_hash: String,
    },

    #[error("metadata apply failed: {0}")]
    MetadataApplyError(String),

    #[error("hash index error: {0}")]
    HashIndexError(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BulwarkError {
    /// Errors that poison the whole backup and mail the admins.
    pub fn is_disk_level(&self) -> bool {
        matches!(
            self,
            BulwarkError::DiskError(_) | BulwarkError::HashIndexError(_)
        )
    }

    /// Errors occurring before any durable content was written.
    pub fn is_early(&self) -> bool {
        matches!(
            self,
            BulwarkError::ConnectFail(_)
                | BulwarkError::FilelistTimeout
                | BulwarkError::FilelistRemoteError(_)
                | BulwarkError::NoBackupDirs
        )
    }
}
