pub mod stream;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Name of the per-directory metadata blob inside the hashes sidecar tree.
pub const DIR_METADATA_FN: &str = ".dir_metadata";

/// Sidecar filename for a content entry. Escapes the rare names that would
/// collide with the directory blob or with an already-escaped name; the
/// mapping is injective (strip one `.e` to invert).
pub fn escape_metadata_fn(name: &str) -> String {
    if name == DIR_METADATA_FN || name.starts_with(".e") {
        format!(".e{name}")
    } else {
        name.to_string()
    }
}

/// Per-entry metadata delivered out of band by the client and stored as a
/// sidecar blob next to the content tree.
///
/// `file_permissions` is a whitespace-separated token list: `a<id>` grants
/// principal `id` access, `d<id>` denies it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(default)]
    pub file_permissions: String,
    #[serde(default)]
    pub unix_mode: Option<u32>,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub accessed: i64,
}

impl FileMetadata {
    /// Whether `id` is granted access. A matching deny token sets `denied`
    /// and wins over any allow.
    pub fn has_permission(permissions: &str, id: i64, denied: &mut bool) -> bool {
        let mut allowed = false;
        for token in permissions.split_whitespace() {
            if let Some(rest) = token.strip_prefix('a') {
                if rest.parse::<i64>() == Ok(id) {
                    allowed = true;
                }
            } else if let Some(rest) = token.strip_prefix('d') {
                if rest.parse::<i64>() == Ok(id) {
                    *denied = true;
                }
            }
        }
        allowed && !*denied
    }
}

/// Sidecar path for a file entry: `<hashes_root>/<dir>/<escaped name>`.
pub fn file_sidecar_path(hashes_root: &Path, rel_dir: &str, name: &str) -> PathBuf {
    let mut p = hashes_root.to_path_buf();
    if !rel_dir.is_empty() {
        p.push(rel_dir);
    }
    p.push(escape_metadata_fn(name));
    p
}

/// Sidecar path for a directory entry: `<hashes_root>/<dir>/.dir_metadata`.
pub fn dir_sidecar_path(hashes_root: &Path, rel_dir: &str) -> PathBuf {
    let mut p = hashes_root.to_path_buf();
    if !rel_dir.is_empty() {
        p.push(rel_dir);
    }
    p.push(DIR_METADATA_FN);
    p
}

/// Write a metadata blob atomically (temp + rename).
pub fn write_metadata(path: &Path, metadata: &FileMetadata) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = rmp_serde::to_vec(metadata)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_metadata(path: &Path) -> Result<FileMetadata> {
    let bytes = std::fs::read(path)?;
    Ok(rmp_serde::from_slice(&bytes)?)
}
