use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tracing::{debug, error, info};

use crate::client::{MailSender, TransferClient};
use crate::digest::{hash_file, DigestKind};
use crate::error::{BulwarkError, Result};
use crate::filelist::{for_each_entry, EntryKind};
use crate::legalize::{legalize_filename, LegalizePolicy};
use bulwark_types::ContentHash;

/// Undo the byte-swapped hex encoding some legacy clients emit: nibble
/// pairs arrive transposed (`ab` for `ba`). Odd-length digests are
/// rejected outright rather than half-swapped.
pub fn unswap_hex_pairs(hex: &str) -> Result<String> {
    if hex.len() % 2 != 0 {
        return Err(BulwarkError::Other(format!(
            "odd-length swapped hex digest ({} chars)",
            hex.len()
        )));
    }
    let bytes = hex.as_bytes();
    let mut out = String::with_capacity(hex.len());
    for pair in bytes.chunks_exact(2) {
        out.push(pair[1] as char);
        out.push(pair[0] as char);
    }
    Ok(out)
}

/// Re-reads a committed backup and compares every file's digest against
/// the filelist's claim. A single mismatch fails the verification and
/// mails the admins; mismatched files are re-downloaded for analysis when
/// a transfer client is available.
pub struct Verifier<'a> {
    pub backup_root: &'a Path,
    pub backup_id: i64,
    pub digest_kind: DigestKind,
    pub policy: LegalizePolicy,
    pub transfer: Option<&'a dyn TransferClient>,
    pub mail: &'a dyn MailSender,
}

impl Verifier<'_> {
    /// The filelist extra carrying the configured digest.
    fn def_identifier(&self) -> &'static str {
        match self.digest_kind {
            DigestKind::Sha512 => "sha512",
            DigestKind::Sha256 => "sha256",
        }
    }

    pub fn verify_file_backup(&self, filelist: &Path) -> Result<bool> {
        let mut log = format!(
            "Verification of file backup with id {}. Path={}\n",
            self.backup_id,
            self.backup_root.display()
        );
        let mut verify_ok = true;
        let mut verified_files = 0usize;

        let mut reader = BufReader::new(File::open(filelist)?);
        let mut folder_files: Vec<HashSet<String>> = vec![HashSet::new()];
        let mut curr_path = String::new();
        let mut remote_path = String::new();

        for_each_entry(&mut reader, |entry| {
            match entry.kind {
                EntryKind::Dir => {
                    let legal = legalize_filename(
                        &entry.name,
                        folder_files.last_mut().expect("stack never empty"),
                        self.policy,
                    );
                    folder_files.push(HashSet::new());
                    if !curr_path.is_empty() {
                        curr_path.push('/');
                    }
                    curr_path.push_str(&legal.name);
                    if !remote_path.is_empty() {
                        remote_path.push('/');
                    }
                    remote_path.push_str(&entry.name_lossy());
                }
                EntryKind::UpDir => {
                    if folder_files.len() > 1 {
                        folder_files.pop();
                    }
                    curr_path = parent_of(&curr_path);
                    remote_path = parent_of(&remote_path);
                }
                EntryKind::File => {
                    let legal = legalize_filename(
                        &entry.name,
                        folder_files.last_mut().expect("stack never empty"),
                        self.policy,
                    );
                    let rel = if curr_path.is_empty() {
                        legal.name.clone()
                    } else {
                        format!("{curr_path}/{}", legal.name)
                    };
                    if !self.verify_one(&entry.extras, &rel, &entry.name_lossy(), &remote_path, &mut log) {
                        verify_ok = false;
                    } else {
                        verified_files += 1;
                    }
                }
            }
            Ok(())
        })?;

        if !verify_ok {
            self.mail
                .send_mail_to_admins("File backup verification failed", &log);
        } else {
            debug!(verified_files, "verification finished");
        }

        Ok(verify_ok)
    }

    fn verify_one(
        &self,
        extras: &std::collections::HashMap<String, String>,
        rel: &str,
        raw_name: &str,
        remote_dir: &str,
        log: &mut String,
    ) -> bool {
        let local = self.backup_root.join(rel);

        // Hex digests: sha256_verify, or the legacy byte-swapped sha256
        // variant used when the session digest is SHA-512.
        let mut hex_digest = extras.get("sha256_verify").cloned().filter(|s| !s.is_empty());
        if hex_digest.is_none() && self.digest_kind == DigestKind::Sha512 {
            if let Some(swapped) = extras.get("sha256").filter(|s| !s.is_empty()) {
                match unswap_hex_pairs(swapped) {
                    Ok(unswapped) => hex_digest = Some(unswapped),
                    Err(e) => {
                        let msg = format!("Bad legacy digest for \"{rel}\": {e}. Verification failed.");
                        error!("{msg}");
                        let _ = writeln!(log, "{msg}");
                        return false;
                    }
                }
            }
        }

        if let Some(expected_hex) = hex_digest {
            return match hash_file(DigestKind::Sha256, &local) {
                Ok(actual) if actual.to_hex() == expected_hex.to_lowercase() => true,
                Ok(actual) => {
                    let msg = BulwarkError::VerifyMismatch {
                        path: rel.to_string(),
                        local_hash: actual.to_hex(),
                        remote_hash: expected_hex.to_lowercase(),
                    };
                    error!("{msg}");
                    let _ = writeln!(log, "{msg}");
                    false
                }
                Err(e) => {
                    let msg = format!("Cannot read \"{rel}\" for verification: {e}");
                    error!("{msg}");
                    let _ = writeln!(log, "{msg}");
                    false
                }
            };
        }

        // Configured digest, base64-dash encoded.
        let Some(expected_b64) = extras.get(self.def_identifier()).filter(|s| !s.is_empty()) else {
            let msg = format!("No hash for file \"{rel}\" found. Verification failed.");
            error!("{msg}");
            let _ = writeln!(log, "{msg}");
            return false;
        };
        let Some(expected) = ContentHash::from_base64_dash(expected_b64) else {
            let msg = format!("Undecodable hash for file \"{rel}\". Verification failed.");
            error!("{msg}");
            let _ = writeln!(log, "{msg}");
            return false;
        };

        match hash_file(self.digest_kind, &local) {
            Ok(actual) if actual == expected => true,
            Ok(actual) => {
                let msg = BulwarkError::VerifyMismatch {
                    path: rel.to_string(),
                    local_hash: actual.to_base64_dash(),
                    remote_hash: expected_b64.clone(),
                };
                error!("{msg}");
                let _ = writeln!(log, "{msg}");
                let remote_file = if remote_dir.is_empty() {
                    raw_name.to_string()
                } else {
                    format!("{remote_dir}/{raw_name}")
                };
                self.save_debug_data(&remote_file, &actual, expected_b64);
                false
            }
            Err(e) => {
                let msg = format!("Cannot read \"{rel}\" for verification: {e}");
                error!("{msg}");
                let _ = writeln!(log, "{msg}");
                false
            }
        }
    }

    /// Redownload a mismatched file into a scratch dir and log both hashes
    /// for offline analysis.
    fn save_debug_data(&self, remote_file: &str, local_hash: &ContentHash, remote_hash: &str) {
        info!(
            local_hash = %local_hash.to_base64_dash(),
            remote_hash,
            "hash mismatch details"
        );
        let Some(transfer) = self.transfer else {
            return;
        };
        info!(path = remote_file, "trying to download file that failed to verify");

        let tmpdir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "cannot create scratch dir for debug download");
                return;
            }
        };
        let target = tmpdir.path().join("verify_failed.file");
        match transfer.fetch_file(remote_file, &target) {
            Ok(_) => {
                let sha512 = hash_file(DigestKind::Sha512, &target)
                    .map(|h| h.to_base64_dash())
                    .unwrap_or_else(|e| format!("<hash failed: {e}>"));
                let sha256 = hash_file(DigestKind::Sha256, &target)
                    .map(|h| h.to_hex())
                    .unwrap_or_else(|e| format!("<hash failed: {e}>"));
                // Keep the scratch dir for analysis.
                let kept = tmpdir.keep();
                info!(
                    path = remote_file,
                    dir = %kept.display(),
                    sha512 = %sha512,
                    sha256 = %sha256,
                    "downloaded file with failed verification for analysis"
                );
            }
            Err(e) => {
                error!(path = remote_file, error = %e,
                    "error downloading file after verification failed");
            }
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}
