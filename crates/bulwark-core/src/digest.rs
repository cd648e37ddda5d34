use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256, Sha512};

use crate::error::Result;
use bulwark_types::ContentHash;

/// Digest selected for filelist hashes: SHA-512 for current clients,
/// SHA-256 for legacy ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    Sha512,
    Sha256,
}

impl DigestKind {
    pub fn output_len(self) -> usize {
        match self {
            DigestKind::Sha512 => 64,
            DigestKind::Sha256 => 32,
        }
    }
}

/// Hash an entire reader with the selected digest.
pub fn hash_reader<R: Read>(kind: DigestKind, mut reader: R) -> Result<ContentHash> {
    let mut buf = [0u8; 32768];
    match kind {
        DigestKind::Sha512 => {
            let mut hasher = Sha512::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(ContentHash(hasher.finalize().to_vec()))
        }
        DigestKind::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(ContentHash(hasher.finalize().to_vec()))
        }
    }
}

/// Hash a file on disk with the selected digest.
pub fn hash_file(kind: DigestKind, path: &Path) -> Result<ContentHash> {
    let file = File::open(path)?;
    hash_reader(kind, BufReader::new(file))
}
