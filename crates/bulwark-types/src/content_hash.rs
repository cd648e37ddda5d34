use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A file content digest: 32 bytes (SHA-256) or 64 bytes (SHA-512).
///
/// Clients transmit SHA-512 digests base64-encoded with `+` replaced by `-`
/// ("base64-dash") and legacy SHA-256 digests as hex, so both renderings
/// live here.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub Vec<u8>);

impl ContentHash {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ContentHash(bytes)
    }

    /// Parse a hex digest (legacy SHA-256 wire form).
    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().map(ContentHash)
    }

    /// Parse a base64-dash digest (SHA-512 wire form).
    pub fn from_base64_dash(s: &str) -> Option<Self> {
        let plain: String = s.chars().map(|c| if c == '-' { '+' } else { c }).collect();
        STANDARD.decode(plain).ok().map(ContentHash)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn to_base64_dash(&self) -> String {
        STANDARD
            .encode(&self.0)
            .chars()
            .map(|c| if c == '+' { '-' } else { c })
            .collect()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hx = self.to_hex();
        write!(f, "ContentHash({})", &hx[..hx.len().min(16)])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hx = self.to_hex();
        write!(f, "{}", &hx[..hx.len().min(16)])
    }
}
