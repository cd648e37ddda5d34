use std::collections::{HashMap, HashSet};

use md5::{Digest, Md5};
use tracing::warn;

/// Name-length caps: `MAX_PATH - 15` on Windows targets, `NAME_MAX - 11`
/// on POSIX targets.
const WINDOWS_NAME_CAP: usize = 260 - 15;
const POSIX_NAME_CAP: usize = 255 - 11;

const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegalizePolicy {
    Windows,
    Posix,
}

impl LegalizePolicy {
    /// Policy matching the filesystem this server writes to.
    pub fn host() -> Self {
        if cfg!(windows) {
            LegalizePolicy::Windows
        } else {
            LegalizePolicy::Posix
        }
    }

    fn name_cap(self) -> usize {
        match self {
            LegalizePolicy::Windows => WINDOWS_NAME_CAP,
            LegalizePolicy::Posix => POSIX_NAME_CAP,
        }
    }

    fn is_disallowed(self, c: char) -> bool {
        match self {
            LegalizePolicy::Windows => {
                matches!(c, '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '/')
                    || ('\x01'..='\x1f').contains(&c)
            }
            LegalizePolicy::Posix => c == '/',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Legalized {
    pub name: String,
    pub modified: bool,
}

fn is_reserved_windows(name: &str) -> bool {
    WINDOWS_RESERVED
        .iter()
        .any(|r| name == *r || name.strip_prefix(r).is_some_and(|rest| rest.starts_with('.')))
}

fn truncate_to_boundary(s: &mut String, cap: usize) {
    let mut end = cap;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Produce a filesystem-legal, per-directory-unique name for a raw client
/// filename.
///
/// `seen` is the set of lowercased names already produced in the current
/// directory; it is consulted and updated only under the Windows policy
/// (case-insensitive collision handling). Deterministic for a given
/// `(raw, seen)` pair, and injective per directory: every modification is
/// stabilized with the first 10 hex chars of MD5 over the original bytes,
/// and residual collisions get a `_<n>` counter.
pub fn legalize_filename(raw: &[u8], seen: &mut HashSet<String>, policy: LegalizePolicy) -> Legalized {
    let (mut name, mut modified) = match std::str::from_utf8(raw) {
        Ok(s) => (s.to_string(), false),
        Err(e) => {
            // Re-encoding recovery keeps only the bytes before the first
            // invalid sequence; nothing after the break survives.
            let prefix = String::from_utf8_lossy(&raw[..e.valid_up_to()]).into_owned();
            warn!(name = %String::from_utf8_lossy(raw), "filename has encoding problems, mangling");
            (prefix, true)
        }
    };

    if policy == LegalizePolicy::Windows && is_reserved_windows(&name) {
        warn!(name = %name, "filename reserved on Windows, prefixing");
        name.insert(0, '_');
        modified = true;
    }

    let cap = policy.name_cap();
    if name.len() > cap {
        warn!(name = %name, cap, "filename too long, shortening");
        truncate_to_boundary(&mut name, cap);
        modified = true;
    }

    if name.chars().any(|c| policy.is_disallowed(c)) {
        warn!(name = %name, "filename contains disallowed characters, replacing");
        name = name
            .chars()
            .map(|c| if policy.is_disallowed(c) { '_' } else { c })
            .collect();
        modified = true;
    }

    if modified {
        let digest = Md5::digest(raw);
        let hex = hex::encode(digest);
        name.push('-');
        name.push_str(&hex[..10]);
    }

    if policy == LegalizePolicy::Windows {
        let base = name.clone();
        let mut n = 1usize;
        while seen.contains(&name.to_lowercase()) {
            name = format!("{base}_{n}");
            n += 1;
            modified = true;
        }
        seen.insert(name.to_lowercase());
    }

    Legalized { name, modified }
}

/// Records `original client path → legalized name` for every modified
/// filename, so the metadata stream can translate client paths after the
/// content tree is finalized.
///
/// Keys are `<legalized parent path>/<original name>` (just the original
/// name at the root), mirroring how corrections are discovered while
/// walking the filelist.
#[derive(Debug, Default)]
pub struct PathCorrections {
    map: HashMap<String, String>,
}

impl PathCorrections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, parent_path: &str, original_name: &str, legalized: &str) {
        let key = if parent_path.is_empty() {
            original_name.to_string()
        } else {
            format!("{parent_path}/{original_name}")
        };
        self.map.insert(key, legalized.to_string());
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Translate a full client path into its legalized on-disk relative
    /// path, applying recorded corrections component by component.
    pub fn translate_path(&self, client_path: &str) -> String {
        let mut prefix = String::new();
        for component in client_path.split('/').filter(|c| !c.is_empty()) {
            let key = if prefix.is_empty() {
                component.to_string()
            } else {
                format!("{prefix}/{component}")
            };
            let corrected = self.map.get(&key).map(String::as_str).unwrap_or(component);
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(corrected);
        }
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legalize(raw: &[u8], policy: LegalizePolicy) -> Legalized {
        let mut seen = HashSet::new();
        legalize_filename(raw, &mut seen, policy)
    }

    #[test]
    fn clean_name_untouched() {
        let l = legalize(b"report.pdf", LegalizePolicy::Posix);
        assert_eq!(l.name, "report.pdf");
        assert!(!l.modified);
    }

    #[test]
    fn legalize_is_pure() {
        let a = legalize("schr\u{f6}dinger?.txt".as_bytes(), LegalizePolicy::Windows);
        let b = legalize("schr\u{f6}dinger?.txt".as_bytes(), LegalizePolicy::Windows);
        assert_eq!(a, b);
    }

    #[test]
    fn windows_reserved_bare_and_dotted() {
        let bare = legalize(b"CON", LegalizePolicy::Windows);
        assert!(bare.modified);
        assert!(bare.name.starts_with("_CON-"));

        let dotted = legalize(b"CON.txt", LegalizePolicy::Windows);
        assert!(dotted.modified);
        assert!(dotted.name.starts_with("_CON.txt-"));

        // CONX is not reserved.
        let not_reserved = legalize(b"CONX", LegalizePolicy::Windows);
        assert!(!not_reserved.modified);
    }

    #[test]
    fn windows_nul_prefixed_and_suffixed() {
        let l = legalize(b"NUL", LegalizePolicy::Windows);
        let md5_prefix = &hex::encode(Md5::digest(b"NUL"))[..10];
        assert_eq!(l.name, format!("_NUL-{md5_prefix}"));
    }

    #[test]
    fn posix_slash_replaced() {
        let l = legalize(b"a/b", LegalizePolicy::Posix);
        assert!(l.modified);
        assert!(l.name.starts_with("a_b-"));
    }

    #[test]
    fn windows_disallowed_chars_and_controls() {
        let l = legalize(b"a:b*c\x05d", LegalizePolicy::Windows);
        assert!(l.modified);
        assert!(l.name.starts_with("a_b_c_d-"));
    }

    #[test]
    fn posix_boundary_lengths() {
        // Exactly NAME_MAX-11: untouched.
        let at_cap = "x".repeat(POSIX_NAME_CAP);
        let l = legalize(at_cap.as_bytes(), LegalizePolicy::Posix);
        assert!(!l.modified);
        assert_eq!(l.name.len(), POSIX_NAME_CAP);

        // One over: truncated and hash-suffixed.
        let over = "x".repeat(POSIX_NAME_CAP + 1);
        let l = legalize(over.as_bytes(), LegalizePolicy::Posix);
        assert!(l.modified);
        assert_eq!(l.name.len(), POSIX_NAME_CAP + 11);
        assert_eq!(&l.name[POSIX_NAME_CAP..POSIX_NAME_CAP + 1], "-");
    }

    #[test]
    fn truncation_respects_char_boundary() {
        let mut s = "x".repeat(POSIX_NAME_CAP - 1);
        s.push('\u{e9}'); // two bytes, straddles the cap
        let l = legalize(s.as_bytes(), LegalizePolicy::Posix);
        assert!(l.modified);
        assert!(l.name.is_char_boundary(l.name.len()));
    }

    #[test]
    fn case_collision_gets_counter() {
        let mut seen = HashSet::new();
        let first = legalize_filename(b"Readme", &mut seen, LegalizePolicy::Windows);
        assert_eq!(first.name, "Readme");
        let second = legalize_filename(b"README", &mut seen, LegalizePolicy::Windows);
        assert_eq!(second.name, "README_1");
        assert!(second.modified);
        let third = legalize_filename(b"readme", &mut seen, LegalizePolicy::Windows);
        assert_eq!(third.name, "readme_2");
    }

    #[test]
    fn posix_allows_case_twins() {
        let mut seen = HashSet::new();
        let a = legalize_filename(b"Readme", &mut seen, LegalizePolicy::Posix);
        let b = legalize_filename(b"README", &mut seen, LegalizePolicy::Posix);
        assert_eq!(a.name, "Readme");
        assert_eq!(b.name, "README");
    }

    #[test]
    fn invalid_utf8_truncates_at_first_bad_byte() {
        let l = legalize(&[0x66, 0xff, 0x6f], LegalizePolicy::Posix);
        assert!(l.modified);
        // Valid prefix survives; neither the bad byte nor the trailing
        // 'o' makes it through, and the suffix stabilizes the name.
        let md5_prefix = &hex::encode(Md5::digest([0x66, 0xff, 0x6f]))[..10];
        assert_eq!(l.name, format!("f-{md5_prefix}"));
    }

    #[test]
    fn fully_invalid_name_keeps_only_the_suffix() {
        let l = legalize(&[0xff, 0xfe], LegalizePolicy::Posix);
        assert!(l.modified);
        assert!(l.name.starts_with('-'));
        assert_eq!(l.name.len(), 11);
    }

    #[test]
    fn injective_for_distinct_originals() {
        // Two names that legalize to the same base still differ by suffix.
        let a = legalize(b"a/b", LegalizePolicy::Posix);
        let b = legalize(b"a_b/", LegalizePolicy::Posix);
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn corrections_translate_paths() {
        let mut c = PathCorrections::new();
        c.record("", "NUL", "_NUL-abcdef0123");
        c.record("_NUL-abcdef0123", "a:b", "a_b-0123456789");

        assert_eq!(
            c.translate_path("NUL/a:b"),
            "_NUL-abcdef0123/a_b-0123456789"
        );
        assert_eq!(c.translate_path("other/file"), "other/file");
        assert_eq!(c.len(), 2);
    }
}
