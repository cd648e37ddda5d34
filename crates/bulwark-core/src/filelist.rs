use std::collections::HashMap;
use std::io::Read;

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::warn;

use crate::error::Result;

/// One parsed filelist event.
///
/// The client streams an ordered list of directory-enter, directory-leave
/// and file entries. A directory entry named `..` is a leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub kind: EntryKind,
    /// Raw client bytes. Not guaranteed to be valid UTF-8.
    pub name: Vec<u8>,
    pub size: u64,
    pub extras: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    UpDir,
    File,
}

impl FileEntry {
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Dir | EntryKind::UpDir)
    }

    /// Symlink target, when the client sent one.
    pub fn symlink_target(&self) -> Option<&str> {
        self.extras.get("sym_target").map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    LineStart,
    AfterKind,
    Name { escaped: bool },
    AfterName,
    Size,
    Extras,
    SkipLine,
}

/// Streaming parser over the textual filelist format:
///
/// ```text
/// d "dirname" 0
/// f "filename" 1234#sha512=...&orig_path=...
/// d ".." 0
/// ```
///
/// Names are quoted with `\"` and `\\` escapes; extras are `key=value`
/// pairs joined by `&`, values percent-encoded. Fed a byte at a time;
/// yields an entry at each completed line. Malformed lines are skipped
/// with a warning and the parser resynchronizes at the next newline.
///
/// Per-parse state only; create a fresh parser for every pass.
pub struct FileListParser {
    state: State,
    kind: EntryKind,
    name: Vec<u8>,
    size_digits: String,
    extras_raw: String,
    line: usize,
    malformed: usize,
}

impl Default for FileListParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FileListParser {
    pub fn new() -> Self {
        FileListParser {
            state: State::LineStart,
            kind: EntryKind::File,
            name: Vec::new(),
            size_digits: String::new(),
            extras_raw: String::new(),
            line: 0,
            malformed: 0,
        }
    }

    /// Number of entries yielded so far.
    pub fn entries_seen(&self) -> usize {
        self.line
    }

    /// Number of lines skipped as malformed.
    pub fn malformed_lines(&self) -> usize {
        self.malformed
    }

    /// Feed one byte; returns a completed entry at end of line.
    pub fn next_entry(&mut self, b: u8) -> Option<FileEntry> {
        match self.state {
            State::LineStart => match b {
                b'f' | b'd' => {
                    self.kind = if b == b'f' {
                        EntryKind::File
                    } else {
                        EntryKind::Dir
                    };
                    self.name.clear();
                    self.size_digits.clear();
                    self.extras_raw.clear();
                    self.state = State::AfterKind;
                }
                b'\n' | b'\r' => {}
                _ => self.skip_malformed("unexpected entry kind"),
            },
            State::AfterKind => match b {
                b' ' => {}
                b'"' => self.state = State::Name { escaped: false },
                _ => self.skip_malformed("expected quoted name"),
            },
            State::Name { escaped } => {
                if escaped {
                    self.name.push(b);
                    self.state = State::Name { escaped: false };
                } else {
                    match b {
                        b'\\' => self.state = State::Name { escaped: true },
                        b'"' => self.state = State::AfterName,
                        b'\n' => self.skip_malformed("newline inside name"),
                        _ => self.name.push(b),
                    }
                }
            }
            State::AfterName => match b {
                b' ' => {}
                b'0'..=b'9' => {
                    self.size_digits.push(b as char);
                    self.state = State::Size;
                }
                b'#' => self.state = State::Extras,
                b'\n' => return self.finish_line(),
                b'\r' => {}
                _ => self.skip_malformed("expected size"),
            },
            State::Size => match b {
                b'0'..=b'9' => self.size_digits.push(b as char),
                b'#' => self.state = State::Extras,
                b'\n' => return self.finish_line(),
                b'\r' => {}
                _ => self.skip_malformed("bad size digit"),
            },
            State::Extras => match b {
                b'\n' => return self.finish_line(),
                b'\r' => {}
                _ => self.extras_raw.push(b as char),
            },
            State::SkipLine => {
                if b == b'\n' {
                    self.state = State::LineStart;
                }
            }
        }
        None
    }

    fn skip_malformed(&mut self, what: &str) {
        warn!(line = self.line, what, "skipping malformed filelist line");
        self.malformed += 1;
        self.state = State::SkipLine;
    }

    fn finish_line(&mut self) -> Option<FileEntry> {
        self.state = State::LineStart;

        let size: u64 = self.size_digits.parse().unwrap_or(0);
        let kind = if self.kind == EntryKind::Dir && self.name == b".." {
            EntryKind::UpDir
        } else {
            self.kind
        };

        let mut extras = HashMap::new();
        if !self.extras_raw.is_empty() {
            for pair in self.extras_raw.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    let v = percent_decode_str(v).decode_utf8_lossy().into_owned();
                    extras.insert(k.to_string(), v);
                }
            }
        }

        self.line += 1;
        Some(FileEntry {
            kind,
            name: std::mem::take(&mut self.name),
            size,
            extras,
        })
    }
}

/// Parse a whole reader, invoking `f` per entry. Used by the passes that
/// re-walk the finalized filelist (verification, user views).
pub fn for_each_entry<R: Read, F>(reader: &mut R, mut f: F) -> Result<usize>
where
    F: FnMut(FileEntry) -> Result<()>,
{
    let mut parser = FileListParser::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for &b in &buf[..n] {
            if let Some(entry) = parser.next_entry(b) {
                f(entry)?;
            }
        }
    }
    Ok(parser.entries_seen())
}

/// Render one entry back into wire form. The inverse of the parser; used
/// when rewriting client lists and by the test fixtures. Byte-oriented so
/// raw (possibly non-UTF-8) names survive untouched.
pub fn write_entry(out: &mut Vec<u8>, entry: &FileEntry) {
    out.push(if entry.kind == EntryKind::File { b'f' } else { b'd' });
    out.extend_from_slice(b" \"");
    for &b in &entry.name {
        if b == b'"' || b == b'\\' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.extend_from_slice(b"\" ");
    out.extend_from_slice(entry.size.to_string().as_bytes());
    if !entry.extras.is_empty() {
        out.push(b'#');
        let mut keys: Vec<_> = entry.extras.keys().collect();
        keys.sort();
        for (i, k) in keys.iter().enumerate() {
            if i > 0 {
                out.push(b'&');
            }
            out.extend_from_slice(k.as_bytes());
            out.push(b'=');
            out.extend_from_slice(
                utf8_percent_encode(&entry.extras[*k], NON_ALPHANUMERIC)
                    .to_string()
                    .as_bytes(),
            );
        }
    }
    out.push(b'\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &str) -> Vec<FileEntry> {
        let mut parser = FileListParser::new();
        let mut out = Vec::new();
        for &b in input.as_bytes() {
            if let Some(e) = parser.next_entry(b) {
                out.push(e);
            }
        }
        out
    }

    #[test]
    fn basic_stream() {
        let entries = parse_all("d \"A\" 0\nf \"x\" 5#sha256=aabb\nd \"..\" 0\n");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, EntryKind::Dir);
        assert_eq!(entries[0].name, b"A");
        assert_eq!(entries[1].kind, EntryKind::File);
        assert_eq!(entries[1].size, 5);
        assert_eq!(entries[1].extras["sha256"], "aabb");
        assert_eq!(entries[2].kind, EntryKind::UpDir);
    }

    #[test]
    fn escaped_name() {
        let entries = parse_all("f \"a\\\"b\\\\c\" 1\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"a\"b\\c");
    }

    #[test]
    fn file_named_dotdot_is_a_file() {
        let entries = parse_all("f \"..\" 3\n");
        assert_eq!(entries[0].kind, EntryKind::File);
    }

    #[test]
    fn malformed_line_resyncs() {
        let entries = parse_all("garbage here\nf \"ok\" 7\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"ok");
    }

    #[test]
    fn extras_percent_decoded() {
        let entries = parse_all("f \"x\" 1#orig_path=%2Fhome%2Fu&sym_target=t\n");
        assert_eq!(entries[0].extras["orig_path"], "/home/u");
        assert_eq!(entries[0].symlink_target(), Some("t"));
    }

    #[test]
    fn non_utf8_name_preserved() {
        let mut parser = FileListParser::new();
        let mut input: Vec<u8> = b"f \"".to_vec();
        input.extend_from_slice(&[0xff, 0xfe]);
        input.extend_from_slice(b"\" 1\n");
        let mut entries = Vec::new();
        for b in input {
            if let Some(e) = parser.next_entry(b) {
                entries.push(e);
            }
        }
        assert_eq!(entries[0].name, vec![0xff, 0xfe]);
    }

    #[test]
    fn write_then_parse_roundtrip() {
        let entry = FileEntry {
            kind: EntryKind::File,
            name: b"we\"ird\\name".to_vec(),
            size: 42,
            extras: [("sha512".to_string(), "q-/w=".to_string())]
                .into_iter()
                .collect(),
        };
        let mut bytes = Vec::new();
        write_entry(&mut bytes, &entry);
        let parsed = parse_all(std::str::from_utf8(&bytes).unwrap());
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], entry);
    }

    #[test]
    fn write_preserves_raw_name_bytes() {
        let entry = FileEntry {
            kind: EntryKind::File,
            name: vec![0xc3, 0xa9, 0xff],
            size: 1,
            extras: HashMap::new(),
        };
        let mut bytes = Vec::new();
        write_entry(&mut bytes, &entry);

        let mut parser = FileListParser::new();
        let mut parsed = Vec::new();
        for b in bytes {
            if let Some(e) = parser.next_entry(b) {
                parsed.push(e);
            }
        }
        assert_eq!(parsed[0].name, entry.name);
    }

    #[test]
    fn crlf_tolerated() {
        let entries = parse_all("f \"x\" 5\r\nd \"y\" 0\r\n");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn for_each_entry_counts() {
        let data = b"d \"A\" 0\nf \"x\" 5\nd \"..\" 0\n";
        let mut count = 0;
        let total = for_each_entry(&mut &data[..], |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(total, 3);
    }
}
