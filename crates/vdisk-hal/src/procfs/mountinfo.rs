//! `/proc/self/mountinfo` as a lookup table.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub target: PathBuf,
    pub fs_type: String,
    /// Mount source as the kernel reports it, e.g. `/dev/loop3`.
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn read() -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string("/proc/self/mountinfo")?))
    }

    /// Lines look like
    /// `<id> <parent> <maj:min> <root> <target> <opts> [tags] - <fstype> <source> <superopts>`.
    /// Malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let (head, tail) = line.split_once(" - ")?;
                let target = head.split_whitespace().nth(4)?;
                let mut tail = tail.split_whitespace();
                Some(MountEntry {
                    fs_type: tail.next()?.to_string(),
                    source: tail.next()?.to_string(),
                    target: PathBuf::from(unescape(target)),
                })
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn contains(&self, target: &Path) -> bool {
        let wanted = trim_slash(target);
        self.entries.iter().any(|e| trim_slash(&e.target) == wanted)
    }

    /// Where block device `name` (with or without `/dev/`) is mounted, sorted.
    pub fn targets_of_device(&self, name: &str) -> Vec<PathBuf> {
        let name = name.trim_start_matches("/dev/");
        let mut targets: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|e| e.source.strip_prefix("/dev/") == Some(name))
            .map(|e| e.target.clone())
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }
}

/// The kernel octal-escapes space, tab, newline and backslash in paths.
fn unescape(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes
            .get(i + 1..i + 4)
            .filter(|d| matches!(d[0], b'0'..=b'3') && d.iter().all(|&b| matches!(b, b'0'..=b'7')));
        if let (b'\\', Some(digits)) = (bytes[i], octal) {
            out.push(digits.iter().fold(0u8, |acc, d| acc * 8 + (d - b'0')));
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn trim_slash(path: &Path) -> String {
    let s = path.to_string_lossy();
    match s.trim_end_matches('/') {
        "" => "/".to_string(),
        trimmed => trimmed.to_string(),
    }
}
