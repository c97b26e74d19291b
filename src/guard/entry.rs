// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Directory entries and listing snapshots.

use std::fs::Metadata;
use std::time::SystemTime;

/// Whether an entry exists on disk or was synthesized by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Backed by a real filesystem object.
    Real,
    /// The synthetic `..` entry at the head of non-root listings.
    Parent,
}

/// One node in a listing or the result of a stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    /// Unix permission bits including the file type bits.
    pub mode: u32,
    pub modified: SystemTime,
    pub kind: EntryKind,
}

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

impl DirEntry {
    /// Build an entry from filesystem metadata.
    pub fn from_metadata(name: impl Into<String>, metadata: &Metadata) -> Self {
        let is_dir = metadata.is_dir();

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode = if is_dir {
            S_IFDIR | 0o755
        } else {
            S_IFREG | 0o644
        };

        Self {
            name: name.into(),
            size: if is_dir { 0 } else { metadata.len() },
            is_dir,
            mode,
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            kind: EntryKind::Real,
        }
    }

    /// The synthetic `..` entry.
    pub fn parent(modified: SystemTime) -> Self {
        Self {
            name: "..".to_string(),
            size: 0,
            is_dir: true,
            mode: S_IFDIR | 0o755,
            modified,
            kind: EntryKind::Parent,
        }
    }

    /// A plain file entry, mainly for alternate storage backends.
    pub fn file(name: impl Into<String>, size: u64, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            size,
            is_dir: false,
            mode: S_IFREG | 0o644,
            modified,
            kind: EntryKind::Real,
        }
    }

    /// A plain directory entry, mainly for alternate storage backends.
    pub fn directory(name: impl Into<String>, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            size: 0,
            is_dir: true,
            mode: S_IFDIR | 0o755,
            modified,
            kind: EntryKind::Real,
        }
    }

    /// Seconds since the Unix epoch, saturating at zero.
    pub fn mtime_secs(&self) -> u64 {
        self.modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// `ls -l` style line used for SFTP long names.
    pub fn long_name(&self) -> String {
        let kind = if self.is_dir { 'd' } else { '-' };
        let perms = self.mode & 0o777;
        let mut rwx = String::with_capacity(9);
        for shift in [6, 3, 0] {
            let bits = (perms >> shift) & 0o7;
            rwx.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            rwx.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            rwx.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        format!(
            "{kind}{rwx} 1 owner group {:>10} {} {}",
            self.size,
            self.mtime_secs(),
            self.name
        )
    }
}

/// An ordered directory snapshot.
///
/// When present, the synthetic `..` entry is always first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirListing {
    entries: Vec<DirEntry>,
}

impl DirListing {
    pub fn new(entries: Vec<DirEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter()
    }

    /// A window of at most `limit` entries starting at `offset`.
    ///
    /// Out-of-range offsets yield an empty slice.
    pub fn page(&self, offset: usize, limit: usize) -> &[DirEntry] {
        let start = offset.min(self.entries.len());
        let end = start.saturating_add(limit).min(self.entries.len());
        &self.entries[start..end]
    }
}

impl IntoIterator for DirListing {
    type Item = DirEntry;
    type IntoIter = std::vec::IntoIter<DirEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(n: usize) -> DirListing {
        DirListing::new(
            (0..n)
                .map(|i| DirEntry::file(format!("f{i}"), i as u64, SystemTime::UNIX_EPOCH))
                .collect(),
        )
    }

    #[test]
    fn test_page_windows() {
        let l = listing(5);
        assert_eq!(l.page(0, 2).len(), 2);
        assert_eq!(l.page(4, 10).len(), 1);
        assert_eq!(l.page(4, 10)[0].name, "f4");
        assert!(l.page(5, 10).is_empty());
        assert!(l.page(100, 10).is_empty());
        assert_eq!(l.page(1, usize::MAX).len(), 4);
    }

    #[test]
    fn test_parent_entry() {
        let p = DirEntry::parent(SystemTime::UNIX_EPOCH);
        assert_eq!(p.name, "..");
        assert!(p.is_dir);
        assert_eq!(p.kind, EntryKind::Parent);
        assert_eq!(p.mode & S_IFDIR, S_IFDIR);
    }

    #[test]
    fn test_long_name() {
        let f = DirEntry::file("notes.txt", 42, SystemTime::UNIX_EPOCH);
        let line = f.long_name();
        assert!(line.starts_with("-rw-r--r--"));
        assert!(line.ends_with("notes.txt"));
        assert!(line.contains("42"));

        let d = DirEntry::directory("docs", SystemTime::UNIX_EPOCH);
        assert!(d.long_name().starts_with("drwxr-xr-x"));
    }

    #[test]
    fn test_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![0u8; 17]).unwrap();

        let entry = DirEntry::from_metadata("data.bin", &std::fs::metadata(&path).unwrap());
        assert_eq!(entry.size, 17);
        assert!(!entry.is_dir);

        let dir_entry = DirEntry::from_metadata("d", &std::fs::metadata(dir.path()).unwrap());
        assert!(dir_entry.is_dir);
        assert_eq!(dir_entry.size, 0);
    }
}
