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

//! Path confinement for the shared directory tree.
//!
//! [`PathGuard`] turns arbitrary client-supplied paths into [`ResolvedPath`]s:
//! root-relative, lexically clean, free of `..` segments and of any excluded
//! component. Every storage access made by the gateway and the web routes goes
//! through it.
//!
//! # Resolution rules
//!
//! 1. Leading separators are stripped, so `/a/b` and `a/b` are the same path.
//! 2. The remainder is cleaned lexically (`.` dropped, `x/..` collapsed).
//!    Cleaning never consults the filesystem.
//! 3. If the cleaned form still starts with `..` the request is rejected with
//!    [`GatewayError::PathTraversal`].
//! 4. If the cleaned form matches an exclude pattern it is rejected with
//!    [`GatewayError::ExcludedPath`].
//! 5. Empty input and `/` resolve to the share root.
//!
//! # Example
//!
//! ```
//! use treeshare::guard::PathGuard;
//! use treeshare::shared::error::GatewayError;
//!
//! # fn main() -> anyhow::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let guard = PathGuard::local(dir.path(), vec![".git".to_string()])?;
//!
//! assert_eq!(guard.resolve("/docs/./a.txt")?.as_str(), "docs/a.txt");
//! assert!(matches!(guard.resolve("docs/../../etc"), Err(GatewayError::PathTraversal)));
//! assert!(matches!(guard.resolve(".git/config"), Err(GatewayError::ExcludedPath)));
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod storage;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;

use crate::shared::error::{GatewayError, GatewayResult};

pub use self::entry::{DirEntry, DirListing, EntryKind};
pub use self::storage::{BoxedReader, LocalStorage, Storage};

/// A root-relative, lexically clean, exclusion-checked path.
///
/// The only way to obtain one is through [`PathGuard::resolve`], so holding a
/// `ResolvedPath` is proof the path was confined. The root itself is the
/// empty path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedPath(String);

impl ResolvedPath {
    fn root() -> Self {
        Self(String::new())
    }

    /// The relative path, `/`-separated, without a leading separator.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Borrow as a relative [`Path`].
    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Whether this is the share root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Final component, or `/` for the root.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("/")
    }

    /// The parent directory, or `None` for the root.
    pub fn parent(&self) -> Option<ResolvedPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Path as a client should see it: absolute within the share.
    pub fn client_path(&self) -> String {
        format!("/{}", self.0)
    }

    fn child(&self, name: &str) -> ResolvedPath {
        if self.is_root() {
            Self(name.to_string())
        } else {
            Self(format!("{}/{}", self.0, name))
        }
    }

    fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// `a`, `a/b`, `a/b/c` for `a/b/c`; nothing for the root.
    fn prefixes(&self) -> impl Iterator<Item = &str> {
        let rel = self.0.as_str();
        rel.match_indices('/')
            .map(move |(i, _)| &rel[..i])
            .chain(std::iter::once(rel))
            .filter(|p| !p.is_empty())
    }
}

impl fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

/// Lexically clean a path without touching the filesystem.
///
/// Leading separators are ignored. A `..` that would climb above the start is
/// kept, so callers can detect traversal by looking at the first component.
pub fn clean_path(input: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();

    for segment in input.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            name => parts.push(name),
        }
    }

    parts.join("/")
}

/// Rejected names are matched three ways: exact path, any single component,
/// or trailing suffix. Every entry on the way down is tested, so a match also
/// covers everything beneath it.
#[derive(Debug, Clone)]
struct ExcludePattern {
    raw: String,
    suffix: String,
}

impl ExcludePattern {
    fn parse(pattern: &str) -> Option<Self> {
        let trimmed = pattern.trim().trim_matches('/');
        if trimmed.is_empty() {
            return None;
        }
        let suffix = trimmed.strip_prefix('*').unwrap_or(trimmed).to_string();
        if suffix.is_empty() {
            return None;
        }
        Some(Self {
            raw: clean_path(trimmed.trim_start_matches('*')),
            suffix,
        })
    }

    fn matches(&self, path: &ResolvedPath) -> bool {
        if path.components().any(|c| c == self.raw) {
            return true;
        }
        path.prefixes()
            .any(|prefix| prefix == self.raw || prefix.ends_with(&self.suffix))
    }
}

/// Confinement layer over a [`Storage`] backend.
///
/// Holds only immutable configuration, so it is cheap to share behind an
/// `Arc` and safe to call from any number of tasks.
#[derive(Clone)]
pub struct PathGuard {
    root: PathBuf,
    excludes: Vec<ExcludePattern>,
    storage: Arc<dyn Storage>,
}

impl fmt::Debug for PathGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathGuard")
            .field("root", &self.root)
            .field("excludes", &self.exclude_patterns())
            .finish()
    }
}

impl PathGuard {
    /// Create a guard over an explicit storage backend.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` is not absolute.
    pub fn new(
        root: impl Into<PathBuf>,
        excludes: Vec<String>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() {
            anyhow::bail!("Share root must be an absolute path: {}", root.display());
        }

        let excludes: Vec<ExcludePattern> = excludes
            .iter()
            .filter_map(|p| {
                let parsed = ExcludePattern::parse(p);
                if parsed.is_none() {
                    tracing::warn!(pattern = %p, "Ignoring empty exclude pattern");
                }
                parsed
            })
            .collect();

        tracing::debug!(
            root = %root.display(),
            exclude_count = excludes.len(),
            "Created path guard"
        );

        Ok(Self {
            root,
            excludes,
            storage,
        })
    }

    /// Create a guard over the local filesystem rooted at `root`.
    pub fn local(root: impl AsRef<Path>, excludes: Vec<String>) -> Result<Self> {
        let storage = LocalStorage::new(root.as_ref())?;
        let root = storage.root().to_path_buf();
        Self::new(root, excludes, Arc::new(storage))
    }

    /// The absolute confinement root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configured exclude patterns, in order.
    pub fn exclude_patterns(&self) -> Vec<&str> {
        self.excludes.iter().map(|p| p.raw.as_str()).collect()
    }

    /// Resolve a client path to a confined, root-relative path.
    ///
    /// Pure: no filesystem access, no side effects.
    pub fn resolve(&self, request: &str) -> GatewayResult<ResolvedPath> {
        let cleaned = clean_path(request);

        if cleaned == ".." || cleaned.starts_with("../") {
            tracing::warn!(requested = %request, "Path traversal attempt rejected");
            return Err(GatewayError::PathTraversal);
        }

        let resolved = ResolvedPath(cleaned);
        if self.is_excluded(&resolved) {
            tracing::debug!(requested = %request, "Excluded path rejected");
            return Err(GatewayError::ExcludedPath);
        }

        Ok(resolved)
    }

    /// Check an already-clean path against the exclude list.
    pub fn is_excluded(&self, path: &ResolvedPath) -> bool {
        self.excludes.iter().any(|p| p.matches(path))
    }

    /// Metadata for one path.
    pub async fn stat(&self, request: &str) -> GatewayResult<DirEntry> {
        let path = self.resolve(request)?;
        self.stat_resolved(&path).await
    }

    /// Metadata for a path that was already resolved.
    pub async fn stat_resolved(&self, path: &ResolvedPath) -> GatewayResult<DirEntry> {
        self.check_target(path).await?;
        let mut entry = self.storage.stat(path).await?;
        entry.name = path.file_name().to_string();
        Ok(entry)
    }

    /// List the children of a directory.
    ///
    /// Excluded children are dropped. Every non-root listing starts with a
    /// synthetic `..` entry; the root listing never has one.
    pub async fn list_children(&self, request: &str) -> GatewayResult<DirListing> {
        let path = self.resolve(request)?;
        self.list_resolved(&path).await
    }

    /// A path that passed [`resolve`](Self::resolve) may still lead into an
    /// excluded entry through a link; check where it really points.
    async fn check_target(&self, path: &ResolvedPath) -> GatewayResult<()> {
        if path.is_root() || self.excludes.is_empty() {
            return Ok(());
        }
        let target = self.storage.target(path).await?;
        if target != *path && self.is_excluded(&target) {
            tracing::debug!(path = %path, "Link into excluded path rejected");
            return Err(GatewayError::ExcludedPath);
        }
        Ok(())
    }

    async fn list_resolved(&self, path: &ResolvedPath) -> GatewayResult<DirListing> {
        self.check_target(path).await?;
        let children = self.storage.list_children(path).await?;

        let mut entries = Vec::with_capacity(children.len() + 1);
        if let Some(parent) = path.parent() {
            let modified = match self.storage.stat(&parent).await {
                Ok(meta) => meta.modified,
                Err(_) => SystemTime::now(),
            };
            entries.push(DirEntry::parent(modified));
        }

        let before = children.len();
        for child in children {
            let child_path = path.child(&child.name);
            if self.is_excluded(&child_path) || self.check_target(&child_path).await.is_err() {
                continue;
            }
            entries.push(child);
        }

        tracing::trace!(
            path = %path,
            listed = entries.len(),
            hidden = before + usize::from(!path.is_root()) - entries.len(),
            "Listed directory"
        );

        Ok(DirListing::new(entries))
    }

    /// Open a path for reading.
    ///
    /// Directories open as a listing (with the synthetic `..` entry), files
    /// open as a [`GuardedFile`] that can produce sequential streams.
    pub async fn open(&self, request: &str) -> GatewayResult<Opened> {
        let path = self.resolve(request)?;
        let entry = self.stat_resolved(&path).await?;

        if entry.is_dir {
            let listing = self.list_resolved(&path).await?;
            return Ok(Opened::Directory { path, listing });
        }

        Ok(Opened::File(GuardedFile {
            path,
            entry,
            storage: Arc::clone(&self.storage),
        }))
    }

    /// Link targets may point anywhere, so reading them is never allowed.
    pub fn readlink(&self, request: &str) -> GatewayResult<String> {
        tracing::debug!(requested = %request, "readlink rejected");
        Err(GatewayError::Unsupported("readlink"))
    }
}

/// Result of [`PathGuard::open`].
pub enum Opened {
    /// A directory snapshot.
    Directory {
        /// The resolved directory path.
        path: ResolvedPath,
        /// Its listing, synthetic parent first.
        listing: DirListing,
    },
    /// A regular file.
    File(GuardedFile),
}

/// A confined file that can be (re)opened as a sequential stream.
#[derive(Clone)]
pub struct GuardedFile {
    path: ResolvedPath,
    entry: DirEntry,
    storage: Arc<dyn Storage>,
}

impl GuardedFile {
    /// The resolved path.
    pub fn path(&self) -> &ResolvedPath {
        &self.path
    }

    /// Metadata captured at open time.
    pub fn entry(&self) -> &DirEntry {
        &self.entry
    }

    /// Open a fresh stream positioned at offset zero.
    pub async fn stream(&self) -> GatewayResult<BoxedReader> {
        Ok(self.storage.open(&self.path).await?)
    }
}
