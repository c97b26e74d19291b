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

//! Storage backends behind the path guard.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncRead;

use super::entry::DirEntry;
use super::ResolvedPath;
use crate::shared::error::{GatewayError, GatewayResult};

/// A sequential byte stream for one file.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Read-only access to a tree of files addressed by [`ResolvedPath`].
///
/// Implementations only ever see paths that already passed confinement and
/// exclusion checks.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Metadata for a single path.
    async fn stat(&self, path: &ResolvedPath) -> GatewayResult<DirEntry>;

    /// Open a file as a stream starting at offset zero.
    async fn open(&self, path: &ResolvedPath) -> GatewayResult<BoxedReader>;

    /// Children of a directory, sorted by name. No synthetic entries.
    async fn list_children(&self, path: &ResolvedPath) -> GatewayResult<Vec<DirEntry>>;

    /// The root-relative path `path` really refers to once links are
    /// followed. Backends without links return it unchanged.
    async fn target(&self, path: &ResolvedPath) -> GatewayResult<ResolvedPath> {
        Ok(path.clone())
    }
}

/// Storage on the local filesystem.
///
/// Symbolic links are followed only while their target stays under the root.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a backend for `root`, which must exist and be a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("Share root does not exist: {}", root.display()))?;
        if !root.is_dir() {
            anyhow::bail!("Share root is not a directory: {}", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a resolved path to disk, refusing anything a symlink moved outside
    /// the root.
    async fn real_path(&self, path: &ResolvedPath) -> GatewayResult<PathBuf> {
        let joined = self.root.join(path.as_path());
        let canonical = tokio::fs::canonicalize(&joined).await?;
        if !canonical.starts_with(&self.root) {
            tracing::warn!(path = %path, "Symlink escapes share root");
            return Err(GatewayError::PathTraversal);
        }
        Ok(canonical)
    }
}

/// Express an absolute path under `root` as a [`ResolvedPath`].
fn relative_to(root: &Path, canonical: &Path) -> GatewayResult<ResolvedPath> {
    let rel = canonical
        .strip_prefix(root)
        .map_err(|_| GatewayError::PathTraversal)?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(ResolvedPath(parts.join("/")))
}

#[async_trait]
impl Storage for LocalStorage {
    async fn stat(&self, path: &ResolvedPath) -> GatewayResult<DirEntry> {
        let real = self.real_path(path).await?;
        let metadata = tokio::fs::metadata(&real).await?;
        Ok(DirEntry::from_metadata(path.file_name(), &metadata))
    }

    async fn open(&self, path: &ResolvedPath) -> GatewayResult<BoxedReader> {
        let real = self.real_path(path).await?;
        let metadata = tokio::fs::metadata(&real).await?;
        if metadata.is_dir() {
            return Err(GatewayError::Storage(io::Error::new(
                io::ErrorKind::IsADirectory,
                "is a directory",
            )));
        }
        let file = tokio::fs::File::open(&real).await?;
        Ok(Box::new(file))
    }

    async fn list_children(&self, path: &ResolvedPath) -> GatewayResult<Vec<DirEntry>> {
        let real = self.real_path(path).await?;
        let mut reader = tokio::fs::read_dir(&real).await?;
        let mut entries = Vec::new();

        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = entry.path();

            // Drop dangling links and links that leave the root
            let target = match tokio::fs::canonicalize(&child).await {
                Ok(target) if target.starts_with(&self.root) => target,
                _ => continue,
            };

            match tokio::fs::metadata(&target).await {
                Ok(metadata) => entries.push(DirEntry::from_metadata(name, &metadata)),
                Err(e) => {
                    tracing::debug!(name = %name, error = %e, "Skipping unreadable entry");
                }
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn target(&self, path: &ResolvedPath) -> GatewayResult<ResolvedPath> {
        let real = self.real_path(path).await?;
        relative_to(&self.root, &real)
    }
}
