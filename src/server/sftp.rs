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

//! Read-only SFTP subsystem handler.
//!
//! Implements `russh_sftp::server::Handler` on top of a [`PathGuard`]. Every
//! client path goes through the guard; handles hold only resolved paths,
//! listing snapshots, and random-access readers.
//!
//! # Read-only
//!
//! Opening with any write, create, truncate, append, or exclusive flag fails
//! with `SSH_FX_PERMISSION_DENIED`, as do write, remove, rename, mkdir, rmdir,
//! symlink, setstat, and fsetstat. This holds for every authenticated user.
//! Readlink answers `SSH_FX_OP_UNSUPPORTED`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use treeshare::guard::PathGuard;
//! use treeshare::server::sftp::SftpHandler;
//!
//! # fn main() -> anyhow::Result<()> {
//! let guard = Arc::new(PathGuard::local("/srv/share", vec![".git".into()])?);
//! let handler = SftpHandler::new("alice", guard);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use russh_sftp::protocol::{
    Attrs, Data, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};

use crate::guard::{DirEntry, DirListing, Opened, PathGuard, ResolvedPath};
use crate::shared::error::GatewayError;

use super::reader::RandomAccessReader;

/// Error type for SFTP operations.
///
/// Converts into `StatusCode` for the handler trait. Messages are generic and
/// never carry a filesystem path.
#[derive(Debug, Clone)]
pub struct SftpError {
    pub code: StatusCode,
    pub message: String,
}

impl SftpError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_supported() -> Self {
        Self::new(StatusCode::OpUnsupported, "Operation not supported")
    }

    /// Rejection for every write-class request.
    pub fn read_only(operation: &'static str) -> Self {
        GatewayError::Unsupported(operation).into()
    }

    pub fn invalid_handle() -> Self {
        Self::new(StatusCode::Failure, "Invalid handle")
    }

    pub fn eof() -> Self {
        Self::new(StatusCode::Eof, "End of file")
    }
}

impl std::fmt::Display for SftpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SftpError {}

impl From<GatewayError> for SftpError {
    fn from(err: GatewayError) -> Self {
        Self::new(err.status_code(), err.to_string())
    }
}

impl From<SftpError> for StatusCode {
    fn from(err: SftpError) -> Self {
        err.code
    }
}

enum OpenHandle {
    File(RandomAccessReader),
    Dir {
        path: ResolvedPath,
        listing: DirListing,
        position: usize,
    },
}

/// Maximum number of open handles per session.
const MAX_HANDLES: usize = 1000;

/// Maximum bytes returned by one read.
const MAX_READ_SIZE: u32 = 65536;

/// Entries returned per readdir call.
const READDIR_BATCH: usize = 100;

/// SFTP handler for one authenticated channel.
///
/// russh-sftp feeds requests to the handler one at a time, so the requests of
/// a session never interleave against storage.
pub struct SftpHandler {
    user: String,
    guard: Arc<PathGuard>,
    handles: HashMap<String, OpenHandle>,
    handle_counter: u64,
}

impl SftpHandler {
    pub fn new(user: impl Into<String>, guard: Arc<PathGuard>) -> Self {
        let user = user.into();
        tracing::debug!(user = %user, "Creating SFTP handler");

        Self {
            user,
            guard,
            handles: HashMap::new(),
            handle_counter: 0,
        }
    }

    /// Number of currently open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn new_handle(&mut self) -> Result<String, SftpError> {
        if self.handles.len() >= MAX_HANDLES {
            tracing::warn!(user = %self.user, "Too many open handles");
            return Err(SftpError::new(StatusCode::Failure, "Too many open handles"));
        }
        self.handle_counter += 1;
        Ok(format!("h{}", self.handle_counter))
    }

    fn ok_status(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: String::new(),
            language_tag: "en".to_string(),
        }
    }

    fn reject_write(&self, operation: &'static str, target: &str) -> SftpError {
        tracing::info!(
            user = %self.user,
            operation = operation,
            target = %target,
            "Rejected write-class request on read-only share"
        );
        SftpError::read_only(operation)
    }
}

/// Attributes for an entry; synthetic entries get the same shape.
pub fn entry_attrs(entry: &DirEntry) -> FileAttributes {
    let mtime = entry.mtime_secs() as u32;
    FileAttributes {
        size: Some(entry.size),
        uid: None,
        user: None,
        gid: None,
        group: None,
        permissions: Some(entry.mode),
        atime: Some(mtime),
        mtime: Some(mtime),
    }
}

pub fn empty_attrs() -> FileAttributes {
    FileAttributes {
        size: None,
        uid: None,
        user: None,
        gid: None,
        group: None,
        permissions: None,
        atime: None,
        mtime: None,
    }
}

fn to_sftp_file(entry: &DirEntry) -> russh_sftp::protocol::File {
    russh_sftp::protocol::File {
        filename: entry.name.clone(),
        longname: entry.long_name(),
        attrs: entry_attrs(entry),
    }
}

fn is_write_open(flags: OpenFlags) -> bool {
    flags.contains(OpenFlags::WRITE)
        || flags.contains(OpenFlags::CREATE)
        || flags.contains(OpenFlags::TRUNCATE)
        || flags.contains(OpenFlags::APPEND)
        || flags.contains(OpenFlags::EXCLUDE)
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = SftpError;

    fn unimplemented(&self) -> Self::Error {
        SftpError::not_supported()
    }

    fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> impl std::future::Future<Output = Result<Version, Self::Error>> + Send {
        tracing::info!(user = %self.user, version = version, "SFTP session initialized");
        async move { Ok(Version::new()) }
    }

    fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> impl std::future::Future<Output = Result<Handle, Self::Error>> + Send {
        async move {
            if is_write_open(pflags) {
                return Err(self.reject_write("open-for-write", &filename));
            }

            let handle = self.new_handle()?;
            let file = match self.guard.open(&filename).await? {
                Opened::File(file) => file,
                Opened::Directory { .. } => {
                    return Err(SftpError::new(StatusCode::Failure, "Is a directory"));
                }
            };

            tracing::debug!(
                user = %self.user,
                path = %file.path(),
                handle = %handle,
                "Opened file"
            );

            self.handles
                .insert(handle.clone(), OpenHandle::File(RandomAccessReader::new(file)));

            Ok(Handle { id, handle })
        }
    }

    fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> impl std::future::Future<Output = Result<Data, Self::Error>> + Send {
        async move {
            let capped_len = len.min(MAX_READ_SIZE);

            let reader = match self.handles.get_mut(&handle) {
                Some(OpenHandle::File(reader)) => reader,
                _ => return Err(SftpError::invalid_handle()),
            };

            let data = reader.read_at(offset, capped_len as usize).await?;
            if data.is_empty() {
                return Err(SftpError::eof());
            }

            tracing::trace!(
                handle = %handle,
                offset = offset,
                requested = len,
                read = data.len(),
                "Read data from file"
            );

            Ok(Data { id, data })
        }
    }

    fn close(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        tracing::debug!(user = %self.user, handle = %handle, "Closing handle");
        let removed = self.handles.remove(&handle);

        async move {
            match removed {
                Some(_) => Ok(Self::ok_status(id)),
                None => Err(SftpError::invalid_handle()),
            }
        }
    }

    fn opendir(
        &mut self,
        id: u32,
        path: String,
    ) -> impl std::future::Future<Output = Result<Handle, Self::Error>> + Send {
        async move {
            let handle = self.new_handle()?;
            let resolved = self.guard.resolve(&path)?;
            let listing = self.guard.list_children(resolved.as_str()).await?;

            tracing::debug!(
                user = %self.user,
                path = %resolved,
                entries = listing.len(),
                handle = %handle,
                "Opened directory"
            );

            self.handles.insert(
                handle.clone(),
                OpenHandle::Dir {
                    path: resolved,
                    listing,
                    position: 0,
                },
            );

            Ok(Handle { id, handle })
        }
    }

    fn readdir(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl std::future::Future<Output = Result<Name, Self::Error>> + Send {
        let result = match self.handles.get_mut(&handle) {
            Some(OpenHandle::Dir {
                listing, position, ..
            }) => {
                let page = listing.page(*position, READDIR_BATCH);
                if page.is_empty() {
                    Err(SftpError::eof())
                } else {
                    let files: Vec<_> = page.iter().map(to_sftp_file).collect();
                    *position += files.len();
                    tracing::trace!(
                        handle = %handle,
                        returned = files.len(),
                        remaining = listing.len() - *position,
                        "Read directory entries"
                    );
                    Ok(Name { id, files })
                }
            }
            _ => Err(SftpError::invalid_handle()),
        };

        async move { result }
    }

    fn stat(
        &mut self,
        id: u32,
        path: String,
    ) -> impl std::future::Future<Output = Result<Attrs, Self::Error>> + Send {
        async move {
            let entry = self.guard.stat(&path).await?;
            Ok(Attrs {
                id,
                attrs: entry_attrs(&entry),
            })
        }
    }

    /// Symlinks are always followed, so lstat reports the same as stat.
    fn lstat(
        &mut self,
        id: u32,
        path: String,
    ) -> impl std::future::Future<Output = Result<Attrs, Self::Error>> + Send {
        async move {
            let entry = self.guard.stat(&path).await?;
            Ok(Attrs {
                id,
                attrs: entry_attrs(&entry),
            })
        }
    }

    fn fstat(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl std::future::Future<Output = Result<Attrs, Self::Error>> + Send {
        async move {
            let entry = match self.handles.get(&handle) {
                Some(OpenHandle::File(reader)) => reader.file().entry().clone(),
                Some(OpenHandle::Dir { path, .. }) => {
                    let path = path.clone();
                    self.guard.stat_resolved(&path).await?
                }
                None => return Err(SftpError::invalid_handle()),
            };

            Ok(Attrs {
                id,
                attrs: entry_attrs(&entry),
            })
        }
    }

    fn realpath(
        &mut self,
        id: u32,
        path: String,
    ) -> impl std::future::Future<Output = Result<Name, Self::Error>> + Send {
        async move {
            let resolved = self.guard.resolve(&path)?;
            let display_path = resolved.client_path();

            let attrs = match self.guard.stat_resolved(&resolved).await {
                Ok(entry) => entry_attrs(&entry),
                Err(_) => empty_attrs(),
            };

            tracing::trace!(requested = %path, resolved = %display_path, "Resolved real path");

            Ok(Name {
                id,
                files: vec![russh_sftp::protocol::File {
                    filename: display_path,
                    longname: String::new(),
                    attrs,
                }],
            })
        }
    }

    fn readlink(
        &mut self,
        _id: u32,
        path: String,
    ) -> impl std::future::Future<Output = Result<Name, Self::Error>> + Send {
        let result = self.guard.readlink(&path).map_err(SftpError::from);
        async move {
            result?;
            Err(SftpError::not_supported())
        }
    }

    fn write(
        &mut self,
        _id: u32,
        handle: String,
        _offset: u64,
        _data: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let err = self.reject_write("write", &handle);
        async move { Err(err) }
    }

    fn remove(
        &mut self,
        _id: u32,
        filename: String,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let err = self.reject_write("remove", &filename);
        async move { Err(err) }
    }

    fn rename(
        &mut self,
        _id: u32,
        oldpath: String,
        _newpath: String,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let err = self.reject_write("rename", &oldpath);
        async move { Err(err) }
    }

    fn mkdir(
        &mut self,
        _id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let err = self.reject_write("mkdir", &path);
        async move { Err(err) }
    }

    fn rmdir(
        &mut self,
        _id: u32,
        path: String,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let err = self.reject_write("rmdir", &path);
        async move { Err(err) }
    }

    fn symlink(
        &mut self,
        _id: u32,
        linkpath: String,
        _targetpath: String,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let err = self.reject_write("symlink", &linkpath);
        async move { Err(err) }
    }

    fn setstat(
        &mut self,
        _id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let err = self.reject_write("setstat", &path);
        async move { Err(err) }
    }

    fn fsetstat(
        &mut self,
        _id: u32,
        handle: String,
        _attrs: FileAttributes,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let err = self.reject_write("fsetstat", &handle);
        async move { Err(err) }
    }
}
