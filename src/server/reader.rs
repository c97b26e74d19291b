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

//! Random-access reads over sequential storage streams.
//!
//! Storage only hands out forward-only streams, while SFTP clients read at
//! arbitrary offsets and often pipeline several reads out of order. The
//! [`RandomAccessReader`] keeps one stream and its current position:
//!
//! - a read at the current position continues the stream;
//! - a read ahead of it discards the gap;
//! - a read behind it reopens the file from offset zero and then skips.
//!
//! Sequential downloads therefore never reopen, and out-of-order reads cost
//! at most one reopen each.

use tokio::io::{AsyncReadExt, BufReader};

use crate::guard::{BoxedReader, GuardedFile};
use crate::shared::error::GatewayResult;

/// Buffer used between the storage stream and client reads.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Offset-addressable reader for one open file handle.
pub struct RandomAccessReader {
    file: GuardedFile,
    stream: Option<BufReader<BoxedReader>>,
    position: u64,
    reopens: u64,
}

impl RandomAccessReader {
    pub fn new(file: GuardedFile) -> Self {
        Self {
            file,
            stream: None,
            position: 0,
            reopens: 0,
        }
    }

    /// The file this reader serves.
    pub fn file(&self) -> &GuardedFile {
        &self.file
    }

    /// Offset the underlying stream is currently positioned at.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// How many times a backwards read forced the stream to be reopened.
    pub fn reopen_count(&self) -> u64 {
        self.reopens
    }

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes only at end of file; an empty buffer means the
    /// offset is at or past the end. After an error the stream position is
    /// unknown, so the stream is dropped and the next read starts over.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> GatewayResult<Vec<u8>> {
        let result = self.read_at_inner(offset, len).await;
        if result.is_err() {
            tracing::debug!(path = %self.file.path(), offset, "Dropping stream after read error");
            self.stream = None;
            self.position = 0;
        }
        result
    }

    async fn read_at_inner(&mut self, offset: u64, len: usize) -> GatewayResult<Vec<u8>> {
        let needs_open = match self.stream {
            None => true,
            Some(_) => offset < self.position,
        };

        if needs_open {
            if self.stream.is_some() {
                self.reopens += 1;
                tracing::trace!(
                    path = %self.file.path(),
                    from = self.position,
                    to = offset,
                    "Reopening stream for backwards read"
                );
            }
            self.stream = None;
            let raw = self.file.stream().await?;
            self.stream = Some(BufReader::with_capacity(STREAM_BUFFER_SIZE, raw));
            self.position = 0;
        }

        let Some(stream) = self.stream.as_mut() else {
            return Ok(Vec::new());
        };

        if offset > self.position {
            let gap = offset - self.position;
            let skipped =
                tokio::io::copy(&mut (&mut *stream).take(gap), &mut tokio::io::sink()).await?;
            self.position += skipped;
            if skipped < gap {
                return Ok(Vec::new());
            }
        }

        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = stream.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        self.position += filled as u64;

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::{DirEntry, Opened, PathGuard, ResolvedPath, Storage};
    use async_trait::async_trait;
    use std::io::{self, Cursor};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::SystemTime;
    use tempfile::TempDir;
    use tokio::io::{AsyncRead, ReadBuf};

    async fn reader_for(content: &[u8]) -> (TempDir, RandomAccessReader) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), content).unwrap();
        let guard = PathGuard::local(dir.path(), vec![]).unwrap();
        match guard.open("/data.bin").await.unwrap() {
            Opened::File(file) => (dir, RandomAccessReader::new(file)),
            Opened::Directory { .. } => panic!("expected a file"),
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_sequential_reads_never_reopen() {
        let content = sample(10_000);
        let (_dir, mut reader) = reader_for(&content).await;

        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            let chunk = reader.read_at(offset, 4096).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            out.extend(chunk);
        }

        assert_eq!(out, content);
        assert_eq!(reader.reopen_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_skip() {
        let content = sample(5000);
        let (_dir, mut reader) = reader_for(&content).await;

        let chunk = reader.read_at(3000, 100).await.unwrap();
        assert_eq!(chunk, &content[3000..3100]);
        assert_eq!(reader.position(), 3100);
        assert_eq!(reader.reopen_count(), 0);
    }

    #[tokio::test]
    async fn test_backwards_read_reopens() {
        let content = sample(5000);
        let (_dir, mut reader) = reader_for(&content).await;

        reader.read_at(4000, 500).await.unwrap();
        let chunk = reader.read_at(10, 20).await.unwrap();
        assert_eq!(chunk, &content[10..30]);
        assert_eq!(reader.reopen_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_read_is_idempotent() {
        let content = sample(1000);
        let (_dir, mut reader) = reader_for(&content).await;

        let first = reader.read_at(200, 50).await.unwrap();
        let second = reader.read_at(200, 50).await.unwrap();
        assert_eq!(first, second);
    }

    /// Serves `content`, but the first `broken_opens` streams fail after
    /// `fail_after` bytes.
    struct FlakyStorage {
        content: Vec<u8>,
        fail_after: usize,
        broken_opens: usize,
        opens: AtomicUsize,
    }

    struct BrokenTail;

    impl AsyncRead for BrokenTail {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "storage went away")))
        }
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn stat(&self, path: &ResolvedPath) -> GatewayResult<DirEntry> {
            Ok(DirEntry::file(
                path.file_name(),
                self.content.len() as u64,
                SystemTime::now(),
            ))
        }

        async fn open(&self, _path: &ResolvedPath) -> GatewayResult<BoxedReader> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.broken_opens {
                let head = Cursor::new(self.content[..self.fail_after].to_vec());
                Ok(Box::new(head.chain(BrokenTail)))
            } else {
                Ok(Box::new(Cursor::new(self.content.clone())))
            }
        }

        async fn list_children(&self, _path: &ResolvedPath) -> GatewayResult<Vec<DirEntry>> {
            Ok(Vec::new())
        }
    }

    async fn flaky_reader(
        content: &[u8],
        fail_after: usize,
    ) -> (Arc<FlakyStorage>, RandomAccessReader) {
        let storage = Arc::new(FlakyStorage {
            content: content.to_vec(),
            fail_after,
            broken_opens: 1,
            opens: AtomicUsize::new(0),
        });
        let guard = PathGuard::new("/share", vec![], storage.clone()).unwrap();
        match guard.open("/data.bin").await.unwrap() {
            Opened::File(file) => (storage, RandomAccessReader::new(file)),
            Opened::Directory { .. } => panic!("expected a file"),
        }
    }

    #[tokio::test]
    async fn test_error_mid_read_forces_reopen() {
        let content = sample(100);
        let (storage, mut reader) = flaky_reader(&content, 10).await;

        assert!(reader.read_at(0, 20).await.is_err());
        assert_eq!(reader.read_at(0, 20).await.unwrap(), &content[0..20]);
        assert_eq!(storage.opens.load(Ordering::SeqCst), 2);
        assert_eq!(reader.position(), 20);
    }

    #[tokio::test]
    async fn test_error_during_skip_forces_reopen() {
        let content = sample(100);
        let (storage, mut reader) = flaky_reader(&content, 10).await;

        assert!(reader.read_at(50, 5).await.is_err());
        assert_eq!(reader.read_at(50, 5).await.unwrap(), &content[50..55]);
        assert_eq!(storage.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_read_past_end() {
        let content = sample(100);
        let (_dir, mut reader) = reader_for(&content).await;

        assert!(reader.read_at(100, 10).await.unwrap().is_empty());
        assert!(reader.read_at(500, 10).await.unwrap().is_empty());

        let tail = reader.read_at(90, 64).await.unwrap();
        assert_eq!(tail, &content[90..]);
    }
}
