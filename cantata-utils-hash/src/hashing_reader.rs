// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! An async reader adapter that hashes everything read through it.
//!
//! The digest state lives behind an [`Arc<Mutex<…>>`] so the caller can
//! extract the final hash even after the reader has been moved into a
//! consumer that does not hand it back (e.g. a NAR restorer).

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use pin_project_lite::pin_project;
use tokio::io::AsyncRead;

use crate::{Algorithm, Context, Hash};

/// Incremental hash plus byte count, shared between the reader and its
/// creator.
pub struct HashState {
    ctx: Context,
    pub bytes_read: u64,
}

impl std::fmt::Debug for HashState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashState")
            .field("algorithm", &self.ctx.algorithm())
            .field("bytes_read", &self.bytes_read)
            .finish_non_exhaustive()
    }
}

impl HashState {
    fn new(algorithm: Algorithm) -> Self {
        HashState {
            ctx: Context::new(algorithm),
            bytes_read: 0,
        }
    }

    fn update(&mut self, data: &[u8]) {
        self.ctx.update(data);
        self.bytes_read += data.len() as u64;
    }

    /// Consume the state and return the digest.
    pub fn finish(self) -> Hash {
        self.ctx.finish()
    }
}

pin_project! {
    /// Wraps an [`AsyncRead`] and hashes every byte that passes through.
    pub struct HashingReader<R> {
        #[pin]
        inner: R,
        state: Arc<Mutex<HashState>>,
    }
}

impl<R> HashingReader<R> {
    /// Create a hashing reader; the returned handle yields the digest
    /// once reading is done.
    pub fn new(inner: R, algorithm: Algorithm) -> (Self, Arc<Mutex<HashState>>) {
        let state = Arc::new(Mutex::new(HashState::new(algorithm)));
        (
            HashingReader {
                inner,
                state: state.clone(),
            },
            state,
        )
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let new = &buf.filled()[before..];
                if !new.is_empty() {
                    this.state.lock().unwrap().update(new);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt as _;

    use super::*;

    #[tokio::test]
    async fn hashes_all_bytes_read() {
        let data = b"hello, world".as_slice();
        let (mut reader, state) = HashingReader::new(data, Algorithm::SHA256);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello, world");

        let state = Arc::try_unwrap(state).unwrap().into_inner().unwrap();
        assert_eq!(state.bytes_read, 12);
        assert_eq!(state.finish(), Algorithm::SHA256.digest("hello, world"));
    }
}
