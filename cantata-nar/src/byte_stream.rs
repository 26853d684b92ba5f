// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! The NAR serialization of a path as a stream of byte chunks.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::dump_path;

/// Default chunk size for yielded Bytes (64 KiB).
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks buffered between encoder and consumer. Lets the
/// encoder work ahead without unbounded memory growth.
const CHANNEL_CAPACITY: usize = 4;

/// An [`AsyncWrite`] collecting bytes into [`Bytes`] chunks sent through
/// a bounded channel. A full channel makes `poll_write` pend, giving
/// natural back-pressure.
struct ChannelWriter {
    sender: PollSender<io::Result<Bytes>>,
    buffer: BytesMut,
    chunk_size: usize,
}

impl ChannelWriter {
    fn new(sender: PollSender<io::Result<Bytes>>, chunk_size: usize) -> Self {
        ChannelWriter {
            sender,
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
        }
    }

    fn poll_emit_chunk(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.buffer.is_empty() {
            return Poll::Ready(Ok(()));
        }
        ready!(self.sender.poll_reserve(cx))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream dropped"))?;
        let chunk = std::mem::replace(&mut self.buffer, BytesMut::with_capacity(self.chunk_size));
        self.sender
            .send_item(Ok(chunk.freeze()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream dropped"))?;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.buffer.len() >= self.chunk_size {
            ready!(self.poll_emit_chunk(cx))?;
        }
        let n = buf.len().min(self.chunk_size - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_emit_chunk(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_emit_chunk(cx))?;
        Poll::Ready(Ok(()))
    }
}

/// A [`Stream`] of [`Bytes`] chunks containing the NAR serialization of
/// a filesystem path.
///
/// A background task walks the tree and encodes; the bounded channel
/// provides pipelining with back-pressure. Encoding errors surface as
/// the final stream item.
pub struct NarByteStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl NarByteStream {
    pub fn new(path: PathBuf) -> Self {
        Self::with_chunk_size(path, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(path: PathBuf, chunk_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let sender = PollSender::new(tx.clone());

        tokio::task::spawn(async move {
            let mut writer = ChannelWriter::new(sender, chunk_size);
            use tokio::io::AsyncWriteExt as _;
            match dump_path(&path, &mut writer).await {
                Ok(_) => {
                    let _ = writer.shutdown().await;
                }
                Err(err) => {
                    tracing::debug!("NAR dump of {} failed: {}", path.display(), err);
                    let _ = tx
                        .send(Err(io::Error::other(err.to_string())))
                        .await;
                }
            }
        });

        NarByteStream { rx }
    }
}

impl Stream for NarByteStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;

    use super::*;

    #[tokio::test]
    async fn stream_matches_direct_dump() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("file"), vec![7u8; 200_000]).unwrap();

        let mut direct = Vec::new();
        dump_path(&root, &mut direct).await.unwrap();

        let mut streamed = Vec::new();
        let mut stream = NarByteStream::with_chunk_size(root.clone(), 4096);
        while let Some(chunk) = stream.next().await {
            streamed.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(direct, streamed);
    }

    #[tokio::test]
    async fn missing_path_yields_error() {
        let mut stream = NarByteStream::new(PathBuf::from("/does/not/exist"));
        let mut saw_error = false;
        while let Some(chunk) = stream.next().await {
            if chunk.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }
}
