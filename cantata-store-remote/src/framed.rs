// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Framed payload streaming for `AddToStore*` bodies.
//!
//! Payload bytes are carried in chunks, each prefixed with its u64
//! length; a zero-length chunk terminates the stream. This keeps the
//! payload inside the request framing so a server can always resynchronise
//! after a failed operation by draining to the terminator.

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::error::ProtocolError;

const DEFAULT_BUFFER: usize = 64 * 1024;

/// Writes a framed byte stream.
pub struct FramedSink<W> {
    writer: W,
    buffer: Vec<u8>,
    capacity: usize,
}

impl<W: AsyncWrite + Unpin> FramedSink<W> {
    pub fn new(writer: W) -> Self {
        Self::with_capacity(writer, DEFAULT_BUFFER)
    }

    pub fn with_capacity(writer: W, capacity: usize) -> Self {
        FramedSink {
            writer,
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let room = self.capacity - self.buffer.len();
            let take = remaining.len().min(room);
            self.buffer.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if self.buffer.len() == self.capacity {
                self.flush_chunk().await?;
            }
        }
        Ok(())
    }

    async fn flush_chunk(&mut self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.writer
            .write_all(&(self.buffer.len() as u64).to_le_bytes())
            .await?;
        self.writer.write_all(&self.buffer).await?;
        self.buffer.clear();
        Ok(())
    }

    /// Flush and write the zero-length terminator; hands the writer
    /// back.
    pub async fn finish(mut self) -> Result<W, ProtocolError> {
        self.flush_chunk().await?;
        self.writer.write_all(&0u64.to_le_bytes()).await?;
        self.writer.flush().await?;
        Ok(self.writer)
    }
}

/// Reads a framed byte stream back into a contiguous one.
pub struct FramedSource<R> {
    reader: R,
    chunk: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FramedSource<R> {
    pub fn new(reader: R) -> Self {
        FramedSource {
            reader,
            chunk: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    async fn next_chunk(&mut self) -> Result<(), ProtocolError> {
        let mut len_bytes = [0u8; 8];
        self.reader.read_exact(&mut len_bytes).await?;
        let len = u64::from_le_bytes(len_bytes);
        if len == 0 {
            self.eof = true;
            return Ok(());
        }
        self.chunk.resize(len as usize, 0);
        self.pos = 0;
        self.reader.read_exact(&mut self.chunk).await?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes; 0 at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let mut total = 0;
        while total < buf.len() {
            if self.pos >= self.chunk.len() {
                if self.eof {
                    break;
                }
                self.next_chunk().await?;
                continue;
            }
            let take = (buf.len() - total).min(self.chunk.len() - self.pos);
            buf[total..total + take].copy_from_slice(&self.chunk[self.pos..self.pos + take]);
            self.pos += take;
            total += take;
        }
        Ok(total)
    }

    /// Read the whole payload into memory (request bodies are already
    /// size-capped by callers).
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        loop {
            if self.pos < self.chunk.len() {
                out.extend_from_slice(&self.chunk[self.pos..]);
                self.pos = self.chunk.len();
            }
            if self.eof {
                break;
            }
            self.next_chunk().await?;
        }
        Ok(out)
    }

    /// Consume any remaining chunks so the connection stays in sync.
    pub async fn drain(&mut self) -> Result<(), ProtocolError> {
        while !self.eof {
            self.next_chunk().await?;
            self.pos = self.chunk.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_small_buffer() {
        let mut sink = FramedSink::with_capacity(Vec::new(), 8);
        sink.write(b"hello framed world").await.unwrap();
        let encoded = sink.finish().await.unwrap();

        let mut source = FramedSource::new(encoded.as_slice());
        let out = source.read_to_end().await.unwrap();
        assert_eq!(out, b"hello framed world");
    }

    #[tokio::test]
    async fn empty_stream() {
        let sink = FramedSink::new(Vec::new());
        let encoded = sink.finish().await.unwrap();
        assert_eq!(encoded, 0u64.to_le_bytes());

        let mut source = FramedSource::new(encoded.as_slice());
        assert_eq!(source.read_to_end().await.unwrap(), b"");
    }

    #[tokio::test]
    async fn partial_reads() {
        let mut sink = FramedSink::with_capacity(Vec::new(), 4);
        sink.write(b"abcdefghij").await.unwrap();
        let encoded = sink.finish().await.unwrap();

        let mut source = FramedSource::new(encoded.as_slice());
        let mut buf = [0u8; 3];
        let mut out = Vec::new();
        loop {
            let n = source.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdefghij");
    }

    #[tokio::test]
    async fn drain_leaves_reader_positioned() {
        let mut sink = FramedSink::with_capacity(Vec::new(), 4);
        sink.write(b"abcdefghij").await.unwrap();
        let mut encoded = sink.finish().await.unwrap();
        encoded.extend_from_slice(b"TRAILER");

        let mut reader = encoded.as_slice();
        let mut source = FramedSource::new(&mut reader);
        source.drain().await.unwrap();
        assert_eq!(reader, b"TRAILER");
    }
}
