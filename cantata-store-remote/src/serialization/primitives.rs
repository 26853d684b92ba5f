// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

use std::collections::BTreeSet;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::error::ProtocolError;
use crate::protocol::{MAX_LIST_SIZE, MAX_STRING_SIZE, WireCtx};
use crate::serialization::{Deserialize, Serialize};

impl Serialize for u64 {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        _ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        writer.write_all(&self.to_le_bytes()).await?;
        Ok(())
    }
}

impl Deserialize for u64 {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        _ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).await?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl Serialize for bool {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        (*self as u64).serialize(writer, ctx).await
    }
}

impl Deserialize for bool {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        Ok(u64::deserialize(reader, ctx).await? != 0)
    }
}

impl Serialize for [u8] {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        let len = self.len() as u64;
        len.serialize(writer, ctx).await?;
        writer.write_all(self).await?;
        let padding = (len.wrapping_neg() & 7) as usize;
        if padding > 0 {
            writer.write_all(&[0u8; 8][..padding]).await?;
        }
        Ok(())
    }
}

impl Serialize for Vec<u8> {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        self.as_slice().serialize(writer, ctx).await
    }
}

impl Deserialize for Vec<u8> {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let len = u64::deserialize(reader, ctx).await?;
        if len > MAX_STRING_SIZE {
            return Err(ProtocolError::StringTooLong {
                length: len,
                max: MAX_STRING_SIZE,
            });
        }
        let aligned = (len + 7) & !7;
        let mut buf = vec![0u8; aligned as usize];
        reader.read_exact(&mut buf).await?;
        buf.truncate(len as usize);
        Ok(buf)
    }
}

impl Serialize for str {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        self.as_bytes().serialize(writer, ctx).await
    }
}

impl Serialize for String {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        self.as_bytes().serialize(writer, ctx).await
    }
}

impl Deserialize for String {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let bytes = Vec::<u8>::deserialize(reader, ctx).await?;
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

impl<T: Serialize + Sync> Serialize for Vec<T> {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        (self.len() as u64).serialize(writer, ctx).await?;
        for item in self {
            item.serialize(writer, ctx).await?;
        }
        Ok(())
    }
}

impl<T: Deserialize + Send> Deserialize for Vec<T> {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let len = u64::deserialize(reader, ctx).await?;
        if len > MAX_LIST_SIZE {
            return Err(ProtocolError::ListTooLong {
                length: len,
                max: MAX_LIST_SIZE,
            });
        }
        let mut out = Vec::with_capacity(len.min(4096) as usize);
        for _ in 0..len {
            out.push(T::deserialize(reader, ctx).await?);
        }
        Ok(out)
    }
}

impl<T: Serialize + Sync> Serialize for BTreeSet<T> {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        (self.len() as u64).serialize(writer, ctx).await?;
        for item in self {
            item.serialize(writer, ctx).await?;
        }
        Ok(())
    }
}

impl<T: Deserialize + Send + Ord> Deserialize for BTreeSet<T> {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let items = Vec::<T>::deserialize(reader, ctx).await?;
        Ok(items.into_iter().collect())
    }
}

impl<T: Serialize + Sync> Serialize for Option<T> {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        match self {
            None => 0u64.serialize(writer, ctx).await,
            Some(value) => {
                1u64.serialize(writer, ctx).await?;
                value.serialize(writer, ctx).await
            }
        }
    }
}

impl<T: Deserialize + Send> Deserialize for Option<T> {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        if u64::deserialize(reader, ctx).await? == 0 {
            Ok(None)
        } else {
            Ok(Some(T::deserialize(reader, ctx).await?))
        }
    }
}
