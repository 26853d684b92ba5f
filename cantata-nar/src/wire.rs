// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Token framing: u64 LE length, payload, zero padding to 8 bytes.

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::NarError;

pub(crate) const ZEROS: [u8; 8] = [0u8; 8];

pub(crate) const fn padding_len(len: u64) -> usize {
    (len.wrapping_neg() & 7) as usize
}

pub(crate) async fn write_u64<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: u64,
) -> std::io::Result<u64> {
    writer.write_all(&value.to_le_bytes()).await?;
    Ok(8)
}

pub(crate) async fn write_token<W: AsyncWrite + Unpin>(
    writer: &mut W,
    token: &[u8],
) -> std::io::Result<u64> {
    let mut written = write_u64(writer, token.len() as u64).await?;
    writer.write_all(token).await?;
    written += token.len() as u64;
    let pad = padding_len(token.len() as u64);
    if pad > 0 {
        writer.write_all(&ZEROS[..pad]).await?;
        written += pad as u64;
    }
    Ok(written)
}

pub(crate) async fn read_u64<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, NarError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

/// Read one length-limited token including its padding.
pub(crate) async fn read_token<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: u64,
) -> Result<Vec<u8>, NarError> {
    let len = read_u64(reader).await?;
    if len > max_len {
        return Err(NarError::TokenTooLong(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    read_padding(reader, len).await?;
    Ok(buf)
}

pub(crate) async fn read_padding<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: u64,
) -> Result<(), NarError> {
    let pad = padding_len(len);
    if pad > 0 {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf[..pad]).await?;
        if buf[..pad] != ZEROS[..pad] {
            return Err(NarError::BadPadding);
        }
    }
    Ok(())
}

/// Read a token and require it to match `expected`.
pub(crate) async fn expect_token<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected: &[u8],
) -> Result<(), NarError> {
    let token = read_token(reader, 64).await?;
    if token != expected {
        return Err(NarError::UnexpectedToken {
            expected: String::from_utf8_lossy(expected).into_owned(),
            got: String::from_utf8_lossy(&token).into_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case(0, 0)]
    #[case(1, 7)]
    #[case(7, 1)]
    #[case(8, 0)]
    #[case(13, 3)]
    fn padding(#[case] len: u64, #[case] pad: usize) {
        assert_eq!(padding_len(len), pad);
    }

    #[tokio::test]
    async fn token_roundtrip() {
        let mut buf = Vec::new();
        let written = write_token(&mut buf, b"nix-archive-1").await.unwrap();
        assert_eq!(written, 24);
        assert_eq!(buf.len(), 24);

        let mut reader = buf.as_slice();
        let token = read_token(&mut reader, 64).await.unwrap();
        assert_eq!(token, b"nix-archive-1");
    }

    #[tokio::test]
    async fn nonzero_padding_rejected() {
        let mut buf = Vec::new();
        write_token(&mut buf, b"x").await.unwrap();
        buf[9 + 2] = 0xFF;
        let mut reader = buf.as_slice();
        assert!(matches!(
            read_token(&mut reader, 64).await,
            Err(NarError::BadPadding)
        ));
    }
}
