// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

use data_encoding::{DecodeError, DecodeKind, DecodePartial};

pub const ALPHABET: [u8; 32] = *b"0123456789abcdfghijklmnpqrsvwxyz";

const REVERSE: [u8; 256] = {
    let mut table = [0xFFu8; 256];
    let mut i = 0u8;
    while i < 32 {
        table[ALPHABET[i as usize] as usize] = i;
        i += 1;
    }
    table
};

/// Number of characters needed to encode `len` bytes.
pub const fn encode_len(len: usize) -> usize {
    (8 * len).div_ceil(5)
}

/// Number of bytes decoded from `len` characters.
///
/// Panics at const-eval time when `len` is not a valid encoded length.
pub const fn decode_len(len: usize) -> usize {
    let trail = len * 5 % 8;
    if trail >= 5 {
        panic!("invalid nix-base32 length");
    }
    5 * len / 8
}

/// Encode `input` into `output`, which must be exactly
/// [`encode_len`]`(input.len())` bytes long.
pub fn encode_mut(input: &[u8], output: &mut [u8]) {
    let len = encode_len(input.len());
    assert_eq!(output.len(), len);
    for (pos, out) in output.iter_mut().enumerate() {
        let bit = (len - 1 - pos) * 5;
        let byte = bit / 8;
        let shift = bit % 8;
        let mut value = (input[byte] as u16) >> shift;
        if byte + 1 < input.len() {
            value |= (input[byte + 1] as u16) << (8 - shift);
        }
        *out = ALPHABET[(value & 0x1f) as usize];
    }
}

/// Encode `input` into a freshly allocated `String`.
pub fn encode(input: &[u8]) -> String {
    let mut output = vec![0u8; encode_len(input.len())];
    encode_mut(input, &mut output);
    // Characters come from ALPHABET, an ASCII subset.
    String::from_utf8(output).unwrap()
}

fn symbol_error(position: usize) -> DecodePartial {
    DecodePartial {
        read: position / 8 * 8,
        written: position / 8 * 5,
        error: DecodeError {
            position,
            kind: DecodeKind::Symbol,
        },
    }
}

/// Decode `input` into `output`, which must be exactly
/// [`decode_len`]`(input.len())` bytes long.
///
/// Fails with a positioned error on characters outside the alphabet and
/// on non-zero trailing bits.
pub fn decode_mut(input: &[u8], output: &mut [u8]) -> Result<(), DecodePartial> {
    let len = input.len();
    assert_eq!(output.len(), decode_len(len));
    output.fill(0);
    for n in 0..len {
        let pos = len - 1 - n;
        let digit = REVERSE[input[pos] as usize];
        if digit >= 32 {
            return Err(symbol_error(pos));
        }
        let bit = n * 5;
        let byte = bit / 8;
        let shift = bit % 8;
        let value = (digit as u16) << shift;
        output[byte] |= (value & 0xff) as u8;
        let carry = (value >> 8) as u8;
        if byte + 1 < output.len() {
            output[byte + 1] |= carry;
        } else if carry != 0 {
            // Bits that do not fit in the output must be zero.
            return Err(DecodePartial {
                read: 0,
                written: 0,
                error: DecodeError {
                    position: pos,
                    kind: DecodeKind::Trailing,
                },
            });
        }
    }
    Ok(())
}

/// Decode a nix-base32 string into a freshly allocated buffer.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, DecodePartial> {
    let mut output = vec![0u8; decode_len(input.len())];
    decode_mut(input, &mut output)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use proptest::{prop_assert_eq, proptest};
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty("", &[])]
    #[case::one_zero("00", &hex!("00"))]
    #[case::one_ff("3z", &hex!("ff"))]
    #[case::two("0bqz", &hex!("1f2f"))]
    #[case::three("gy003", &hex!("0300 FF"))]
    #[case::four("0s14004", &hex!("0400 1234"))]
    #[case::five("aqs14005", &hex!("0500 1234 56"))]
    #[case::six("3qaqs14006", &hex!("0600 1234 5678"))]
    #[case::seven("16kqaqs14007", &hex!("0700 1234 5678 9A"))]
    #[case::eight("br6kqaqs14008", &hex!("0800 1234 5678 9ABC"))]
    #[case::sha1_abc("x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88", &hex!("0839 7037 8635 6bca 59b0 f4a3 2987 eb2e 6de4 3ae8"))]
    #[case::sha256_abc("1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s", &hex!("ba78 16bf 8f01 cfea 4141 40de 5dae 2223 b003 61a3 9617 7a9c b410 ff61 f200 15ad"))]
    #[case::sha512_abc("2gs8k559z4rlahfx0y688s49m2vvszylcikrfinm30ly9rak69236nkam5ydvly1ai7xac99vxfc4ii84hawjbk876blyk1jfhkbbyx", &hex!("ddaf 35a1 9361 7aba cc41 7349 ae20 4131 12e6 fa4e 89a9 7ea2 0a9e eee6 4b55 d39a 2192 992a 274f c1a8 36ba 3c23 a3fe ebbd 454d 4423 643c e80e 2a9a c94f a54c a49f"))]
    fn encode_known(#[case] expected: &str, #[case] data: &[u8]) {
        assert_eq!(encode(data), expected);
    }

    #[rstest]
    #[case::empty("", &[])]
    #[case::one_zero("00", &hex!("00"))]
    #[case::one_ff("3z", &hex!("ff"))]
    #[case::two("0bqz", &hex!("1f2f"))]
    #[case::sha1_abc("x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88", &hex!("0839 7037 8635 6bca 59b0 f4a3 2987 eb2e 6de4 3ae8"))]
    #[case::sha256_abc("1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s", &hex!("ba78 16bf 8f01 cfea 4141 40de 5dae 2223 b003 61a3 9617 7a9c b410 ff61 f200 15ad"))]
    fn decode_known(#[case] data: &str, #[case] expected: &[u8]) {
        assert_eq!(decode(data.as_bytes()).unwrap(), expected);
    }

    #[rstest]
    #[case::at_start("|czz0", 0)]
    #[case::mid("cz|z0", 2)]
    #[case::at_end("czz0|", 4)]
    #[case::excluded_e("czze0", 3)]
    #[case::excluded_t("tzzz0", 0)]
    fn decode_rejects_symbol(#[case] data: &str, #[case] position: usize) {
        let err = decode(data.as_bytes()).expect_err("decode succeeded");
        assert_eq!(err.error.position, position);
        assert_eq!(err.error.kind, DecodeKind::Symbol);
    }

    #[test]
    fn decode_rejects_trailing_bits() {
        // "zz" would decode to 10 bits for a single output byte.
        let err = decode(b"zz").expect_err("decode succeeded");
        assert_eq!(err.error.kind, DecodeKind::Trailing);
    }

    proptest! {
        #[test]
        fn roundtrip(data: Vec<u8>) {
            let encoded = encode(&data);
            let decoded = decode(encoded.as_bytes()).unwrap();
            prop_assert_eq!(data, decoded);
        }
    }
}
