/*
 * encoder.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Forchetta, a pre-fork application server.
 *
 * Forchetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Forchetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Forchetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! HPACK encoder (RFC 7541) for response header blocks: `:status` and
//! regular headers. Indexed representation for exact static-table matches,
//! literal with name index for name-only matches, literal without indexing
//! (Huffman when shorter) for everything else. The dynamic table is not
//! populated on the encode side.

use bytes::BufMut;
use std::io;

use super::huffman;
use super::static_table::STATIC_TABLE;

/// Encode a header list into an HPACK header block. Names must already be
/// lower-case (pseudo-headers first, per RFC 7540 §8.1.2.1).
pub fn encode_headers(headers: &[(&str, &str)], out: &mut impl BufMut) -> io::Result<()> {
    for &(name, value) in headers {
        if let Some(idx) = find_static_exact(name, value) {
            encode_indexed(idx, out);
        } else if let Some(idx) = find_static_name(name) {
            encode_literal_with_name_index(idx, value.as_bytes(), out)?;
        } else {
            encode_literal_new_name(name.as_bytes(), value.as_bytes(), out)?;
        }
    }
    Ok(())
}

fn find_static_exact(name: &str, value: &str) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|&(n, v)| n == name && v == Some(value))
}

fn find_static_name(name: &str) -> Option<usize> {
    STATIC_TABLE.iter().position(|&(n, _)| n == name)
}

/// Indexed header field (RFC 7541 §6.1): 1-bit prefix + 7-bit index.
fn encode_indexed(index: usize, out: &mut impl BufMut) {
    encode_integer(index as u64, 7, 0x80, out);
}

/// Literal without indexing, name from static table index (RFC 7541 §6.2.2).
fn encode_literal_with_name_index(
    name_index: usize,
    value: &[u8],
    out: &mut impl BufMut,
) -> io::Result<()> {
    encode_integer(name_index as u64, 4, 0x00, out);
    encode_string_huffman(value, out);
    Ok(())
}

/// Literal without indexing, new name (RFC 7541 §6.2.2).
fn encode_literal_new_name(name: &[u8], value: &[u8], out: &mut impl BufMut) -> io::Result<()> {
    out.put_u8(0x00);
    encode_string_huffman(name, out);
    encode_string_huffman(value, out);
    Ok(())
}

/// Encode a string with Huffman if it saves space, plain otherwise.
fn encode_string_huffman(s: &[u8], out: &mut impl BufMut) {
    let huff_len = huffman::encoded_length(s);
    if huff_len < s.len() {
        let encoded = huffman::encode(s);
        encode_integer(encoded.len() as u64, 7, 0x80, out);
        out.put_slice(&encoded);
    } else {
        encode_integer(s.len() as u64, 7, 0x00, out);
        out.put_slice(s);
    }
}

fn encode_integer(mut value: u64, nbits: u8, prefix: u8, out: &mut impl BufMut) {
    let max_prefix = (1u64 << nbits) - 1;
    if value < max_prefix {
        out.put_u8(prefix | value as u8);
        return;
    }
    out.put_u8(prefix | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        out.put_u8(0x80 | (value % 128) as u8);
        value /= 128;
    }
    out.put_u8(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn status_200_is_single_indexed_byte() {
        let mut buf = BytesMut::new();
        encode_headers(&[(":status", "200")], &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x88]);
    }

    #[test]
    fn known_name_uses_name_index() {
        let mut buf = BytesMut::new();
        encode_headers(&[("content-length", "42")], &mut buf).unwrap();
        // 4-bit name index for content-length (28), then value.
        assert_eq!(buf[0] & 0xf0, 0x00);
        assert_eq!(buf[0] & 0x0f, 0x0f); // 28 > 15, prefix saturates
    }

    #[test]
    fn new_name_literal() {
        let mut buf = BytesMut::new();
        encode_headers(&[("x-request-id", "abc123")], &mut buf).unwrap();
        assert_eq!(buf[0], 0x00);
    }

    #[test]
    fn integer_continuation_bytes() {
        let mut buf = BytesMut::new();
        encode_integer(1337, 5, 0x00, &mut buf);
        // RFC 7541 C.1.2: 1337 with 5-bit prefix = 1f 9a 0a
        assert_eq!(&buf[..], &[0x1f, 0x9a, 0x0a]);
    }
}
