/*
 * decoder.rs
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

//! HPACK decoder (RFC 7541) for client request header blocks. Supports
//! indexed fields, literals with/without indexing, Huffman strings, and
//! dynamic-table size updates. The decoded header list is bounded by the
//! advertised SETTINGS_MAX_HEADER_LIST_SIZE.

use bytes::Buf;
use std::collections::VecDeque;
use std::fmt;
use std::io;

use super::huffman;
use super::static_table::{STATIC_TABLE, STATIC_TABLE_SIZE};

/// Decoded header (name, value).
#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Callback for each decoded header.
pub trait HeaderHandler {
    fn header(&mut self, name: &str, value: &str);
}

/// Decode failure. The connection maps `ListTooLarge` to a refused stream
/// and everything else to COMPRESSION_ERROR.
#[derive(Debug)]
pub enum DecodeError {
    /// Decoded list exceeded SETTINGS_MAX_HEADER_LIST_SIZE.
    ListTooLarge,
    Invalid(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::ListTooLarge => write!(f, "header list too large"),
            DecodeError::Invalid(m) => write!(f, "invalid HPACK block: {}", m),
        }
    }
}

impl std::error::Error for DecodeError {}

fn invalid(msg: impl Into<String>) -> DecodeError {
    DecodeError::Invalid(msg.into())
}

/// HPACK decoder with static and dynamic tables. One per connection; the
/// dynamic table carries across header blocks.
pub struct Decoder {
    /// Ceiling from SETTINGS_HEADER_TABLE_SIZE.
    header_table_size: usize,
    /// Ceiling on the uncompressed size of one decoded header list,
    /// counted as name + value + 32 per entry (RFC 7540 §6.5.2).
    max_header_list_size: usize,
    dynamic_table: VecDeque<Header>,
    max_size: usize,
}

impl Decoder {
    pub fn new(header_table_size: usize, max_header_list_size: usize) -> Self {
        Self {
            header_table_size,
            max_header_list_size,
            dynamic_table: VecDeque::new(),
            max_size: header_table_size,
        }
    }

    pub fn set_header_table_size(&mut self, size: usize) {
        self.header_table_size = size;
    }

    /// Decode one complete header block, invoking the handler per header.
    pub fn decode<B: Buf, H: HeaderHandler>(
        &mut self,
        buf: &mut B,
        handler: &mut H,
    ) -> Result<(), DecodeError> {
        let mut list_size = 0usize;
        while buf.has_remaining() {
            let b = buf.get_u8();
            if (b & 0x80) != 0 {
                // Indexed header field (7-bit index)
                let index = decode_integer(buf, b, 7)?;
                if index == 0 {
                    return Err(invalid("indexed header index 0"));
                }
                let (name, value) = get_indexed(&self.dynamic_table, index)?;
                emit(&mut list_size, self.max_header_list_size, name, value, handler)?;
            } else if (b & 0x40) != 0 {
                // Literal with incremental indexing (6-bit index)
                let (name, value) = self.get_literal(buf, b, 6)?;
                self.add_to_dynamic(name.clone(), value.clone());
                emit(&mut list_size, self.max_header_list_size, name, value, handler)?;
            } else if (b & 0x20) != 0 {
                // Dynamic table size update (5-bit)
                let max_size = decode_integer(buf, b, 5)? as usize;
                if max_size > self.header_table_size {
                    return Err(invalid("dynamic table size exceeds SETTINGS"));
                }
                self.evict_to(max_size);
                self.max_size = max_size;
            } else {
                // Literal without indexing (4-bit) or never indexed
                let (name, value) = self.get_literal(buf, b, 4)?;
                emit(&mut list_size, self.max_header_list_size, name, value, handler)?;
            }
        }
        Ok(())
    }

    fn get_literal<B: Buf>(
        &self,
        buf: &mut B,
        opcode: u8,
        nbits: u8,
    ) -> Result<(String, String), DecodeError> {
        let index = decode_integer(buf, opcode, nbits)?;
        let name = if index == 0 {
            decode_string(buf)?
        } else {
            let (n, _) = get_indexed(&self.dynamic_table, index)?;
            n
        };
        let value = decode_string(buf)?;
        Ok((name, value))
    }

    fn add_to_dynamic(&mut self, name: String, value: String) {
        let entry_size = name.len() + value.len() + 32;
        while self.dynamic_size() + entry_size > self.max_size && !self.dynamic_table.is_empty() {
            self.dynamic_table.pop_back();
        }
        if self.dynamic_size() + entry_size <= self.max_size {
            self.dynamic_table.push_front(Header { name, value });
        }
    }

    fn dynamic_size(&self) -> usize {
        self.dynamic_table
            .iter()
            .map(|h| h.name.len() + h.value.len() + 32)
            .sum()
    }

    fn evict_to(&mut self, max: usize) {
        while self.dynamic_size() > max && !self.dynamic_table.is_empty() {
            self.dynamic_table.pop_back();
        }
    }
}

fn emit<H: HeaderHandler>(
    list_size: &mut usize,
    max: usize,
    name: String,
    value: String,
    handler: &mut H,
) -> Result<(), DecodeError> {
    *list_size += name.len() + value.len() + 32;
    if *list_size > max {
        return Err(DecodeError::ListTooLarge);
    }
    handler.header(&name, &value);
    Ok(())
}

fn get_indexed(
    dynamic_table: &VecDeque<Header>,
    index: u64,
) -> Result<(String, String), DecodeError> {
    if index < STATIC_TABLE_SIZE as u64 {
        let (name, value) = STATIC_TABLE[index as usize];
        Ok((name.to_string(), value.unwrap_or("").to_string()))
    } else {
        let idx = (index - STATIC_TABLE_SIZE as u64) as usize;
        match dynamic_table.get(idx) {
            Some(h) => Ok((h.name.clone(), h.value.clone())),
            None => Err(invalid("index out of range")),
        }
    }
}

fn decode_integer<B: Buf>(buf: &mut B, opcode: u8, nbits: u8) -> Result<u64, DecodeError> {
    let nmask = (1u64 << nbits) - 1;
    let mut value = (opcode & (nmask as u8)) as u64;
    if value < nmask {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(invalid("truncated integer"));
        }
        let b = buf.get_u8();
        value += ((b & 0x7f) as u64) << shift;
        if (b & 0x80) == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(invalid("integer too large"));
        }
    }
    Ok(value)
}

fn decode_string<B: Buf>(buf: &mut B) -> Result<String, DecodeError> {
    if !buf.has_remaining() {
        return Err(invalid("truncated string length"));
    }
    let b = buf.get_u8();
    let is_huffman = (b & 0x80) != 0;
    let len = decode_integer(buf, b, 7)? as usize;
    if buf.remaining() < len {
        return Err(invalid("truncated string"));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    if is_huffman {
        let decoded = huffman::decode(&bytes).map_err(|e: io::Error| invalid(e.to_string()))?;
        return String::from_utf8(decoded).map_err(|_| invalid("huffman string not UTF-8"));
    }
    String::from_utf8(bytes).map_err(|_| invalid("string not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectHeaders(Vec<(String, String)>);
    impl HeaderHandler for CollectHeaders {
        fn header(&mut self, name: &str, value: &str) {
            self.0.push((name.to_string(), value.to_string()));
        }
    }

    fn decoder() -> Decoder {
        Decoder::new(4096, 65536)
    }

    #[test]
    fn decode_indexed_static() {
        // 0x82 = indexed, index 2 = :method GET
        let data: &[u8] = &[0x82];
        let mut collector = CollectHeaders(Vec::new());
        decoder().decode(&mut &data[..], &mut collector).unwrap();
        assert_eq!(collector.0.len(), 1);
        assert_eq!(collector.0[0], (":method".into(), "GET".into()));
    }

    #[test]
    fn decode_request_pseudo_headers() {
        // 0x82 = :method GET, 0x86 = :scheme http, 0x84 = :path /
        let data: &[u8] = &[0x82, 0x86, 0x84];
        let mut collector = CollectHeaders(Vec::new());
        decoder().decode(&mut &data[..], &mut collector).unwrap();
        assert_eq!(collector.0.len(), 3);
        assert_eq!(collector.0[0].1, "GET");
        assert_eq!(collector.0[1].1, "http");
        assert_eq!(collector.0[2].1, "/");
    }

    #[test]
    fn decode_literal_without_indexing_plain() {
        let data: &[u8] = &[
            0x00, // literal, new name
            0x03, b'f', b'o', b'o', // name (not Huffman, len 3)
            0x03, b'b', b'a', b'r', // value (not Huffman, len 3)
        ];
        let mut collector = CollectHeaders(Vec::new());
        decoder().decode(&mut &data[..], &mut collector).unwrap();
        assert_eq!(collector.0[0], ("foo".into(), "bar".into()));
    }

    #[test]
    fn decode_literal_with_indexing_populates_dynamic_table() {
        let data: &[u8] = &[
            0x40, // literal with indexing, new name
            0x04, b't', b'e', b's', b't', // name
            0x05, b'v', b'a', b'l', b'u', b'e', // value
        ];
        let mut dec = decoder();
        let mut collector = CollectHeaders(Vec::new());
        dec.decode(&mut &data[..], &mut collector).unwrap();
        assert_eq!(collector.0[0], ("test".into(), "value".into()));

        // Dynamic index right after the static table resolves to it.
        let data: &[u8] = &[0xbe]; // indexed, 62 = first dynamic entry
        let mut collector = CollectHeaders(Vec::new());
        dec.decode(&mut &data[..], &mut collector).unwrap();
        assert_eq!(collector.0[0], ("test".into(), "value".into()));
    }

    #[test]
    fn decode_huffman_string_literal() {
        // name "x" plain; value "abc" Huffman-encoded ([0x1c, 0x64]).
        let data: &[u8] = &[0x00, 0x01, b'x', 0x82, 0x1c, 0x64];
        let mut collector = CollectHeaders(Vec::new());
        decoder().decode(&mut &data[..], &mut collector).unwrap();
        assert_eq!(collector.0[0], ("x".into(), "abc".into()));
    }

    #[test]
    fn decode_dynamic_table_size_update() {
        // 0x20 = size update to 0, then indexed :method GET.
        let data: &[u8] = &[0x20, 0x82];
        let mut collector = CollectHeaders(Vec::new());
        decoder().decode(&mut &data[..], &mut collector).unwrap();
        assert_eq!(collector.0.len(), 1);
    }

    #[test]
    fn size_update_above_settings_rejected() {
        // 5-bit prefix 31 + continuation for a value far above 4096.
        let data: &[u8] = &[0x3f, 0xe1, 0x7f];
        let mut collector = CollectHeaders(Vec::new());
        assert!(matches!(
            decoder().decode(&mut &data[..], &mut collector),
            Err(DecodeError::Invalid(_))
        ));
    }

    #[test]
    fn decode_index_zero_errors() {
        let data: &[u8] = &[0x80];
        let mut collector = CollectHeaders(Vec::new());
        assert!(decoder().decode(&mut &data[..], &mut collector).is_err());
    }

    #[test]
    fn header_list_size_enforced() {
        // name(8) + value(10) + 32 = 50 > 48 ceiling.
        let mut dec = Decoder::new(4096, 48);
        let data: &[u8] = &[
            0x00, 0x08, b'x', b'-', b'l', b'o', b'n', b'g', b'e', b'r',
            0x0a, b'v', b'v', b'v', b'v', b'v', b'v', b'v', b'v', b'v', b'v',
        ];
        let mut collector = CollectHeaders(Vec::new());
        assert!(matches!(
            dec.decode(&mut &data[..], &mut collector),
            Err(DecodeError::ListTooLarge)
        ));
    }

    #[test]
    fn encoder_decoder_roundtrip() {
        use super::super::encode_headers;

        let input = &[
            (":status", "200"),
            ("content-type", "text/html"),
            ("server", "forchetta/0.1"),
            ("x-custom", "value with spaces"),
        ];
        let mut buf = bytes::BytesMut::new();
        encode_headers(input, &mut buf).unwrap();

        let mut collector = CollectHeaders(Vec::new());
        let mut cursor = &buf[..];
        decoder().decode(&mut cursor, &mut collector).unwrap();

        assert_eq!(collector.0.len(), input.len());
        for (i, &(name, value)) in input.iter().enumerate() {
            assert_eq!(collector.0[i].0, name);
            assert_eq!(collector.0[i].1, value);
        }
    }
}
