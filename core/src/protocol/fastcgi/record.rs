/*
 * record.rs
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

//! FastCGI record framing: the fixed 8-byte header
//! `version | type | requestId-BE16 | contentLength-BE16 | padding | reserved`
//! plus content and padding to an 8-byte boundary on the write side.

use std::io::{self, Write};

use crate::protocol::http::error::HttpError;
use crate::unreader::{Source, Unreader};

use super::{FCGI_HEADER_LEN, FCGI_MAX_CONTENT_LEN, FCGI_VERSION_1};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub fn parse(raw: &[u8]) -> Result<RecordHeader, HttpError> {
        if raw.len() < FCGI_HEADER_LEN {
            return Err(HttpError::InvalidGateway("incomplete record header".into()));
        }
        if raw[0] != FCGI_VERSION_1 {
            return Err(HttpError::InvalidGateway(format!(
                "unsupported FastCGI version {}",
                raw[0]
            )));
        }
        Ok(RecordHeader {
            record_type: raw[1],
            request_id: u16::from_be_bytes([raw[2], raw[3]]),
            content_length: u16::from_be_bytes([raw[4], raw[5]]),
            padding_length: raw[6],
        })
    }
}

/// Read one record header from the unreader. `Ok(None)` at clean EOF.
pub fn read_header<S: Source>(
    unreader: &mut Unreader<S>,
) -> Result<Option<RecordHeader>, HttpError> {
    let raw = unreader.read_exact_or_eof(FCGI_HEADER_LEN)?;
    if raw.is_empty() {
        return Ok(None);
    }
    RecordHeader::parse(&raw).map(Some)
}

/// Read a record's content, discarding its padding.
pub fn read_content<S: Source>(
    unreader: &mut Unreader<S>,
    header: &RecordHeader,
) -> Result<bytes::Bytes, HttpError> {
    let content = unreader.read_exact_or_eof(header.content_length as usize)?;
    if content.len() < header.content_length as usize {
        return Err(HttpError::InvalidGateway("incomplete record content".into()));
    }
    if header.padding_length > 0 {
        let pad = unreader.read_exact_or_eof(header.padding_length as usize)?;
        if pad.len() < header.padding_length as usize {
            return Err(HttpError::InvalidGateway("incomplete record padding".into()));
        }
    }
    Ok(content)
}

/// Write one record, padding the content to an 8-byte boundary.
pub fn write_record(
    out: &mut dyn Write,
    record_type: u8,
    request_id: u16,
    content: &[u8],
) -> io::Result<()> {
    debug_assert!(content.len() <= FCGI_MAX_CONTENT_LEN);
    let padding = (8 - content.len() % 8) % 8;
    let header = [
        FCGI_VERSION_1,
        record_type,
        (request_id >> 8) as u8,
        request_id as u8,
        (content.len() >> 8) as u8,
        content.len() as u8,
        padding as u8,
        0,
    ];
    out.write_all(&header)?;
    out.write_all(content)?;
    if padding > 0 {
        out.write_all(&[0u8; 8][..padding])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unreader::BufSource;

    #[test]
    fn header_roundtrip() {
        let mut out = Vec::new();
        write_record(&mut out, super::super::FCGI_STDOUT, 9, b"hello").unwrap();
        // 8-byte header, 5 content, 3 padding.
        assert_eq!(out.len(), 16);
        let header = RecordHeader::parse(&out).unwrap();
        assert_eq!(header.record_type, super::super::FCGI_STDOUT);
        assert_eq!(header.request_id, 9);
        assert_eq!(header.content_length, 5);
        assert_eq!(header.padding_length, 3);
    }

    #[test]
    fn aligned_content_needs_no_padding() {
        let mut out = Vec::new();
        write_record(&mut out, super::super::FCGI_STDOUT, 1, b"12345678").unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(RecordHeader::parse(&out).unwrap().padding_length, 0);
    }

    #[test]
    fn bad_version_rejected() {
        let raw = [2u8, 1, 0, 1, 0, 0, 0, 0];
        assert!(RecordHeader::parse(&raw).is_err());
    }

    #[test]
    fn read_skips_padding() {
        let mut raw = Vec::new();
        write_record(&mut raw, super::super::FCGI_PARAMS, 3, b"abc").unwrap();
        write_record(&mut raw, super::super::FCGI_PARAMS, 3, b"").unwrap();
        let mut u = Unreader::new(BufSource::of(raw));
        let h1 = read_header(&mut u).unwrap().unwrap();
        assert_eq!(&read_content(&mut u, &h1).unwrap()[..], b"abc");
        let h2 = read_header(&mut u).unwrap().unwrap();
        assert_eq!(h2.content_length, 0);
        assert!(read_header(&mut u).unwrap().is_none());
    }
}
