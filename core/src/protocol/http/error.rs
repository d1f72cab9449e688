/*
 * error.rs
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

//! Typed HTTP parse errors. Each violation carries an HTTP status hint the
//! engine uses for the error response; parsers never retry.

use std::fmt;
use std::io;

/// Request parsing and framing errors.
#[derive(Debug)]
pub enum HttpError {
    /// Request line failed to lex.
    InvalidRequestLine(String),
    /// Method is not a token (or violates the conventional-method policy).
    InvalidRequestMethod(String),
    /// Version does not match `HTTP/d.d` or is outside the accepted range.
    InvalidHttpVersion(String),
    /// Empty or unparseable URI.
    InvalidUri(String),
    /// Malformed header field.
    InvalidHeader(String),
    /// Header name is not a token (or carries `_` under the refuse policy).
    InvalidHeaderName(String),
    /// Obsolete line folding without `permit_obsolete_folding`.
    ObsoleteFolding,
    /// Request line exceeded `limit_request_line`.
    LimitRequestLine { size: usize, limit: usize },
    /// More than `limit_request_fields` header fields.
    LimitRequestFields { limit: usize },
    /// A single field exceeded `limit_request_field_size`.
    LimitRequestFieldSize { size: usize, limit: usize },
    /// `Transfer-Encoding` names an unknown coding.
    UnsupportedTransferCoding(String),
    /// `Transfer-Encoding: chunked` together with `Content-Length`, or
    /// chunked on HTTP/1.0.
    InvalidBodyFraming,
    /// `Content-Length` is not a non-negative integer.
    InvalidContentLength(String),
    /// Chunk size is not strict hex.
    InvalidChunkSize(String),
    /// Chunk payload not terminated by CRLF.
    ChunkMissingTerminator,
    /// Malformed proxy-protocol v1 line.
    InvalidProxyLine(String),
    /// Proxy protocol, gateway request or forwarded-scheme header from a
    /// peer outside the allow-list.
    ForbiddenPeer(String),
    /// Conflicting values across configured secure-scheme headers.
    InvalidSchemeHeaders,
    /// Malformed uWSGI packet or FastCGI record.
    InvalidGateway(String),
    /// Gateway feature we do not speak (uWSGI modifier, FastCGI role).
    UnsupportedGateway(String),
    /// The peer closed before a full request was read.
    NoMoreData,
    /// Transport failure under the parser.
    Io(io::Error),
}

impl HttpError {
    /// The status the engine should answer with. 0 means no response can be
    /// written (transport-level failure).
    pub fn status_hint(&self) -> u16 {
        match self {
            HttpError::LimitRequestLine { .. }
            | HttpError::LimitRequestFields { .. }
            | HttpError::LimitRequestFieldSize { .. } => 431,
            HttpError::UnsupportedTransferCoding(_) | HttpError::UnsupportedGateway(_) => 501,
            HttpError::InvalidHttpVersion(_) => 505,
            HttpError::ForbiddenPeer(_) => 403,
            HttpError::NoMoreData | HttpError::Io(_) => 0,
            _ => 400,
        }
    }

    /// True when the failure is transport-level and no error response should
    /// be attempted.
    pub fn is_transport(&self) -> bool {
        self.status_hint() == 0
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::InvalidRequestLine(l) => write!(f, "invalid request line: {:?}", l),
            HttpError::InvalidRequestMethod(m) => write!(f, "invalid method: {:?}", m),
            HttpError::InvalidHttpVersion(v) => write!(f, "invalid HTTP version: {:?}", v),
            HttpError::InvalidUri(u) => write!(f, "invalid URI: {:?}", u),
            HttpError::InvalidHeader(h) => write!(f, "invalid header: {:?}", h),
            HttpError::InvalidHeaderName(n) => write!(f, "invalid header name: {:?}", n),
            HttpError::ObsoleteFolding => write!(f, "obsolete header line folding"),
            HttpError::LimitRequestLine { size, limit } => {
                write!(f, "request line too large: {} > {}", size, limit)
            }
            HttpError::LimitRequestFields { limit } => {
                write!(f, "too many header fields (limit {})", limit)
            }
            HttpError::LimitRequestFieldSize { size, limit } => {
                write!(f, "header field too large: {} > {}", size, limit)
            }
            HttpError::UnsupportedTransferCoding(c) => {
                write!(f, "unsupported transfer coding: {:?}", c)
            }
            HttpError::InvalidBodyFraming => write!(f, "invalid body framing"),
            HttpError::InvalidContentLength(v) => write!(f, "invalid Content-Length: {:?}", v),
            HttpError::InvalidChunkSize(v) => write!(f, "invalid chunk size: {:?}", v),
            HttpError::ChunkMissingTerminator => write!(f, "chunk missing CRLF terminator"),
            HttpError::InvalidProxyLine(l) => write!(f, "invalid PROXY line: {:?}", l),
            HttpError::ForbiddenPeer(p) => write!(f, "request forbidden from peer {}", p),
            HttpError::InvalidSchemeHeaders => write!(f, "conflicting secure scheme headers"),
            HttpError::InvalidGateway(m) => write!(f, "invalid gateway record: {}", m),
            HttpError::UnsupportedGateway(m) => write!(f, "unsupported gateway feature: {}", m),
            HttpError::NoMoreData => write!(f, "no more data"),
            HttpError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for HttpError {}

impl From<io::Error> for HttpError {
    fn from(e: io::Error) -> Self {
        HttpError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_hints() {
        assert_eq!(HttpError::InvalidHeader("x".into()).status_hint(), 400);
        assert_eq!(
            HttpError::LimitRequestFieldSize { size: 9000, limit: 8190 }.status_hint(),
            431
        );
        assert_eq!(
            HttpError::UnsupportedTransferCoding("br".into()).status_hint(),
            501
        );
        assert_eq!(HttpError::InvalidHttpVersion("HTTP/3.0".into()).status_hint(), 505);
        assert_eq!(HttpError::ForbiddenPeer("10.0.0.1".into()).status_hint(), 403);
        assert!(HttpError::NoMoreData.is_transport());
    }
}
