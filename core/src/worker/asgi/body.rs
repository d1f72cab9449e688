/*
 * body.rs
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

//! Async request-body framing for the ASGI engine: the same
//! length-delimited and chunked rules as the sync readers, pulled through
//! an [`AsyncUnreader`] and delivered as `http.request` body chunks.

use bytes::{Bytes, BytesMut};
use std::io;

use tokio::io::AsyncRead;

use crate::config::Config;
use crate::protocol::http::error::HttpError;
use crate::protocol::http::h1::body::parse_chunk_size;
use crate::protocol::http::h1::parser::parse_header_block;
use crate::protocol::http::request::BodyKind;
use crate::protocol::http::HeaderList;
use crate::unreader::AsyncUnreader;

/// One step of body progress.
#[derive(Debug)]
pub enum BodyChunk {
    /// More payload; `more` is false on the final chunk.
    Data { data: Bytes, more: bool },
    /// Body complete with trailers (chunked only).
    Trailers(HeaderList),
}

pub struct BodyFramer {
    kind: BodyKind,
    /// Remaining bytes of the current length-delimited body or chunk.
    remaining: u64,
    /// Chunked: a size line is next (after the first chunk, preceded by
    /// the payload-terminating CRLF).
    started: bool,
    pub done: bool,
}

impl BodyFramer {
    pub fn new(kind: BodyKind) -> BodyFramer {
        let (remaining, done) = match kind {
            BodyKind::None => (0, true),
            BodyKind::Length(n) => (n, n == 0),
            BodyKind::Chunked => (0, false),
        };
        BodyFramer {
            kind,
            remaining,
            started: false,
            done,
        }
    }

    /// Pull the next body chunk. Must not be called after `done`.
    pub async fn next<R: AsyncRead + Unpin>(
        &mut self,
        unreader: &mut AsyncUnreader<R>,
        cfg: &Config,
    ) -> io::Result<BodyChunk> {
        match self.kind {
            BodyKind::None => {
                self.done = true;
                Ok(BodyChunk::Data {
                    data: Bytes::new(),
                    more: false,
                })
            }
            BodyKind::Length(_) => self.next_length(unreader).await,
            BodyKind::Chunked => self.next_chunked(unreader, cfg).await,
        }
    }

    async fn next_length<R: AsyncRead + Unpin>(
        &mut self,
        unreader: &mut AsyncUnreader<R>,
    ) -> io::Result<BodyChunk> {
        let want = self.remaining.min(8192) as usize;
        let data = unreader.read_exact_or_eof(want).await?;
        if data.len() < want {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed before declared content length",
            ));
        }
        self.remaining -= data.len() as u64;
        if self.remaining == 0 {
            self.done = true;
        }
        Ok(BodyChunk::Data {
            data,
            more: !self.done,
        })
    }

    async fn next_chunked<R: AsyncRead + Unpin>(
        &mut self,
        unreader: &mut AsyncUnreader<R>,
        cfg: &Config,
    ) -> io::Result<BodyChunk> {
        if self.remaining == 0 {
            if self.started {
                let crlf = unreader.read_exact_or_eof(2).await?;
                if &crlf[..] != b"\r\n" {
                    return Err(invalid(HttpError::ChunkMissingTerminator));
                }
            }
            let line = read_line(unreader, cfg.limit_request_line).await?;
            let size = parse_chunk_size(&line).map_err(invalid)?;
            self.started = true;
            if size == 0 {
                let trailers = read_trailers(unreader, cfg).await?;
                self.done = true;
                return Ok(BodyChunk::Trailers(trailers));
            }
            self.remaining = size;
        }
        let want = self.remaining.min(8192) as usize;
        let data = unreader.read_exact_or_eof(want).await?;
        if data.len() < want {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof inside chunk"));
        }
        self.remaining -= data.len() as u64;
        Ok(BodyChunk::Data { data, more: true })
    }
}

fn invalid(e: HttpError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

async fn read_line<R: AsyncRead + Unpin>(
    unreader: &mut AsyncUnreader<R>,
    limit: usize,
) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    loop {
        if let Some(idx) = memchr::memmem::find(&buf, b"\r\n") {
            let line = buf.split_to(idx).freeze();
            let _ = buf.split_to(2);
            unreader.unread(&buf);
            return Ok(line);
        }
        if buf.len() > limit {
            return Err(invalid(HttpError::InvalidChunkSize("line too long".into())));
        }
        let chunk = unreader.read().await?;
        if chunk.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof in body"));
        }
        buf.extend_from_slice(&chunk);
    }
}

async fn read_trailers<R: AsyncRead + Unpin>(
    unreader: &mut AsyncUnreader<R>,
    cfg: &Config,
) -> io::Result<HeaderList> {
    let mut buf = BytesMut::new();
    loop {
        if buf.len() >= 2 && &buf[..2] == b"\r\n" {
            let _ = buf.split_to(2);
            unreader.unread(&buf);
            return Ok(Vec::new());
        }
        if let Some(idx) = memchr::memmem::find(&buf, b"\r\n\r\n") {
            let block = buf.split_to(idx);
            let _ = buf.split_to(4);
            unreader.unread(&buf);
            return parse_header_block(&block, cfg).map_err(invalid);
        }
        let cap = cfg
            .limit_request_fields
            .saturating_mul(cfg.limit_request_field_size.saturating_add(4));
        if buf.len() > cap {
            return Err(invalid(HttpError::LimitRequestFields {
                limit: cfg.limit_request_fields,
            }));
        }
        let chunk = unreader.read().await?;
        if chunk.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof in trailers"));
        }
        buf.extend_from_slice(&chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn length_body_in_chunks() {
        let data: &[u8] = b"hello worldTAIL";
        let mut u = AsyncUnreader::new(data);
        let cfg = Config::default();
        let mut framer = BodyFramer::new(BodyKind::Length(11));
        let mut collected = Vec::new();
        while !framer.done {
            match framer.next(&mut u, &cfg).await.unwrap() {
                BodyChunk::Data { data, .. } => collected.extend_from_slice(&data),
                BodyChunk::Trailers(_) => unreachable!(),
            }
        }
        assert_eq!(collected, b"hello world");
        assert_eq!(&u.read_exact_or_eof(4).await.unwrap()[..], b"TAIL");
    }

    #[tokio::test]
    async fn chunked_body_with_trailers() {
        let data: &[u8] = b"5\r\nhello\r\n6\r\n world\r\n0\r\nX-Check: 1\r\n\r\nNEXT";
        let mut u = AsyncUnreader::new(data);
        let cfg = Config::default();
        let mut framer = BodyFramer::new(BodyKind::Chunked);
        let mut collected = Vec::new();
        let mut trailers = Vec::new();
        while !framer.done {
            match framer.next(&mut u, &cfg).await.unwrap() {
                BodyChunk::Data { data, .. } => collected.extend_from_slice(&data),
                BodyChunk::Trailers(t) => trailers = t,
            }
        }
        assert_eq!(collected, b"hello world");
        assert_eq!(trailers, vec![("X-CHECK".to_string(), "1".to_string())]);
        assert_eq!(&u.read_exact_or_eof(4).await.unwrap()[..], b"NEXT");
    }

    #[tokio::test]
    async fn empty_body_is_immediately_done() {
        let framer = BodyFramer::new(BodyKind::None);
        assert!(framer.done);
        let framer = BodyFramer::new(BodyKind::Length(0));
        assert!(framer.done);
    }

    #[tokio::test]
    async fn eof_mid_body_errors() {
        let data: &[u8] = b"abc";
        let mut u = AsyncUnreader::new(data);
        let cfg = Config::default();
        let mut framer = BodyFramer::new(BodyKind::Length(10));
        let err = framer.next(&mut u, &cfg).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
