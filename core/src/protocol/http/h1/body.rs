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

//! Request body readers: length-delimited, chunked (with trailers), and
//! EOF-delimited, under a buffered `Body` facade giving the application
//! `read`/`readline` over a chunk-grained source. The engine drains any
//! unread remainder before a keepalive connection is reused.

use std::io;

use bytes::{Bytes, BytesMut};

use crate::config::Config;
use crate::unreader::{Source, Unreader};

use super::super::error::HttpError;
use super::super::request::BodyKind;
use super::super::HeaderList;
use super::parser::parse_header_block;

fn invalid(e: HttpError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Read one CRLF-terminated line from the unreader, returning it without the
/// CRLF. Bytes past the line are pushed back.
fn read_line<S: Source>(u: &mut Unreader<S>, limit: usize) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    loop {
        if let Some(idx) = memchr::memmem::find(&buf, b"\r\n") {
            let line = buf.split_to(idx).freeze();
            let _ = buf.split_to(2);
            u.unread(&buf);
            return Ok(line);
        }
        if buf.len() > limit {
            return Err(invalid(HttpError::InvalidChunkSize("line too long".into())));
        }
        let chunk = u.read()?;
        if chunk.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof in body"));
        }
        buf.extend_from_slice(&chunk);
    }
}

/// Reads at most the declared content length; EOF before that is an error.
pub struct LengthReader {
    remaining: u64,
}

impl LengthReader {
    pub fn new(length: u64) -> Self {
        LengthReader { remaining: length }
    }

    fn read<S: Source>(&mut self, u: &mut Unreader<S>, size: usize) -> io::Result<Bytes> {
        let want = (self.remaining.min(size as u64)) as usize;
        if want == 0 {
            return Ok(Bytes::new());
        }
        let data = u.read_exact_or_eof(want)?;
        if data.len() < want {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed before declared content length",
            ));
        }
        self.remaining -= data.len() as u64;
        Ok(data)
    }

    fn done(&self) -> bool {
        self.remaining == 0
    }
}

/// Unfolds chunk frames on demand; exposes trailers after exhaustion.
pub struct ChunkedReader {
    /// Bytes left in the current chunk; 0 means a size line is next.
    chunk_remaining: u64,
    /// Set once the terminating chunk and trailers have been consumed.
    finished: bool,
    started: bool,
    trailers: HeaderList,
}

impl ChunkedReader {
    pub fn new() -> Self {
        ChunkedReader {
            chunk_remaining: 0,
            finished: false,
            started: false,
            trailers: Vec::new(),
        }
    }

    fn read<S: Source>(
        &mut self,
        u: &mut Unreader<S>,
        cfg: &Config,
        size: usize,
    ) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        while out.len() < size && !self.finished {
            if self.chunk_remaining == 0 {
                // Consume the CRLF terminating the previous chunk payload.
                if self.started {
                    let crlf = u.read_exact_or_eof(2)?;
                    if &crlf[..] != b"\r\n" {
                        return Err(invalid(HttpError::ChunkMissingTerminator));
                    }
                }
                let size_line = read_line(u, cfg.limit_request_line)?;
                let n = parse_chunk_size(&size_line).map_err(invalid)?;
                self.started = true;
                if n == 0 {
                    self.read_trailers(u, cfg)?;
                    self.finished = true;
                    break;
                }
                self.chunk_remaining = n;
            }
            let want = (size - out.len()).min(self.chunk_remaining as usize);
            let data = u.read_exact_or_eof(want)?;
            if data.len() < want {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof inside chunk",
                ));
            }
            self.chunk_remaining -= data.len() as u64;
            out.extend_from_slice(&data);
        }
        Ok(out.freeze())
    }

    /// Terminating chunk: `0 CRLF trailer-headers CRLF CRLF` (the bare form
    /// `0 CRLF CRLF` has no trailers). Trailers go through the header lexer.
    fn read_trailers<S: Source>(&mut self, u: &mut Unreader<S>, cfg: &Config) -> io::Result<()> {
        let mut buf = BytesMut::new();
        loop {
            if buf.len() >= 2 && &buf[..2] == b"\r\n" {
                let _ = buf.split_to(2);
                u.unread(&buf);
                return Ok(());
            }
            if let Some(idx) = memchr::memmem::find(&buf, b"\r\n\r\n") {
                let block = buf.split_to(idx);
                let _ = buf.split_to(4);
                u.unread(&buf);
                self.trailers = parse_header_block(&block, cfg).map_err(invalid)?;
                return Ok(());
            }
            let cap = cfg
                .limit_request_fields
                .saturating_mul(cfg.limit_request_field_size.saturating_add(4));
            if buf.len() > cap {
                return Err(invalid(HttpError::LimitRequestFields {
                    limit: cfg.limit_request_fields,
                }));
            }
            let chunk = u.read()?;
            if chunk.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof in trailers",
                ));
            }
            buf.extend_from_slice(&chunk);
        }
    }

    fn done(&self) -> bool {
        self.finished
    }
}

impl Default for ChunkedReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Strict hex chunk size; extensions after `;` are discarded.
pub(crate) fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HttpError::InvalidChunkSize(String::from_utf8_lossy(line).into_owned()))?;
    let hex = text.split(';').next().unwrap_or("").trim();
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HttpError::InvalidChunkSize(hex.to_string()));
    }
    u64::from_str_radix(hex, 16).map_err(|_| HttpError::InvalidChunkSize(hex.to_string()))
}

/// Reads until the source closes. Responses only, never requests.
pub struct EofReader {
    finished: bool,
}

impl EofReader {
    pub fn new() -> Self {
        EofReader { finished: false }
    }

    fn read<S: Source>(&mut self, u: &mut Unreader<S>, size: usize) -> io::Result<Bytes> {
        if self.finished {
            return Ok(Bytes::new());
        }
        let data = u.read_exact_or_eof(size)?;
        if data.len() < size {
            self.finished = true;
        }
        Ok(data)
    }
}

impl Default for EofReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Framing strategy under a [`Body`].
pub enum BodyReader {
    Length(LengthReader),
    Chunked(ChunkedReader),
    Eof(EofReader),
}

impl BodyReader {
    pub fn for_kind(kind: BodyKind) -> BodyReader {
        match kind {
            BodyKind::None => BodyReader::Length(LengthReader::new(0)),
            BodyKind::Length(n) => BodyReader::Length(LengthReader::new(n)),
            BodyKind::Chunked => BodyReader::Chunked(ChunkedReader::new()),
        }
    }
}

/// Buffered body facade: overlays a small memory buffer so `readline` is
/// efficient over a chunk-grained reader. Borrows the connection's unreader
/// for the lifetime of the request.
pub struct Body<'a, S: Source> {
    reader: BodyReader,
    unreader: &'a mut Unreader<S>,
    cfg: &'a Config,
    buf: BytesMut,
}

const READ_GRAIN: usize = 1024;

impl<'a, S: Source> Body<'a, S> {
    pub fn new(kind: BodyKind, unreader: &'a mut Unreader<S>, cfg: &'a Config) -> Self {
        Body {
            reader: BodyReader::for_kind(kind),
            unreader,
            cfg,
            buf: BytesMut::new(),
        }
    }

    /// A reader consuming until EOF; response bodies only.
    pub fn until_eof(unreader: &'a mut Unreader<S>, cfg: &'a Config) -> Self {
        Body {
            reader: BodyReader::Eof(EofReader::new()),
            unreader,
            cfg,
            buf: BytesMut::new(),
        }
    }

    fn pull(&mut self, size: usize) -> io::Result<Bytes> {
        match &mut self.reader {
            BodyReader::Length(r) => r.read(self.unreader, size),
            BodyReader::Chunked(r) => r.read(self.unreader, self.cfg, size),
            BodyReader::Eof(r) => r.read(self.unreader, size),
        }
    }

    /// Read up to `size` bytes (`None` = to exhaustion). An empty return
    /// means the body is consumed.
    pub fn read(&mut self, size: Option<usize>) -> io::Result<Bytes> {
        let size = size.unwrap_or(usize::MAX);
        if size == 0 {
            return Ok(Bytes::new());
        }
        while self.buf.len() < size {
            let grain = READ_GRAIN.max(size.saturating_sub(self.buf.len()).min(8192));
            let data = self.pull(grain)?;
            if data.is_empty() {
                break;
            }
            self.buf.extend_from_slice(&data);
        }
        let take = self.buf.len().min(size);
        Ok(self.buf.split_to(take).freeze())
    }

    /// Read one line including its `\n`, bounded by `size`.
    pub fn readline(&mut self, size: Option<usize>) -> io::Result<Bytes> {
        let size = size.unwrap_or(usize::MAX);
        if size == 0 {
            return Ok(Bytes::new());
        }
        loop {
            if let Some(idx) = memchr::memchr(b'\n', &self.buf) {
                let take = (idx + 1).min(size);
                return Ok(self.buf.split_to(take).freeze());
            }
            if self.buf.len() >= size {
                return Ok(self.buf.split_to(size).freeze());
            }
            let data = self.pull(READ_GRAIN)?;
            if data.is_empty() {
                let take = self.buf.len().min(size);
                return Ok(self.buf.split_to(take).freeze());
            }
            self.buf.extend_from_slice(&data);
        }
    }

    /// True once the underlying reader has nothing further to deliver.
    pub fn exhausted(&self) -> bool {
        if !self.buf.is_empty() {
            return false;
        }
        match &self.reader {
            BodyReader::Length(r) => r.done(),
            BodyReader::Chunked(r) => r.done(),
            BodyReader::Eof(r) => r.finished,
        }
    }

    /// Read and discard the unconsumed remainder so the transport can be
    /// reused. A no-op on a consumed body; safe to call twice. A TLS-layer
    /// "would block" (no application data buffered) ends the drain.
    pub fn drain(&mut self) -> io::Result<()> {
        self.buf.clear();
        loop {
            if self.exhausted() {
                return Ok(());
            }
            match self.pull(8192) {
                Ok(data) if data.is_empty() => return Ok(()),
                Ok(_) => {
                    self.buf.clear();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Trailers parsed after a chunked body is exhausted.
    pub fn trailers(&self) -> &HeaderList {
        match &self.reader {
            BodyReader::Chunked(r) => &r.trailers,
            _ => {
                const EMPTY: &HeaderList = &Vec::new();
                EMPTY
            }
        }
    }

    /// Iterate line-by-line until exhaustion.
    pub fn lines(&mut self) -> Lines<'_, 'a, S> {
        Lines { body: self }
    }
}

/// Line iterator over a [`Body`].
pub struct Lines<'b, 'a, S: Source> {
    body: &'b mut Body<'a, S>,
}

impl<S: Source> Iterator for Lines<'_, '_, S> {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.body.readline(None) {
            Ok(line) if line.is_empty() => None,
            Ok(line) => Some(Ok(line)),
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unreader::BufSource;

    fn unreader(data: &[u8]) -> Unreader<BufSource> {
        Unreader::new(BufSource::of(data.to_vec()))
    }

    #[test]
    fn length_reader_exact() {
        let cfg = Config::default();
        let mut u = unreader(b"hello world tail");
        let mut body = Body::new(BodyKind::Length(11), &mut u, &cfg);
        assert_eq!(&body.read(Some(5)).unwrap()[..], b"hello");
        assert_eq!(&body.read(None).unwrap()[..], b" world");
        assert!(body.read(None).unwrap().is_empty());
        assert!(body.exhausted());
        // The tail stays in the unreader for the next request.
        assert_eq!(&u.read().unwrap()[..], b" tail");
    }

    #[test]
    fn length_reader_eof_short_is_error() {
        let cfg = Config::default();
        let mut u = unreader(b"abc");
        let mut body = Body::new(BodyKind::Length(10), &mut u, &cfg);
        let err = body.read(None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn chunked_with_trailer() {
        let cfg = Config::default();
        let mut u = unreader(b"5\r\nhello\r\n6\r\n world\r\n0\r\nX-Check: 1\r\n\r\n");
        let mut body = Body::new(BodyKind::Chunked, &mut u, &cfg);
        assert_eq!(&body.read(None).unwrap()[..], b"hello world");
        assert!(body.exhausted());
        assert_eq!(
            body.trailers(),
            &vec![("X-CHECK".to_string(), "1".to_string())]
        );
    }

    #[test]
    fn chunked_no_trailer() {
        let cfg = Config::default();
        let mut u = unreader(b"3\r\nabc\r\n0\r\n\r\nnext");
        let mut body = Body::new(BodyKind::Chunked, &mut u, &cfg);
        assert_eq!(&body.read(None).unwrap()[..], b"abc");
        assert!(body.trailers().is_empty());
        drop(body);
        assert_eq!(&u.read().unwrap()[..], b"next");
    }

    #[test]
    fn chunk_extension_ignored() {
        let cfg = Config::default();
        let mut u = unreader(b"4;name=val\r\nwxyz\r\n0\r\n\r\n");
        let mut body = Body::new(BodyKind::Chunked, &mut u, &cfg);
        assert_eq!(&body.read(None).unwrap()[..], b"wxyz");
    }

    #[test]
    fn bad_chunk_size() {
        let cfg = Config::default();
        let mut u = unreader(b"zz\r\nbody\r\n0\r\n\r\n");
        let mut body = Body::new(BodyKind::Chunked, &mut u, &cfg);
        let err = body.read(None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn chunk_missing_terminator() {
        let cfg = Config::default();
        let mut u = unreader(b"3\r\nabcXX0\r\n\r\n");
        let mut body = Body::new(BodyKind::Chunked, &mut u, &cfg);
        let err = body.read(None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn readline_respects_newlines() {
        let cfg = Config::default();
        let mut u = unreader(b"line1\nline2\nrest");
        let mut body = Body::new(BodyKind::Length(16), &mut u, &cfg);
        assert_eq!(&body.readline(None).unwrap()[..], b"line1\n");
        assert_eq!(&body.readline(None).unwrap()[..], b"line2\n");
        assert_eq!(&body.readline(None).unwrap()[..], b"rest");
        assert!(body.readline(None).unwrap().is_empty());
    }

    #[test]
    fn lines_iterator() {
        let cfg = Config::default();
        let mut u = unreader(b"a\nb\n");
        let mut body = Body::new(BodyKind::Length(4), &mut u, &cfg);
        let lines: Vec<_> = body.lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec![Bytes::from_static(b"a\n"), Bytes::from_static(b"b\n")]);
    }

    #[test]
    fn drain_is_idempotent() {
        let cfg = Config::default();
        let mut u = unreader(b"hello nextreq");
        let mut body = Body::new(BodyKind::Length(5), &mut u, &cfg);
        body.drain().unwrap();
        body.drain().unwrap();
        assert!(body.exhausted());
        drop(body);
        assert_eq!(&u.read().unwrap()[..], b" nextreq");
    }

    #[test]
    fn drain_would_block_is_end_of_drain() {
        struct Blocky;
        impl Source for Blocky {
            fn chunk(&mut self) -> io::Result<Bytes> {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "no tls data"))
            }
        }
        let cfg = Config::default();
        let mut u = Unreader::new(Blocky);
        let mut body: Body<'_, Blocky> = Body {
            reader: BodyReader::Length(LengthReader::new(100)),
            unreader: &mut u,
            cfg: &cfg,
            buf: BytesMut::new(),
        };
        body.drain().unwrap();
    }

    #[test]
    fn eof_reader_reads_to_close() {
        let cfg = Config::default();
        let mut u = unreader(b"everything until eof");
        let mut body = Body::until_eof(&mut u, &cfg);
        assert_eq!(&body.read(None).unwrap()[..], b"everything until eof");
        assert!(body.exhausted());
    }
}
