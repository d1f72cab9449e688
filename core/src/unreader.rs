/*
 * unreader.rs
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

//! Byte sources with push-back. Parsers over-read one line or one block and
//! return the remainder to the stream via `unread`; the Unreader is the only
//! boundary between the parsers' pull expectations and the transport's
//! chunked supply.

use std::io::{self, Read};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Chunk size pulled from an underlying socket per read.
pub const CHUNK_SIZE: usize = 8192;

/// Supplies raw chunks to an [`Unreader`]. An empty chunk means EOF.
pub trait Source {
    fn chunk(&mut self) -> io::Result<Bytes>;
}

/// Source over any blocking reader (the connection transport).
pub struct ReadSource<R: Read> {
    inner: R,
    max_chunk: usize,
}

impl<R: Read> ReadSource<R> {
    pub fn new(inner: R) -> Self {
        ReadSource {
            inner,
            max_chunk: CHUNK_SIZE,
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Read> Source for ReadSource<R> {
    fn chunk(&mut self) -> io::Result<Bytes> {
        let mut tmp = [0u8; CHUNK_SIZE];
        let want = self.max_chunk.min(tmp.len());
        let n = self.inner.read(&mut tmp[..want])?;
        Ok(Bytes::copy_from_slice(&tmp[..n]))
    }
}

/// Source over a finite list of byte chunks; used by codec replay and tests.
pub struct BufSource {
    chunks: std::collections::VecDeque<Bytes>,
}

impl BufSource {
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        BufSource {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }

    /// Single-chunk convenience.
    pub fn of(data: impl Into<Bytes>) -> Self {
        Self::new([data.into()])
    }
}

impl Source for BufSource {
    fn chunk(&mut self) -> io::Result<Bytes> {
        Ok(self.chunks.pop_front().unwrap_or_default())
    }
}

/// A byte stream with push-back over any [`Source`].
pub struct Unreader<S: Source> {
    source: S,
    buf: BytesMut,
}

impl<S: Source> Unreader<S> {
    pub fn new(source: S) -> Self {
        Unreader {
            source,
            buf: BytesMut::new(),
        }
    }

    /// The buffered bytes (clearing the buffer), or one chunk pulled from the
    /// source. An empty return means EOF.
    pub fn read(&mut self) -> io::Result<Bytes> {
        if !self.buf.is_empty() {
            return Ok(self.buf.split().freeze());
        }
        self.source.chunk()
    }

    /// Read until `n` bytes are buffered or the source signals EOF; returns
    /// up to `n` bytes (fewer only at EOF).
    pub fn read_exact_or_eof(&mut self, n: usize) -> io::Result<Bytes> {
        while self.buf.len() < n {
            let chunk = self.source.chunk()?;
            if chunk.is_empty() {
                return Ok(self.buf.split().freeze());
            }
            self.buf.extend_from_slice(&chunk);
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Prepend bytes so the next read returns them first.
    pub fn unread(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut merged = BytesMut::with_capacity(data.len() + self.buf.len());
        merged.extend_from_slice(data);
        merged.extend_from_slice(&self.buf);
        self.buf = merged;
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

/// The async rendition of [`Unreader`], over any `AsyncRead`. Same contract,
/// suspension instead of blocking.
pub struct AsyncUnreader<R: AsyncRead + Unpin> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> AsyncUnreader<R> {
    pub fn new(inner: R) -> Self {
        AsyncUnreader {
            inner,
            buf: BytesMut::new(),
        }
    }

    pub async fn read(&mut self) -> io::Result<Bytes> {
        if !self.buf.is_empty() {
            return Ok(self.buf.split().freeze());
        }
        let mut tmp = [0u8; CHUNK_SIZE];
        let n = self.inner.read(&mut tmp).await?;
        Ok(Bytes::copy_from_slice(&tmp[..n]))
    }

    pub async fn read_exact_or_eof(&mut self, n: usize) -> io::Result<Bytes> {
        let mut tmp = [0u8; CHUNK_SIZE];
        while self.buf.len() < n {
            let got = self.inner.read(&mut tmp).await?;
            if got == 0 {
                return Ok(self.buf.split().freeze());
            }
            self.buf.extend_from_slice(&tmp[..got]);
        }
        Ok(self.buf.split_to(n).freeze())
    }

    pub fn unread(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut merged = BytesMut::with_capacity(data.len() + self.buf.len());
        merged.extend_from_slice(data);
        merged.extend_from_slice(&self.buf);
        self.buf = merged;
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_returns_buffered_first() {
        let mut u = Unreader::new(BufSource::of(&b"world"[..]));
        u.unread(b"hello ");
        assert_eq!(&u.read().unwrap()[..], b"hello ");
        assert_eq!(&u.read().unwrap()[..], b"world");
        assert!(u.read().unwrap().is_empty());
    }

    #[test]
    fn unread_prepends() {
        let mut u = Unreader::new(BufSource::of(&b""[..]));
        u.unread(b"cd");
        u.unread(b"ab");
        assert_eq!(&u.read().unwrap()[..], b"abcd");
    }

    #[test]
    fn read_exact_spans_chunks() {
        let mut u = Unreader::new(BufSource::new([
            Bytes::from_static(b"ab"),
            Bytes::from_static(b"cd"),
            Bytes::from_static(b"ef"),
        ]));
        assert_eq!(&u.read_exact_or_eof(5).unwrap()[..], b"abcde");
        assert_eq!(&u.read().unwrap()[..], b"f");
    }

    #[test]
    fn read_exact_short_at_eof() {
        let mut u = Unreader::new(BufSource::of(&b"xy"[..]));
        assert_eq!(&u.read_exact_or_eof(10).unwrap()[..], b"xy");
        assert!(u.read_exact_or_eof(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn async_unreader_roundtrip() {
        let data: &[u8] = b"GET / HTTP/1.1\r\n";
        let mut u = AsyncUnreader::new(data);
        let got = u.read_exact_or_eof(4).await.unwrap();
        assert_eq!(&got[..], b"GET ");
        u.unread(b"GET ");
        let all = u.read_exact_or_eof(data.len()).await.unwrap();
        assert_eq!(&all[..], data);
    }
}
