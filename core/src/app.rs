/*
 * app.rs
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

//! The application boundary. The threaded engine serves a synchronous
//! CGI-style callable; the async engine serves an ASGI-shaped callable
//! defined in `worker::asgi::scope`.

use std::io;

use bytes::Bytes;

use crate::protocol::http::h1::ResponseWriter;
use crate::protocol::http::request::Request;
use crate::protocol::http::HeaderList;

pub use crate::worker::asgi::scope::{AppSend, AsgiApplication, Event, Receive, Scope};

/// Streaming request-body handle given to the application (`wsgi.input`).
pub trait RequestBody {
    /// Read up to `size` bytes; `None` reads to exhaustion. Empty = done.
    fn read(&mut self, size: Option<usize>) -> io::Result<Bytes>;
    /// Read one line including its newline, bounded by `size`.
    fn readline(&mut self, size: Option<usize>) -> io::Result<Bytes>;
    /// Trailers, available after a chunked body is exhausted.
    fn trailers(&self) -> &HeaderList;
}

impl<S: crate::unreader::Source> RequestBody for crate::protocol::http::h1::Body<'_, S> {
    fn read(&mut self, size: Option<usize>) -> io::Result<Bytes> {
        crate::protocol::http::h1::Body::read(self, size)
    }

    fn readline(&mut self, size: Option<usize>) -> io::Result<Bytes> {
        crate::protocol::http::h1::Body::readline(self, size)
    }

    fn trailers(&self) -> &HeaderList {
        crate::protocol::http::h1::Body::trailers(self)
    }
}

/// Response channel given to the application: declare the head, then write
/// body bytes. Mirrors `start_response` + the write callable.
pub trait StartResponse {
    fn start(
        &mut self,
        status: u16,
        reason: Option<&str>,
        headers: &[(String, String)],
    ) -> io::Result<()>;
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    /// 1xx informational response ahead of the final one (103 Early Hints).
    /// No-op where the protocol cannot express it.
    fn send_informational(&mut self, status: u16, headers: &[(String, String)]) -> io::Result<()>;
}

impl<W: io::Write> StartResponse for ResponseWriter<W> {
    fn start(
        &mut self,
        status: u16,
        reason: Option<&str>,
        headers: &[(String, String)],
    ) -> io::Result<()> {
        ResponseWriter::start(self, status, reason, headers)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        ResponseWriter::write(self, data)
    }

    fn send_informational(&mut self, status: u16, headers: &[(String, String)]) -> io::Result<()> {
        ResponseWriter::send_informational(self, status, headers)
    }
}

/// What the application returns in addition to anything it wrote through
/// [`StartResponse`]; `File` takes the sendfile fast path.
pub enum WsgiBody {
    Empty,
    Bytes(Bytes),
    File(std::fs::File),
}

/// A synchronous application. One call per request; may be invoked from
/// many pool threads at once.
pub trait Application: Send + Sync + 'static {
    fn call(
        &self,
        request: &Request,
        body: &mut dyn RequestBody,
        response: &mut dyn StartResponse,
    ) -> io::Result<WsgiBody>;
}

/// Blanket impl so plain functions and closures serve as applications.
impl<F> Application for F
where
    F: Fn(&Request, &mut dyn RequestBody, &mut dyn StartResponse) -> io::Result<WsgiBody>
        + Send
        + Sync
        + 'static,
{
    fn call(
        &self,
        request: &Request,
        body: &mut dyn RequestBody,
        response: &mut dyn StartResponse,
    ) -> io::Result<WsgiBody> {
        self(request, body, response)
    }
}
