/*
 * writer.rs
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

//! HTTP/1.x response writer: status line, default and validated application
//! headers, hop-by-hop filtering, chunked encoding, informational responses
//! and a sendfile fast path.

use std::io::{self, Read, Write};

use crate::util::{http_date, is_field_value_byte, is_token, SERVER_TOKEN};

/// Hop-by-hop headers (RFC 9110 §7.6.1), stripped from application output.
const HOP_BY_HOP: &[&str] = &[
    "CONNECTION",
    "KEEP-ALIVE",
    "PROXY-AUTHENTICATE",
    "PROXY-AUTHORIZATION",
    "TE",
    "TRAILERS",
    "TRANSFER-ENCODING",
    "UPGRADE",
];

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        103 => "Early Hints",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Content Too Large",
        414 => "URI Too Long",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

/// Minimal complete error response for parse failures, written before any
/// application involvement. Always closes.
pub fn write_error_response(out: &mut dyn Write, status: u16, version: (u8, u8)) -> io::Result<()> {
    let reason = reason_phrase(status);
    let body = format!("<html><body><h1>{} {}</h1></body></html>", status, reason);
    write!(
        out,
        "HTTP/{}.{} {} {}\r\nServer: {}\r\nDate: {}\r\nConnection: close\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
        version.0,
        version.1,
        status,
        reason,
        SERVER_TOKEN,
        http_date(),
        body.len(),
        body
    )?;
    out.flush()
}

/// Streaming response writer for one request. `start` may be called again to
/// replace the headers until the first byte is flushed; after that it fails,
/// which is the engine's cue to abort the connection instead.
pub struct ResponseWriter<W: Write> {
    out: W,
    version: (u8, u8),
    /// Close decision inherited from the request.
    request_close: bool,
    status: u16,
    reason: Option<String>,
    headers: Vec<(String, String)>,
    headers_sent: bool,
    chunked: bool,
    content_length: Option<u64>,
    bytes_sent: u64,
    /// Preserved `Connection: upgrade` (WebSocket handshake).
    upgrade: bool,
    /// No Content-Length and not chunked: the body is EOF-delimited.
    force_close: bool,
    finished: bool,
}

impl<W: Write> ResponseWriter<W> {
    pub fn new(out: W, version: (u8, u8), request_close: bool) -> Self {
        ResponseWriter {
            out,
            version,
            request_close,
            status: 0,
            reason: None,
            headers: Vec::new(),
            headers_sent: false,
            chunked: false,
            content_length: None,
            bytes_sent: 0,
            upgrade: false,
            force_close: false,
            finished: false,
        }
    }

    /// Send a 1xx informational response ahead of the final one. No-op on
    /// HTTP/1.0 peers (they would take it for the response).
    pub fn send_informational(
        &mut self,
        status: u16,
        headers: &[(String, String)],
    ) -> io::Result<()> {
        if !(100..200).contains(&status) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "informational status must be 1xx",
            ));
        }
        if self.version < (1, 1) {
            return Ok(());
        }
        if self.headers_sent {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "final headers already sent",
            ));
        }
        write!(self.out, "HTTP/1.1 {} {}\r\n", status, reason_phrase(status))?;
        for (name, value) in headers {
            validate_header(name, value)?;
            write!(self.out, "{}: {}\r\n", name, value)?;
        }
        self.out.write_all(b"\r\n")?;
        self.out.flush()
    }

    /// Declare status and headers. Fails once response bytes have been
    /// flushed; before that, a second call replaces the previous declaration.
    pub fn start(
        &mut self,
        status: u16,
        reason: Option<&str>,
        headers: &[(String, String)],
    ) -> io::Result<()> {
        if self.headers_sent {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "headers already sent",
            ));
        }
        let mut chunked = false;
        let mut content_length = None;
        let mut upgrade = false;
        let mut kept = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            validate_header(name, value)?;
            let upper = name.to_ascii_uppercase();
            match upper.as_str() {
                "TRANSFER-ENCODING" => {
                    if value.trim().eq_ignore_ascii_case("chunked") {
                        chunked = true;
                    }
                    continue;
                }
                "CONTENT-LENGTH" => {
                    content_length = Some(value.trim().parse::<u64>().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "bad Content-Length")
                    })?);
                    kept.push((name.clone(), value.clone()));
                    continue;
                }
                "CONNECTION" if value.trim().eq_ignore_ascii_case("upgrade") => {
                    upgrade = true;
                    continue;
                }
                "UPGRADE" => {
                    kept.push((name.clone(), value.clone()));
                    continue;
                }
                _ if HOP_BY_HOP.contains(&upper.as_str()) => continue,
                _ => kept.push((name.clone(), value.clone())),
            }
        }
        if chunked && content_length.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunked and Content-Length are mutually exclusive",
            ));
        }
        // Chunked framing only exists in 1.1.
        if self.version < (1, 1) {
            chunked = false;
        }
        self.status = status;
        self.reason = reason.map(str::to_string);
        self.headers = kept;
        self.chunked = chunked;
        self.content_length = content_length;
        self.upgrade = upgrade;
        self.force_close = !chunked && content_length.is_none() && !no_body_status(status);
        Ok(())
    }

    /// True once the connection cannot be kept alive after this response.
    pub fn should_close(&self) -> bool {
        self.request_close || self.force_close
    }

    fn send_headers(&mut self) -> io::Result<()> {
        if self.headers_sent {
            return Ok(());
        }
        if self.status == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write before start",
            ));
        }
        let reason = match &self.reason {
            Some(r) => r.clone(),
            None => reason_phrase(self.status).to_string(),
        };
        write!(
            self.out,
            "HTTP/{}.{} {} {}\r\n",
            self.version.0, self.version.1, self.status, reason
        )?;
        write!(self.out, "Server: {}\r\n", SERVER_TOKEN)?;
        write!(self.out, "Date: {}\r\n", http_date())?;
        if self.upgrade {
            self.out.write_all(b"Connection: upgrade\r\n")?;
        } else if self.should_close() {
            self.out.write_all(b"Connection: close\r\n")?;
        } else {
            self.out.write_all(b"Connection: keep-alive\r\n")?;
        }
        if self.chunked {
            self.out.write_all(b"Transfer-Encoding: chunked\r\n")?;
        }
        for (name, value) in &self.headers {
            write!(self.out, "{}: {}\r\n", name, value)?;
        }
        self.out.write_all(b"\r\n")?;
        self.headers_sent = true;
        Ok(())
    }

    /// Write a body chunk. The first write emits the head.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.send_headers()?;
        if data.is_empty() {
            return Ok(());
        }
        if let Some(limit) = self.content_length {
            if self.bytes_sent + data.len() as u64 > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "body exceeds declared Content-Length",
                ));
            }
        }
        if self.chunked {
            write!(self.out, "{:x}\r\n", data.len())?;
            self.out.write_all(data)?;
            self.out.write_all(b"\r\n")?;
        } else {
            self.out.write_all(data)?;
        }
        self.bytes_sent += data.len() as u64;
        Ok(())
    }

    /// Stream a file body. When no chunking is required the copy goes
    /// straight from the file to the socket in large blocks (the zero-copy
    /// path is the kernel's readahead + uncorked socket writes).
    pub fn write_file(&mut self, file: &mut std::fs::File) -> io::Result<()> {
        self.send_headers()?;
        if self.chunked {
            let mut buf = [0u8; 16384];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                write!(self.out, "{:x}\r\n", n)?;
                self.out.write_all(&buf[..n])?;
                self.out.write_all(b"\r\n")?;
            }
        } else {
            let sent = io::copy(file, &mut self.out)?;
            self.bytes_sent += sent;
        }
        Ok(())
    }

    /// Terminate the response: emits the head if nothing was written, the
    /// final `0 CRLF CRLF` when chunked, and flushes. Idempotent.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.send_headers()?;
        if self.chunked {
            self.out.write_all(b"0\r\n\r\n")?;
        }
        self.out.flush()?;
        self.finished = true;
        Ok(())
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// The underlying sink (e.g. to drain a memory buffer between writes).
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.out
    }
}

fn no_body_status(status: u16) -> bool {
    matches!(status, 204 | 304) || (100..200).contains(&status)
}

fn validate_header(name: &str, value: &str) -> io::Result<()> {
    if !is_token(name.as_bytes()) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid header name {:?}", name),
        ));
    }
    if !value.bytes().all(is_field_value_byte) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid value for header {:?}", name),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(name: &str, value: &str) -> (String, String) {
        (name.to_string(), value.to_string())
    }

    #[test]
    fn plain_response_with_content_length() {
        let mut out = Vec::new();
        let mut w = ResponseWriter::new(&mut out, (1, 1), false);
        w.start(200, None, &[hdr("Content-Length", "5"), hdr("Content-Type", "text/plain")])
            .unwrap();
        w.write(b"hello").unwrap();
        w.finish().unwrap();
        assert!(!w.should_close());
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn chunked_when_app_declared() {
        let mut out = Vec::new();
        let mut w = ResponseWriter::new(&mut out, (1, 1), false);
        w.start(200, None, &[hdr("Transfer-Encoding", "chunked")]).unwrap();
        w.write(b"hello").unwrap();
        w.write(b" world").unwrap();
        w.finish().unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("5\r\nhello\r\n"));
        assert!(text.contains("6\r\n world\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
    }

    #[test]
    fn chunked_and_length_conflict() {
        let mut out = Vec::new();
        let mut w = ResponseWriter::new(&mut out, (1, 1), false);
        let err = w
            .start(
                200,
                None,
                &[hdr("Transfer-Encoding", "chunked"), hdr("Content-Length", "5")],
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn no_framing_forces_close() {
        let mut out = Vec::new();
        let mut w = ResponseWriter::new(&mut out, (1, 1), false);
        w.start(200, None, &[]).unwrap();
        w.write(b"x").unwrap();
        w.finish().unwrap();
        assert!(w.should_close());
        drop(w);
        assert!(String::from_utf8(out).unwrap().contains("Connection: close\r\n"));
    }

    #[test]
    fn hop_by_hop_stripped_but_upgrade_kept() {
        let mut out = Vec::new();
        let mut w = ResponseWriter::new(&mut out, (1, 1), false);
        w.start(
            101,
            None,
            &[
                hdr("Connection", "Upgrade"),
                hdr("Upgrade", "websocket"),
                hdr("Keep-Alive", "timeout=5"),
                hdr("Proxy-Authenticate", "x"),
            ],
        )
        .unwrap();
        w.finish().unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Connection: upgrade\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(!text.contains("Keep-Alive"));
        assert!(!text.contains("Proxy-Authenticate"));
    }

    #[test]
    fn start_replaces_headers_until_flush() {
        let mut out = Vec::new();
        let mut w = ResponseWriter::new(&mut out, (1, 1), false);
        w.start(200, None, &[hdr("Content-Length", "2")]).unwrap();
        // The error path replaces the response before anything was written.
        w.start(500, None, &[hdr("Content-Length", "0")]).unwrap();
        w.write(b"").unwrap();
        w.finish().unwrap();
        // Once flushed, a further start is refused.
        assert!(w.start(200, None, &[]).is_err());
        drop(w);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[test]
    fn header_validation() {
        let mut out = Vec::new();
        let mut w = ResponseWriter::new(&mut out, (1, 1), false);
        assert!(w.start(200, None, &[hdr("Bad Name", "v")]).is_err());
        assert!(w.start(200, None, &[hdr("X-Ok", "bad\r\nvalue")]).is_err());
    }

    #[test]
    fn informational_is_noop_on_http10() {
        let mut out = Vec::new();
        let mut w = ResponseWriter::new(&mut out, (1, 0), true);
        w.send_informational(103, &[hdr("Link", "</style.css>; rel=preload")])
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn early_hints_before_final() {
        let mut out = Vec::new();
        let mut w = ResponseWriter::new(&mut out, (1, 1), false);
        w.send_informational(103, &[hdr("Link", "</s.css>; rel=preload")]).unwrap();
        w.start(200, None, &[hdr("Content-Length", "0")]).unwrap();
        w.finish().unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 103 Early Hints\r\n"));
        assert!(text.contains("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn overlong_body_rejected() {
        let mut out = Vec::new();
        let mut w = ResponseWriter::new(&mut out, (1, 1), false);
        w.start(200, None, &[hdr("Content-Length", "3")]).unwrap();
        w.write(b"abc").unwrap();
        assert!(w.write(b"d").is_err());
    }

    #[test]
    fn raw_error_response() {
        let mut out = Vec::new();
        write_error_response(&mut out, 400, (1, 1)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }
}
