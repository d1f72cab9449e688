/*
 * response.rs
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

//! FastCGI response writer: all output is framed in STDOUT records of at
//! most 65535 bytes, the head uses the CGI `Status:` header instead of an
//! HTTP status line, and the reply terminates with an empty STDOUT plus
//! END_REQUEST(appStatus=0, REQUEST_COMPLETE).

use std::io::{self, Write};

use crate::protocol::http::h1::writer::reason_phrase;
use crate::util::{http_date, SERVER_TOKEN};

use super::record::write_record;
use super::{FCGI_END_REQUEST, FCGI_MAX_CONTENT_LEN, FCGI_REQUEST_COMPLETE, FCGI_STDOUT};

pub struct FcgiResponseWriter<'a> {
    out: &'a mut dyn Write,
    request_id: u16,
    headers_sent: bool,
    finished: bool,
}

impl<'a> FcgiResponseWriter<'a> {
    pub fn new(out: &'a mut dyn Write, request_id: u16) -> Self {
        FcgiResponseWriter {
            out,
            request_id,
            headers_sent: false,
            finished: false,
        }
    }

    fn stdout(&mut self, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(FCGI_MAX_CONTENT_LEN) {
            write_record(self.out, FCGI_STDOUT, self.request_id, chunk)?;
        }
        Ok(())
    }

    /// Emit the CGI-style head: `Status:`, defaults, application headers.
    pub fn start(&mut self, status: u16, headers: &[(String, String)]) -> io::Result<()> {
        if self.headers_sent {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "headers already sent",
            ));
        }
        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(
            format!("Status: {} {}\r\n", status, reason_phrase(status)).as_bytes(),
        );
        head.extend_from_slice(format!("Server: {}\r\n", SERVER_TOKEN).as_bytes());
        head.extend_from_slice(format!("Date: {}\r\n", http_date()).as_bytes());
        for (name, value) in headers {
            head.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        head.extend_from_slice(b"\r\n");
        self.stdout(&head)?;
        self.headers_sent = true;
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.headers_sent {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write before start",
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.stdout(data)
    }

    /// Terminal empty STDOUT + END_REQUEST. Idempotent.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        write_record(self.out, FCGI_STDOUT, self.request_id, &[])?;
        let body = [0u8, 0, 0, 0, FCGI_REQUEST_COMPLETE, 0, 0, 0];
        write_record(self.out, FCGI_END_REQUEST, self.request_id, &body)?;
        self.out.flush()?;
        self.finished = true;
        Ok(())
    }
}

/// Reply to GET_VALUES with our capabilities.
pub fn write_get_values_result(
    out: &mut dyn Write,
    names: &[String],
    max_conns: usize,
) -> io::Result<()> {
    let mut body = Vec::new();
    for name in names {
        let value = match name.as_str() {
            "FCGI_MAX_CONNS" | "FCGI_MAX_REQS" => max_conns.to_string(),
            "FCGI_MPXS_CONNS" => "1".to_string(),
            _ => continue,
        };
        encode_pair_raw(name, &value, &mut body);
    }
    write_record(out, super::FCGI_GET_VALUES_RESULT, super::FCGI_NULL_REQUEST_ID, &body)
}

fn encode_pair_raw(name: &str, value: &str, out: &mut Vec<u8>) {
    for len in [name.len(), value.len()] {
        if len < 128 {
            out.push(len as u8);
        } else {
            out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
        }
    }
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::super::record::RecordHeader;
    use super::super::FCGI_HEADER_LEN;
    use super::*;

    fn records(raw: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        let mut rest = raw;
        while rest.len() >= FCGI_HEADER_LEN {
            let h = RecordHeader::parse(rest).unwrap();
            let start = FCGI_HEADER_LEN;
            let end = start + h.content_length as usize;
            out.push((h.record_type, rest[start..end].to_vec()));
            rest = &rest[end + h.padding_length as usize..];
        }
        out
    }

    #[test]
    fn response_framing() {
        let mut raw = Vec::new();
        let mut w = FcgiResponseWriter::new(&mut raw, 5);
        w.start(200, &[("Content-Type".into(), "text/plain".into())])
            .unwrap();
        w.write(b"hello").unwrap();
        w.finish().unwrap();
        w.finish().unwrap();

        let recs = records(&raw);
        // head, body, terminal empty stdout, end request.
        assert_eq!(recs.len(), 4);
        let head = String::from_utf8(recs[0].1.clone()).unwrap();
        assert!(head.starts_with("Status: 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/plain\r\n"));
        assert_eq!(recs[1].1, b"hello");
        assert_eq!(recs[2].0, FCGI_STDOUT);
        assert!(recs[2].1.is_empty());
        assert_eq!(recs[3].0, FCGI_END_REQUEST);
        assert_eq!(recs[3].1[4], FCGI_REQUEST_COMPLETE);
    }

    #[test]
    fn large_bodies_split_into_records() {
        let mut raw = Vec::new();
        let mut w = FcgiResponseWriter::new(&mut raw, 1);
        w.start(200, &[]).unwrap();
        let body = vec![b'x'; FCGI_MAX_CONTENT_LEN + 10];
        w.write(&body).unwrap();
        w.finish().unwrap();
        let recs = records(&raw);
        let body_recs: Vec<_> = recs
            .iter()
            .filter(|(t, c)| *t == FCGI_STDOUT && !c.is_empty())
            .collect();
        // head + two body records (65535 + 10).
        assert_eq!(body_recs.len(), 3);
        assert_eq!(body_recs[1].1.len(), FCGI_MAX_CONTENT_LEN);
        assert_eq!(body_recs[2].1.len(), 10);
    }

    #[test]
    fn get_values_result() {
        let mut raw = Vec::new();
        write_get_values_result(
            &mut raw,
            &["FCGI_MPXS_CONNS".to_string(), "FCGI_MAX_CONNS".to_string()],
            1000,
        )
        .unwrap();
        let recs = records(&raw);
        assert_eq!(recs[0].0, super::super::FCGI_GET_VALUES_RESULT);
        let body = &recs[0].1;
        let text = String::from_utf8_lossy(body);
        assert!(text.contains("FCGI_MPXS_CONNS"));
        assert!(text.contains("1000"));
    }

    #[test]
    fn write_before_start_is_error() {
        let mut raw = Vec::new();
        let mut w = FcgiResponseWriter::new(&mut raw, 1);
        assert!(w.write(b"x").is_err());
    }
}
