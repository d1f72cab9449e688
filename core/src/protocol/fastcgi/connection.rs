/*
 * connection.rs
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

//! FastCGI connection state: records for the same requestId accumulate in a
//! table of partial requests; a request is ready when both its PARAMS and
//! STDIN streams have been terminated by their empty records. Only the
//! RESPONDER role is spoken.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

use crate::config::Config;
use crate::protocol::cgi;
use crate::protocol::http::error::HttpError;
use crate::protocol::http::request::{PeerAddr, Request};
use crate::unreader::{Source, Unreader};

use super::record::{read_content, read_header};
use super::{
    record_type_name, FCGI_ABORT_REQUEST, FCGI_BEGIN_REQUEST, FCGI_GET_VALUES, FCGI_KEEP_CONN,
    FCGI_NULL_REQUEST_ID, FCGI_PARAMS, FCGI_RESPONDER, FCGI_STDIN, MAX_FCGI_PARAMS,
};

/// One complete request plus its transport bookkeeping.
#[derive(Debug)]
pub struct FcgiRequest {
    pub request_id: u16,
    /// Web server asked us to keep the transport open afterwards. Wins over
    /// any embedded `Connection: close` header.
    pub keep_conn: bool,
    pub request: Request,
    pub stdin: Bytes,
}

/// Pulled from [`FcgiConnection::next_event`].
#[derive(Debug)]
pub enum FcgiEvent {
    Request(Box<FcgiRequest>),
    /// ABORT_REQUEST for a request we had not finished reading.
    Abort(u16),
    /// GET_VALUES management record; the names the web server asked about.
    GetValues(Vec<String>),
    /// Clean end of the transport.
    Eof,
}

struct Partial {
    keep_conn: bool,
    params: BytesMut,
    stdin: BytesMut,
    params_done: bool,
    stdin_done: bool,
}

impl Partial {
    fn ready(&self) -> bool {
        self.params_done && self.stdin_done
    }
}

/// Per-connection multiplexing state.
pub struct FcgiConnection {
    partial: HashMap<u16, Partial>,
    req_counter: u64,
}

impl FcgiConnection {
    pub fn new() -> Self {
        FcgiConnection {
            partial: HashMap::new(),
            req_counter: 0,
        }
    }

    /// Read records until something actionable happens. Blocking; the
    /// threaded engine drives this per connection.
    pub fn next_event<S: Source>(
        &mut self,
        unreader: &mut Unreader<S>,
        peer: &PeerAddr,
        cfg: &Config,
    ) -> Result<FcgiEvent, HttpError> {
        cgi::check_allowed(peer, &cfg.fastcgi_allow_ips)?;
        loop {
            let Some(header) = read_header(unreader)? else {
                return Ok(FcgiEvent::Eof);
            };
            let content = read_content(unreader, &header)?;
            match header.record_type {
                FCGI_BEGIN_REQUEST => {
                    if content.len() < 8 {
                        return Err(HttpError::InvalidGateway(
                            "BEGIN_REQUEST content too short".into(),
                        ));
                    }
                    let role = u16::from_be_bytes([content[0], content[1]]);
                    let flags = content[2];
                    if role != FCGI_RESPONDER {
                        return Err(HttpError::UnsupportedGateway(format!(
                            "FastCGI role {}",
                            role
                        )));
                    }
                    self.partial.insert(
                        header.request_id,
                        Partial {
                            keep_conn: flags & FCGI_KEEP_CONN != 0,
                            params: BytesMut::new(),
                            stdin: BytesMut::new(),
                            params_done: false,
                            stdin_done: false,
                        },
                    );
                }
                FCGI_PARAMS => {
                    let partial = self.partial.get_mut(&header.request_id).ok_or_else(|| {
                        HttpError::InvalidGateway("PARAMS for unknown request".into())
                    })?;
                    if content.is_empty() {
                        partial.params_done = true;
                    } else {
                        partial.params.extend_from_slice(&content);
                    }
                    if partial.ready() {
                        return self.finish(header.request_id, peer, cfg);
                    }
                }
                FCGI_STDIN => {
                    let partial = self.partial.get_mut(&header.request_id).ok_or_else(|| {
                        HttpError::InvalidGateway("STDIN for unknown request".into())
                    })?;
                    if content.is_empty() {
                        partial.stdin_done = true;
                    } else {
                        partial.stdin.extend_from_slice(&content);
                    }
                    if partial.ready() {
                        return self.finish(header.request_id, peer, cfg);
                    }
                }
                FCGI_ABORT_REQUEST => {
                    if self.partial.remove(&header.request_id).is_some() {
                        return Ok(FcgiEvent::Abort(header.request_id));
                    }
                }
                FCGI_GET_VALUES => {
                    if header.request_id != FCGI_NULL_REQUEST_ID {
                        return Err(HttpError::InvalidGateway(
                            "GET_VALUES with non-null request id".into(),
                        ));
                    }
                    let names = parse_pairs(&content)?
                        .into_iter()
                        .map(|(name, _)| name)
                        .collect();
                    return Ok(FcgiEvent::GetValues(names));
                }
                other => {
                    tracing::debug!(record = record_type_name(other), "ignoring record");
                }
            }
        }
    }

    fn finish(
        &mut self,
        request_id: u16,
        peer: &PeerAddr,
        cfg: &Config,
    ) -> Result<FcgiEvent, HttpError> {
        let partial = self
            .partial
            .remove(&request_id)
            .ok_or_else(|| HttpError::InvalidGateway("request vanished".into()))?;
        self.req_counter += 1;
        let vars = parse_pairs(&partial.params)?;
        let mut request = cgi::request_from_vars(vars, peer.clone(), self.req_counter, cfg)?;
        // FCGI_KEEP_CONN absent means we close the transport after replying.
        if !partial.keep_conn {
            request.must_close = true;
        }
        Ok(FcgiEvent::Request(Box::new(FcgiRequest {
            request_id,
            keep_conn: partial.keep_conn,
            request,
            stdin: partial.stdin.freeze(),
        })))
    }
}

impl Default for FcgiConnection {
    fn default() -> Self {
        Self::new()
    }
}

/// FastCGI name-value pairs: each length is 1 byte if the high bit is
/// clear, else 4 bytes big-endian with the high bit cleared.
fn parse_pairs(data: &[u8]) -> Result<Vec<(String, String)>, HttpError> {
    let mut pairs = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        if pairs.len() >= MAX_FCGI_PARAMS {
            return Err(HttpError::InvalidGateway("too many parameters".into()));
        }
        let name_len = decode_length(data, &mut pos)?;
        let value_len = decode_length(data, &mut pos)?;
        if pos + name_len > data.len() {
            return Err(HttpError::InvalidGateway("truncated parameter name".into()));
        }
        let name = String::from_utf8_lossy(&data[pos..pos + name_len]).into_owned();
        pos += name_len;
        if pos + value_len > data.len() {
            return Err(HttpError::InvalidGateway("truncated parameter value".into()));
        }
        let value = String::from_utf8_lossy(&data[pos..pos + value_len]).into_owned();
        pos += value_len;
        pairs.push((name, value));
    }
    Ok(pairs)
}

fn decode_length(data: &[u8], pos: &mut usize) -> Result<usize, HttpError> {
    let first = *data
        .get(*pos)
        .ok_or_else(|| HttpError::InvalidGateway("truncated length".into()))?;
    if first & 0x80 == 0 {
        *pos += 1;
        return Ok(first as usize);
    }
    if *pos + 4 > data.len() {
        return Err(HttpError::InvalidGateway("truncated 4-byte length".into()));
    }
    let len = u32::from_be_bytes([data[*pos] & 0x7f, data[*pos + 1], data[*pos + 2], data[*pos + 3]]);
    *pos += 4;
    Ok(len as usize)
}

/// Encode one name-value pair (client-side helper for tests).
#[cfg(test)]
pub(crate) fn encode_pair(name: &str, value: &str, out: &mut Vec<u8>) {
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
    use super::super::record::write_record;
    use super::super::FCGI_AUTHORIZER;
    use super::*;
    use crate::unreader::BufSource;

    fn peer() -> PeerAddr {
        PeerAddr::Tcp("127.0.0.1:8000".parse().unwrap())
    }

    fn begin(out: &mut Vec<u8>, id: u16, keep: bool) {
        let body = [
            (FCGI_RESPONDER >> 8) as u8,
            FCGI_RESPONDER as u8,
            if keep { FCGI_KEEP_CONN } else { 0 },
            0,
            0,
            0,
            0,
            0,
        ];
        write_record(out, FCGI_BEGIN_REQUEST, id, &body).unwrap();
    }

    fn params(out: &mut Vec<u8>, id: u16, vars: &[(&str, &str)]) {
        let mut block = Vec::new();
        for (n, v) in vars {
            encode_pair(n, v, &mut block);
        }
        write_record(out, FCGI_PARAMS, id, &block).unwrap();
        write_record(out, FCGI_PARAMS, id, &[]).unwrap();
    }

    fn stdin(out: &mut Vec<u8>, id: u16, body: &[u8]) {
        if !body.is_empty() {
            write_record(out, FCGI_STDIN, id, body).unwrap();
        }
        write_record(out, FCGI_STDIN, id, &[]).unwrap();
    }

    fn base_vars<'a>() -> Vec<(&'a str, &'a str)> {
        vec![
            ("REQUEST_METHOD", "POST"),
            ("PATH_INFO", "/form"),
            ("QUERY_STRING", ""),
            ("CONTENT_LENGTH", "4"),
            ("HTTP_HOST", "x"),
        ]
    }

    #[test]
    fn single_request_roundtrip() {
        let mut raw = Vec::new();
        begin(&mut raw, 1, true);
        params(&mut raw, 1, &base_vars());
        stdin(&mut raw, 1, b"data");

        let mut conn = FcgiConnection::new();
        let mut u = Unreader::new(BufSource::of(raw));
        let cfg = Config::default();
        match conn.next_event(&mut u, &peer(), &cfg).unwrap() {
            FcgiEvent::Request(req) => {
                assert_eq!(req.request_id, 1);
                assert!(req.keep_conn);
                assert_eq!(req.request.method, "POST");
                assert_eq!(req.request.path, "/form");
                assert_eq!(&req.stdin[..], b"data");
                // KEEP_CONN set: must_close stays clear.
                assert!(!req.request.must_close);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            conn.next_event(&mut u, &peer(), &cfg).unwrap(),
            FcgiEvent::Eof
        ));
    }

    #[test]
    fn no_keep_conn_forces_close() {
        let mut raw = Vec::new();
        begin(&mut raw, 1, false);
        params(&mut raw, 1, &base_vars());
        stdin(&mut raw, 1, b"data");
        let mut conn = FcgiConnection::new();
        let mut u = Unreader::new(BufSource::of(raw));
        let cfg = Config::default();
        match conn.next_event(&mut u, &peer(), &cfg).unwrap() {
            FcgiEvent::Request(req) => assert!(req.request.must_close),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn interleaved_requests_multiplex() {
        // Two BEGINs, then interleaved PARAMS/STDIN; request 2 completes
        // first.
        let mut raw = Vec::new();
        begin(&mut raw, 1, true);
        begin(&mut raw, 2, true);
        let mut block1 = Vec::new();
        for (n, v) in [("REQUEST_METHOD", "GET"), ("PATH_INFO", "/one")] {
            encode_pair(n, v, &mut block1);
        }
        write_record(&mut raw, FCGI_PARAMS, 1, &block1).unwrap();
        params(&mut raw, 2, &[("REQUEST_METHOD", "GET"), ("PATH_INFO", "/two")]);
        stdin(&mut raw, 2, b"");
        write_record(&mut raw, FCGI_PARAMS, 1, &[]).unwrap();
        stdin(&mut raw, 1, b"");

        let mut conn = FcgiConnection::new();
        let mut u = Unreader::new(BufSource::of(raw));
        let cfg = Config::default();
        let first = conn.next_event(&mut u, &peer(), &cfg).unwrap();
        match first {
            FcgiEvent::Request(req) => assert_eq!(req.request.path, "/two"),
            other => panic!("unexpected event {:?}", other),
        }
        let second = conn.next_event(&mut u, &peer(), &cfg).unwrap();
        match second {
            FcgiEvent::Request(req) => {
                assert_eq!(req.request.path, "/one");
                assert_eq!(req.request.req_number, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn abort_drops_partial() {
        let mut raw = Vec::new();
        begin(&mut raw, 7, true);
        write_record(&mut raw, FCGI_ABORT_REQUEST, 7, &[]).unwrap();
        let mut conn = FcgiConnection::new();
        let mut u = Unreader::new(BufSource::of(raw));
        let cfg = Config::default();
        assert!(matches!(
            conn.next_event(&mut u, &peer(), &cfg).unwrap(),
            FcgiEvent::Abort(7)
        ));
    }

    #[test]
    fn only_responder_role() {
        let mut raw = Vec::new();
        let body = [0, FCGI_AUTHORIZER as u8, 0, 0, 0, 0, 0, 0];
        write_record(&mut raw, FCGI_BEGIN_REQUEST, 1, &body).unwrap();
        let mut conn = FcgiConnection::new();
        let mut u = Unreader::new(BufSource::of(raw));
        let cfg = Config::default();
        assert!(matches!(
            conn.next_event(&mut u, &peer(), &cfg).unwrap_err(),
            HttpError::UnsupportedGateway(_)
        ));
    }

    #[test]
    fn get_values_surfaces_names() {
        let mut block = Vec::new();
        encode_pair("FCGI_MAX_CONNS", "", &mut block);
        encode_pair("FCGI_MPXS_CONNS", "", &mut block);
        let mut raw = Vec::new();
        write_record(&mut raw, FCGI_GET_VALUES, 0, &block).unwrap();
        let mut conn = FcgiConnection::new();
        let mut u = Unreader::new(BufSource::of(raw));
        let cfg = Config::default();
        match conn.next_event(&mut u, &peer(), &cfg).unwrap() {
            FcgiEvent::GetValues(names) => {
                assert_eq!(names, vec!["FCGI_MAX_CONNS", "FCGI_MPXS_CONNS"]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn long_pair_lengths_decode() {
        let name = "N".repeat(200);
        let mut block = Vec::new();
        encode_pair(&name, "v", &mut block);
        let pairs = parse_pairs(&block).unwrap();
        assert_eq!(pairs[0].0.len(), 200);
        assert_eq!(pairs[0].1, "v");
    }
}
