/*
 * uwsgi.rs
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

//! uWSGI packet codec: 4-byte header `modifier1 | datasize-LE16 | modifier2`,
//! then `datasize` bytes of LE16-framed key/value pairs, then the body framed
//! by `CONTENT_LENGTH`. Responses go back as plain HTTP/1. Only modifier1 0
//! (a WSGI-style request) is supported.

use crate::config::Config;
use crate::unreader::{Source, Unreader};

use super::cgi;
use super::http::error::HttpError;
use super::http::request::{PeerAddr, Request};

/// Variable-count cap bounding memory per packet.
pub const MAX_UWSGI_VARS: usize = 1000;

/// Parse one uWSGI request. The body (per `CONTENT_LENGTH`) remains in the
/// unreader for the body reader, exactly like HTTP/1.
pub fn parse<S: Source>(
    unreader: &mut Unreader<S>,
    peer: PeerAddr,
    req_number: u64,
    cfg: &Config,
) -> Result<Request, HttpError> {
    cgi::check_allowed(&peer, &cfg.uwsgi_allow_ips)?;

    let header = unreader.read_exact_or_eof(4)?;
    if header.is_empty() {
        return Err(HttpError::NoMoreData);
    }
    if header.len() < 4 {
        return Err(HttpError::InvalidGateway("incomplete packet header".into()));
    }
    let modifier1 = header[0];
    let datasize = u16::from_le_bytes([header[1], header[2]]) as usize;
    let _modifier2 = header[3];
    if modifier1 != 0 {
        return Err(HttpError::UnsupportedGateway(format!(
            "uwsgi modifier1 {}",
            modifier1
        )));
    }

    let vars_block = unreader.read_exact_or_eof(datasize)?;
    if vars_block.len() < datasize {
        return Err(HttpError::InvalidGateway("incomplete vars block".into()));
    }
    let vars = parse_vars(&vars_block)?;
    cgi::request_from_vars(vars, peer, req_number, cfg)
}

/// `key_size-LE16 key val_size-LE16 val`, repeated.
fn parse_vars(block: &[u8]) -> Result<Vec<(String, String)>, HttpError> {
    let mut vars = Vec::new();
    let mut pos = 0usize;
    while pos < block.len() {
        if vars.len() >= MAX_UWSGI_VARS {
            return Err(HttpError::InvalidGateway("too many uwsgi vars".into()));
        }
        let key = take_lstring(block, &mut pos)?;
        let value = take_lstring(block, &mut pos)?;
        vars.push((key, value));
    }
    Ok(vars)
}

fn take_lstring(block: &[u8], pos: &mut usize) -> Result<String, HttpError> {
    if *pos + 2 > block.len() {
        return Err(HttpError::InvalidGateway("truncated var size".into()));
    }
    let len = u16::from_le_bytes([block[*pos], block[*pos + 1]]) as usize;
    *pos += 2;
    if *pos + len > block.len() {
        return Err(HttpError::InvalidGateway("truncated var".into()));
    }
    let s = String::from_utf8_lossy(&block[*pos..*pos + len]).into_owned();
    *pos += len;
    Ok(s)
}

/// Serialize a vars block (test and client-side helper).
#[cfg(test)]
pub(crate) fn encode_packet(vars: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut block = Vec::new();
    for (k, v) in vars {
        block.extend_from_slice(&(k.len() as u16).to_le_bytes());
        block.extend_from_slice(k.as_bytes());
        block.extend_from_slice(&(v.len() as u16).to_le_bytes());
        block.extend_from_slice(v.as_bytes());
    }
    let mut out = Vec::with_capacity(4 + block.len() + body.len());
    out.push(0);
    out.extend_from_slice(&(block.len() as u16).to_le_bytes());
    out.push(0);
    out.extend_from_slice(&block);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::http::request::BodyKind;
    use crate::unreader::BufSource;

    fn peer() -> PeerAddr {
        PeerAddr::Tcp("127.0.0.1:6000".parse().unwrap())
    }

    #[test]
    fn parses_packet_and_leaves_body() {
        let cfg = Config::default();
        let packet = encode_packet(
            &[
                ("REQUEST_METHOD", "POST"),
                ("PATH_INFO", "/submit"),
                ("QUERY_STRING", ""),
                ("CONTENT_LENGTH", "5"),
                ("HTTP_HOST", "x"),
            ],
            b"hello",
        );
        let mut u = Unreader::new(BufSource::of(packet));
        let req = parse(&mut u, peer(), 1, &cfg).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/submit");
        assert_eq!(req.body_kind, BodyKind::Length(5));
        assert_eq!(&u.read().unwrap()[..], b"hello");
    }

    #[test]
    fn nonzero_modifier1_unsupported() {
        let cfg = Config::default();
        let mut packet = encode_packet(&[("REQUEST_METHOD", "GET")], b"");
        packet[0] = 5;
        let mut u = Unreader::new(BufSource::of(packet));
        let err = parse(&mut u, peer(), 1, &cfg).unwrap_err();
        assert!(matches!(err, HttpError::UnsupportedGateway(_)));
        assert_eq!(err.status_hint(), 501);
    }

    #[test]
    fn truncated_vars_block_rejected() {
        let cfg = Config::default();
        let packet = encode_packet(&[("REQUEST_METHOD", "GET")], b"");
        let cut = packet.len() - 3;
        let mut u = Unreader::new(BufSource::of(packet[..cut].to_vec()));
        assert!(matches!(
            parse(&mut u, peer(), 1, &cfg).unwrap_err(),
            HttpError::InvalidGateway(_)
        ));
    }

    #[test]
    fn var_count_capped() {
        let cfg = Config::default();
        let vars: Vec<(String, String)> = (0..=MAX_UWSGI_VARS)
            .map(|i| (format!("K{}", i), "v".to_string()))
            .collect();
        let borrowed: Vec<(&str, &str)> =
            vars.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        // The block for this many vars exceeds the LE16 datasize, so build
        // the cap check input directly.
        let mut block = Vec::new();
        for (k, v) in &borrowed {
            block.extend_from_slice(&(k.len() as u16).to_le_bytes());
            block.extend_from_slice(k.as_bytes());
            block.extend_from_slice(&(v.len() as u16).to_le_bytes());
            block.extend_from_slice(v.as_bytes());
        }
        assert!(matches!(
            parse_vars(&block).unwrap_err(),
            HttpError::InvalidGateway(_)
        ));
        let _ = cfg;
    }

    #[test]
    fn disallowed_peer_forbidden() {
        let cfg = Config::default();
        let packet = encode_packet(&[("REQUEST_METHOD", "GET")], b"");
        let mut u = Unreader::new(BufSource::of(packet));
        let outside = PeerAddr::Tcp("198.51.100.2:1".parse().unwrap());
        let err = parse(&mut u, outside, 1, &cfg).unwrap_err();
        assert_eq!(err.status_hint(), 403);
    }
}
