/*
 * parser.rs
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

//! HTTP/1.x request parser: request line, headers, framing metadata.
//!
//! Lexing is strict per RFC 9110/9112; every relaxation is an explicit
//! configuration switch. The pull drivers (sync and async) accumulate bytes
//! from an Unreader and hand complete slices to the pure lexers below, so
//! trailer parsing and the async engine reuse the same rules.

use bytes::BytesMut;
use memchr::memmem;
use tokio::io::AsyncRead;

use crate::config::{Config, HeaderMapPolicy};
use crate::unreader::{AsyncUnreader, Source, Unreader};
use crate::util::is_token;

use super::super::error::HttpError;
use super::super::request::{BodyKind, PeerAddr, Request, Scheme};
use super::super::HeaderList;
use super::proxy;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Longest conventional method token (`methre` bound in the original).
const MAX_METHOD_LEN: usize = 20;
/// Bound applied when `permit_unconventional_http_method` is on.
const MAX_METHOD_LEN_RELAXED: usize = 100;
/// Longest well-formed proxy-protocol v1 line including CRLF.
const MAX_PROXY_LINE: usize = 107;

/// Parse one request from the unreader. Over-read bytes are returned to the
/// unreader, so the next request (pipelining) or the body reader starts
/// exactly where this one stopped.
pub fn parse<S: Source>(
    unreader: &mut Unreader<S>,
    peer: PeerAddr,
    req_number: u64,
    cfg: &Config,
) -> Result<Request, HttpError> {
    let mut buf = BytesMut::new();

    // Proxy-protocol v1 prelude: first request on the connection only.
    let mut proxy_info = None;
    if req_number == 1 && cfg.proxy_protocol {
        fill_to(unreader, &mut buf, 6)?;
        if buf.len() >= 6 && &buf[..6] == b"PROXY " {
            let idx = read_until(unreader, &mut buf, CRLF, MAX_PROXY_LINE, || {
                HttpError::InvalidProxyLine("line too long".into())
            })?;
            let line = buf.split_to(idx + 2);
            proxy_info = Some(proxy::parse_line(&line[..idx], &peer, cfg)?);
        }
    }

    // Request line.
    let idx = read_until(unreader, &mut buf, CRLF, cfg.limit_request_line, || {
        HttpError::LimitRequestLine {
            size: cfg.limit_request_line + 1,
            limit: cfg.limit_request_line,
        }
    })?;
    let line = buf.split_to(idx + 2);
    let (method, uri, version) = parse_request_line(&line[..idx], cfg)?;

    // Header block, terminated by CRLFCRLF (or an immediate CRLF).
    let headers = if buf.len() >= 2 && &buf[..2] == CRLF {
        let _ = buf.split_to(2);
        Vec::new()
    } else {
        let cap = header_block_cap(cfg);
        let idx = read_until(unreader, &mut buf, HEADER_END, cap, || {
            HttpError::LimitRequestFieldSize {
                size: cap + 1,
                limit: cfg.limit_request_field_size,
            }
        })?;
        let block = buf.split_to(idx + 4);
        parse_header_block(&block[..idx], cfg)?
    };

    unreader.unread(&buf);
    finish(method, uri, version, headers, peer, proxy_info, req_number, cfg)
}

/// Async rendition of [`parse`]; identical rules, suspension on socket reads.
pub async fn parse_async<R: AsyncRead + Unpin>(
    unreader: &mut AsyncUnreader<R>,
    peer: PeerAddr,
    req_number: u64,
    cfg: &Config,
) -> Result<Request, HttpError> {
    let mut buf = BytesMut::new();

    let mut proxy_info = None;
    if req_number == 1 && cfg.proxy_protocol {
        fill_to_async(unreader, &mut buf, 6).await?;
        if buf.len() >= 6 && &buf[..6] == b"PROXY " {
            let idx = read_until_async(unreader, &mut buf, CRLF, MAX_PROXY_LINE, || {
                HttpError::InvalidProxyLine("line too long".into())
            })
            .await?;
            let line = buf.split_to(idx + 2);
            proxy_info = Some(proxy::parse_line(&line[..idx], &peer, cfg)?);
        }
    }

    let idx = read_until_async(unreader, &mut buf, CRLF, cfg.limit_request_line, || {
        HttpError::LimitRequestLine {
            size: cfg.limit_request_line + 1,
            limit: cfg.limit_request_line,
        }
    })
    .await?;
    let line = buf.split_to(idx + 2);
    let (method, uri, version) = parse_request_line(&line[..idx], cfg)?;

    let headers = if buf.len() >= 2 && &buf[..2] == CRLF {
        let _ = buf.split_to(2);
        Vec::new()
    } else {
        let cap = header_block_cap(cfg);
        let idx = read_until_async(unreader, &mut buf, HEADER_END, cap, || {
            HttpError::LimitRequestFieldSize {
                size: cap + 1,
                limit: cfg.limit_request_field_size,
            }
        })
        .await?;
        let block = buf.split_to(idx + 4);
        parse_header_block(&block[..idx], cfg)?
    };

    unreader.unread(&buf);
    finish(method, uri, version, headers, peer, proxy_info, req_number, cfg)
}

#[allow(clippy::too_many_arguments)]
fn finish(
    method: String,
    uri: String,
    version: (u8, u8),
    headers: HeaderList,
    peer: PeerAddr,
    proxy_info: Option<super::super::request::ProxyInfo>,
    req_number: u64,
    cfg: &Config,
) -> Result<Request, HttpError> {
    let (path, query, fragment) = split_uri(&uri)?;
    let scheme = resolve_scheme(&headers, &peer, cfg)?;
    let (body_kind, must_close) = body_framing(version, &headers)?;

    let remote_addr = match &proxy_info {
        Some(info) => PeerAddr::Tcp(info.client_addr),
        None => peer.clone(),
    };

    Ok(Request {
        method,
        uri,
        path,
        query,
        fragment,
        version,
        headers,
        trailers: Vec::new(),
        scheme,
        peer_addr: peer,
        remote_addr,
        proxy_protocol_info: proxy_info,
        server: None,
        req_number,
        body_kind,
        must_close,
    })
}

/// Upper bound on the accumulated header block before CRLFCRLF shows up.
fn header_block_cap(cfg: &Config) -> usize {
    cfg.limit_request_fields
        .saturating_mul(cfg.limit_request_field_size.saturating_add(4))
}

// ---------------------------------------------------------------------------
// Pull helpers
// ---------------------------------------------------------------------------

fn fill_to<S: Source>(
    unreader: &mut Unreader<S>,
    buf: &mut BytesMut,
    n: usize,
) -> Result<(), HttpError> {
    while buf.len() < n {
        let chunk = unreader.read()?;
        if chunk.is_empty() {
            // EOF before even a prefix; idle keepalive close shows up here.
            if buf.is_empty() {
                return Err(HttpError::NoMoreData);
            }
            return Ok(());
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(())
}

fn read_until<S: Source>(
    unreader: &mut Unreader<S>,
    buf: &mut BytesMut,
    needle: &[u8],
    limit: usize,
    over: impl Fn() -> HttpError,
) -> Result<usize, HttpError> {
    loop {
        if let Some(idx) = memmem::find(buf, needle) {
            if idx > limit {
                return Err(over());
            }
            return Ok(idx);
        }
        if buf.len() > limit + needle.len() {
            return Err(over());
        }
        let chunk = unreader.read()?;
        if chunk.is_empty() {
            return Err(HttpError::NoMoreData);
        }
        buf.extend_from_slice(&chunk);
    }
}

async fn fill_to_async<R: AsyncRead + Unpin>(
    unreader: &mut AsyncUnreader<R>,
    buf: &mut BytesMut,
    n: usize,
) -> Result<(), HttpError> {
    while buf.len() < n {
        let chunk = unreader.read().await?;
        if chunk.is_empty() {
            if buf.is_empty() {
                return Err(HttpError::NoMoreData);
            }
            return Ok(());
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(())
}

async fn read_until_async<R: AsyncRead + Unpin>(
    unreader: &mut AsyncUnreader<R>,
    buf: &mut BytesMut,
    needle: &[u8],
    limit: usize,
    over: impl Fn() -> HttpError,
) -> Result<usize, HttpError> {
    loop {
        if let Some(idx) = memmem::find(buf, needle) {
            if idx > limit {
                return Err(over());
            }
            return Ok(idx);
        }
        if buf.len() > limit + needle.len() {
            return Err(over());
        }
        let chunk = unreader.read().await?;
        if chunk.is_empty() {
            return Err(HttpError::NoMoreData);
        }
        buf.extend_from_slice(&chunk);
    }
}

// ---------------------------------------------------------------------------
// Pure lexers
// ---------------------------------------------------------------------------

/// Lex `METHOD SP request-target SP HTTP/d.d`. Exactly one SP between parts.
pub(crate) fn parse_request_line(
    line: &[u8],
    cfg: &Config,
) -> Result<(String, String, (u8, u8)), HttpError> {
    let as_lossy = || String::from_utf8_lossy(line).into_owned();

    let mut parts = line.splitn(3, |&b| b == b' ');
    let method = parts.next().filter(|p| !p.is_empty());
    let uri = parts.next().filter(|p| !p.is_empty());
    let version = parts.next().filter(|p| !p.is_empty());
    let (method, uri, version) = match (method, uri, version) {
        (Some(m), Some(u), Some(v)) => (m, u, v),
        _ => return Err(HttpError::InvalidRequestLine(as_lossy())),
    };
    if uri.contains(&b' ') || version.contains(&b' ') {
        return Err(HttpError::InvalidRequestLine(as_lossy()));
    }

    let method = parse_method(method, cfg)?;
    let uri = std::str::from_utf8(uri)
        .map_err(|_| HttpError::InvalidUri(as_lossy()))?
        .to_string();
    let version = parse_version(version, cfg)?;
    Ok((method, uri, version))
}

fn parse_method(raw: &[u8], cfg: &Config) -> Result<String, HttpError> {
    let lossy = || String::from_utf8_lossy(raw).into_owned();
    if !is_token(raw) {
        return Err(HttpError::InvalidRequestMethod(lossy()));
    }
    let max = if cfg.permit_unconventional_http_method {
        MAX_METHOD_LEN_RELAXED
    } else {
        MAX_METHOD_LEN
    };
    if raw.len() > max {
        return Err(HttpError::InvalidRequestMethod(lossy()));
    }
    let mut method = String::from_utf8_lossy(raw).into_owned();
    if method.bytes().any(|b| b.is_ascii_lowercase()) {
        if cfg.casefold_http_method {
            method.make_ascii_uppercase();
        } else if !cfg.permit_unconventional_http_method {
            return Err(HttpError::InvalidRequestMethod(lossy()));
        }
    }
    Ok(method)
}

fn parse_version(raw: &[u8], cfg: &Config) -> Result<(u8, u8), HttpError> {
    let lossy = || String::from_utf8_lossy(raw).into_owned();
    let rest = raw
        .strip_prefix(b"HTTP/")
        .ok_or_else(|| HttpError::InvalidHttpVersion(lossy()))?;
    let mut halves = rest.splitn(2, |&b| b == b'.');
    let major = halves.next().unwrap_or_default();
    let minor = halves.next().unwrap_or_default();
    if major.is_empty()
        || minor.is_empty()
        || !major.iter().all(u8::is_ascii_digit)
        || !minor.iter().all(u8::is_ascii_digit)
    {
        return Err(HttpError::InvalidHttpVersion(lossy()));
    }
    let parse = |d: &[u8]| -> Result<u8, HttpError> {
        std::str::from_utf8(d)
            .ok()
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or_else(|| HttpError::InvalidHttpVersion(lossy()))
    };
    let version = (parse(major)?, parse(minor)?);
    if !cfg.permit_unconventional_http_version && !(version >= (1, 0) && version < (2, 0)) {
        return Err(HttpError::InvalidHttpVersion(lossy()));
    }
    Ok(version)
}

/// Split a request-target into (path, query, fragment). Handles origin-form,
/// absolute-form, authority-form and the asterisk-form.
pub(crate) fn split_uri(uri: &str) -> Result<(String, String, String), HttpError> {
    if uri.is_empty() {
        return Err(HttpError::InvalidUri(uri.into()));
    }
    let (rest, fragment) = match uri.split_once('#') {
        Some((r, f)) => (r, f.to_string()),
        None => (uri, String::new()),
    };
    let (target, query) = match rest.split_once('?') {
        Some((t, q)) => (t, q.to_string()),
        None => (rest, String::new()),
    };
    let path = if target.starts_with('/') || target == "*" {
        target.to_string()
    } else if let Some(scheme_end) = target.find("://") {
        // Absolute-form: path starts at the first slash past the authority.
        let after = &target[scheme_end + 3..];
        match after.find('/') {
            Some(i) => after[i..].to_string(),
            None => String::new(),
        }
    } else {
        // Authority-form (CONNECT) carries no path.
        String::new()
    };
    Ok((path, query, fragment))
}

/// Lex a CRLF-separated header block (without the terminating CRLFCRLF).
/// Also used for chunked-body trailers.
pub(crate) fn parse_header_block(block: &[u8], cfg: &Config) -> Result<HeaderList, HttpError> {
    let mut headers: HeaderList = Vec::new();
    let mut lines = block.split_str_crlf();

    let mut current: Option<(String, String)> = None;
    for line in &mut lines {
        if line.len() > cfg.limit_request_field_size {
            return Err(HttpError::LimitRequestFieldSize {
                size: line.len(),
                limit: cfg.limit_request_field_size,
            });
        }
        if line.first() == Some(&b' ') || line.first() == Some(&b'\t') {
            // Obsolete line folding.
            if !cfg.permit_obsolete_folding {
                return Err(HttpError::ObsoleteFolding);
            }
            let Some((_, value)) = current.as_mut() else {
                return Err(HttpError::InvalidHeader(
                    String::from_utf8_lossy(line).into_owned(),
                ));
            };
            value.push(' ');
            value.push_str(trim_ows(line));
            continue;
        }
        if let Some(header) = current.take() {
            push_header(&mut headers, header, cfg)?;
        }
        current = Some(parse_header_line(line, cfg)?);
        if headers.len() >= cfg.limit_request_fields {
            return Err(HttpError::LimitRequestFields {
                limit: cfg.limit_request_fields,
            });
        }
    }
    if let Some(header) = current.take() {
        push_header(&mut headers, header, cfg)?;
    }
    if headers.len() > cfg.limit_request_fields {
        return Err(HttpError::LimitRequestFields {
            limit: cfg.limit_request_fields,
        });
    }
    Ok(headers)
}

fn parse_header_line(line: &[u8], cfg: &Config) -> Result<(String, String), HttpError> {
    let lossy = || String::from_utf8_lossy(line).into_owned();
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| HttpError::InvalidHeader(lossy()))?;
    let (mut name, value) = (&line[..colon], &line[colon + 1..]);

    // Whitespace between the field name and the colon smuggles headers past
    // intermediaries; strict mode rejects it.
    if name.last() == Some(&b' ') || name.last() == Some(&b'\t') {
        if !cfg.strip_header_spaces {
            return Err(HttpError::InvalidHeaderName(
                String::from_utf8_lossy(name).into_owned(),
            ));
        }
        while let Some((&b' ' | &b'\t', rest)) = name.split_last() {
            name = rest;
        }
    }
    if !is_token(name) {
        return Err(HttpError::InvalidHeaderName(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    if value.iter().any(|&b| b == 0 || b == b'\r' || b == b'\n') {
        return Err(HttpError::InvalidHeader(lossy()));
    }
    let name = std::str::from_utf8(name).unwrap_or_default().to_ascii_uppercase();
    let value = trim_ows(value).to_string();
    Ok((name, value))
}

/// Apply the underscore policy, then append.
fn push_header(
    headers: &mut HeaderList,
    (name, value): (String, String),
    cfg: &Config,
) -> Result<(), HttpError> {
    if name.contains('_') && !cfg.forwarder_headers.iter().any(|h| h == &name) {
        match cfg.header_map {
            HeaderMapPolicy::Refuse => return Err(HttpError::InvalidHeaderName(name)),
            HeaderMapPolicy::Drop => return Ok(()),
            HeaderMapPolicy::Dangerous => {}
        }
    }
    headers.push((name, value));
    Ok(())
}

fn trim_ows(v: &[u8]) -> &str {
    let start = v.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(v.len());
    let end = v.iter().rposition(|&b| b != b' ' && b != b'\t').map_or(start, |i| i + 1);
    std::str::from_utf8(&v[start..end]).unwrap_or_default()
}

/// Scheme resolution: TLS transport wins; otherwise a configured
/// secure-scheme header from a trusted peer flips to https. Conflicting
/// values across configured headers are a hard error.
fn resolve_scheme(
    headers: &HeaderList,
    peer: &PeerAddr,
    cfg: &Config,
) -> Result<Scheme, HttpError> {
    if cfg.is_ssl {
        return Ok(Scheme::Https);
    }
    let trusted = match peer {
        PeerAddr::Unix => true,
        PeerAddr::Tcp(sa) => cfg.forwarded_allow_ips.allows(sa.ip()),
    };
    if !trusted {
        return Ok(Scheme::Http);
    }
    let mut scheme = None;
    for (name, value) in headers {
        if let Some(expect) = cfg.secure_scheme_headers.get(name) {
            let this = if value == expect { Scheme::Https } else { Scheme::Http };
            match scheme {
                None => scheme = Some(this),
                Some(prev) if prev != this => return Err(HttpError::InvalidSchemeHeaders),
                Some(_) => {}
            }
        }
    }
    Ok(scheme.unwrap_or(Scheme::Http))
}

/// Body framing per RFC 9112 §6, plus the legacy `Sec-WebSocket-Key1`
/// 8-byte body. Returns the framing and whether the connection must close
/// after this response.
pub(crate) fn body_framing(
    version: (u8, u8),
    headers: &HeaderList,
) -> Result<(BodyKind, bool), HttpError> {
    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut must_close = false;
    let mut saw_te = false;
    let mut legacy_ws_key = false;

    for (name, value) in headers {
        match name.as_str() {
            "CONTENT-LENGTH" => {
                if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(HttpError::InvalidContentLength(value.clone()));
                }
                let n: u64 = value
                    .parse()
                    .map_err(|_| HttpError::InvalidContentLength(value.clone()))?;
                match content_length {
                    Some(prev) if prev != n => {
                        return Err(HttpError::InvalidContentLength(value.clone()))
                    }
                    _ => content_length = Some(n),
                }
            }
            "TRANSFER-ENCODING" => {
                saw_te = true;
                for coding in value.split(',') {
                    match coding.trim().to_ascii_lowercase().as_str() {
                        "chunked" => {
                            if version != (1, 1) {
                                return Err(HttpError::InvalidBodyFraming);
                            }
                            chunked = true;
                        }
                        "identity" => {}
                        "compress" | "deflate" | "gzip" => must_close = true,
                        other => {
                            return Err(HttpError::UnsupportedTransferCoding(other.into()))
                        }
                    }
                }
            }
            "SEC-WEBSOCKET-KEY1" => legacy_ws_key = true,
            _ => {}
        }
    }

    if chunked && content_length.is_some() {
        return Err(HttpError::InvalidBodyFraming);
    }
    let kind = if chunked {
        BodyKind::Chunked
    } else if let Some(n) = content_length {
        if n == 0 {
            BodyKind::None
        } else {
            BodyKind::Length(n)
        }
    } else if legacy_ws_key && !saw_te {
        BodyKind::Length(8)
    } else {
        BodyKind::None
    };
    Ok((kind, must_close))
}

/// Iterator over CRLF-separated lines of a header block.
trait SplitCrlf {
    fn split_str_crlf(&self) -> CrlfLines<'_>;
}

impl SplitCrlf for [u8] {
    fn split_str_crlf(&self) -> CrlfLines<'_> {
        CrlfLines { rest: Some(self) }
    }
}

struct CrlfLines<'a> {
    rest: Option<&'a [u8]>,
}

impl<'a> Iterator for CrlfLines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let rest = self.rest?;
        match memmem::find(rest, CRLF) {
            Some(i) => {
                self.rest = Some(&rest[i + 2..]);
                Some(&rest[..i])
            }
            None => {
                self.rest = None;
                if rest.is_empty() {
                    None
                } else {
                    Some(rest)
                }
            }
        }
    }
}
