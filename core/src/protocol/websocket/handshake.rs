/*
 * handshake.rs
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

//! WebSocket opening handshake, server side (RFC 6455 §4.2): validate the
//! upgrade request, compute Sec-WebSocket-Accept, build the 101 response.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::fmt;

use crate::util::{http_date, SERVER_TOKEN};

use super::super::http::request::Request;

/// Magic GUID appended to the key (RFC 6455 §4.2.2).
const WS_ACCEPT_MAGIC: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeError {
    NotAnUpgrade,
    MissingKey,
    /// Key does not decode to 16 bytes.
    BadKey,
    BadVersion,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::NotAnUpgrade => write!(f, "not a websocket upgrade request"),
            HandshakeError::MissingKey => write!(f, "missing Sec-WebSocket-Key"),
            HandshakeError::BadKey => write!(f, "Sec-WebSocket-Key is not 16 bytes"),
            HandshakeError::BadVersion => write!(f, "unsupported Sec-WebSocket-Version"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// `base64(SHA1(key ‖ magic))`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_ACCEPT_MAGIC);
    BASE64.encode(hasher.finalize())
}

/// Validated upgrade parameters extracted from the request.
#[derive(Debug)]
pub struct Upgrade {
    pub key: String,
    pub accept: String,
    /// Subprotocols offered by the client, in preference order.
    pub subprotocols: Vec<String>,
}

/// Check the upgrade headers and length-check the key.
pub fn validate_upgrade(req: &Request) -> Result<Upgrade, HandshakeError> {
    if !req.is_websocket_upgrade() {
        return Err(HandshakeError::NotAnUpgrade);
    }
    if let Some(version) = req.header("SEC-WEBSOCKET-VERSION") {
        if version.trim() != "13" {
            return Err(HandshakeError::BadVersion);
        }
    }
    let key = req
        .header("SEC-WEBSOCKET-KEY")
        .ok_or(HandshakeError::MissingKey)?
        .trim()
        .to_string();
    let decoded = BASE64.decode(&key).map_err(|_| HandshakeError::BadKey)?;
    if decoded.len() != 16 {
        return Err(HandshakeError::BadKey);
    }
    let subprotocols = req
        .header("SEC-WEBSOCKET-PROTOCOL")
        .map(|v| v.split(',').map(|p| p.trim().to_string()).collect())
        .unwrap_or_default();
    Ok(Upgrade {
        accept: accept_key(&key),
        key,
        subprotocols,
    })
}

/// Serialize the `101 Switching Protocols` response.
pub fn build_response(upgrade: &Upgrade, subprotocol: Option<&str>) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    out.extend_from_slice(b"Upgrade: websocket\r\nConnection: Upgrade\r\n");
    out.extend_from_slice(b"Sec-WebSocket-Accept: ");
    out.extend_from_slice(upgrade.accept.as_bytes());
    out.extend_from_slice(b"\r\n");
    if let Some(proto) = subprotocol {
        out.extend_from_slice(b"Sec-WebSocket-Protocol: ");
        out.extend_from_slice(proto.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Server: {}\r\nDate: {}\r\n\r\n", SERVER_TOKEN, http_date()).as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::http::h1;
    use crate::protocol::http::request::PeerAddr;
    use crate::unreader::{BufSource, Unreader};

    fn upgrade_request(extra: &str) -> Request {
        let raw = format!(
            "GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n{}\r\n",
            extra
        );
        let cfg = Config::default();
        let mut u = Unreader::new(BufSource::of(raw.into_bytes()));
        h1::parse(&mut u, PeerAddr::Tcp("127.0.0.1:1".parse().unwrap()), 1, &cfg).unwrap()
    }

    #[test]
    fn rfc_sample_accept_key() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn validates_and_builds_101() {
        let req = upgrade_request("");
        let up = validate_upgrade(&req).unwrap();
        assert_eq!(up.accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        let resp = build_response(&up, None);
        let text = String::from_utf8(resp).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    }

    #[test]
    fn subprotocols_parsed_and_echoed() {
        let req = upgrade_request("Sec-WebSocket-Protocol: chat, superchat\r\n");
        let up = validate_upgrade(&req).unwrap();
        assert_eq!(up.subprotocols, vec!["chat", "superchat"]);
        let resp = build_response(&up, Some("chat"));
        assert!(String::from_utf8(resp)
            .unwrap()
            .contains("Sec-WebSocket-Protocol: chat\r\n"));
    }

    #[test]
    fn short_key_rejected() {
        let raw = "GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: c2hvcnQ=\r\n\r\n";
        let cfg = Config::default();
        let mut u = Unreader::new(BufSource::of(&raw.as_bytes()[..]));
        let req = h1::parse(&mut u, PeerAddr::Unix, 1, &cfg).unwrap();
        assert_eq!(validate_upgrade(&req).unwrap_err(), HandshakeError::BadKey);
    }

    #[test]
    fn plain_request_is_not_upgrade() {
        let raw = "GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let cfg = Config::default();
        let mut u = Unreader::new(BufSource::of(&raw.as_bytes()[..]));
        let req = h1::parse(&mut u, PeerAddr::Unix, 1, &cfg).unwrap();
        assert_eq!(
            validate_upgrade(&req).unwrap_err(),
            HandshakeError::NotAnUpgrade
        );
    }
}
