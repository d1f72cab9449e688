/*
 * request.rs
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

//! The parsed request: method, URI components, version, ordered headers,
//! framing metadata and peer identity. Immutable after parse apart from body
//! consumption (which lives in the body readers, not here).

use std::net::SocketAddr;

use percent_encoding::percent_decode_str;

use crate::config::Config;

use super::HeaderList;

/// Peer identity of a connection. Unix-domain peers have no address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix,
}

impl PeerAddr {
    pub fn ip_string(&self) -> String {
        match self {
            PeerAddr::Tcp(sa) => sa.ip().to_string(),
            PeerAddr::Unix => String::new(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            PeerAddr::Tcp(sa) => sa.port(),
            PeerAddr::Unix => 0,
        }
    }

    pub fn ip(&self) -> Option<std::net::IpAddr> {
        match self {
            PeerAddr::Tcp(sa) => Some(sa.ip()),
            PeerAddr::Unix => None,
        }
    }
}

/// Request scheme as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Body framing determined at parse time (RFC 9112 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body (neither framing header present, or Content-Length: 0).
    None,
    Length(u64),
    Chunked,
}

/// Client address recorded from a proxy-protocol v1 prelude.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub client_addr: SocketAddr,
    pub proxy_addr: SocketAddr,
}

/// A parsed request, protocol-independent: HTTP/1 parsing, the HTTP/2
/// connection and the uWSGI/FastCGI codecs all produce this shape.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    /// The URI exactly as received.
    pub uri: String,
    pub path: String,
    pub query: String,
    pub fragment: String,
    pub version: (u8, u8),
    pub headers: HeaderList,
    pub trailers: HeaderList,
    pub scheme: Scheme,
    /// Transport peer.
    pub peer_addr: PeerAddr,
    /// Effective client (post proxy-protocol rewrite).
    pub remote_addr: PeerAddr,
    pub proxy_protocol_info: Option<ProxyInfo>,
    /// Listener name the connection arrived on.
    pub server: Option<(String, u16)>,
    /// 1-based request counter on the connection.
    pub req_number: u64,
    pub body_kind: BodyKind,
    /// Forces connection close regardless of the Connection header.
    pub must_close: bool,
}

impl Request {
    /// First value of a header, by canonical upper-cased name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Connection-close computation: `Connection: close` forces close,
    /// `keep-alive` forces keep-alive, otherwise 1.1 keeps and 1.0 closes.
    pub fn should_close(&self) -> bool {
        if self.must_close {
            return true;
        }
        if let Some(v) = self.header("CONNECTION") {
            match v.trim().to_ascii_lowercase().as_str() {
                "close" => return true,
                "keep-alive" => return false,
                _ => {}
            }
        }
        self.version < (1, 1)
    }

    /// True for a well-formed `Connection: Upgrade` + `Upgrade: websocket`.
    pub fn is_websocket_upgrade(&self) -> bool {
        let conn_upgrade = self
            .header("CONNECTION")
            .map(|v| {
                v.split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false);
        let upgrade_ws = self
            .header("UPGRADE")
            .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        conn_upgrade && upgrade_ws
    }

    /// CGI-style variables for the application: `REQUEST_METHOD`,
    /// `PATH_INFO` (percent-decoded), `HTTP_*` and friends. The engine adds
    /// the non-string parts (input stream, error stream) itself.
    pub fn cgi_environ(&self, cfg: &Config) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(self.headers.len() + 10);
        env.push(("REQUEST_METHOD".into(), self.method.clone()));
        env.push(("SCRIPT_NAME".into(), cfg.root_path.clone()));
        let path_info = percent_decode_str(&self.path)
            .decode_utf8()
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| self.path.clone());
        env.push(("PATH_INFO".into(), path_info));
        env.push(("QUERY_STRING".into(), self.query.clone()));
        env.push(("RAW_URI".into(), self.uri.clone()));
        env.push((
            "SERVER_PROTOCOL".into(),
            format!("HTTP/{}.{}", self.version.0, self.version.1),
        ));
        if let Some((name, port)) = &self.server {
            env.push(("SERVER_NAME".into(), name.clone()));
            env.push(("SERVER_PORT".into(), port.to_string()));
        }
        env.push(("REMOTE_ADDR".into(), self.remote_addr.ip_string()));
        env.push(("REMOTE_PORT".into(), self.remote_addr.port().to_string()));
        for (name, value) in &self.headers {
            match name.as_str() {
                "CONTENT-TYPE" => env.push(("CONTENT_TYPE".into(), value.clone())),
                "CONTENT-LENGTH" => env.push(("CONTENT_LENGTH".into(), value.clone())),
                _ => env.push((format!("HTTP_{}", name.replace('-', "_")), value.clone())),
            }
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request {
            method: "GET".into(),
            uri: "/a%20b?x=1".into(),
            path: "/a%20b".into(),
            query: "x=1".into(),
            fragment: String::new(),
            version: (1, 1),
            headers: vec![
                ("HOST".into(), "example".into()),
                ("CONTENT-LENGTH".into(), "0".into()),
                ("X-THING".into(), "yes".into()),
            ],
            trailers: Vec::new(),
            scheme: Scheme::Http,
            peer_addr: PeerAddr::Tcp("127.0.0.1:9999".parse().unwrap()),
            remote_addr: PeerAddr::Tcp("127.0.0.1:9999".parse().unwrap()),
            proxy_protocol_info: None,
            server: Some(("127.0.0.1".into(), 80)),
            req_number: 1,
            body_kind: BodyKind::None,
            must_close: false,
        }
    }

    #[test]
    fn close_defaults_by_version() {
        let mut req = request();
        assert!(!req.should_close());
        req.version = (1, 0);
        assert!(req.should_close());
    }

    #[test]
    fn connection_header_wins() {
        let mut req = request();
        req.headers.push(("CONNECTION".into(), "close".into()));
        assert!(req.should_close());

        let mut req = request();
        req.version = (1, 0);
        req.headers.push(("CONNECTION".into(), "Keep-Alive".into()));
        assert!(!req.should_close());
    }

    #[test]
    fn must_close_overrides() {
        let mut req = request();
        req.headers.push(("CONNECTION".into(), "keep-alive".into()));
        req.must_close = true;
        assert!(req.should_close());
    }

    #[test]
    fn environ_mapping() {
        let req = request();
        let cfg = Config::default();
        let env = req.cgi_environ(&cfg);
        let get = |k: &str| {
            env.iter()
                .find(|(n, _)| n == k)
                .map(|(_, v)| v.as_str())
                .unwrap_or("")
        };
        assert_eq!(get("REQUEST_METHOD"), "GET");
        assert_eq!(get("PATH_INFO"), "/a b");
        assert_eq!(get("RAW_URI"), "/a%20b?x=1");
        assert_eq!(get("QUERY_STRING"), "x=1");
        assert_eq!(get("CONTENT_LENGTH"), "0");
        assert_eq!(get("HTTP_X_THING"), "yes");
        assert_eq!(get("HTTP_HOST"), "example");
        assert!(env.iter().all(|(n, _)| n != "HTTP_CONTENT_LENGTH"));
    }

    #[test]
    fn websocket_upgrade_detection() {
        let mut req = request();
        assert!(!req.is_websocket_upgrade());
        req.headers.push(("CONNECTION".into(), "keep-alive, Upgrade".into()));
        req.headers.push(("UPGRADE".into(), "WebSocket".into()));
        assert!(req.is_websocket_upgrade());
    }
}
