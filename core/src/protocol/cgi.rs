/*
 * cgi.rs
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

//! CGI-variable mapping shared by the uWSGI and FastCGI codecs: translate
//! `REQUEST_METHOD` / `PATH_INFO` / `HTTP_*` variables into the canonical
//! request shape, and enforce the gateway source-IP allow-lists.

use crate::config::{AllowIps, Config};

use super::http::error::HttpError;
use super::http::request::{BodyKind, PeerAddr, Request, Scheme};
use super::http::HeaderList;

/// Reject gateway requests from peers outside the allow-list. Unix-domain
/// peers are always trusted.
pub fn check_allowed(peer: &PeerAddr, allow: &AllowIps) -> Result<(), HttpError> {
    match peer {
        PeerAddr::Unix => Ok(()),
        PeerAddr::Tcp(sa) => {
            if allow.allows(sa.ip()) {
                Ok(())
            } else {
                Err(HttpError::ForbiddenPeer(sa.ip().to_string()))
            }
        }
    }
}

/// Build a [`Request`] from accumulated CGI variables. `HTTP_X_Y` becomes
/// header `X-Y`; `CONTENT_TYPE`/`CONTENT_LENGTH` become their headers;
/// `HTTPS` in {on, 1, true} flips the scheme.
pub fn request_from_vars(
    vars: Vec<(String, String)>,
    peer: PeerAddr,
    req_number: u64,
    cfg: &Config,
) -> Result<Request, HttpError> {
    let mut method = None;
    let mut path = String::from("/");
    let mut query = String::new();
    let mut raw_uri = None;
    let mut version = (1, 1);
    let mut scheme = if cfg.is_ssl { Scheme::Https } else { Scheme::Http };
    let mut server = None;
    let mut server_port = None;
    let mut content_length: Option<u64> = None;
    let mut headers: HeaderList = Vec::new();

    for (name, value) in vars {
        match name.as_str() {
            "REQUEST_METHOD" => method = Some(value),
            "PATH_INFO" | "SCRIPT_URL" => path = value,
            "QUERY_STRING" => query = value,
            "REQUEST_URI" => raw_uri = Some(value),
            "SERVER_PROTOCOL" => {
                if let Some(v) = value.strip_prefix("HTTP/") {
                    let mut halves = v.splitn(2, '.');
                    let major = halves.next().and_then(|d| d.parse().ok());
                    let minor = halves.next().and_then(|d| d.parse().ok());
                    if let (Some(major), Some(minor)) = (major, minor) {
                        version = (major, minor);
                    }
                }
            }
            "SERVER_NAME" => server = Some(value),
            "SERVER_PORT" => server_port = value.parse::<u16>().ok(),
            "CONTENT_TYPE" => headers.push(("CONTENT-TYPE".into(), value)),
            "CONTENT_LENGTH" => {
                if !value.is_empty() {
                    let n: u64 = value
                        .parse()
                        .map_err(|_| HttpError::InvalidContentLength(value.clone()))?;
                    content_length = Some(n);
                    headers.push(("CONTENT-LENGTH".into(), n.to_string()));
                }
            }
            "HTTPS" => {
                if matches!(value.to_ascii_lowercase().as_str(), "on" | "1" | "true") {
                    scheme = Scheme::Https;
                }
            }
            _ => {
                if let Some(header) = name.strip_prefix("HTTP_") {
                    headers.push((header.replace('_', "-"), value));
                }
                // Other CGI vars (DOCUMENT_ROOT etc.) carry no request data.
            }
        }
    }

    let method = method.ok_or_else(|| HttpError::InvalidGateway("REQUEST_METHOD missing".into()))?;
    if method.is_empty() {
        return Err(HttpError::InvalidGateway("REQUEST_METHOD empty".into()));
    }

    let uri = raw_uri.unwrap_or_else(|| {
        if query.is_empty() {
            path.clone()
        } else {
            format!("{}?{}", path, query)
        }
    });
    let body_kind = match content_length {
        Some(0) | None => BodyKind::None,
        Some(n) => BodyKind::Length(n),
    };
    let server = match (server, server_port) {
        (Some(name), Some(port)) => Some((name, port)),
        (Some(name), None) => Some((name, 80)),
        _ => None,
    };

    Ok(Request {
        method,
        uri,
        path,
        query,
        fragment: String::new(),
        version,
        headers,
        trailers: Vec::new(),
        scheme,
        peer_addr: peer.clone(),
        remote_addr: peer,
        proxy_protocol_info: None,
        server,
        req_number,
        body_kind,
        must_close: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerAddr {
        PeerAddr::Tcp("127.0.0.1:7000".parse().unwrap())
    }

    fn vars() -> Vec<(String, String)> {
        [
            ("REQUEST_METHOD", "POST"),
            ("PATH_INFO", "/app/x"),
            ("QUERY_STRING", "a=1"),
            ("SERVER_PROTOCOL", "HTTP/1.1"),
            ("SERVER_NAME", "example"),
            ("SERVER_PORT", "8000"),
            ("CONTENT_TYPE", "text/plain"),
            ("CONTENT_LENGTH", "11"),
            ("HTTP_X_CUSTOM", "yes"),
            ("HTTP_HOST", "example"),
        ]
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn maps_vars_to_request() {
        let cfg = Config::default();
        let req = request_from_vars(vars(), peer(), 1, &cfg).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/app/x");
        assert_eq!(req.query, "a=1");
        assert_eq!(req.uri, "/app/x?a=1");
        assert_eq!(req.version, (1, 1));
        assert_eq!(req.header("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(req.header("X-CUSTOM"), Some("yes"));
        assert_eq!(req.header("HOST"), Some("example"));
        assert_eq!(req.body_kind, BodyKind::Length(11));
        assert_eq!(req.server, Some(("example".into(), 8000)));
    }

    #[test]
    fn https_var_flips_scheme() {
        let cfg = Config::default();
        let mut v = vars();
        v.push(("HTTPS".into(), "on".into()));
        let req = request_from_vars(v, peer(), 1, &cfg).unwrap();
        assert_eq!(req.scheme, Scheme::Https);

        let mut v = vars();
        v.push(("HTTPS".into(), "off".into()));
        let req = request_from_vars(v, peer(), 1, &cfg).unwrap();
        assert_eq!(req.scheme, Scheme::Http);
    }

    #[test]
    fn missing_method_rejected() {
        let cfg = Config::default();
        let v = vec![("PATH_INFO".to_string(), "/".to_string())];
        assert!(matches!(
            request_from_vars(v, peer(), 1, &cfg).unwrap_err(),
            HttpError::InvalidGateway(_)
        ));
    }

    #[test]
    fn allow_list_enforced() {
        let cfg = Config::default();
        assert!(check_allowed(&peer(), &cfg.fastcgi_allow_ips).is_ok());
        let outside = PeerAddr::Tcp("203.0.113.1:9".parse().unwrap());
        assert!(matches!(
            check_allowed(&outside, &cfg.fastcgi_allow_ips).unwrap_err(),
            HttpError::ForbiddenPeer(_)
        ));
        assert!(check_allowed(&PeerAddr::Unix, &cfg.fastcgi_allow_ips).is_ok());
    }
}
