/*
 * proxy.rs
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

//! Proxy-protocol v1: `PROXY TCP4|TCP6 src dst sport dport\r\n`, sent by an
//! upstream load balancer ahead of the first request. Only peers on the
//! `proxy_allow_ips` list may send it; the carried client address replaces
//! the transport peer for everything downstream.

use std::net::{IpAddr, SocketAddr};

use crate::config::Config;

use super::super::error::HttpError;
use super::super::request::{PeerAddr, ProxyInfo};

/// Parse one PROXY line (without CRLF), enforcing the peer allow-list.
pub fn parse_line(
    line: &[u8],
    peer: &PeerAddr,
    cfg: &Config,
) -> Result<ProxyInfo, HttpError> {
    match peer {
        PeerAddr::Unix => {}
        PeerAddr::Tcp(sa) => {
            if !cfg.proxy_allow_ips.allows(sa.ip()) {
                return Err(HttpError::ForbiddenPeer(sa.ip().to_string()));
            }
        }
    }

    let text = std::str::from_utf8(line)
        .map_err(|_| HttpError::InvalidProxyLine(String::from_utf8_lossy(line).into_owned()))?;
    let invalid = || HttpError::InvalidProxyLine(text.to_string());

    let mut parts = text.split(' ');
    if parts.next() != Some("PROXY") {
        return Err(invalid());
    }
    let proto = parts.next().ok_or_else(invalid)?;
    let src = parts.next().ok_or_else(invalid)?;
    let dst = parts.next().ok_or_else(invalid)?;
    let sport = parts.next().ok_or_else(invalid)?;
    let dport = parts.next().ok_or_else(invalid)?;
    if parts.next().is_some() {
        return Err(invalid());
    }

    let src: IpAddr = src.parse().map_err(|_| invalid())?;
    let dst: IpAddr = dst.parse().map_err(|_| invalid())?;
    match proto {
        "TCP4" if src.is_ipv4() && dst.is_ipv4() => {}
        "TCP6" if src.is_ipv6() && dst.is_ipv6() => {}
        _ => return Err(invalid()),
    }
    let sport: u16 = sport.parse().map_err(|_| invalid())?;
    let dport: u16 = dport.parse().map_err(|_| invalid())?;

    Ok(ProxyInfo {
        client_addr: SocketAddr::new(src, sport),
        proxy_addr: SocketAddr::new(dst, dport),
    })
}
