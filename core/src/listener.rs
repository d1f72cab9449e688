/*
 * listener.rs
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

//! The listener set: address parsing, socket creation, fd inheritance
//! across fork and exec. Listeners are bound once by the supervisor and
//! shared by every worker; they are never closed while a worker exists.

use std::fmt;
use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};

use crate::config::Config;
use crate::util::set_cloexec;

/// Environment variable carrying inherited listener fds across a binary
/// upgrade: `FORCHETTA_FD=3,4,5`.
pub const FD_ENV: &str = "FORCHETTA_FD";

/// A parsed bind address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp(SocketAddr),
    Unix(PathBuf),
    /// An already-open descriptor (`fd://N`).
    Fd(RawFd),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(sa) => write!(f, "http://{}", sa),
            Address::Unix(p) => write!(f, "unix:{}", p.display()),
            Address::Fd(fd) => write!(f, "fd://{}", fd),
        }
    }
}

impl Address {
    /// Parse `unix:/path`, `host:port`, `[v6]:port`, `tcp://host:port`,
    /// `fd://N`. A bare `:port` binds the wildcard address.
    pub fn parse(s: &str) -> io::Result<Address> {
        let s = s.trim();
        let invalid =
            || io::Error::new(io::ErrorKind::InvalidInput, format!("bad address {:?}", s));
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Address::Unix(PathBuf::from(path)));
        }
        if let Some(fd) = s.strip_prefix("fd://") {
            return fd.parse::<RawFd>().map(Address::Fd).map_err(|_| invalid());
        }
        let hostport = s.strip_prefix("tcp://").unwrap_or(s);
        let hostport = if let Some(port) = hostport.strip_prefix(':') {
            format!("0.0.0.0:{}", port)
        } else {
            hostport.to_string()
        };
        hostport
            .parse::<SocketAddr>()
            .map(Address::Tcp)
            .map_err(|_| invalid())
    }
}

/// A bound listening socket plus the address it was created from.
#[derive(Debug)]
pub enum Listener {
    Tcp { addr: SocketAddr, sock: TcpListener },
    Unix { path: PathBuf, sock: UnixListener },
}

impl Listener {
    /// Bind one address with the standard socket options: `SO_REUSEADDR`,
    /// `SO_REUSEPORT` where available, `TCP_NODELAY` on accepted peers (set
    /// per connection), configurable backlog, and `FD_CLOEXEC` (cleared
    /// only around exec during binary upgrade).
    pub fn bind(address: &Address, cfg: &Config) -> io::Result<Listener> {
        match address {
            Address::Tcp(addr) => {
                let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
                let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
                socket.set_reuse_address(true)?;
                #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
                socket.set_reuse_port(true)?;
                socket.bind(&(*addr).into())?;
                socket.listen(cfg.backlog)?;
                let sock: TcpListener = socket.into();
                set_cloexec(sock.as_raw_fd(), true)?;
                let addr = sock.local_addr()?;
                Ok(Listener::Tcp { addr, sock })
            }
            Address::Unix(path) => {
                // A previous run's socket file blocks bind; remove it.
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                let sock = UnixListener::bind(path)?;
                fs::set_permissions(path, fs::Permissions::from_mode(0o666))?;
                set_cloexec(sock.as_raw_fd(), true)?;
                Ok(Listener::Unix {
                    path: path.clone(),
                    sock,
                })
            }
            Address::Fd(fd) => Listener::from_fd(*fd),
        }
    }

    /// Adopt an inherited descriptor (binary upgrade, `fd://N`).
    pub fn from_fd(fd: RawFd) -> io::Result<Listener> {
        set_cloexec(fd, true)?;
        // Probe the socket family via getsockname.
        let sock = unsafe { TcpListener::from_raw_fd(fd) };
        match sock.local_addr() {
            Ok(addr) => Ok(Listener::Tcp { addr, sock }),
            Err(_) => {
                let fd = sock.into_raw_fd();
                let sock = unsafe { UnixListener::from_raw_fd(fd) };
                let path = sock
                    .local_addr()
                    .ok()
                    .and_then(|a| a.as_pathname().map(PathBuf::from))
                    .unwrap_or_default();
                Ok(Listener::Unix { path, sock })
            }
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp { sock, .. } => sock.as_raw_fd(),
            Listener::Unix { sock, .. } => sock.as_raw_fd(),
        }
    }

    /// Listener identity for diffing across a reload.
    pub fn address(&self) -> Address {
        match self {
            Listener::Tcp { addr, .. } => Address::Tcp(*addr),
            Listener::Unix { path, .. } => Address::Unix(path.clone()),
        }
    }

    /// The (name, port) pair exposed to applications as SERVER_NAME/PORT.
    pub fn server_name(&self) -> (String, u16) {
        match self {
            Listener::Tcp { addr, .. } => (addr.ip().to_string(), addr.port()),
            Listener::Unix { path, .. } => (path.display().to_string(), 0),
        }
    }

    /// Remove the socket file of a Unix listener being retired.
    pub fn cleanup(&self) {
        if let Listener::Unix { path, .. } = self {
            let _ = fs::remove_file(path);
        }
    }
}

/// Format the fd-inherit env value for a listener set.
pub fn fd_env_value(listeners: &[Listener]) -> String {
    listeners
        .iter()
        .map(|l| l.raw_fd().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Recover listeners named by the fd-inherit env var, if set.
pub fn inherited_fds() -> io::Result<Vec<RawFd>> {
    match std::env::var(FD_ENV) {
        Ok(value) => value
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<RawFd>().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("bad {} entry {:?}", FD_ENV, s),
                    )
                })
            })
            .collect(),
        Err(_) => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_forms() {
        assert_eq!(
            Address::parse("127.0.0.1:8000").unwrap(),
            Address::Tcp("127.0.0.1:8000".parse().unwrap())
        );
        assert_eq!(
            Address::parse("tcp://0.0.0.0:80").unwrap(),
            Address::Tcp("0.0.0.0:80".parse().unwrap())
        );
        assert_eq!(
            Address::parse("[::1]:8000").unwrap(),
            Address::Tcp("[::1]:8000".parse().unwrap())
        );
        assert_eq!(
            Address::parse(":9000").unwrap(),
            Address::Tcp("0.0.0.0:9000".parse().unwrap())
        );
    }

    #[test]
    fn parses_unix_and_fd_forms() {
        assert_eq!(
            Address::parse("unix:/tmp/app.sock").unwrap(),
            Address::Unix(PathBuf::from("/tmp/app.sock"))
        );
        assert_eq!(Address::parse("fd://3").unwrap(), Address::Fd(3));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("unix:").is_err());
        assert!(Address::parse("fd://x").is_err());
        assert!(Address::parse("nonsense").is_err());
    }

    #[test]
    fn binds_ephemeral_tcp() {
        let cfg = Config::default();
        let listener =
            Listener::bind(&Address::parse("127.0.0.1:0").unwrap(), &cfg).unwrap();
        let (name, port) = listener.server_name();
        assert_eq!(name, "127.0.0.1");
        assert_ne!(port, 0);
        assert!(matches!(listener.address(), Address::Tcp(_)));
    }

    #[test]
    fn binds_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.sock");
        let cfg = Config::default();
        let listener = Listener::bind(&Address::Unix(path.clone()), &cfg).unwrap();
        assert!(path.exists());
        listener.cleanup();
        assert!(!path.exists());
    }

    #[test]
    fn fd_env_roundtrip() {
        let cfg = Config::default();
        let l = Listener::bind(&Address::parse("127.0.0.1:0").unwrap(), &cfg).unwrap();
        let value = fd_env_value(std::slice::from_ref(&l));
        assert_eq!(value, l.raw_fd().to_string());
    }
}
