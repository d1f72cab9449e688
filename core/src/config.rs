/*
 * config.rs
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

//! Server configuration: the option registry consumed by the core, plus the
//! lifecycle hooks as typed callback fields. Loading a config file is the
//! embedder's business; this module only defines the settled values.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::protocol::http::request::Request;

/// Which engine a forked worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerClass {
    /// Accept loop + bounded thread pool (`worker/threaded.rs`).
    Threaded,
    /// Single-threaded cooperative engine with the ASGI-shaped bridge.
    Asgi,
}

/// Wire protocol spoken on accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// HTTP/1.x, upgrading to HTTP/2 on the cleartext preface or `h2` ALPN.
    Http,
    Uwsgi,
    Fastcgi,
}

/// Policy for header names containing underscores (CGI-ambiguous).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMapPolicy {
    /// Reject the request with 400.
    Refuse,
    /// Silently drop the header.
    Drop,
    /// Pass the header through untouched.
    Dangerous,
}

/// An IP allow-list: a wildcard, or a set of addresses and CIDR networks.
#[derive(Debug, Clone)]
pub enum AllowIps {
    Wildcard,
    List(Vec<IpNet>),
}

/// One allow-list entry: a single address or an address/prefix network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    /// Parse `"10.0.0.1"`, `"10.0.0.0/8"`, `"::1"`, `"fd00::/8"`.
    pub fn parse(s: &str) -> Option<IpNet> {
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part.trim().parse().ok()?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = match prefix_part {
            Some(p) => {
                let p: u8 = p.trim().parse().ok()?;
                if p > max {
                    return None;
                }
                p
            }
            None => max,
        };
        Some(IpNet { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = 32 - u32::from(self.prefix);
                let mask = if bits >= 32 { 0 } else { u32::MAX << bits };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = 128 - u32::from(self.prefix);
                let mask = if bits >= 128 { 0 } else { u128::MAX << bits };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

impl AllowIps {
    /// Build from the usual string form; `"*"` anywhere means wildcard.
    /// Entries that fail to parse are dropped.
    pub fn parse(entries: &[&str]) -> AllowIps {
        if entries.iter().any(|e| e.trim() == "*") {
            return AllowIps::Wildcard;
        }
        AllowIps::List(entries.iter().filter_map(|e| IpNet::parse(e)).collect())
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        match self {
            AllowIps::Wildcard => true,
            AllowIps::List(nets) => nets.iter().any(|n| n.contains(ip)),
        }
    }
}

/// Per-request hook: called with the parsed request.
pub type RequestHook = Arc<dyn Fn(&Request) + Send + Sync>;
/// Worker lifecycle hook: called with the worker's pid.
pub type WorkerHook = Arc<dyn Fn(i32) + Send + Sync>;
/// Supervisor lifecycle hook.
pub type ServerHook = Arc<dyn Fn() + Send + Sync>;

/// The lifecycle hooks, as explicit typed callback fields.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_starting: Option<ServerHook>,
    pub when_ready: Option<ServerHook>,
    pub on_reload: Option<ServerHook>,
    pub on_exit: Option<ServerHook>,
    pub pre_request: Option<RequestHook>,
    pub post_request: Option<RequestHook>,
    pub worker_int: Option<WorkerHook>,
    pub worker_abort: Option<WorkerHook>,
    pub worker_exit: Option<WorkerHook>,
    pub child_exit: Option<WorkerHook>,
    pub nworkers_changed: Option<Arc<dyn Fn(usize, usize) + Send + Sync>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Hooks { .. }")
    }
}

/// The settled configuration consumed by the supervisor and the workers.
#[derive(Clone)]
pub struct Config {
    // Process model
    pub workers: usize,
    pub threads: usize,
    pub worker_connections: usize,
    pub worker_class: WorkerClass,
    pub protocol: Protocol,
    pub max_requests: u64,
    pub max_requests_jitter: u64,
    /// Worker heartbeat timeout, seconds. Stuck workers are SIGKILLed.
    pub timeout: u64,
    pub graceful_timeout: u64,
    /// Keepalive idle timeout, seconds.
    pub keepalive: u64,
    pub user: Option<u32>,
    pub group: Option<u32>,

    // HTTP/1 parse limits
    pub limit_request_line: usize,
    pub limit_request_fields: usize,
    pub limit_request_field_size: usize,

    // HTTP/1 lexing policy
    pub permit_obsolete_folding: bool,
    pub permit_unconventional_http_method: bool,
    pub permit_unconventional_http_version: bool,
    pub casefold_http_method: bool,
    pub header_map: HeaderMapPolicy,
    pub forwarder_headers: Vec<String>,
    pub strip_header_spaces: bool,

    // Peer trust
    pub proxy_protocol: bool,
    pub proxy_allow_ips: AllowIps,
    pub forwarded_allow_ips: AllowIps,
    pub secure_scheme_headers: HashMap<String, String>,
    pub uwsgi_allow_ips: AllowIps,
    pub fastcgi_allow_ips: AllowIps,

    // Transport
    pub is_ssl: bool,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub backlog: i32,

    // Application surface
    pub root_path: String,

    // HTTP/2
    pub http2_max_concurrent_streams: u32,
    pub http2_initial_window_size: u32,
    pub http2_max_frame_size: u32,
    pub http2_max_header_list_size: u32,

    // ASGI
    pub asgi_disconnect_grace_period: u64,

    pub hooks: Hooks,

    /// Re-reads the configuration on SIGHUP. Absent, a reload recycles the
    /// workers under the current settings.
    pub reloader: Option<Arc<dyn Fn() -> Config + Send + Sync>>,
}

impl Config {
    /// Upper bound on idle keepalive connections in the threaded engine.
    /// Leaves room for one in-progress request per pool thread.
    pub fn max_keepalived(&self) -> usize {
        self.worker_connections.saturating_sub(self.threads)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: 1,
            threads: 1,
            worker_connections: 1000,
            worker_class: WorkerClass::Threaded,
            protocol: Protocol::Http,
            max_requests: 0,
            max_requests_jitter: 0,
            timeout: 30,
            graceful_timeout: 30,
            keepalive: 2,
            user: None,
            group: None,
            limit_request_line: 8190,
            limit_request_fields: 32768,
            limit_request_field_size: 8190,
            permit_obsolete_folding: false,
            permit_unconventional_http_method: false,
            permit_unconventional_http_version: false,
            casefold_http_method: false,
            header_map: HeaderMapPolicy::Refuse,
            forwarder_headers: vec!["SCRIPT_NAME".into(), "PATH_INFO".into()],
            strip_header_spaces: false,
            proxy_protocol: false,
            proxy_allow_ips: AllowIps::parse(&["127.0.0.1"]),
            forwarded_allow_ips: AllowIps::parse(&["127.0.0.1"]),
            secure_scheme_headers: HashMap::from([
                ("X-FORWARDED-PROTOCOL".to_string(), "ssl".to_string()),
                ("X-FORWARDED-PROTO".to_string(), "https".to_string()),
                ("X-FORWARDED-SSL".to_string(), "on".to_string()),
            ]),
            uwsgi_allow_ips: AllowIps::parse(&["127.0.0.1", "::1"]),
            fastcgi_allow_ips: AllowIps::parse(&["127.0.0.1", "::1"]),
            is_ssl: false,
            tls: None,
            backlog: 2048,
            root_path: String::new(),
            http2_max_concurrent_streams: 100,
            http2_initial_window_size: 65535,
            http2_max_frame_size: 16384,
            http2_max_header_list_size: 65536,
            asgi_disconnect_grace_period: 3,
            hooks: Hooks::default(),
            reloader: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("workers", &self.workers)
            .field("threads", &self.threads)
            .field("worker_class", &self.worker_class)
            .field("protocol", &self.protocol)
            .field("worker_connections", &self.worker_connections)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipnet_single_address() {
        let net = IpNet::parse("127.0.0.1").unwrap();
        assert!(net.contains("127.0.0.1".parse().unwrap()));
        assert!(!net.contains("127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn ipnet_cidr_v4() {
        let net = IpNet::parse("10.0.0.0/8").unwrap();
        assert!(net.contains("10.200.3.4".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn ipnet_cidr_v6() {
        let net = IpNet::parse("fd00::/8").unwrap();
        assert!(net.contains("fd12::1".parse().unwrap()));
        assert!(!net.contains("fe80::1".parse().unwrap()));
    }

    #[test]
    fn ipnet_mixed_families_never_match() {
        let net = IpNet::parse("0.0.0.0/0").unwrap();
        assert!(!net.contains("::1".parse().unwrap()));
    }

    #[test]
    fn allow_ips_wildcard() {
        let allow = AllowIps::parse(&["*"]);
        assert!(allow.allows("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn allow_ips_list() {
        let allow = AllowIps::parse(&["127.0.0.1", "::1"]);
        assert!(allow.allows("127.0.0.1".parse().unwrap()));
        assert!(allow.allows("::1".parse().unwrap()));
        assert!(!allow.allows("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn bad_prefix_rejected() {
        assert!(IpNet::parse("10.0.0.0/33").is_none());
        assert!(IpNet::parse("not-an-ip").is_none());
    }

    #[test]
    fn max_keepalived_leaves_room_for_threads() {
        let cfg = Config {
            worker_connections: 1000,
            threads: 4,
            ..Config::default()
        };
        assert_eq!(cfg.max_keepalived(), 996);
    }
}
