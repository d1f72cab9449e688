/*
 * threaded.rs
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

//! The threaded worker engine: one accept thread around a readiness poller,
//! a bounded handler pool, an idle-keepalive registry ordered by deadline,
//! and a method queue carrying connections back from the pool.
//!
//! Ownership discipline: a connection's socket is mutated by exactly one
//! thread at a time; ownership moves into a pool thread at dispatch and
//! returns over the method queue. The registry and every poller
//! registration are touched only by the accept thread.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::app::{Application, StartResponse, WsgiBody};
use crate::config::{Config, Protocol};
use crate::listener::Listener;
use crate::protocol::fastcgi::response::write_get_values_result;
use crate::protocol::fastcgi::{FcgiConnection, FcgiEvent, FcgiResponseWriter};
use crate::protocol::http::h1::writer::write_error_response;
use crate::protocol::http::h1::{self, Body, ResponseWriter};
use crate::protocol::http::h2::{H2Connection, SendOutcome, CONNECTION_PREFACE};
use crate::protocol::http::request::{BodyKind, PeerAddr, ProxyInfo, Request, Scheme};
use crate::protocol::http::HttpError;
use crate::protocol::uwsgi;
use crate::unreader::{BufSource, ReadSource, Unreader};
use crate::util;
use crate::worker::pool::{MethodQueue, MethodSender, ThreadPool};
use crate::worker::{self, WorkerState};

/// Budget of receive rounds while waiting for WINDOW_UPDATEs on a stalled
/// HTTP/2 response before giving up with connection-lost.
const H2_PUMP_RETRY_BUDGET: u32 = 256;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The connection byte stream: plain TCP, Unix, or TLS-wrapped TCP.
pub enum Transport {
    Plain(TcpStream),
    Unix(UnixStream),
    Tls(Box<rustls::StreamOwned<rustls::ServerConnection, TcpStream>>),
}

impl Transport {
    fn raw_fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        match self {
            Transport::Plain(s) => s.as_raw_fd(),
            Transport::Unix(s) => s.as_raw_fd(),
            Transport::Tls(s) => s.sock.as_raw_fd(),
        }
    }

    fn alpn_h2(&self) -> bool {
        match self {
            Transport::Tls(s) => s.conn.alpn_protocol() == Some(b"h2"),
            _ => false,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Unix(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Unix(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Unix(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

/// Shared handle: the parser reads and the response writer writes through
/// the same socket. Only one thread touches a connection at a time, so the
/// mutex is uncontended bookkeeping, not a lock on the hot path.
#[derive(Clone)]
pub struct TransportHandle(Arc<Mutex<Transport>>);

impl TransportHandle {
    fn new(transport: Transport) -> Self {
        TransportHandle(Arc::new(Mutex::new(transport)))
    }

    fn raw_fd(&self) -> RawFd {
        self.0.lock().expect("transport lock").raw_fd()
    }

    fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        util::set_nonblocking(self.raw_fd(), on)
    }

    fn alpn_h2(&self) -> bool {
        self.0.lock().expect("transport lock").alpn_h2()
    }
}

impl Read for TransportHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.lock().expect("transport lock").read(buf)
    }
}

impl Write for TransportHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("transport lock").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().expect("transport lock").flush()
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One accepted connection, owned by whichever thread holds it.
pub struct Connection {
    transport: TransportHandle,
    unreader: Unreader<ReadSource<TransportHandle>>,
    peer: PeerAddr,
    server: (String, u16),
    /// Requests served on this connection so far.
    req_count: u64,
    /// Proxy-protocol identity from the first request, applied to every
    /// later request on the connection.
    proxy_info: Option<ProxyInfo>,
    /// FastCGI multiplexing state survives across dispatches.
    fcgi: Option<FcgiConnection>,
}

impl Connection {
    fn new(transport: Transport, peer: PeerAddr, server: (String, u16)) -> Connection {
        let handle = TransportHandle::new(transport);
        Connection {
            unreader: Unreader::new(ReadSource::new(handle.clone())),
            transport: handle,
            peer,
            server,
            req_count: 0,
            proxy_info: None,
            fcgi: None,
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.transport.raw_fd()
    }
}

/// Handler verdict carried back over the method queue. Signal handlers wake
/// the loop through the queue's pipe without enqueueing anything.
enum Wake {
    Finished {
        conn: Option<Connection>,
        keepalive: bool,
        served: u64,
    },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

const WAKE_TOKEN_OFFSET: usize = 0;

pub struct ThreadedWorker {
    cfg: Arc<Config>,
    app: Arc<dyn Application>,
    state: WorkerState,
    listeners: Arc<Vec<Listener>>,
    poll: Poll,
    pool: ThreadPool,
    queue: MethodQueue<Wake>,
    /// Busy + idle connections known to this worker.
    nr_conns: usize,
    /// Idle keepalive registry, ordered by deadline.
    idle: BTreeMap<(Instant, Token), Connection>,
    /// Reverse index: idle token → its registry key.
    idle_deadlines: HashMap<Token, Instant>,
    listeners_registered: bool,
    next_token: usize,
    wake_token: Token,
}

impl ThreadedWorker {
    pub fn new(
        cfg: Arc<Config>,
        listeners: Arc<Vec<Listener>>,
        app: Arc<dyn Application>,
        state: WorkerState,
    ) -> io::Result<ThreadedWorker> {
        let poll = Poll::new()?;
        let queue = MethodQueue::new()?;
        worker::set_wake_fd(queue.wake_fd());
        let wake_token = Token(listeners.len() + WAKE_TOKEN_OFFSET);
        poll.registry().register(
            &mut SourceFd(&queue.poll_fd()),
            wake_token,
            Interest::READABLE,
        )?;
        for listener in listeners.iter() {
            util::set_nonblocking(listener.raw_fd(), true)?;
        }
        let pool = ThreadPool::new(cfg.threads);
        let next_token = listeners.len() + 1;
        Ok(ThreadedWorker {
            cfg,
            app,
            state,
            listeners,
            poll,
            pool,
            queue,
            nr_conns: 0,
            idle: BTreeMap::new(),
            idle_deadlines: HashMap::new(),
            listeners_registered: false,
            next_token,
            wake_token,
        })
    }

    /// The accept loop. Returns when the worker should exit.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(256);
        let mut shutdown_started: Option<Instant> = None;

        loop {
            self.state.notify();

            if self.state.parent_changed() {
                tracing::info!("parent changed, shutting down");
                break;
            }

            let signals = worker::take_signals();
            if signals & worker::SIG_FAST_EXIT != 0 {
                self.pool.shutdown(false);
                std::process::exit(0);
            }
            if signals & worker::SIG_GRACEFUL != 0 {
                self.state.alive = false;
            }
            if signals & worker::SIG_REOPEN_LOGS != 0 {
                tracing::debug!("log reopen requested");
            }

            if !self.state.alive && shutdown_started.is_none() {
                shutdown_started = Some(Instant::now());
                // Idle connections have no request in flight; drop them now.
                self.murder_all_idle();
            }
            if let Some(started) = shutdown_started {
                let busy = self.nr_conns;
                if busy == 0 {
                    break;
                }
                if started.elapsed() >= Duration::from_secs(self.cfg.graceful_timeout) {
                    tracing::warn!(busy, "graceful timeout expired, abandoning connections");
                    break;
                }
            }

            // Backpressure: only listen while there is room for another
            // connection.
            let accept_enabled = self.state.alive && self.nr_conns < self.cfg.worker_connections;
            self.set_listeners_registered(accept_enabled)?;

            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let mut ready_idle: Vec<Token> = Vec::new();
            let mut accept_ready = false;
            let mut wake_ready = false;
            for event in events.iter() {
                let token = event.token();
                if token.0 < self.listeners.len() {
                    accept_ready = true;
                } else if token == self.wake_token {
                    wake_ready = true;
                } else {
                    ready_idle.push(token);
                }
            }

            if accept_ready && accept_enabled {
                self.accept_all()?;
            }
            for token in ready_idle {
                self.dispatch_idle(token)?;
            }
            if wake_ready {
                for wake in self.queue.drain() {
                    self.process_wake(wake)?;
                }
            }

            self.murder_keepalived()?;
        }

        self.pool.shutdown(false);
        Ok(())
    }

    fn poll_timeout(&self) -> Duration {
        let max = Duration::from_secs(1);
        match self.idle.keys().next() {
            Some((deadline, _)) => deadline.saturating_duration_since(Instant::now()).min(max),
            None => max,
        }
    }

    fn set_listeners_registered(&mut self, want: bool) -> io::Result<()> {
        if want == self.listeners_registered {
            return Ok(());
        }
        for (i, listener) in self.listeners.iter().enumerate() {
            let fd = listener.raw_fd();
            if want {
                self.poll.registry().register(
                    &mut SourceFd(&fd),
                    Token(i),
                    Interest::READABLE,
                )?;
            } else {
                self.poll.registry().deregister(&mut SourceFd(&fd))?;
            }
        }
        self.listeners_registered = want;
        Ok(())
    }

    fn accept_all(&mut self) -> io::Result<()> {
        let listeners = Arc::clone(&self.listeners);
        for listener in listeners.iter() {
            loop {
                if self.nr_conns >= self.cfg.worker_connections {
                    return Ok(());
                }
                let accepted = match listener {
                    Listener::Tcp { sock, .. } => match sock.accept() {
                        Ok((stream, peer)) => {
                            stream.set_nodelay(true).ok();
                            Some((Transport::Plain(stream), PeerAddr::Tcp(peer)))
                        }
                        Err(e) if accept_retryable(&e) => None,
                        Err(e) => return Err(e),
                    },
                    Listener::Unix { sock, .. } => match sock.accept() {
                        Ok((stream, _)) => Some((Transport::Unix(stream), PeerAddr::Unix)),
                        Err(e) if accept_retryable(&e) => None,
                        Err(e) => return Err(e),
                    },
                };
                let Some((transport, peer)) = accepted else {
                    break;
                };
                self.nr_conns += 1;
                let conn = Connection::new(transport, peer, listener.server_name());
                self.dispatch(conn);
            }
        }
        Ok(())
    }

    fn dispatch_idle(&mut self, token: Token) -> io::Result<()> {
        let Some(deadline) = self.idle_deadlines.remove(&token) else {
            return Ok(());
        };
        let Some(conn) = self.idle.remove(&(deadline, token)) else {
            return Ok(());
        };
        self.poll
            .registry()
            .deregister(&mut SourceFd(&conn.raw_fd()))?;
        self.dispatch(conn);
        Ok(())
    }

    /// Hand a connection to the pool. The socket goes blocking; the handler
    /// owns it until the method-queue callback returns it.
    fn dispatch(&mut self, conn: Connection) {
        if let Err(e) = conn.transport.set_nonblocking(false) {
            tracing::debug!(error = %e, "failed to block socket, dropping");
            self.nr_conns = self.nr_conns.saturating_sub(1);
            return;
        }
        let cfg = Arc::clone(&self.cfg);
        let app = Arc::clone(&self.app);
        let sender = self.queue.sender();
        self.pool.execute(Box::new(move || {
            handle_connection(conn, cfg, app, sender);
        }));
    }

    fn process_wake(&mut self, wake: Wake) -> io::Result<()> {
        match wake {
            Wake::Finished {
                conn,
                keepalive,
                served,
            } => {
                self.state.count_requests(served);
                match conn {
                    Some(conn)
                        if keepalive
                            && self.state.alive
                            && self.idle.len() < self.cfg.max_keepalived() =>
                    {
                        self.register_idle(conn)
                    }
                    _ => {
                        self.nr_conns = self.nr_conns.saturating_sub(1);
                        Ok(())
                    }
                }
            }
        }
    }

    fn register_idle(&mut self, conn: Connection) -> io::Result<()> {
        if let Err(e) = conn.transport.set_nonblocking(true) {
            tracing::debug!(error = %e, "failed to unblock socket, closing");
            self.nr_conns = self.nr_conns.saturating_sub(1);
            return Ok(());
        }
        self.next_token += 1;
        let token = Token(self.next_token);
        let deadline = Instant::now() + Duration::from_secs(self.cfg.keepalive);
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut SourceFd(&conn.raw_fd()), token, Interest::READABLE)
        {
            tracing::debug!(error = %e, "poller registration failed, closing");
            self.nr_conns = self.nr_conns.saturating_sub(1);
            return Ok(());
        }
        self.idle.insert((deadline, token), conn);
        self.idle_deadlines.insert(token, deadline);
        Ok(())
    }

    /// Pop expired idle connections: deregister and close.
    fn murder_keepalived(&mut self) -> io::Result<()> {
        let now = Instant::now();
        while let Some((&(deadline, token), _)) = self.idle.iter().next() {
            if deadline > now {
                break;
            }
            if let Some(conn) = self.idle.remove(&(deadline, token)) {
                self.idle_deadlines.remove(&token);
                let _ = self
                    .poll
                    .registry()
                    .deregister(&mut SourceFd(&conn.raw_fd()));
                self.nr_conns = self.nr_conns.saturating_sub(1);
            }
        }
        Ok(())
    }

    fn murder_all_idle(&mut self) {
        let tokens: Vec<_> = self.idle.keys().copied().collect();
        for key in tokens {
            if let Some(conn) = self.idle.remove(&key) {
                self.idle_deadlines.remove(&key.1);
                let _ = self
                    .poll
                    .registry()
                    .deregister(&mut SourceFd(&conn.raw_fd()));
                self.nr_conns = self.nr_conns.saturating_sub(1);
            }
        }
    }
}

fn accept_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
    )
}

// ---------------------------------------------------------------------------
// Request handlers (pool threads)
// ---------------------------------------------------------------------------

fn handle_connection(
    mut conn: Connection,
    cfg: Arc<Config>,
    app: Arc<dyn Application>,
    sender: MethodSender<Wake>,
) {
    // Fresh TLS connections finish the handshake before parsing so ALPN can
    // steer protocol selection.
    if conn.req_count == 0 && cfg.is_ssl {
        if let Some(tls) = cfg.tls.clone() {
            if let Err(e) = wrap_tls(&mut conn, tls) {
                tracing::debug!(error = %e, "tls handshake failed");
                sender.send(Wake::Finished {
                    conn: None,
                    keepalive: false,
                    served: 0,
                });
                return;
            }
        }
    }

    let (keepalive, served, conn) = match cfg.protocol {
        Protocol::Http => {
            if conn.transport.alpn_h2() || (conn.req_count == 0 && sniff_h2_preface(&mut conn)) {
                let served = handle_h2(&mut conn, &cfg, app.as_ref());
                (false, served, None)
            } else {
                let (keepalive, served) = handle_http1(&mut conn, &cfg, app.as_ref());
                let conn = if keepalive { Some(conn) } else { None };
                (keepalive, served, conn)
            }
        }
        Protocol::Uwsgi => {
            let served = handle_uwsgi(&mut conn, &cfg, app.as_ref());
            (false, served, None)
        }
        Protocol::Fastcgi => {
            let served = handle_fastcgi(&mut conn, &cfg, app.as_ref());
            (false, served, None)
        }
    };
    sender.send(Wake::Finished {
        conn,
        keepalive,
        served,
    });
}

fn wrap_tls(conn: &mut Connection, tls: Arc<rustls::ServerConfig>) -> io::Result<()> {
    // Take the plain stream out and rebuild the connection around the TLS
    // wrapper; the unreader buffer is empty on a fresh connection.
    let transport = {
        let mut guard = conn.transport.0.lock().expect("transport lock");
        std::mem::replace(&mut *guard, Transport::Unix(unconnected_unix()))
    };
    let tcp = match transport {
        Transport::Plain(tcp) => tcp,
        other => {
            let mut guard = conn.transport.0.lock().expect("transport lock");
            *guard = other;
            return Ok(());
        }
    };
    let server_conn = rustls::ServerConnection::new(tls)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let mut stream = rustls::StreamOwned::new(server_conn, tcp);
    while stream.conn.is_handshaking() {
        stream
            .conn
            .complete_io(&mut stream.sock)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    }
    let mut guard = conn.transport.0.lock().expect("transport lock");
    *guard = Transport::Tls(Box::new(stream));
    Ok(())
}

fn unconnected_unix() -> UnixStream {
    // Placeholder used only while swapping the transport variant.
    UnixStream::pair().map(|(a, _)| a).expect("socketpair")
}

/// Peek for the cleartext HTTP/2 preface; consumed bytes are pushed back.
fn sniff_h2_preface(conn: &mut Connection) -> bool {
    let mut seen: Vec<u8> = Vec::new();
    let result = loop {
        if seen.len() >= CONNECTION_PREFACE.len() {
            break true;
        }
        match conn.unreader.read() {
            Ok(chunk) if chunk.is_empty() => break false,
            Ok(chunk) => {
                seen.extend_from_slice(&chunk);
                let cmp = seen.len().min(CONNECTION_PREFACE.len());
                if seen[..cmp] != CONNECTION_PREFACE[..cmp] {
                    break false;
                }
            }
            Err(_) => break false,
        }
    };
    conn.unreader.unread(&seen);
    result
}

/// Serve HTTP/1 requests until close or keepalive hand-back. Returns the
/// keepalive decision and how many requests were served this dispatch.
fn handle_http1(conn: &mut Connection, cfg: &Config, app: &dyn Application) -> (bool, u64) {
    let mut served = 0u64;
    loop {
        let req_number = conn.req_count + 1;
        let mut request =
            match h1::parse(&mut conn.unreader, conn.peer.clone(), req_number, cfg) {
                Ok(req) => req,
                Err(e) => {
                    handle_parse_error(conn, &e);
                    return (false, served);
                }
            };
        conn.req_count = req_number;
        request.server = Some(conn.server.clone());

        // The proxy prelude arrives once; its client address holds for the
        // connection's whole life.
        if req_number == 1 {
            conn.proxy_info = request.proxy_protocol_info.clone();
        } else if let Some(info) = &conn.proxy_info {
            request.remote_addr = PeerAddr::Tcp(info.client_addr);
            request.proxy_protocol_info = Some(info.clone());
        }

        if let Some(hook) = &cfg.hooks.pre_request {
            hook(&request);
        }

        let should_close = request.should_close();
        let mut writer = ResponseWriter::new(conn.transport.clone(), request.version, should_close);
        let mut body = Body::new(request.body_kind, &mut conn.unreader, cfg);

        let outcome = app.call(&request, &mut body, &mut writer);
        let write_result = match outcome {
            Ok(WsgiBody::Empty) => writer.finish(),
            Ok(WsgiBody::Bytes(data)) => writer.write(&data).and_then(|_| writer.finish()),
            Ok(WsgiBody::File(mut file)) => {
                writer.write_file(&mut file).and_then(|_| writer.finish())
            }
            Err(e) => {
                tracing::error!(error = %e, path = %request.path, "application error");
                if writer.headers_sent() {
                    // Mid-body failure: abort the connection, the client
                    // must not see a truncated-but-terminated response.
                    run_post_request(cfg, &request);
                    return (false, served.max(1));
                }
                writer
                    .start(500, None, &[("Content-Length".into(), "0".into())])
                    .and_then(|_| writer.finish())
            }
        };

        let drained = body.drain().is_ok();
        drop(body);
        served += 1;
        run_post_request(cfg, &request);

        if write_result.is_err() {
            return (false, served);
        }
        if writer.should_close() || !drained {
            return (false, served);
        }
        // Pipelining: serve buffered requests before handing the connection
        // back for keepalive registration.
        if conn.unreader.buffered() == 0 {
            return (true, served);
        }
    }
}

fn handle_parse_error(conn: &mut Connection, e: &HttpError) {
    if e.is_transport() {
        tracing::debug!(error = %e, "transport closed during parse");
        return;
    }
    tracing::info!(error = %e, status = e.status_hint(), "rejecting malformed request");
    let mut out = conn.transport.clone();
    let _ = write_error_response(&mut out, e.status_hint(), (1, 1));
}

fn run_post_request(cfg: &Config, request: &Request) {
    if let Some(hook) = &cfg.hooks.post_request {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(request))).is_err() {
            tracing::error!("post_request hook panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP/2 over the threaded engine
// ---------------------------------------------------------------------------

/// Buffers the application's response until the call returns, then plays it
/// onto the stream with flow control.
struct H2Start {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    informational: Vec<(u16, Vec<(String, String)>)>,
}

impl H2Start {
    fn new() -> H2Start {
        H2Start {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
            informational: Vec::new(),
        }
    }
}

impl StartResponse for H2Start {
    fn start(
        &mut self,
        status: u16,
        _reason: Option<&str>,
        headers: &[(String, String)],
    ) -> io::Result<()> {
        self.status = status;
        self.headers = headers.to_vec();
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.body.extend_from_slice(data);
        Ok(())
    }

    fn send_informational(&mut self, status: u16, headers: &[(String, String)]) -> io::Result<()> {
        self.informational.push((status, headers.to_vec()));
        Ok(())
    }
}

fn handle_h2(conn: &mut Connection, cfg: &Config, app: &dyn Application) -> u64 {
    let mut h2 = H2Connection::new(cfg);
    h2.initiate();
    let mut served = 0u64;
    if flush_h2(conn, &mut h2).is_err() {
        return served;
    }
    loop {
        // Pulls the preface-sniff residue first, then blocks on the socket.
        let data = match conn.unreader.read() {
            Ok(data) if data.is_empty() => return served,
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(error = %e, "h2 transport read failed");
                return served;
            }
        };

        let requests = match h2.receive_data(&data) {
            Ok(reqs) => reqs,
            Err(e) => {
                tracing::info!(error = %e, "h2 connection error");
                let _ = flush_h2(conn, &mut h2);
                return served;
            }
        };
        if flush_h2(conn, &mut h2).is_err() {
            return served;
        }
        // Requests completing while a response pump drains WINDOW_UPDATEs
        // append here rather than getting lost.
        let mut pending: std::collections::VecDeque<_> = requests.into();
        while let Some(h2_req) = pending.pop_front() {
            served += 1;
            if serve_h2_request(conn, cfg, app, &mut h2, h2_req, &mut pending).is_err() {
                return served;
            }
        }
        if h2.is_closed() {
            let _ = flush_h2(conn, &mut h2);
            return served;
        }
    }
}

fn serve_h2_request(
    conn: &mut Connection,
    cfg: &Config,
    app: &dyn Application,
    h2: &mut H2Connection,
    h2_req: crate::protocol::http::h2::H2Request,
    pending: &mut std::collections::VecDeque<crate::protocol::http::h2::H2Request>,
) -> io::Result<()> {
    let request = h2_request_to_request(&h2_req, conn, cfg);
    if let Some(hook) = &cfg.hooks.pre_request {
        hook(&request);
    }

    let stream_id = h2_req.stream_id;
    let mut start = H2Start::new();
    let outcome = {
        let mut unreader = Unreader::new(BufSource::of(h2_req.body.clone()));
        let mut body = Body::new(request.body_kind, &mut unreader, cfg);
        app.call(&request, &mut body, &mut start)
    };

    match outcome {
        Ok(extra) => {
            match extra {
                WsgiBody::Empty => {}
                WsgiBody::Bytes(data) => start.body.extend_from_slice(&data),
                WsgiBody::File(mut file) => {
                    file.read_to_end(&mut start.body)?;
                }
            }
            for (status, headers) in &start.informational {
                let _ = h2
                    .send_informational(stream_id, *status, headers)
                    .map_err(h2_io)?;
            }
            let body = if start.body.is_empty() {
                None
            } else {
                Some(&start.body[..])
            };
            let delivered = h2
                .send_response(stream_id, start.status, &start.headers, body)
                .map_err(h2_io)?;
            if delivered {
                pump_h2_stream(conn, h2, stream_id, pending)?;
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "application error on h2 stream");
            let _ = h2
                .send_response(stream_id, 500, &[], None)
                .map_err(h2_io)?;
        }
    }
    run_post_request(cfg, &request);
    flush_h2(conn, h2)
}

/// Write pending DATA as the windows allow; while blocked, pump the receive
/// path so WINDOW_UPDATEs land, up to the retry budget.
fn pump_h2_stream(
    conn: &mut Connection,
    h2: &mut H2Connection,
    stream_id: u32,
    pending: &mut std::collections::VecDeque<crate::protocol::http::h2::H2Request>,
) -> io::Result<()> {
    let mut budget = H2_PUMP_RETRY_BUDGET;
    let mut chunk = [0u8; 16384];
    loop {
        match h2.pump(stream_id).map_err(h2_io)? {
            SendOutcome::Complete => return flush_h2(conn, h2),
            SendOutcome::Blocked => {
                flush_h2(conn, h2)?;
                if budget == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "send window never reopened",
                    ));
                }
                budget -= 1;
                let n = conn.transport.read(&mut chunk)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection lost while flow-control blocked",
                    ));
                }
                pending.extend(h2.receive_data(&chunk[..n]).map_err(h2_io)?);
            }
        }
    }
}

fn flush_h2(conn: &mut Connection, h2: &mut H2Connection) -> io::Result<()> {
    let out = h2.take_output();
    if out.is_empty() {
        return Ok(());
    }
    conn.transport.write_all(&out)?;
    conn.transport.flush()
}

fn h2_io(e: crate::protocol::http::h2::H2Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

fn h2_request_to_request(
    h2_req: &crate::protocol::http::h2::H2Request,
    conn: &Connection,
    cfg: &Config,
) -> Request {
    let mut headers: Vec<(String, String)> = h2_req
        .headers
        .iter()
        .map(|(n, v)| (n.to_ascii_uppercase(), v.clone()))
        .collect();
    if !h2_req.authority.is_empty() {
        headers.insert(0, ("HOST".into(), h2_req.authority.clone()));
    }
    let trailers = h2_req
        .trailers
        .iter()
        .map(|(n, v)| (n.to_ascii_uppercase(), v.clone()))
        .collect();
    let (path, query) = match h2_req.path.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (h2_req.path.clone(), String::new()),
    };
    let scheme = if h2_req.scheme == "https" || cfg.is_ssl {
        Scheme::Https
    } else {
        Scheme::Http
    };
    let body_len = h2_req.body.len() as u64;
    Request {
        method: h2_req.method.clone(),
        uri: h2_req.path.clone(),
        path,
        query,
        fragment: String::new(),
        version: (2, 0),
        headers,
        trailers,
        scheme,
        peer_addr: conn.peer.clone(),
        remote_addr: conn.peer.clone(),
        proxy_protocol_info: None,
        server: Some(conn.server.clone()),
        req_number: h2_req.stream_id as u64,
        body_kind: if body_len == 0 {
            BodyKind::None
        } else {
            BodyKind::Length(body_len)
        },
        must_close: false,
    }
}

// ---------------------------------------------------------------------------
// Gateway protocols
// ---------------------------------------------------------------------------

fn handle_uwsgi(conn: &mut Connection, cfg: &Config, app: &dyn Application) -> u64 {
    let mut request = match uwsgi::parse(&mut conn.unreader, conn.peer.clone(), 1, cfg) {
        Ok(req) => req,
        Err(e) => {
            handle_parse_error(conn, &e);
            return 0;
        }
    };
    conn.req_count += 1;
    request.server = Some(conn.server.clone());
    if let Some(hook) = &cfg.hooks.pre_request {
        hook(&request);
    }

    let mut writer = ResponseWriter::new(conn.transport.clone(), request.version, true);
    let mut body = Body::new(request.body_kind, &mut conn.unreader, cfg);
    let outcome = app.call(&request, &mut body, &mut writer);
    let _ = match outcome {
        Ok(WsgiBody::Empty) => writer.finish(),
        Ok(WsgiBody::Bytes(data)) => writer.write(&data).and_then(|_| writer.finish()),
        Ok(WsgiBody::File(mut file)) => writer.write_file(&mut file).and_then(|_| writer.finish()),
        Err(e) => {
            tracing::error!(error = %e, "application error on uwsgi request");
            if !writer.headers_sent() {
                let _ = writer.start(500, None, &[("Content-Length".into(), "0".into())]);
            }
            writer.finish()
        }
    };
    drop(body);
    run_post_request(cfg, &request);
    1
}

/// Adapter: CGI-style head over STDOUT records.
struct FcgiStart<'a, 'b> {
    inner: &'a mut FcgiResponseWriter<'b>,
}

impl StartResponse for FcgiStart<'_, '_> {
    fn start(
        &mut self,
        status: u16,
        _reason: Option<&str>,
        headers: &[(String, String)],
    ) -> io::Result<()> {
        self.inner.start(status, headers)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write(data)
    }

    fn send_informational(&mut self, _status: u16, _headers: &[(String, String)]) -> io::Result<()> {
        // FastCGI has no informational channel.
        Ok(())
    }
}

fn handle_fastcgi(conn: &mut Connection, cfg: &Config, app: &dyn Application) -> u64 {
    let mut fcgi = conn.fcgi.take().unwrap_or_default();
    let mut served = 0u64;
    loop {
        let event = match fcgi.next_event(&mut conn.unreader, &conn.peer, cfg) {
            Ok(event) => event,
            Err(e) => {
                tracing::info!(error = %e, "fastcgi protocol error");
                return served;
            }
        };
        match event {
            FcgiEvent::Eof => return served,
            FcgiEvent::Abort(request_id) => {
                let mut out = conn.transport.clone();
                let mut writer = FcgiResponseWriter::new(&mut out, request_id);
                let _ = writer.finish();
            }
            FcgiEvent::GetValues(names) => {
                let mut out = conn.transport.clone();
                let _ = write_get_values_result(&mut out, &names, cfg.worker_connections);
                let _ = out.flush();
            }
            FcgiEvent::Request(freq) => {
                served += 1;
                let mut request = freq.request;
                request.server = Some(conn.server.clone());
                if let Some(hook) = &cfg.hooks.pre_request {
                    hook(&request);
                }
                let stdin_len = freq.stdin.len() as u64;
                let mut stdin_unreader = Unreader::new(BufSource::of(freq.stdin));
                let mut body = Body::new(
                    if stdin_len == 0 {
                        BodyKind::None
                    } else {
                        BodyKind::Length(stdin_len)
                    },
                    &mut stdin_unreader,
                    cfg,
                );
                let mut out = conn.transport.clone();
                let mut writer = FcgiResponseWriter::new(&mut out, freq.request_id);
                let outcome = {
                    let mut start = FcgiStart { inner: &mut writer };
                    app.call(&request, &mut body, &mut start)
                };
                let _ = match outcome {
                    Ok(WsgiBody::Empty) => writer.finish(),
                    Ok(WsgiBody::Bytes(data)) => {
                        writer.write(&data).and_then(|_| writer.finish())
                    }
                    Ok(WsgiBody::File(mut file)) => {
                        let mut data = Vec::new();
                        file.read_to_end(&mut data)
                            .and_then(|_| writer.write(&data))
                            .and_then(|_| writer.finish())
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "application error on fastcgi request");
                        let _ = writer.start(500, &[]);
                        writer.finish()
                    }
                };
                run_post_request(cfg, &request);
                // FCGI_KEEP_CONN wins over any embedded Connection header.
                if !freq.keep_conn {
                    return served;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h2_start_buffers_response() {
        let mut start = H2Start::new();
        start
            .start(201, None, &[("X-A".into(), "1".into())])
            .unwrap();
        start.write(b"hello").unwrap();
        start.send_informational(103, &[]).unwrap();
        assert_eq!(start.status, 201);
        assert_eq!(start.body, b"hello");
        assert_eq!(start.informational.len(), 1);
        // exc_info-style restart before flush replaces the head.
        start.start(500, None, &[]).unwrap();
        assert_eq!(start.status, 500);
    }

    #[test]
    fn h2_request_mapping() {
        let h2_req = crate::protocol::http::h2::H2Request {
            stream_id: 7,
            method: "POST".into(),
            path: "/x?y=1".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            headers: vec![("content-type".into(), "text/plain".into())],
            trailers: vec![("x-check".into(), "1".into())],
            body: bytes::Bytes::from_static(b"abc"),
        };
        let conn = Connection::new(
            Transport::Unix(UnixStream::pair().unwrap().0),
            PeerAddr::Unix,
            ("unit".into(), 0),
        );
        let cfg = Config::default();
        let req = h2_request_to_request(&h2_req, &conn, &cfg);
        assert_eq!(req.version, (2, 0));
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/x");
        assert_eq!(req.query, "y=1");
        assert_eq!(req.header("HOST"), Some("example.com"));
        assert_eq!(req.header("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(req.scheme, Scheme::Https);
        assert_eq!(req.body_kind, BodyKind::Length(3));
        assert_eq!(req.trailers[0].0, "X-CHECK");
    }

    #[test]
    fn preface_sniff_detects_h2_and_restores_bytes() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(CONNECTION_PREFACE).unwrap();
        let mut conn = Connection::new(Transport::Unix(ours), PeerAddr::Unix, ("t".into(), 0));
        assert!(sniff_h2_preface(&mut conn));
        // The sniff put every byte back.
        let restored = conn
            .unreader
            .read_exact_or_eof(CONNECTION_PREFACE.len())
            .unwrap();
        assert_eq!(&restored[..], CONNECTION_PREFACE);
    }

    #[test]
    fn preface_sniff_rejects_http1() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let mut conn = Connection::new(Transport::Unix(ours), PeerAddr::Unix, ("t".into(), 0));
        assert!(!sniff_h2_preface(&mut conn));
        let restored = conn.unreader.read_exact_or_eof(3).unwrap();
        assert_eq!(&restored[..], b"GET");
    }
}
