/*
 * mod.rs
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

//! The async (ASGI) worker engine: a single-threaded cooperative runtime,
//! one task per connection, the scope/receive/send bridge, lifespan, and
//! graceful client-disconnect propagation.

pub mod body;
pub mod lifespan;
pub mod scope;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{timeout, Instant};

use crate::config::Config;
use crate::listener::Listener;
use crate::protocol::http::h1::writer::write_error_response;
use crate::protocol::http::h1::{parse_async, ResponseWriter};
use crate::protocol::http::h2::{H2Connection, SendOutcome};
use crate::protocol::http::request::{PeerAddr, Request};
use crate::protocol::websocket::{handshake, WsConnection, WsMessage};
use crate::unreader::AsyncUnreader;
use crate::worker::WorkerState;

use body::{BodyChunk, BodyFramer};
use scope::{
    AppSend, AsgiApplication, Event, HttpScope, Receive, Scope, SharedState, WebSocketScope,
};

/// Shared engine context, cloned into connection tasks.
struct Shared {
    cfg: Arc<Config>,
    app: Arc<dyn AsgiApplication>,
    state: SharedState,
    /// Requests completed since the last heartbeat tick.
    served: AtomicU64,
    /// Backpressure: permits = worker_connections.
    conns: Arc<Semaphore>,
}

/// Engine entry: builds the single-threaded runtime and serves until exit.
pub fn run(
    cfg: Arc<Config>,
    listeners: Arc<Vec<Listener>>,
    app: Arc<dyn AsgiApplication>,
    state: WorkerState,
) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(cfg, listeners, app, state))
}

async fn serve(
    cfg: Arc<Config>,
    listeners: Arc<Vec<Listener>>,
    app: Arc<dyn AsgiApplication>,
    mut state: WorkerState,
) -> io::Result<()> {
    let lifespan = lifespan::Lifespan::start(Arc::clone(&app)).await?;
    let shared = Arc::new(Shared {
        conns: Arc::new(Semaphore::new(cfg.worker_connections)),
        cfg: Arc::clone(&cfg),
        app,
        state: Arc::clone(&lifespan.state),
        served: AtomicU64::new(0),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for listener in listeners.iter() {
        let accept = tokio_listener(listener)?;
        let shared = Arc::clone(&shared);
        let shutdown = shutdown_rx.clone();
        let server = listener.server_name();
        tokio::spawn(accept_loop(accept, server, shared, shutdown));
    }

    use tokio::signal::unix::{signal, SignalKind};
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                state.notify();
                state.count_requests(shared.served.swap(0, Ordering::Relaxed));
                if state.parent_changed() {
                    tracing::info!("parent changed, shutting down");
                    break;
                }
                if !state.alive {
                    break;
                }
            }
            _ = sigquit.recv() => {
                state.alive = false;
                break;
            }
            _ = sigterm.recv() => std::process::exit(0),
            _ = sigint.recv() => std::process::exit(0),
            _ = sigusr1.recv() => tracing::debug!("log reopen requested"),
        }
    }

    // Graceful drain: stop accepting, let in-flight requests finish within
    // graceful_timeout.
    let _ = shutdown_tx.send(true);
    let drain = async {
        let _ = shared
            .conns
            .acquire_many(shared.cfg.worker_connections as u32)
            .await;
    };
    if timeout(Duration::from_secs(cfg.graceful_timeout), drain)
        .await
        .is_err()
    {
        tracing::warn!("graceful timeout expired, abandoning connections");
    }
    lifespan.shutdown().await;
    Ok(())
}

enum AcceptSocket {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

fn tokio_listener(listener: &Listener) -> io::Result<AcceptSocket> {
    match listener {
        Listener::Tcp { sock, .. } => {
            let cloned = sock.try_clone()?;
            cloned.set_nonblocking(true)?;
            Ok(AcceptSocket::Tcp(tokio::net::TcpListener::from_std(cloned)?))
        }
        Listener::Unix { sock, .. } => {
            let cloned = sock.try_clone()?;
            cloned.set_nonblocking(true)?;
            Ok(AcceptSocket::Unix(tokio::net::UnixListener::from_std(
                cloned,
            )?))
        }
    }
}

async fn accept_loop(
    accept: AcceptSocket,
    server: (String, u16),
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let tls = shared.cfg.tls.clone().map(tokio_rustls::TlsAcceptor::from);
    loop {
        // Backpressure: no permit, no accept.
        let permit = tokio::select! {
            permit = Arc::clone(&shared.conns).acquire_owned() => permit.expect("semaphore closed"),
            _ = shutdown.changed() => return,
        };
        let accepted = tokio::select! {
            accepted = accept_one(&accept) => accepted,
            _ = shutdown.changed() => return,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!(error = %e, "accept failed");
                continue;
            }
        };
        let shared = Arc::clone(&shared);
        let server = server.clone();
        let shutdown = shutdown.clone();
        let tls = tls.clone();
        // The permit rides inside the task and frees a slot when it ends.
        tokio::spawn(async move {
            let _slot = permit;
            match (stream, tls) {
                (AcceptedStream::Tcp(tcp), Some(tls)) if shared.cfg.is_ssl => {
                    match tls.accept(tcp).await {
                        Ok(stream) => {
                            let h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2");
                            serve_stream(stream, h2, peer, server, shared, shutdown).await;
                        }
                        Err(e) => tracing::debug!(error = %e, "tls accept failed"),
                    }
                }
                (AcceptedStream::Tcp(tcp), _) => {
                    serve_stream(tcp, false, peer, server, shared, shutdown).await;
                }
                (AcceptedStream::Unix(stream), _) => {
                    serve_stream(stream, false, peer, server, shared, shutdown).await;
                }
            }
        });
    }
}

enum AcceptedStream {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

async fn accept_one(accept: &AcceptSocket) -> io::Result<(AcceptedStream, PeerAddr)> {
    match accept {
        AcceptSocket::Tcp(listener) => {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            Ok((AcceptedStream::Tcp(stream), PeerAddr::Tcp(peer)))
        }
        AcceptSocket::Unix(listener) => {
            let (stream, _) = listener.accept().await?;
            Ok((AcceptedStream::Unix(stream), PeerAddr::Unix))
        }
    }
}

/// Serve one connection: h2 by ALPN or preface, otherwise the h1 keepalive
/// loop with WebSocket hand-off.
async fn serve_stream<S>(
    stream: S,
    h2_hint: bool,
    peer: PeerAddr,
    server: (String, u16),
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut unreader = AsyncUnreader::new(read);

    if h2_hint || sniff_h2_preface(&mut unreader).await {
        serve_h2(&mut unreader, &mut write, &peer, &server, &shared).await;
        return;
    }

    let cfg = &shared.cfg;
    let mut req_number = 0u64;
    let mut proxy_info: Option<crate::protocol::http::request::ProxyInfo> = None;
    loop {
        if *shutdown.borrow() {
            return;
        }
        req_number += 1;

        // Idle keepalive bound between requests.
        let parsed = if req_number > 1 {
            match timeout(
                Duration::from_secs(cfg.keepalive),
                parse_async(&mut unreader, peer.clone(), req_number, cfg),
            )
            .await
            {
                Ok(parsed) => parsed,
                Err(_) => return,
            }
        } else {
            parse_async(&mut unreader, peer.clone(), req_number, cfg).await
        };

        let mut request = match parsed {
            Ok(req) => req,
            Err(e) => {
                if !e.is_transport() {
                    tracing::info!(error = %e, "rejecting malformed request");
                    let mut buf = Vec::new();
                    let _ = write_error_response(&mut buf, e.status_hint(), (1, 1));
                    let _ = write.write_all(&buf).await;
                }
                return;
            }
        };
        request.server = Some(server.clone());

        // The proxy prelude arrives once; its client address holds for the
        // connection's whole life.
        if req_number == 1 {
            proxy_info = request.proxy_protocol_info.clone();
        } else if let Some(info) = &proxy_info {
            request.remote_addr = PeerAddr::Tcp(info.client_addr);
            request.proxy_protocol_info = Some(info.clone());
        }

        if request.is_websocket_upgrade() {
            serve_websocket(&mut unreader, &mut write, request, &shared).await;
            return;
        }

        let keepalive = serve_http1_request(&mut unreader, &mut write, &request, &shared).await;
        shared.served.fetch_add(1, Ordering::Relaxed);
        if !keepalive {
            return;
        }
    }
}

async fn sniff_h2_preface<R: AsyncRead + Unpin>(unreader: &mut AsyncUnreader<R>) -> bool {
    use crate::protocol::http::h2::CONNECTION_PREFACE;
    let mut seen: Vec<u8> = Vec::new();
    let result = loop {
        if seen.len() >= CONNECTION_PREFACE.len() {
            break true;
        }
        match unreader.read().await {
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
    unreader.unread(&seen);
    result
}

fn http_scope(request: &Request, shared: &Shared) -> HttpScope {
    HttpScope {
        http_version: match request.version {
            (2, _) => "2".to_string(),
            (major, minor) => format!("{}.{}", major, minor),
        },
        method: request.method.clone(),
        scheme: request.scheme.as_str().to_string(),
        path: request.path.clone(),
        raw_path: Bytes::copy_from_slice(request.uri.as_bytes()),
        query_string: Bytes::copy_from_slice(request.query.as_bytes()),
        root_path: shared.cfg.root_path.clone(),
        headers: request
            .headers
            .iter()
            .map(|(n, v)| {
                (
                    Bytes::copy_from_slice(n.to_ascii_lowercase().as_bytes()),
                    Bytes::copy_from_slice(v.as_bytes()),
                )
            })
            .collect(),
        server: request.server.clone(),
        client: match &request.remote_addr {
            PeerAddr::Tcp(sa) => Some((sa.ip().to_string(), sa.port())),
            PeerAddr::Unix => None,
        },
        state: Arc::clone(&shared.state),
    }
}

/// Bridge one HTTP/1 request to the application. Returns the keepalive
/// decision.
async fn serve_http1_request<R, W>(
    unreader: &mut AsyncUnreader<R>,
    write: &mut W,
    request: &Request,
    shared: &Shared,
) -> bool
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cfg = &shared.cfg;
    if let Some(hook) = &cfg.hooks.pre_request {
        hook(request);
    }
    let scope = Scope::Http(http_scope(request, shared));
    let (to_app, app_rx) = mpsc::channel::<Event>(16);
    let (app_tx, mut from_app) = mpsc::channel::<Event>(16);
    let fut = shared
        .app
        .call(scope, Receive::new(app_rx), AppSend::new(app_tx));
    let mut app_task = tokio::spawn(async move {
        if let Err(e) = fut.await {
            tracing::error!(error = %e, "application error");
        }
    });

    let mut framer = BodyFramer::new(request.body_kind);
    if framer.done {
        // Bodyless request: one empty body event completes the stream.
        let _ = to_app
            .send(Event::HttpRequest {
                body: Bytes::new(),
                more_body: false,
            })
            .await;
    }
    let mut writer = ResponseWriter::new(Vec::new(), request.version, request.should_close());
    let mut response_complete = false;
    let mut disconnected = false;
    let mut write_failed = false;
    let grace = Duration::from_secs(cfg.asgi_disconnect_grace_period);
    // Armed (reset to now + grace) when the transport dies mid-request; the
    // handler is only cancelled once it expires.
    let far_future = Instant::now() + Duration::from_secs(86400 * 365);
    let grace_timer = tokio::time::sleep_until(far_future);
    tokio::pin!(grace_timer);

    loop {
        let body_active = !framer.done && !disconnected;
        tokio::select! {
            biased;
            event = from_app.recv() => {
                let Some(event) = event else { break };
                if handle_h1_response_event(event, &mut writer, write, &mut response_complete)
                    .await
                    .is_err()
                {
                    // The client went away mid-response: tell the app and
                    // grant it the disconnect grace period.
                    write_failed = true;
                    if !disconnected {
                        disconnected = true;
                        let _ = to_app.try_send(Event::HttpDisconnect);
                        grace_timer.as_mut().reset(Instant::now() + grace);
                    }
                }
            }
            chunk = framer.next(unreader, cfg), if body_active => {
                match chunk {
                    Ok(BodyChunk::Data { data, more }) => {
                        let _ = to_app.send(Event::HttpRequest { body: data, more_body: more }).await;
                    }
                    Ok(BodyChunk::Trailers(_)) => {
                        let _ = to_app.send(Event::HttpRequest { body: Bytes::new(), more_body: false }).await;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "client disconnected mid-request");
                        disconnected = true;
                        let _ = to_app.try_send(Event::HttpDisconnect);
                        grace_timer.as_mut().reset(Instant::now() + grace);
                    }
                }
            }
            _ = grace_timer.as_mut(), if disconnected => {
                tracing::debug!("disconnect grace period expired, cancelling handler");
                app_task.abort();
                break;
            }
        }
    }
    let _ = (&mut app_task).await;

    if let Some(hook) = &cfg.hooks.post_request {
        hook(request);
    }

    if disconnected || write_failed {
        return false;
    }
    if !response_complete {
        // Application ended without completing a response.
        if !writer.headers_sent() {
            let _ = writer.start(500, None, &[("Content-Length".into(), "0".into())]);
        }
        let _ = writer.finish();
        let _ = flush_writer(&mut writer, write).await;
        return false;
    }
    // Drain any unread remainder (bounded) so the transport can be reused.
    let drained = timeout(Duration::from_secs(cfg.keepalive.max(1)), async {
        while !framer.done {
            framer.next(unreader, cfg).await?;
        }
        Ok::<(), io::Error>(())
    })
    .await;
    if !matches!(drained, Ok(Ok(()))) {
        return false;
    }
    !writer.should_close()
}

async fn flush_writer<W: AsyncWrite + Unpin>(
    writer: &mut ResponseWriter<Vec<u8>>,
    write: &mut W,
) -> io::Result<()> {
    if writer.get_mut().is_empty() {
        return Ok(());
    }
    let buf = std::mem::take(writer.get_mut());
    write.write_all(&buf).await?;
    write.flush().await
}

async fn handle_h1_response_event<W: AsyncWrite + Unpin>(
    event: Event,
    writer: &mut ResponseWriter<Vec<u8>>,
    write: &mut W,
    response_complete: &mut bool,
) -> io::Result<()> {
    match event {
        Event::HttpResponseStart { status, headers, .. } => {
            let headers = bytes_headers_to_strings(&headers);
            writer.start(status, None, &headers)?;
        }
        Event::HttpResponseInformational { status, headers } => {
            let headers = bytes_headers_to_strings(&headers);
            writer.send_informational(status, &headers)?;
            flush_writer(writer, write).await?;
        }
        Event::HttpResponseBody { body, more_body } => {
            writer.write(&body)?;
            if !more_body {
                writer.finish()?;
                *response_complete = true;
            }
            flush_writer(writer, write).await?;
        }
        Event::HttpResponseTrailers { .. } => {
            // HTTP/1 responses carry no trailers here; recorded and dropped.
        }
        other => {
            tracing::debug!(event = ?other, "unexpected application event for http scope");
        }
    }
    Ok(())
}

fn bytes_headers_to_strings(headers: &[(Bytes, Bytes)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(n, v)| {
            (
                String::from_utf8_lossy(n).into_owned(),
                String::from_utf8_lossy(v).into_owned(),
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// HTTP/2
// ---------------------------------------------------------------------------

async fn serve_h2<R, W>(
    unreader: &mut AsyncUnreader<R>,
    write: &mut W,
    peer: &PeerAddr,
    server: &(String, u16),
    shared: &Shared,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cfg = &shared.cfg;
    let mut h2 = H2Connection::new(cfg);
    h2.initiate();
    if flush_h2(&mut h2, write).await.is_err() {
        return;
    }
    loop {
        let chunk = match unreader.read().await {
            Ok(chunk) if chunk.is_empty() => return,
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "h2 transport read failed");
                return;
            }
        };
        let requests = match h2.receive_data(&chunk) {
            Ok(reqs) => reqs,
            Err(e) => {
                tracing::info!(error = %e, "h2 connection error");
                let _ = flush_h2(&mut h2, write).await;
                return;
            }
        };
        if flush_h2(&mut h2, write).await.is_err() {
            return;
        }
        let mut pending: std::collections::VecDeque<_> = requests.into();
        while let Some(h2_req) = pending.pop_front() {
            shared.served.fetch_add(1, Ordering::Relaxed);
            if serve_h2_request(
                unreader,
                write,
                &mut h2,
                h2_req,
                &mut pending,
                peer,
                server,
                shared,
            )
            .await
            .is_err()
            {
                return;
            }
        }
        if h2.is_closed() {
            let _ = flush_h2(&mut h2, write).await;
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_h2_request<R, W>(
    unreader: &mut AsyncUnreader<R>,
    write: &mut W,
    h2: &mut H2Connection,
    h2_req: crate::protocol::http::h2::H2Request,
    pending: &mut std::collections::VecDeque<crate::protocol::http::h2::H2Request>,
    peer: &PeerAddr,
    server: &(String, u16),
    shared: &Shared,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let stream_id = h2_req.stream_id;
    let (path, query) = match h2_req.path.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (h2_req.path.clone(), String::new()),
    };
    let mut headers: Vec<(Bytes, Bytes)> = Vec::with_capacity(h2_req.headers.len() + 1);
    if !h2_req.authority.is_empty() {
        headers.push((
            Bytes::from_static(b"host"),
            Bytes::copy_from_slice(h2_req.authority.as_bytes()),
        ));
    }
    for (n, v) in &h2_req.headers {
        headers.push((
            Bytes::copy_from_slice(n.as_bytes()),
            Bytes::copy_from_slice(v.as_bytes()),
        ));
    }
    let scope = Scope::Http(HttpScope {
        http_version: "2".into(),
        method: h2_req.method.clone(),
        scheme: h2_req.scheme.clone(),
        path,
        raw_path: Bytes::copy_from_slice(h2_req.path.as_bytes()),
        query_string: Bytes::copy_from_slice(query.as_bytes()),
        root_path: shared.cfg.root_path.clone(),
        headers,
        server: Some(server.clone()),
        client: match peer {
            PeerAddr::Tcp(sa) => Some((sa.ip().to_string(), sa.port())),
            PeerAddr::Unix => None,
        },
        state: Arc::clone(&shared.state),
    });

    let (to_app, app_rx) = mpsc::channel::<Event>(4);
    let (app_tx, mut from_app) = mpsc::channel::<Event>(16);
    let fut = shared
        .app
        .call(scope, Receive::new(app_rx), AppSend::new(app_tx));
    let app_task = tokio::spawn(async move {
        if let Err(e) = fut.await {
            tracing::error!(error = %e, "application error on h2 stream");
        }
    });
    let _ = to_app
        .send(Event::HttpRequest {
            body: h2_req.body.clone(),
            more_body: false,
        })
        .await;

    let mut sent_headers = false;
    let mut want_trailers = false;
    while let Some(event) = from_app.recv().await {
        match event {
            Event::HttpResponseStart {
                status,
                headers,
                trailers,
            } => {
                want_trailers = trailers;
                let headers = bytes_headers_to_strings(&headers);
                let delivered = h2
                    .send_response_headers(stream_id, status, &headers, false)
                    .map_err(h2_io)?;
                sent_headers = delivered;
            }
            Event::HttpResponseInformational { status, headers } => {
                let headers = bytes_headers_to_strings(&headers);
                let _ = h2
                    .send_informational(stream_id, status, &headers)
                    .map_err(h2_io)?;
            }
            Event::HttpResponseBody { body, more_body } => {
                if sent_headers {
                    let end_stream = !more_body && !want_trailers;
                    let outcome = h2.send_body(stream_id, &body, end_stream).map_err(h2_io)?;
                    if outcome == SendOutcome::Blocked {
                        pump_h2(unreader, write, h2, stream_id, pending).await?;
                    }
                }
            }
            Event::HttpResponseTrailers { headers } => {
                if sent_headers {
                    let headers = bytes_headers_to_strings(&headers);
                    let _ = h2.send_trailers(stream_id, &headers).map_err(h2_io)?;
                }
            }
            other => {
                tracing::debug!(event = ?other, "unexpected application event for h2 scope");
            }
        }
        flush_h2(h2, write).await?;
    }
    let _ = app_task.await;
    flush_h2(h2, write).await
}

/// While a stream is blocked on its send window, feed receive so the
/// client's WINDOW_UPDATEs land; bounded retries.
async fn pump_h2<R, W>(
    unreader: &mut AsyncUnreader<R>,
    write: &mut W,
    h2: &mut H2Connection,
    stream_id: u32,
    pending: &mut std::collections::VecDeque<crate::protocol::http::h2::H2Request>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut budget = 256u32;
    loop {
        match h2.pump(stream_id).map_err(h2_io)? {
            SendOutcome::Complete => return flush_h2(h2, write).await,
            SendOutcome::Blocked => {
                flush_h2(h2, write).await?;
                if budget == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "send window never reopened",
                    ));
                }
                budget -= 1;
                let chunk = unreader.read().await?;
                if chunk.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection lost while flow-control blocked",
                    ));
                }
                pending.extend(h2.receive_data(&chunk).map_err(h2_io)?);
            }
        }
    }
}

async fn flush_h2<W: AsyncWrite + Unpin>(h2: &mut H2Connection, write: &mut W) -> io::Result<()> {
    let out = h2.take_output();
    if out.is_empty() {
        return Ok(());
    }
    write.write_all(&out).await?;
    write.flush().await
}

fn h2_io(e: crate::protocol::http::h2::H2Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

async fn serve_websocket<R, W>(
    unreader: &mut AsyncUnreader<R>,
    write: &mut W,
    request: Request,
    shared: &Shared,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let upgrade = match handshake::validate_upgrade(&request) {
        Ok(upgrade) => upgrade,
        Err(e) => {
            tracing::info!(error = %e, "rejecting websocket upgrade");
            let mut buf = Vec::new();
            let _ = write_error_response(&mut buf, 400, request.version);
            let _ = write.write_all(&buf).await;
            return;
        }
    };

    let http = http_scope(&request, shared);
    let scope = Scope::WebSocket(WebSocketScope {
        http_version: http.http_version,
        scheme: if request.scheme == crate::protocol::http::Scheme::Https {
            "wss".into()
        } else {
            "ws".into()
        },
        path: http.path,
        raw_path: http.raw_path,
        query_string: http.query_string,
        root_path: http.root_path,
        headers: http.headers,
        subprotocols: upgrade.subprotocols.clone(),
        server: http.server,
        client: http.client,
        state: Arc::clone(&shared.state),
    });

    let (to_app, app_rx) = mpsc::channel::<Event>(64);
    let (app_tx, mut from_app) = mpsc::channel::<Event>(64);
    let fut = shared
        .app
        .call(scope, Receive::new(app_rx), AppSend::new(app_tx));
    let app_task = tokio::spawn(async move {
        if let Err(e) = fut.await {
            tracing::debug!(error = %e, "websocket application ended with error");
        }
    });
    let _ = to_app.send(Event::WebSocketConnect).await;

    let mut ws = WsConnection::new();
    let mut accepted = false;
    let mut peer_gone = false;

    loop {
        tokio::select! {
            event = from_app.recv() => {
                let Some(event) = event else { break };
                match event {
                    Event::WebSocketAccept { subprotocol } => {
                        if !accepted {
                            accepted = true;
                            let response =
                                handshake::build_response(&upgrade, subprotocol.as_deref());
                            if write.write_all(&response).await.is_err() {
                                break;
                            }
                        }
                    }
                    Event::WebSocketSendText(text) => {
                        if accepted {
                            ws.send_text(&text);
                        }
                    }
                    Event::WebSocketSendBytes(data) => {
                        if accepted {
                            ws.send_binary(&data);
                        }
                    }
                    Event::WebSocketClose { code, reason } => {
                        if accepted {
                            ws.queue_close(code, &reason);
                        } else {
                            // Rejected before accept: plain 403.
                            let mut buf = Vec::new();
                            let _ = write_error_response(&mut buf, 403, request.version);
                            let _ = write.write_all(&buf).await;
                        }
                        let _ = flush_ws(&mut ws, write).await;
                        break;
                    }
                    other => {
                        tracing::debug!(event = ?other, "unexpected application event for websocket scope");
                    }
                }
                if flush_ws(&mut ws, write).await.is_err() {
                    peer_gone = true;
                    break;
                }
            }
            chunk = unreader.read(), if accepted && !peer_gone => {
                match chunk {
                    Ok(data) if data.is_empty() => {
                        peer_gone = true;
                        let _ = to_app.try_send(Event::WebSocketDisconnect { code: 1006 });
                    }
                    Ok(data) => {
                        match ws.receive(&data) {
                            Ok(()) => {}
                            Err(e) => {
                                tracing::debug!(error = %e, "websocket protocol error");
                                let _ = flush_ws(&mut ws, write).await;
                                let _ = to_app
                                    .try_send(Event::WebSocketDisconnect { code: e.close_code });
                                break;
                            }
                        }
                        while let Some(message) = ws.next_message() {
                            let event = match message {
                                WsMessage::Text(text) => Event::WebSocketReceiveText(text),
                                WsMessage::Binary(data) => Event::WebSocketReceiveBytes(data),
                                WsMessage::Disconnect { code } => {
                                    let _ = flush_ws(&mut ws, write).await;
                                    let _ = to_app.try_send(Event::WebSocketDisconnect { code });
                                    peer_gone = true;
                                    break;
                                }
                            };
                            if to_app.send(event).await.is_err() {
                                break;
                            }
                        }
                        if flush_ws(&mut ws, write).await.is_err() {
                            peer_gone = true;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "websocket transport error");
                        peer_gone = true;
                        let _ = to_app.try_send(Event::WebSocketDisconnect { code: 1006 });
                    }
                }
            }
        }
    }
    drop(to_app);
    let _ = app_task.await;
}

async fn flush_ws<W: AsyncWrite + Unpin>(ws: &mut WsConnection, write: &mut W) -> io::Result<()> {
    let out = ws.take_output();
    if out.is_empty() {
        return Ok(());
    }
    write.write_all(&out).await?;
    write.flush().await
}

// Re-exported for engine consumers.
pub use lifespan::Lifespan;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicBool;
    use tokio::io::AsyncReadExt;

    fn shared_with(cfg: Config, app: Arc<dyn AsgiApplication>) -> Arc<Shared> {
        Arc::new(Shared {
            conns: Arc::new(Semaphore::new(cfg.worker_connections)),
            cfg: Arc::new(cfg),
            app,
            state: Arc::new(std::sync::RwLock::new(HashMap::new())),
            served: AtomicU64::new(0),
        })
    }

    type AppFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

    fn hello_app() -> Arc<dyn AsgiApplication> {
        Arc::new(
            |scope: Scope, mut receive: Receive, send: AppSend| -> AppFuture {
                Box::pin(async move {
                    let Scope::Http(_) = scope else { return Ok(()) };
                    // Consume the request body.
                    while let Some(Event::HttpRequest { more_body, .. }) = receive.recv().await {
                        if !more_body {
                            break;
                        }
                    }
                    send.send(Event::HttpResponseStart {
                        status: 200,
                        headers: vec![(
                            Bytes::from_static(b"content-length"),
                            Bytes::from_static(b"5"),
                        )],
                        trailers: false,
                    })
                    .await?;
                    send.send(Event::HttpResponseBody {
                        body: Bytes::from_static(b"hello"),
                        more_body: false,
                    })
                    .await?;
                    Ok(())
                })
            },
        )
    }

    #[tokio::test]
    async fn http1_request_response_over_duplex() {
        let (client, server) = tokio::io::duplex(16384);
        let shared = shared_with(Config::default(), hello_app());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer = PeerAddr::Tcp("127.0.0.1:5000".parse().unwrap());
        let server_task = tokio::spawn(async move {
            serve_stream(
                server,
                false,
                peer,
                ("test".into(), 80),
                shared,
                shutdown_rx,
            )
            .await;
        });

        let (mut read, mut write) = tokio::io::split(client);
        write
            .write_all(b"GET /x HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        read.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("hello"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn keepalive_serves_second_request() {
        let (client, server) = tokio::io::duplex(16384);
        let shared = shared_with(Config::default(), hello_app());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer = PeerAddr::Tcp("127.0.0.1:5001".parse().unwrap());
        tokio::spawn(async move {
            serve_stream(
                server,
                false,
                peer,
                ("test".into(), 80),
                shared,
                shutdown_rx,
            )
            .await;
        });

        let (mut read, mut write) = tokio::io::split(client);
        write
            .write_all(b"GET /a HTTP/1.1\r\nHost: t\r\n\r\nGET /b HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        read.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        let bodies = text.matches("hello").count();
        assert_eq!(bodies, 2, "{}", text);
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[tokio::test(start_paused = false)]
    async fn disconnect_grace_period_before_cancel() {
        // Scenario: the application is sleeping; the client half-closes.
        // receive() must deliver http.disconnect, and cancellation waits out
        // the grace period.
        let saw_disconnect = Arc::new(AtomicBool::new(false));
        let was_cancelled = Arc::new(AtomicBool::new(true));
        let saw = Arc::clone(&saw_disconnect);
        let fin = Arc::clone(&was_cancelled);
        let app: Arc<dyn AsgiApplication> = Arc::new(
            move |_scope: Scope, mut receive: Receive, _send: AppSend| -> AppFuture {
                let saw = Arc::clone(&saw);
                let fin = Arc::clone(&fin);
                Box::pin(async move {
                    loop {
                        match receive.recv().await {
                            Some(Event::HttpDisconnect) => {
                                saw.store(true, Ordering::SeqCst);
                                // Keep sleeping well past the grace period;
                                // only cancellation ends this.
                                tokio::time::sleep(Duration::from_secs(30)).await;
                                fin.store(false, Ordering::SeqCst);
                                return Ok(());
                            }
                            Some(_) => {}
                            None => return Ok(()),
                        }
                    }
                })
            },
        );
        let cfg = Config {
            asgi_disconnect_grace_period: 1,
            ..Config::default()
        };
        let shared = shared_with(cfg, app);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer = PeerAddr::Tcp("127.0.0.1:5002".parse().unwrap());

        let (client, server) = tokio::io::duplex(16384);
        let started = std::time::Instant::now();
        let server_task = tokio::spawn(async move {
            serve_stream(
                server,
                false,
                peer,
                ("test".into(), 80),
                shared,
                shutdown_rx,
            )
            .await;
        });

        let mut client = client;
        // Declared 10-byte body, but only 2 arrive before the half-close.
        client
            .write_all(b"POST /slow HTTP/1.1\r\nHost: t\r\nContent-Length: 10\r\n\r\nab")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        server_task.await.unwrap();
        let elapsed = started.elapsed();
        assert!(saw_disconnect.load(Ordering::SeqCst), "no http.disconnect");
        assert!(was_cancelled.load(Ordering::SeqCst), "handler ran to the end");
        assert!(
            elapsed >= Duration::from_millis(900),
            "cancelled before the grace period: {:?}",
            elapsed
        );
        assert!(
            elapsed < Duration::from_secs(10),
            "grace period not enforced: {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn websocket_fragmented_text_bridges_single_message() {
        use crate::protocol::websocket::frame::{
            client_frame, OP_CLOSE, OP_CONTINUATION, OP_TEXT,
        };

        // Echo app: accept, repeat the first text message back, close.
        let app: Arc<dyn AsgiApplication> = Arc::new(
            |scope: Scope, mut receive: Receive, send: AppSend| -> AppFuture {
                Box::pin(async move {
                    let Scope::WebSocket(_) = scope else { return Ok(()) };
                    loop {
                        match receive.recv().await {
                            Some(Event::WebSocketConnect) => {
                                send.send(Event::WebSocketAccept { subprotocol: None }).await?;
                            }
                            Some(Event::WebSocketReceiveText(text)) => {
                                send.send(Event::WebSocketSendText(format!("echo:{}", text)))
                                    .await?;
                            }
                            Some(Event::WebSocketDisconnect { .. }) | None => return Ok(()),
                            Some(_) => {}
                        }
                    }
                })
            },
        );
        let shared = shared_with(Config::default(), app);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer = PeerAddr::Tcp("127.0.0.1:5003".parse().unwrap());
        let (client, server) = tokio::io::duplex(16384);
        tokio::spawn(async move {
            serve_stream(
                server,
                false,
                peer,
                ("test".into(), 80),
                shared,
                shutdown_rx,
            )
            .await;
        });

        let (mut read, mut write) = tokio::io::split(client);
        write
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: t\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        // Read the 101 head up to its CRLFCRLF.
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            read.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head_text = String::from_utf8_lossy(&head);
        assert!(head_text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head_text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        // Fragmented TEXT: "He" + "llo, " + "World".
        write.write_all(&client_frame(OP_TEXT, false, b"He")).await.unwrap();
        write
            .write_all(&client_frame(OP_CONTINUATION, false, b"llo, "))
            .await
            .unwrap();
        write
            .write_all(&client_frame(OP_CONTINUATION, true, b"World"))
            .await
            .unwrap();

        // Exactly one echoed message comes back.
        let mut header = [0u8; 2];
        read.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x80 | OP_TEXT);
        let len = (header[1] & 0x7f) as usize;
        let mut payload = vec![0u8; len];
        read.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"echo:Hello, World");

        write
            .write_all(&client_frame(OP_CLOSE, true, &1000u16.to_be_bytes()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn h2_preface_is_sniffed_and_served() {
        use crate::protocol::http::h2::CONNECTION_PREFACE;

        let shared = shared_with(Config::default(), hello_app());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer = PeerAddr::Tcp("127.0.0.1:5004".parse().unwrap());
        let (client, server) = tokio::io::duplex(65536);
        tokio::spawn(async move {
            serve_stream(
                server,
                false,
                peer,
                ("test".into(), 80),
                shared,
                shutdown_rx,
            )
            .await;
        });

        let (mut read, mut write) = tokio::io::split(client);
        // Client preface + empty SETTINGS + a GET on stream 1.
        let mut writer = crate::protocol::http::h2::H2Writer::new();
        writer.write_settings(&[]).unwrap();
        let mut block = bytes::BytesMut::new();
        crate::protocol::http::hpack::encode_headers(
            &[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "t"),
            ],
            &mut block,
        )
        .unwrap();
        writer.write_headers(1, &block, true).unwrap();
        let mut bytes_out = CONNECTION_PREFACE.to_vec();
        bytes_out.extend_from_slice(&writer.take_buffer());
        write.write_all(&bytes_out).await.unwrap();

        // Collect frames until the DATA frame with "hello" shows up.
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        let found = loop {
            let n = read.read(&mut buf).await.unwrap();
            if n == 0 {
                break false;
            }
            collected.extend_from_slice(&buf[..n]);
            if collected
                .windows(5)
                .any(|w| w == b"hello")
            {
                break true;
            }
        };
        assert!(found, "no h2 DATA with the response body");
    }
}
