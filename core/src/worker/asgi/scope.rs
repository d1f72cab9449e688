/*
 * scope.rs
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

//! The ASGI-shaped application interface: connection scopes, the typed
//! events flowing through `receive`/`send`, and the application trait.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Protocol version pair advertised in every scope.
pub const ASGI_VERSION: &str = "3.0";
pub const ASGI_SPEC_VERSION: &str = "2.4";

/// Shared lifespan state: populated by the application during startup,
/// then propagated into every request scope. Read-only after startup by
/// convention; an application mutating it later does so under its own
/// discipline.
pub type SharedState = Arc<std::sync::RwLock<HashMap<String, serde_json::Value>>>;

/// HTTP request scope.
#[derive(Debug, Clone)]
pub struct HttpScope {
    /// "1.0", "1.1" or "2".
    pub http_version: String,
    pub method: String,
    pub scheme: String,
    pub path: String,
    pub raw_path: Bytes,
    pub query_string: Bytes,
    pub root_path: String,
    /// Lower-cased name bytes, value bytes; order preserved.
    pub headers: Vec<(Bytes, Bytes)>,
    pub server: Option<(String, u16)>,
    pub client: Option<(String, u16)>,
    pub state: SharedState,
}

/// WebSocket session scope.
#[derive(Debug, Clone)]
pub struct WebSocketScope {
    pub http_version: String,
    pub scheme: String,
    pub path: String,
    pub raw_path: Bytes,
    pub query_string: Bytes,
    pub root_path: String,
    pub headers: Vec<(Bytes, Bytes)>,
    pub subprotocols: Vec<String>,
    pub server: Option<(String, u16)>,
    pub client: Option<(String, u16)>,
    pub state: SharedState,
}

/// Lifespan scope: one per worker process.
#[derive(Debug, Clone)]
pub struct LifespanScope {
    pub state: SharedState,
}

#[derive(Debug, Clone)]
pub enum Scope {
    Http(HttpScope),
    WebSocket(WebSocketScope),
    Lifespan(LifespanScope),
}

/// Events crossing the application boundary, both directions.
#[derive(Debug)]
pub enum Event {
    // Server → application
    HttpRequest { body: Bytes, more_body: bool },
    HttpDisconnect,
    WebSocketConnect,
    WebSocketReceiveText(String),
    WebSocketReceiveBytes(Bytes),
    WebSocketDisconnect { code: u16 },
    LifespanStartup,
    LifespanShutdown,

    // Application → server
    HttpResponseStart {
        status: u16,
        headers: Vec<(Bytes, Bytes)>,
        trailers: bool,
    },
    HttpResponseBody { body: Bytes, more_body: bool },
    HttpResponseTrailers { headers: Vec<(Bytes, Bytes)> },
    HttpResponseInformational {
        status: u16,
        headers: Vec<(Bytes, Bytes)>,
    },
    WebSocketAccept { subprotocol: Option<String> },
    WebSocketSendText(String),
    WebSocketSendBytes(Bytes),
    WebSocketClose { code: u16, reason: String },
    LifespanStartupComplete,
    LifespanStartupFailed { message: String },
    LifespanShutdownComplete,
    LifespanShutdownFailed { message: String },
}

/// The application's receive callable.
pub struct Receive {
    rx: mpsc::Receiver<Event>,
}

impl Receive {
    pub fn new(rx: mpsc::Receiver<Event>) -> Receive {
        Receive { rx }
    }

    /// Next server event; `None` once the server side is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// The application's send callable.
#[derive(Clone)]
pub struct AppSend {
    tx: mpsc::Sender<Event>,
}

impl AppSend {
    pub fn new(tx: mpsc::Sender<Event>) -> AppSend {
        AppSend { tx }
    }

    pub async fn send(&self, event: Event) -> io::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection task gone"))
    }
}

/// An ASGI-shaped application: called once per connection scope with its
/// receive/send pair. Object-safe so engines can hold `Arc<dyn _>`.
pub trait AsgiApplication: Send + Sync + 'static {
    fn call(
        &self,
        scope: Scope,
        receive: Receive,
        send: AppSend,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;
}

/// Closures returning boxed futures serve as applications.
impl<F> AsgiApplication for F
where
    F: Fn(Scope, Receive, AppSend) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>>
        + Send
        + Sync
        + 'static,
{
    fn call(
        &self,
        scope: Scope,
        receive: Receive,
        send: AppSend,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>> {
        self(scope, receive, send)
    }
}
