/*
 * lifespan.rs
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

//! The lifespan protocol: one task per worker running the application with
//! a lifespan scope. Startup must complete before serving; shutdown is
//! signalled during graceful exit. Both waits are bounded.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::scope::{
    AppSend, AsgiApplication, Event, LifespanScope, Receive, Scope, SharedState,
};

/// Bound on startup and shutdown completion.
const LIFESPAN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct Lifespan {
    /// Server → app event queue.
    to_app: mpsc::Sender<Event>,
    /// App → server events.
    from_app: mpsc::Receiver<Event>,
    task: JoinHandle<()>,
    pub state: SharedState,
    startup_done: bool,
}

impl Lifespan {
    /// Launch the lifespan task and run startup to completion. An
    /// application refusing startup aborts the worker with a clear error.
    pub async fn start(app: Arc<dyn AsgiApplication>) -> io::Result<Lifespan> {
        let state: SharedState = Arc::new(std::sync::RwLock::new(HashMap::new()));
        let (to_app, app_rx) = mpsc::channel(8);
        let (app_tx, from_app) = mpsc::channel(8);
        let scope = Scope::Lifespan(LifespanScope {
            state: Arc::clone(&state),
        });
        let fut = app.call(scope, Receive::new(app_rx), AppSend::new(app_tx));
        let task = tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::debug!(error = %e, "lifespan application returned an error");
            }
        });
        let mut lifespan = Lifespan {
            to_app,
            from_app,
            task,
            state,
            startup_done: false,
        };
        lifespan.run_startup().await?;
        Ok(lifespan)
    }

    async fn run_startup(&mut self) -> io::Result<()> {
        let _ = self.to_app.send(Event::LifespanStartup).await;
        let reply = timeout(LIFESPAN_TIMEOUT, self.from_app.recv()).await;
        match reply {
            Ok(Some(Event::LifespanStartupComplete)) => {
                self.startup_done = true;
                tracing::debug!("lifespan startup complete");
                Ok(())
            }
            Ok(Some(Event::LifespanStartupFailed { message })) => {
                self.task.abort();
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("lifespan startup failed: {}", message),
                ))
            }
            Ok(Some(other)) => {
                self.task.abort();
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected lifespan event {:?}", other),
                ))
            }
            Ok(None) => {
                // Application finished without speaking lifespan; tolerated,
                // the state map stays empty.
                self.startup_done = true;
                tracing::debug!("application does not speak lifespan");
                Ok(())
            }
            Err(_) => {
                self.task.abort();
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "lifespan startup timed out",
                ))
            }
        }
    }

    /// Signal shutdown and wait (bounded) for completion. The task is only
    /// cancelled after the wait, never before startup completed.
    pub async fn shutdown(mut self) {
        if self.startup_done {
            let _ = self.to_app.send(Event::LifespanShutdown).await;
            match timeout(LIFESPAN_TIMEOUT, self.from_app.recv()).await {
                Ok(Some(Event::LifespanShutdownComplete)) | Ok(None) => {
                    tracing::debug!("lifespan shutdown complete");
                }
                Ok(Some(Event::LifespanShutdownFailed { message })) => {
                    tracing::error!(%message, "lifespan shutdown failed");
                }
                Ok(Some(other)) => {
                    tracing::debug!(event = ?other, "unexpected lifespan event at shutdown");
                }
                Err(_) => {
                    tracing::warn!("lifespan shutdown timed out");
                }
            }
        }
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn app_completing() -> Arc<dyn AsgiApplication> {
        Arc::new(
            |scope: Scope, mut receive: Receive, send: AppSend| -> std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<()>> + Send>> {
                Box::pin(async move {
                    let Scope::Lifespan(_) = scope else {
                        return Ok(());
                    };
                    while let Some(event) = receive.recv().await {
                        match event {
                            Event::LifespanStartup => {
                                send.send(Event::LifespanStartupComplete).await?;
                            }
                            Event::LifespanShutdown => {
                                send.send(Event::LifespanShutdownComplete).await?;
                                break;
                            }
                            _ => {}
                        }
                    }
                    Ok(())
                })
            },
        )
    }

    #[tokio::test]
    async fn startup_then_shutdown() {
        let lifespan = Lifespan::start(app_completing()).await.unwrap();
        assert!(lifespan.state.read().unwrap().is_empty());
        lifespan.shutdown().await;
    }

    #[tokio::test]
    async fn startup_failure_aborts() {
        let app: Arc<dyn AsgiApplication> = Arc::new(
            |_scope: Scope, mut receive: Receive, send: AppSend| -> std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<()>> + Send>> {
                Box::pin(async move {
                    if let Some(Event::LifespanStartup) = receive.recv().await {
                        send.send(Event::LifespanStartupFailed {
                            message: "no database".into(),
                        })
                        .await?;
                    }
                    Ok(())
                })
            },
        );
        let err = Lifespan::start(app).await.unwrap_err();
        assert!(err.to_string().contains("no database"));
    }

    #[tokio::test]
    async fn app_without_lifespan_is_tolerated() {
        let app: Arc<dyn AsgiApplication> = Arc::new(
            |_scope: Scope, _receive: Receive, _send: AppSend| -> std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<()>> + Send>> {
                Box::pin(async { Ok(()) })
            },
        );
        let lifespan = Lifespan::start(app).await.unwrap();
        lifespan.shutdown().await;
    }

    #[tokio::test]
    async fn state_written_at_startup_is_visible_later() {
        let app: Arc<dyn AsgiApplication> = Arc::new(
            |scope: Scope, mut receive: Receive, send: AppSend| -> std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<()>> + Send>> {
                Box::pin(async move {
                    let Scope::Lifespan(lifespan) = scope else {
                        return Ok(());
                    };
                    while let Some(event) = receive.recv().await {
                        match event {
                            Event::LifespanStartup => {
                                lifespan
                                    .state
                                    .write()
                                    .unwrap()
                                    .insert("pool_size".into(), json!(8));
                                send.send(Event::LifespanStartupComplete).await?;
                            }
                            Event::LifespanShutdown => {
                                send.send(Event::LifespanShutdownComplete).await?;
                                break;
                            }
                            _ => {}
                        }
                    }
                    Ok(())
                })
            },
        );
        let lifespan = Lifespan::start(app).await.unwrap();
        assert_eq!(
            lifespan.state.read().unwrap().get("pool_size"),
            Some(&json!(8))
        );
        lifespan.shutdown().await;
    }
}
