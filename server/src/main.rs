/*
 * main.rs
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

//! The server shell: install the log subscriber, settle a configuration,
//! hand an application to the supervisor. Config-file loading and CLI
//! parsing belong to the embedder; this binary reads a couple of
//! environment knobs and serves a placeholder application.

use std::io;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use forchetta_core::app::{RequestBody, StartResponse, WsgiBody};
use forchetta_core::listener::Address;
use forchetta_core::protocol::http::request::Request;
use forchetta_core::supervisor::Supervisor;
use forchetta_core::worker::AppHandle;
use forchetta_core::Config;

fn demo_app(
    request: &Request,
    _body: &mut dyn RequestBody,
    response: &mut dyn StartResponse,
) -> io::Result<WsgiBody> {
    let body = format!("forchetta serving {} {}\n", request.method, request.path);
    response.start(
        200,
        None,
        &[
            ("Content-Type".into(), "text/plain".into()),
            ("Content-Length".into(), body.len().to_string()),
        ],
    )?;
    Ok(WsgiBody::Bytes(body.into()))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = std::env::var("FORCHETTA_BIND").unwrap_or_else(|_| "127.0.0.1:8000".to_string());
    let mut cfg = Config::default();
    if let Ok(workers) = std::env::var("FORCHETTA_WORKERS") {
        if let Ok(n) = workers.parse() {
            cfg.workers = n;
        }
    }
    if let Ok(threads) = std::env::var("FORCHETTA_THREADS") {
        if let Ok(n) = threads.parse() {
            cfg.threads = n;
        }
    }

    let addresses: Vec<Address> = match bind
        .split(',')
        .map(|s| Address::parse(s))
        .collect::<Result<_, _>>()
    {
        Ok(addresses) => addresses,
        Err(e) => {
            eprintln!("forchetta: {}", e);
            std::process::exit(1);
        }
    };

    let app = AppHandle::Sync(Arc::new(demo_app));
    let supervisor = match Supervisor::new(cfg, &addresses, app) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            eprintln!("forchetta: failed to boot: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = supervisor.run() {
        eprintln!("forchetta: {}", e);
        std::process::exit(1);
    }
}
