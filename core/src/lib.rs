/*
 * lib.rs
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

//! Forchetta core: a pre-fork application server.
//!
//! A single supervisor process owns the listening sockets and a pool of
//! identical worker processes. Each worker accepts connections, parses an
//! HTTP/1.x, HTTP/2, uWSGI or FastCGI request, invokes the application, and
//! streams the response back. Two worker engines are provided: a threaded
//! engine (accept loop + bounded thread pool) and a single-threaded
//! cooperative async engine speaking an ASGI-shaped event protocol.

pub mod app;
pub mod config;
pub mod listener;
pub mod protocol;
pub mod supervisor;
pub mod unreader;
pub mod util;
pub mod worker;

pub use app::{Application, AsgiApplication, StartResponse, WsgiBody};
pub use config::{Config, HeaderMapPolicy, Protocol, WorkerClass};
pub use listener::{Address, Listener};
pub use supervisor::Supervisor;
