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

//! HTTP/2 server side: frame parser/writer, per-stream state machine,
//! multiplexed connection with flow control (no external h2 crate).

pub mod connection;
pub mod frame;
pub mod handler;
pub mod parser;
pub mod stream;
pub mod writer;

pub use connection::{H2Connection, H2Error, H2Request, SendOutcome};
pub use frame::error_to_string;
pub use handler::H2FrameHandler;
pub use parser::H2Parser;
pub use stream::{Stream, StreamState};
pub use writer::H2Writer;

/// HTTP/2 client connection preface (RFC 7540 §3.5).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
