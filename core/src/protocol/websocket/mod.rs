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

//! WebSocket server side (RFC 6455): opening handshake, frame codec with
//! client-masking enforcement, fragmentation and control-frame handling.

pub mod connection;
pub mod frame;
pub mod handshake;

pub use connection::{WsConnection, WsError, WsMessage};
pub use frame::{encode_frame, FrameParser, ParsedFrame};
pub use handshake::{accept_key, validate_upgrade, HandshakeError};
