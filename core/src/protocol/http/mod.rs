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

//! HTTP: the h1 request parser, body readers and response writer; the h2
//! frame layer with HPACK; shared request model and errors.

pub mod error;
pub mod h1;
pub mod h2;
pub mod hpack;
pub mod request;

pub use error::HttpError;
pub use request::{BodyKind, PeerAddr, Request, Scheme};

/// Ordered header list; names are canonical upper-case for HTTP/1.
pub type HeaderList = Vec<(String, String)>;
