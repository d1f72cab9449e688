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

//! FastCGI responder: record codec, multiplexed per-connection request
//! accumulation, and the STDOUT/END_REQUEST response writer.

pub mod connection;
pub mod record;
pub mod response;

pub use connection::{FcgiConnection, FcgiEvent, FcgiRequest};
pub use record::{write_record, RecordHeader};
pub use response::FcgiResponseWriter;

// Protocol version
pub const FCGI_VERSION_1: u8 = 1;

// Record types
pub const FCGI_BEGIN_REQUEST: u8 = 1;
pub const FCGI_ABORT_REQUEST: u8 = 2;
pub const FCGI_END_REQUEST: u8 = 3;
pub const FCGI_PARAMS: u8 = 4;
pub const FCGI_STDIN: u8 = 5;
pub const FCGI_STDOUT: u8 = 6;
pub const FCGI_STDERR: u8 = 7;
pub const FCGI_DATA: u8 = 8;
pub const FCGI_GET_VALUES: u8 = 9;
pub const FCGI_GET_VALUES_RESULT: u8 = 10;
pub const FCGI_UNKNOWN_TYPE: u8 = 11;

// Roles (in BEGIN_REQUEST)
pub const FCGI_RESPONDER: u16 = 1;
pub const FCGI_AUTHORIZER: u16 = 2;
pub const FCGI_FILTER: u16 = 3;

// Flags (in BEGIN_REQUEST)
pub const FCGI_KEEP_CONN: u8 = 1;

// Protocol status (in END_REQUEST)
pub const FCGI_REQUEST_COMPLETE: u8 = 0;
pub const FCGI_CANT_MPX_CONN: u8 = 1;
pub const FCGI_OVERLOADED: u8 = 2;
pub const FCGI_UNKNOWN_ROLE: u8 = 3;

/// Header size (8 bytes fixed).
pub const FCGI_HEADER_LEN: usize = 8;

/// Maximum content length per record.
pub const FCGI_MAX_CONTENT_LEN: usize = 65535;

/// Parameter-count cap bounding memory per request.
pub const MAX_FCGI_PARAMS: usize = 1000;

/// Null request ID (management records).
pub const FCGI_NULL_REQUEST_ID: u16 = 0;

pub fn record_type_name(t: u8) -> &'static str {
    match t {
        FCGI_BEGIN_REQUEST => "BEGIN_REQUEST",
        FCGI_ABORT_REQUEST => "ABORT_REQUEST",
        FCGI_END_REQUEST => "END_REQUEST",
        FCGI_PARAMS => "PARAMS",
        FCGI_STDIN => "STDIN",
        FCGI_STDOUT => "STDOUT",
        FCGI_STDERR => "STDERR",
        FCGI_DATA => "DATA",
        FCGI_GET_VALUES => "GET_VALUES",
        FCGI_GET_VALUES_RESULT => "GET_VALUES_RESULT",
        FCGI_UNKNOWN_TYPE => "UNKNOWN_TYPE",
        _ => "UNKNOWN",
    }
}
