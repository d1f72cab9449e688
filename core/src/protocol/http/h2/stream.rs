/*
 * stream.rs
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

//! Per-stream state machine (RFC 7540 §5.1). One stream is one
//! request/response exchange; the connection owns the table of streams and
//! destroys an entry once it is closed.

use bytes::BytesMut;
use std::fmt;

use super::super::HeaderList;

/// RFC 7540 §5.1 states. Reserved states are omitted: the server never
/// pushes, so nothing can be reserved in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// A stream-level protocol violation, answered with RST_STREAM.
#[derive(Debug)]
pub struct StreamError {
    pub stream_id: u32,
    pub message: String,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {}: {}", self.stream_id, self.message)
    }
}

impl std::error::Error for StreamError {}

/// One HTTP/2 stream: state, accumulated request, response progress, flow
/// control and priority.
pub struct Stream {
    pub id: u32,
    pub state: StreamState,

    // Request accumulation
    pub request_headers: HeaderList,
    pub request_body: BytesMut,
    pub trailers: Option<HeaderList>,
    pub request_complete: bool,

    // Response progress
    pub response_started: bool,
    pub response_headers_sent: bool,
    pub response_complete: bool,
    /// Set when the client reset the stream; writes become no-ops.
    pub reset_by_peer: bool,

    /// Peer-granted send window for this stream.
    pub send_window: i64,
    /// Our receive window for this stream.
    pub recv_window: i64,

    // Priority (RFC 7540 §5.3), recorded for scheduling.
    pub weight: u16,
    pub depends_on: u32,
    pub exclusive: bool,
}

impl Stream {
    pub fn new(id: u32, initial_send_window: i64, initial_recv_window: i64) -> Self {
        Stream {
            id,
            state: StreamState::Idle,
            request_headers: Vec::new(),
            request_body: BytesMut::new(),
            trailers: None,
            request_complete: false,
            response_started: false,
            response_headers_sent: false,
            response_complete: false,
            reset_by_peer: false,
            send_window: initial_send_window,
            recv_window: initial_recv_window,
            weight: 16,
            depends_on: 0,
            exclusive: false,
        }
    }

    pub fn is_client_initiated(&self) -> bool {
        self.id % 2 == 1
    }

    fn err(&self, message: impl Into<String>) -> StreamError {
        StreamError {
            stream_id: self.id,
            message: message.into(),
        }
    }

    pub fn can_receive(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
            && !self.reset_by_peer
    }

    /// First HEADERS opens the stream; a later HEADERS block is trailers.
    pub fn receive_headers(
        &mut self,
        headers: HeaderList,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        match self.state {
            StreamState::Idle => self.state = StreamState::Open,
            StreamState::Open | StreamState::HalfClosedLocal => {
                // Trailers: must end the stream.
                if !end_stream {
                    return Err(self.err("trailers without END_STREAM"));
                }
                self.trailers = Some(headers);
                self.half_close_remote()?;
                self.request_complete = true;
                return Ok(());
            }
            _ => {
                return Err(self.err(format!("cannot receive headers in {:?}", self.state)));
            }
        }
        self.request_headers = headers;
        if end_stream {
            self.half_close_remote()?;
            self.request_complete = true;
        }
        Ok(())
    }

    pub fn receive_data(&mut self, data: &[u8], end_stream: bool) -> Result<(), StreamError> {
        if !self.can_receive() {
            return Err(self.err(format!("cannot receive data in {:?}", self.state)));
        }
        self.request_body.extend_from_slice(data);
        if end_stream {
            self.half_close_remote()?;
            self.request_complete = true;
        }
        Ok(())
    }

    pub fn send_headers(&mut self, end_stream: bool) -> Result<(), StreamError> {
        if !self.can_send() {
            return Err(self.err(format!("cannot send headers in {:?}", self.state)));
        }
        self.response_started = true;
        self.response_headers_sent = true;
        if end_stream {
            self.half_close_local()?;
            self.response_complete = true;
        }
        Ok(())
    }

    pub fn send_data(&mut self, end_stream: bool) -> Result<(), StreamError> {
        if !self.can_send() {
            return Err(self.err(format!("cannot send data in {:?}", self.state)));
        }
        if end_stream {
            self.half_close_local()?;
            self.response_complete = true;
        }
        Ok(())
    }

    pub fn send_trailers(&mut self) -> Result<(), StreamError> {
        if !self.can_send() {
            return Err(self.err(format!("cannot send trailers in {:?}", self.state)));
        }
        if !self.response_headers_sent {
            return Err(self.err("trailers before response headers"));
        }
        self.half_close_local()?;
        self.response_complete = true;
        Ok(())
    }

    /// RST_STREAM in either direction.
    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
        self.request_complete = true;
        self.response_complete = true;
    }

    pub fn update_priority(&mut self, weight: u16, depends_on: u32, exclusive: bool) {
        self.weight = weight.clamp(1, 256);
        self.depends_on = depends_on;
        self.exclusive = exclusive;
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    fn half_close_local(&mut self) -> Result<(), StreamError> {
        match self.state {
            StreamState::Open => {
                self.state = StreamState::HalfClosedLocal;
                Ok(())
            }
            StreamState::HalfClosedRemote => {
                self.state = StreamState::Closed;
                Ok(())
            }
            _ => Err(self.err(format!("cannot half-close local in {:?}", self.state))),
        }
    }

    fn half_close_remote(&mut self) -> Result<(), StreamError> {
        match self.state {
            StreamState::Open => {
                self.state = StreamState::HalfClosedRemote;
                Ok(())
            }
            StreamState::HalfClosedLocal => {
                self.state = StreamState::Closed;
                Ok(())
            }
            _ => Err(self.err(format!("cannot half-close remote in {:?}", self.state))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdrs() -> HeaderList {
        vec![(":method".into(), "GET".into()), (":path".into(), "/".into())]
    }

    #[test]
    fn request_response_lifecycle() {
        let mut s = Stream::new(1, 65535, 65535);
        assert_eq!(s.state, StreamState::Idle);
        s.receive_headers(hdrs(), false).unwrap();
        assert_eq!(s.state, StreamState::Open);
        s.receive_data(b"body", true).unwrap();
        assert_eq!(s.state, StreamState::HalfClosedRemote);
        assert!(s.request_complete);
        s.send_headers(false).unwrap();
        s.send_data(true).unwrap();
        assert_eq!(s.state, StreamState::Closed);
        assert!(s.response_complete);
    }

    #[test]
    fn headers_with_end_stream_half_closes() {
        let mut s = Stream::new(3, 65535, 65535);
        s.receive_headers(hdrs(), true).unwrap();
        assert_eq!(s.state, StreamState::HalfClosedRemote);
        assert!(s.request_complete);
    }

    #[test]
    fn second_headers_block_is_trailers() {
        let mut s = Stream::new(1, 65535, 65535);
        s.receive_headers(hdrs(), false).unwrap();
        s.receive_data(b"x", false).unwrap();
        s.receive_headers(vec![("x-check".into(), "1".into())], true)
            .unwrap();
        assert!(s.request_complete);
        assert_eq!(
            s.trailers.as_deref(),
            Some(&[("x-check".to_string(), "1".to_string())][..])
        );
    }

    #[test]
    fn trailers_without_end_stream_rejected() {
        let mut s = Stream::new(1, 65535, 65535);
        s.receive_headers(hdrs(), false).unwrap();
        assert!(s.receive_headers(vec![], false).is_err());
    }

    #[test]
    fn no_frames_after_closed() {
        let mut s = Stream::new(1, 65535, 65535);
        s.receive_headers(hdrs(), true).unwrap();
        s.send_headers(true).unwrap();
        assert!(s.is_closed());
        assert!(s.receive_data(b"x", false).is_err());
        assert!(s.send_data(false).is_err());
    }

    #[test]
    fn state_never_goes_backwards() {
        let mut s = Stream::new(1, 65535, 65535);
        s.receive_headers(hdrs(), true).unwrap();
        // Receiving again in half-closed-remote is an error, not a rewind.
        assert!(s.receive_data(b"x", false).is_err());
        assert_eq!(s.state, StreamState::HalfClosedRemote);
    }

    #[test]
    fn send_trailers_requires_headers() {
        let mut s = Stream::new(1, 65535, 65535);
        s.receive_headers(hdrs(), true).unwrap();
        assert!(s.send_trailers().is_err());
        s.send_headers(false).unwrap();
        s.send_trailers().unwrap();
        assert!(s.is_closed());
    }

    #[test]
    fn priority_clamped() {
        let mut s = Stream::new(1, 65535, 65535);
        s.update_priority(0, 3, true);
        assert_eq!(s.weight, 1);
        s.update_priority(300, 3, false);
        assert_eq!(s.weight, 256);
    }

    #[test]
    fn writes_after_reset_blocked() {
        let mut s = Stream::new(1, 65535, 65535);
        s.receive_headers(hdrs(), true).unwrap();
        s.reset_by_peer = true;
        assert!(!s.can_send());
    }
}
