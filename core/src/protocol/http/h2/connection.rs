/*
 * connection.rs
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

//! HTTP/2 server connection: preface validation, settings exchange, the
//! stream table, flow control in both directions, and response emission.
//!
//! The connection is transport-free: the engine feeds received bytes into
//! `receive_data` and drains `take_output` to the socket. When a response
//! body is stalled on a zero send-window, the engine pumps the receive path
//! (which applies WINDOW_UPDATEs) and calls `pump` again, up to a bounded
//! retry budget.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;

use crate::config::Config;

use super::super::hpack;
use super::super::hpack::HeaderHandler;
use super::super::HeaderList;
use super::frame::*;
use super::handler::H2FrameHandler;
use super::parser::H2Parser;
use super::stream::{Stream, StreamState};
use super::writer::H2Writer;
use super::CONNECTION_PREFACE;

const DEFAULT_WINDOW: i64 = 65535;
const MAX_WINDOW: i64 = 0x7fff_ffff;

/// Connection-fatal HTTP/2 failure; a GOAWAY naming `code` has already been
/// queued in the output buffer when this is returned.
#[derive(Debug)]
pub struct H2Error {
    pub code: u32,
    pub message: String,
}

impl fmt::Display for H2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h2 connection error {}: {}", error_to_string(self.code), self.message)
    }
}

impl std::error::Error for H2Error {}

/// A complete request received on one stream.
#[derive(Debug)]
pub struct H2Request {
    pub stream_id: u32,
    pub method: String,
    pub path: String,
    pub scheme: String,
    pub authority: String,
    /// Regular headers, lower-case names as decoded.
    pub headers: HeaderList,
    pub trailers: HeaderList,
    pub body: Bytes,
}

/// Progress of a flow-controlled response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Everything written (or the stream was reset; writes are no-ops then).
    Complete,
    /// Send window exhausted; pump the receive path and call `pump` again.
    Blocked,
}

struct Continuation {
    stream_id: u32,
    end_stream: bool,
    fragment: BytesMut,
}

/// Internal state shared with the frame-handler impl. Split from the parser
/// and read buffer so `receive_data` can borrow them independently.
struct Inner {
    cfg_max_concurrent_streams: u32,
    cfg_initial_window_size: u32,
    cfg_max_frame_size: u32,
    cfg_max_header_list_size: u32,

    decoder: hpack::Decoder,
    writer: H2Writer,
    streams: HashMap<u32, Stream>,
    /// Stream ids with complete requests, in arrival order.
    ready: Vec<u32>,
    continuation: Option<Continuation>,
    /// Pending response body per stream: buffered bytes + end-stream flag.
    pending_out: HashMap<u32, (BytesMut, bool)>,

    conn_send_window: i64,
    conn_recv_window: i64,
    /// Peer's INITIAL_WINDOW_SIZE for new streams.
    peer_initial_window: i64,
    highest_stream_id: u32,
    closed: bool,
    goaway_sent: bool,
    /// First connection-fatal error seen while dispatching frames.
    error: Option<H2Error>,
}

/// The server connection.
pub struct H2Connection {
    parser: H2Parser,
    buf: BytesMut,
    preface_seen: usize,
    inner: Inner,
}

impl H2Connection {
    pub fn new(cfg: &Config) -> Self {
        let mut parser = H2Parser::new();
        parser.set_max_frame_size(cfg.http2_max_frame_size as usize);
        H2Connection {
            parser,
            buf: BytesMut::new(),
            preface_seen: 0,
            inner: Inner {
                cfg_max_concurrent_streams: cfg.http2_max_concurrent_streams,
                cfg_initial_window_size: cfg.http2_initial_window_size,
                cfg_max_frame_size: cfg.http2_max_frame_size,
                cfg_max_header_list_size: cfg.http2_max_header_list_size,
                decoder: hpack::Decoder::new(4096, cfg.http2_max_header_list_size as usize),
                writer: H2Writer::new(),
                streams: HashMap::new(),
                ready: Vec::new(),
                continuation: None,
                pending_out: HashMap::new(),
                conn_send_window: DEFAULT_WINDOW,
                conn_recv_window: DEFAULT_WINDOW,
                peer_initial_window: DEFAULT_WINDOW,
                highest_stream_id: 0,
                closed: false,
                goaway_sent: false,
                error: None,
            },
        }
    }

    /// Queue the server SETTINGS advertised on open. Call once, before the
    /// first `receive_data`.
    pub fn initiate(&mut self) {
        let inner = &mut self.inner;
        let settings = [
            (SETTINGS_HEADER_TABLE_SIZE, 4096),
            (SETTINGS_MAX_CONCURRENT_STREAMS, inner.cfg_max_concurrent_streams),
            (SETTINGS_INITIAL_WINDOW_SIZE, inner.cfg_initial_window_size),
            (SETTINGS_MAX_FRAME_SIZE, inner.cfg_max_frame_size),
            (SETTINGS_MAX_HEADER_LIST_SIZE, inner.cfg_max_header_list_size),
        ];
        let _ = inner.writer.write_settings(&settings);
    }

    /// Feed received transport bytes; returns requests that became complete.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<Vec<H2Request>, H2Error> {
        if self.inner.closed {
            return Ok(Vec::new());
        }
        self.buf.extend_from_slice(data);

        // Client connection preface before any frame.
        if self.preface_seen < CONNECTION_PREFACE.len() {
            let want = CONNECTION_PREFACE.len() - self.preface_seen;
            let have = self.buf.len().min(want);
            if self.buf[..have] != CONNECTION_PREFACE[self.preface_seen..self.preface_seen + have] {
                return Err(self.inner.fatal(ERROR_PROTOCOL_ERROR, "bad connection preface"));
            }
            let _ = self.buf.split_to(have);
            self.preface_seen += have;
            if self.preface_seen < CONNECTION_PREFACE.len() {
                return Ok(Vec::new());
            }
        }

        if self
            .parser
            .receive(&mut self.buf, &mut self.inner)
            .is_err()
        {
            return Err(self.inner.fatal(ERROR_INTERNAL_ERROR, "frame dispatch failed"));
        }
        if let Some(err) = self.inner.error.take() {
            // GOAWAY was queued by the handler.
            self.inner.closed = true;
            return Err(err);
        }
        Ok(self.inner.drain_ready())
    }

    /// Bytes queued for the transport. Empty when nothing is pending.
    pub fn take_output(&mut self) -> Bytes {
        self.inner.writer.take_buffer()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed
    }

    /// Send a complete response. Body data beyond the current send window is
    /// buffered; `pump` flushes it as WINDOW_UPDATEs arrive. Returns false
    /// if the client already reset the stream.
    pub fn send_response(
        &mut self,
        stream_id: u32,
        status: u16,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<bool, H2Error> {
        let end_stream = body.map_or(true, |b| b.is_empty());
        if !self.send_response_headers(stream_id, status, headers, end_stream)? {
            return Ok(false);
        }
        if let Some(body) = body {
            if !body.is_empty() {
                self.send_body(stream_id, body, true)?;
            }
        }
        Ok(true)
    }

    /// Send the response HEADERS frame. Returns false on a reset stream.
    pub fn send_response_headers(
        &mut self,
        stream_id: u32,
        status: u16,
        headers: &[(String, String)],
        end_stream: bool,
    ) -> Result<bool, H2Error> {
        let inner = &mut self.inner;
        let Some(stream) = inner.streams.get_mut(&stream_id) else {
            return Ok(false);
        };
        if stream.reset_by_peer {
            return Ok(false);
        }
        if stream.send_headers(end_stream).is_err() {
            return Ok(false);
        }
        let block = encode_response_headers(status, headers);
        let _ = inner.writer.write_headers(stream_id, &block, end_stream);
        inner.reap(stream_id);
        Ok(true)
    }

    /// Send a 1xx informational response (e.g. 103 Early Hints) ahead of the
    /// final HEADERS. `end_stream` is never set.
    pub fn send_informational(
        &mut self,
        stream_id: u32,
        status: u16,
        headers: &[(String, String)],
    ) -> Result<bool, H2Error> {
        if !(100..200).contains(&status) {
            return Err(H2Error {
                code: ERROR_INTERNAL_ERROR,
                message: "informational status must be 1xx".into(),
            });
        }
        let inner = &mut self.inner;
        let Some(stream) = inner.streams.get_mut(&stream_id) else {
            return Ok(false);
        };
        if stream.reset_by_peer || !stream.can_send() || stream.response_headers_sent {
            return Ok(false);
        }
        let block = encode_response_headers(status, headers);
        let _ = inner.writer.write_headers(stream_id, &block, false);
        Ok(true)
    }

    /// Queue body bytes on a stream and pump as far as flow control allows.
    pub fn send_body(
        &mut self,
        stream_id: u32,
        data: &[u8],
        end_stream: bool,
    ) -> Result<SendOutcome, H2Error> {
        let inner = &mut self.inner;
        let Some(stream) = inner.streams.get(&stream_id) else {
            return Ok(SendOutcome::Complete);
        };
        if stream.reset_by_peer {
            return Ok(SendOutcome::Complete);
        }
        let entry = inner
            .pending_out
            .entry(stream_id)
            .or_insert_with(|| (BytesMut::new(), false));
        entry.0.extend_from_slice(data);
        entry.1 = end_stream;
        self.pump(stream_id)
    }

    /// Flush a stream's buffered body within the current send windows.
    pub fn pump(&mut self, stream_id: u32) -> Result<SendOutcome, H2Error> {
        self.inner.pump_stream(stream_id)
    }

    /// Flush every stream with pending body bytes, higher priority weight
    /// first. Returns true while anything remains blocked.
    pub fn pump_all(&mut self) -> Result<bool, H2Error> {
        let mut ids: Vec<u32> = self.inner.pending_out.keys().copied().collect();
        ids.sort_by_key(|id| {
            std::cmp::Reverse(self.inner.streams.get(id).map(|s| s.weight).unwrap_or(16))
        });
        let mut blocked = false;
        for id in ids {
            if self.inner.pump_stream(id)? == SendOutcome::Blocked {
                blocked = true;
            }
        }
        Ok(blocked)
    }

    /// Send trailing headers; requires the response headers to have been
    /// sent. Trailers on a bodyless response are simply the trailer HEADERS
    /// frame carrying end-of-stream.
    pub fn send_trailers(
        &mut self,
        stream_id: u32,
        trailers: &[(String, String)],
    ) -> Result<bool, H2Error> {
        if trailers.iter().any(|(n, _)| n.starts_with(':')) {
            return Err(H2Error {
                code: ERROR_INTERNAL_ERROR,
                message: "pseudo-header in trailers".into(),
            });
        }
        let inner = &mut self.inner;
        let Some(stream) = inner.streams.get_mut(&stream_id) else {
            return Ok(false);
        };
        if stream.reset_by_peer || stream.send_trailers().is_err() {
            return Ok(false);
        }
        let pairs: Vec<(&str, &str)> = trailers
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_str()))
            .collect();
        let mut block = BytesMut::new();
        let _ = hpack::encode_headers(&pairs, &mut block);
        let _ = inner.writer.write_headers(stream_id, &block, true);
        inner.reap(stream_id);
        Ok(true)
    }

    /// Local send window available for a stream right now.
    pub fn local_flow_control_window(&self, stream_id: u32) -> i64 {
        let stream_window = self
            .inner
            .streams
            .get(&stream_id)
            .map(|s| s.send_window)
            .unwrap_or(0);
        stream_window.min(self.inner.conn_send_window).max(0)
    }

    /// Terminate the connection: GOAWAY naming the highest stream id seen,
    /// then refuse further work. Idempotent.
    pub fn close(&mut self, error_code: u32) {
        self.inner.send_goaway(error_code, "closing");
        self.inner.closed = true;
    }
}

impl Inner {
    fn fatal(&mut self, code: u32, message: &str) -> H2Error {
        self.send_goaway(code, message);
        self.closed = true;
        H2Error {
            code,
            message: message.into(),
        }
    }

    fn send_goaway(&mut self, code: u32, message: &str) {
        if !self.goaway_sent {
            let _ = self
                .writer
                .write_goaway(self.highest_stream_id, code, message.as_bytes());
            self.goaway_sent = true;
        }
    }

    fn drain_ready(&mut self) -> Vec<H2Request> {
        let ids = std::mem::take(&mut self.ready);
        let mut requests = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(stream) = self.streams.get_mut(&id) {
                match build_request(stream) {
                    Ok(req) => requests.push(req),
                    Err(msg) => {
                        tracing::debug!(stream_id = id, %msg, "malformed h2 request");
                        let _ = self.writer.write_rst_stream(id, ERROR_PROTOCOL_ERROR);
                        stream.reset();
                        self.streams.remove(&id);
                    }
                }
            }
        }
        requests
    }

    /// Drop a stream from the table once both sides are done with it.
    fn reap(&mut self, stream_id: u32) {
        let done = self
            .streams
            .get(&stream_id)
            .map(|s| s.is_closed())
            .unwrap_or(false);
        if done && !self.pending_out.contains_key(&stream_id) {
            self.streams.remove(&stream_id);
        }
    }

    fn open_streams(&self) -> u32 {
        self.streams
            .values()
            .filter(|s| !matches!(s.state, StreamState::Idle | StreamState::Closed))
            .count() as u32
    }

    fn pump_stream(&mut self, stream_id: u32) -> Result<SendOutcome, H2Error> {
        let Some((mut pending, end)) = self.pending_out.remove(&stream_id) else {
            return Ok(SendOutcome::Complete);
        };
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(SendOutcome::Complete);
        };
        if stream.reset_by_peer {
            return Ok(SendOutcome::Complete);
        }
        let max_frame = self.writer.peer_max_frame_size();
        loop {
            if pending.is_empty() {
                if end {
                    if stream.send_data(true).is_ok() {
                        let _ = self.writer.write_data(stream_id, &[], true);
                    }
                }
                self.reap(stream_id);
                return Ok(SendOutcome::Complete);
            }
            let window = stream.send_window.min(self.conn_send_window);
            if window <= 0 {
                self.pending_out.insert(stream_id, (pending, end));
                return Ok(SendOutcome::Blocked);
            }
            let take = pending.len().min(window as usize).min(max_frame);
            let chunk = pending.split_to(take);
            let last = pending.is_empty() && end;
            if stream.send_data(last).is_err() {
                // Stream died under us; drop the rest silently.
                self.reap(stream_id);
                return Ok(SendOutcome::Complete);
            }
            let _ = self.writer.write_data(stream_id, &chunk, last);
            stream.send_window -= take as i64;
            self.conn_send_window -= take as i64;
        }
    }

    fn apply_peer_settings(&mut self, settings: &[(u16, u32)]) {
        for &(id, value) in settings {
            match id {
                SETTINGS_HEADER_TABLE_SIZE => {
                    // Bounds our encoder's dynamic table; we never index
                    // dynamically on the send side, so just record validity.
                }
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value as i64 > MAX_WINDOW {
                        self.error = Some(self.fatal(
                            ERROR_FLOW_CONTROL_ERROR,
                            "INITIAL_WINDOW_SIZE exceeds 2^31-1",
                        ));
                        return;
                    }
                    let delta = value as i64 - self.peer_initial_window;
                    self.peer_initial_window = value as i64;
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&(value as usize)) {
                        self.error = Some(
                            self.fatal(ERROR_PROTOCOL_ERROR, "MAX_FRAME_SIZE out of range"),
                        );
                        return;
                    }
                    self.writer.set_peer_max_frame_size(value as usize);
                }
                SETTINGS_ENABLE_PUSH => {
                    if value > 1 {
                        self.error =
                            Some(self.fatal(ERROR_PROTOCOL_ERROR, "ENABLE_PUSH must be 0 or 1"));
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    fn decode_header_block(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
    ) {
        let mut collector = HeaderCollector::default();
        match self.decoder.decode(&mut &block[..], &mut collector) {
            Ok(()) => {}
            Err(hpack::DecodeError::ListTooLarge) => {
                self.error = Some(self.fatal(ERROR_REFUSED_STREAM, "header list too large"));
                return;
            }
            Err(e) => {
                self.error = Some(self.fatal(ERROR_COMPRESSION_ERROR, &e.to_string()));
                return;
            }
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        match stream.receive_headers(collector.0, end_stream) {
            Ok(()) => {
                if stream.request_complete {
                    self.ready.push(stream_id);
                }
            }
            Err(e) => {
                tracing::debug!(%e, "stream error on headers");
                let _ = self.writer.write_rst_stream(stream_id, ERROR_PROTOCOL_ERROR);
                stream.reset();
                self.streams.remove(&stream_id);
            }
        }
    }
}

#[derive(Default)]
struct HeaderCollector(HeaderList);

impl HeaderHandler for HeaderCollector {
    fn header(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }
}

impl H2FrameHandler for Inner {
    fn data_frame_received(&mut self, stream_id: u32, end_stream: bool, flow_len: usize, data: Bytes) {
        if self.continuation.is_some() {
            self.error = Some(self.fatal(ERROR_PROTOCOL_ERROR, "frame inside header block"));
            return;
        }
        // Flow control accounting on both the connection and the stream.
        self.conn_recv_window -= flow_len as i64;
        if self.conn_recv_window < 0 {
            self.error = Some(self.fatal(ERROR_FLOW_CONTROL_ERROR, "connection window underflow"));
            return;
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            // DATA for an unknown or already-reaped stream.
            self.error = Some(self.fatal(ERROR_PROTOCOL_ERROR, "DATA on idle stream"));
            return;
        };
        stream.recv_window -= flow_len as i64;
        if stream.recv_window < 0 {
            self.error = Some(self.fatal(ERROR_FLOW_CONTROL_ERROR, "stream window underflow"));
            return;
        }
        match stream.receive_data(&data, end_stream) {
            Ok(()) => {
                if stream.request_complete {
                    self.ready.push(stream_id);
                }
            }
            Err(e) => {
                tracing::debug!(%e, "stream error on data");
                let _ = self.writer.write_rst_stream(stream_id, ERROR_STREAM_CLOSED);
                stream.reset();
                self.streams.remove(&stream_id);
                return;
            }
        }
        // Replenish both windows by the received byte count.
        if flow_len > 0 {
            self.conn_recv_window += flow_len as i64;
            let _ = self.writer.write_window_update(0, flow_len as u32);
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                if !stream.is_closed() {
                    stream.recv_window += flow_len as i64;
                    let _ = self.writer.write_window_update(stream_id, flow_len as u32);
                }
            }
        }
    }

    fn headers_frame_received(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        stream_dependency: u32,
        exclusive: bool,
        weight: u8,
        header_block_fragment: Bytes,
    ) {
        if self.continuation.is_some() {
            self.error = Some(self.fatal(ERROR_PROTOCOL_ERROR, "HEADERS inside header block"));
            return;
        }
        if !self.streams.contains_key(&stream_id) {
            // New stream: client-initiated ids are odd and increase.
            if stream_id % 2 == 0 || stream_id <= self.highest_stream_id {
                self.error = Some(self.fatal(ERROR_PROTOCOL_ERROR, "bad client stream id"));
                return;
            }
            if self.open_streams() >= self.cfg_max_concurrent_streams {
                self.error = Some(self.fatal(ERROR_REFUSED_STREAM, "too many concurrent streams"));
                return;
            }
            self.highest_stream_id = stream_id;
            let mut stream = Stream::new(
                stream_id,
                self.peer_initial_window,
                self.cfg_initial_window_size as i64,
            );
            if weight != 16 || stream_dependency != 0 || exclusive {
                stream.update_priority(weight as u16, stream_dependency, exclusive);
            }
            self.streams.insert(stream_id, stream);
        }
        if end_headers {
            self.decode_header_block(stream_id, &header_block_fragment, end_stream);
        } else {
            self.continuation = Some(Continuation {
                stream_id,
                end_stream,
                fragment: BytesMut::from(&header_block_fragment[..]),
            });
        }
    }

    fn priority_frame_received(
        &mut self,
        stream_id: u32,
        stream_dependency: u32,
        exclusive: bool,
        weight: u8,
    ) {
        if stream_dependency == stream_id {
            self.error = Some(self.fatal(ERROR_PROTOCOL_ERROR, "stream depends on itself"));
            return;
        }
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.update_priority(weight as u16, stream_dependency, exclusive);
        }
    }

    fn rst_stream_frame_received(&mut self, stream_id: u32, error_code: u32) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            tracing::debug!(
                stream_id,
                code = error_to_string(error_code),
                "stream reset by peer"
            );
            stream.reset_by_peer = true;
            stream.reset();
            self.pending_out.remove(&stream_id);
        } else {
            self.error = Some(self.fatal(ERROR_PROTOCOL_ERROR, "RST_STREAM on idle stream"));
        }
    }

    fn settings_frame_received(&mut self, ack: bool, settings: Vec<(u16, u32)>) {
        if ack {
            return;
        }
        self.apply_peer_settings(&settings);
        if self.error.is_none() {
            let _ = self.writer.write_settings_ack();
        }
    }

    fn ping_frame_received(&mut self, ack: bool, opaque_data: u64) {
        if !ack {
            let _ = self.writer.write_ping(opaque_data, true);
        }
    }

    fn goaway_frame_received(&mut self, last_stream_id: u32, error_code: u32, _debug: Bytes) {
        tracing::debug!(
            last_stream_id,
            code = error_to_string(error_code),
            "peer sent GOAWAY"
        );
        self.closed = true;
    }

    fn window_update_frame_received(&mut self, stream_id: u32, increment: u32) {
        if stream_id == 0 {
            self.conn_send_window += increment as i64;
            if self.conn_send_window > MAX_WINDOW {
                self.error =
                    Some(self.fatal(ERROR_FLOW_CONTROL_ERROR, "connection window overflow"));
            }
        } else if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.send_window += increment as i64;
            if stream.send_window > MAX_WINDOW {
                let _ = self
                    .writer
                    .write_rst_stream(stream_id, ERROR_FLOW_CONTROL_ERROR);
                stream.reset();
            }
        }
    }

    fn continuation_frame_received(
        &mut self,
        stream_id: u32,
        end_headers: bool,
        header_block_fragment: Bytes,
    ) {
        let Some(cont) = self.continuation.as_mut() else {
            self.error = Some(self.fatal(ERROR_PROTOCOL_ERROR, "CONTINUATION without HEADERS"));
            return;
        };
        if cont.stream_id != stream_id {
            self.error = Some(self.fatal(ERROR_PROTOCOL_ERROR, "CONTINUATION stream mismatch"));
            return;
        }
        cont.fragment.extend_from_slice(&header_block_fragment);
        if end_headers {
            if let Some(cont) = self.continuation.take() {
                self.decode_header_block(stream_id, &cont.fragment, cont.end_stream);
            }
        }
    }

    fn frame_error(&mut self, error_code: u32, _stream_id: u32, message: String) {
        self.error = Some(self.fatal(error_code, &message));
    }
}

/// Map a stream's accumulated headers into an [`H2Request`], separating the
/// pseudo-headers (RFC 7540 §8.1.2).
fn build_request(stream: &mut Stream) -> Result<H2Request, String> {
    let mut method = None;
    let mut path = None;
    let mut scheme = None;
    let mut authority = None;
    let mut regular: HeaderList = Vec::new();
    let mut seen_regular = false;
    for (name, value) in stream.request_headers.drain(..) {
        if let Some(pseudo) = name.strip_prefix(':') {
            if seen_regular {
                return Err("pseudo-header after regular header".into());
            }
            let slot = match pseudo {
                "method" => &mut method,
                "path" => &mut path,
                "scheme" => &mut scheme,
                "authority" => &mut authority,
                _ => return Err(format!("unknown pseudo-header :{}", pseudo)),
            };
            if slot.is_some() {
                return Err(format!("duplicate pseudo-header :{}", pseudo));
            }
            *slot = Some(value);
        } else {
            if name.bytes().any(|b| b.is_ascii_uppercase()) {
                return Err(format!("upper-case header name {:?}", name));
            }
            seen_regular = true;
            regular.push((name, value));
        }
    }
    let method = method.ok_or(":method missing")?;
    let path = path.ok_or(":path missing")?;
    let scheme = scheme.ok_or(":scheme missing")?;
    Ok(H2Request {
        stream_id: stream.id,
        method,
        path,
        scheme,
        authority: authority.unwrap_or_default(),
        headers: regular,
        trailers: stream.trailers.take().unwrap_or_default(),
        body: stream.request_body.split().freeze(),
    })
}

/// HPACK-encode `:status` plus regular headers, lower-casing names and
/// dropping HTTP/1 connection-level headers.
fn encode_response_headers(status: u16, headers: &[(String, String)]) -> Bytes {
    let status_text = status.to_string();
    let mut pairs: Vec<(String, String)> = Vec::with_capacity(headers.len() + 1);
    pairs.push((":status".into(), status_text));
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "connection" | "keep-alive" | "transfer-encoding" | "upgrade"
        ) {
            continue;
        }
        pairs.push((lower, value.clone()));
    }
    let borrowed: Vec<(&str, &str)> = pairs.iter().map(|(n, v)| (n.as_str(), v.as_str())).collect();
    let mut block = BytesMut::new();
    let _ = hpack::encode_headers(&borrowed, &mut block);
    block.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal frame-building client for tests.
    struct TestClient {
        writer: H2Writer,
    }

    impl TestClient {
        fn new() -> Self {
            TestClient {
                writer: H2Writer::new(),
            }
        }

        fn preface_and_settings(&mut self) -> Vec<u8> {
            let mut out = CONNECTION_PREFACE.to_vec();
            self.writer.write_settings(&[]).unwrap();
            out.extend_from_slice(&self.writer.take_buffer());
            out
        }

        fn headers(&mut self, stream_id: u32, pairs: &[(&str, &str)], end_stream: bool) -> Vec<u8> {
            let mut block = BytesMut::new();
            hpack::encode_headers(pairs, &mut block).unwrap();
            self.writer
                .write_headers(stream_id, &block, end_stream)
                .unwrap();
            self.writer.take_buffer().to_vec()
        }

        fn data(&mut self, stream_id: u32, payload: &[u8], end_stream: bool) -> Vec<u8> {
            self.writer.write_data(stream_id, payload, end_stream).unwrap();
            self.writer.take_buffer().to_vec()
        }

        fn window_update(&mut self, stream_id: u32, inc: u32) -> Vec<u8> {
            self.writer.write_window_update(stream_id, inc).unwrap();
            self.writer.take_buffer().to_vec()
        }

        fn rst(&mut self, stream_id: u32, code: u32) -> Vec<u8> {
            self.writer.write_rst_stream(stream_id, code).unwrap();
            self.writer.take_buffer().to_vec()
        }
    }

    fn get_request(path: &str) -> Vec<(&str, &str)> {
        vec![
            (":method", "GET"),
            (":scheme", "http"),
            (":path", path),
            (":authority", "example"),
        ]
    }

    fn conn() -> (H2Connection, TestClient) {
        let mut conn = H2Connection::new(&Config::default());
        conn.initiate();
        let _ = conn.take_output();
        (conn, TestClient::new())
    }

    /// Count frames of a given type in a byte stream.
    fn frames_of(bytes: &[u8], frame_type: u8) -> Vec<(u32, Vec<u8>)> {
        let mut found = Vec::new();
        let mut rest = bytes;
        while rest.len() >= FRAME_HEADER_LENGTH {
            let len = (rest[0] as usize) << 16 | (rest[1] as usize) << 8 | rest[2] as usize;
            let ty = rest[3];
            let sid = ((rest[5] & 0x7f) as u32) << 24
                | (rest[6] as u32) << 16
                | (rest[7] as u32) << 8
                | rest[8] as u32;
            let payload = rest[FRAME_HEADER_LENGTH..FRAME_HEADER_LENGTH + len].to_vec();
            if ty == frame_type {
                found.push((sid, payload));
            }
            rest = &rest[FRAME_HEADER_LENGTH + len..];
        }
        found
    }

    #[test]
    fn simple_get_roundtrip() {
        let (mut conn, mut client) = conn();
        let reqs = conn.receive_data(&client.preface_and_settings()).unwrap();
        assert!(reqs.is_empty());
        // Server acked the client settings.
        let out = conn.take_output();
        assert_eq!(frames_of(&out, TYPE_SETTINGS).len(), 1);

        let reqs = conn
            .receive_data(&client.headers(1, &get_request("/hello"), true))
            .unwrap();
        assert_eq!(reqs.len(), 1);
        let req = &reqs[0];
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/hello");
        assert_eq!(req.stream_id, 1);

        let ok = conn
            .send_response(
                1,
                200,
                &[("content-type".into(), "text/plain".into())],
                Some(b"hi"),
            )
            .unwrap();
        assert!(ok);
        let out = conn.take_output();
        assert_eq!(frames_of(&out, TYPE_HEADERS).len(), 1);
        let data = frames_of(&out, TYPE_DATA);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].1, b"hi");
    }

    #[test]
    fn bad_preface_is_protocol_error() {
        let mut conn = H2Connection::new(&Config::default());
        conn.initiate();
        let err = conn.receive_data(b"GET / HTTP/1.1\r\n").unwrap_err();
        assert_eq!(err.code, ERROR_PROTOCOL_ERROR);
        let out = conn.take_output();
        assert_eq!(frames_of(&out, TYPE_GOAWAY).len(), 1);
    }

    #[test]
    fn window_updates_mirror_received_data() {
        let (mut conn, mut client) = conn();
        conn.receive_data(&client.preface_and_settings()).unwrap();
        conn.receive_data(&client.headers(1, &get_request("/up"), false))
            .unwrap();
        let _ = conn.take_output();

        let reqs = conn.receive_data(&client.data(1, b"0123456789", true)).unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(&reqs[0].body[..], b"0123456789");

        let out = conn.take_output();
        let updates = frames_of(&out, TYPE_WINDOW_UPDATE);
        // One for the connection (id 0) and one for the stream, each 10.
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].0, 0);
        assert_eq!(updates[0].1, vec![0, 0, 0, 10]);
        assert_eq!(updates[1].0, 1);
        assert_eq!(updates[1].1, vec![0, 0, 0, 10]);
    }

    #[test]
    fn flow_controlled_upload_to_window_edge() {
        // Scenario: DATA totalling the initial window, then one more byte
        // succeeds because every frame was re-credited.
        let (mut conn, mut client) = conn();
        conn.receive_data(&client.preface_and_settings()).unwrap();
        conn.receive_data(&client.headers(1, &get_request("/up"), false))
            .unwrap();
        let _ = conn.take_output();

        let window = DEFAULT_WINDOW as usize;
        let chunk = vec![0u8; 16384];
        let mut sent = 0;
        while sent < window {
            let n = chunk.len().min(window - sent);
            conn.receive_data(&client.data(1, &chunk[..n], false)).unwrap();
            sent += n;
        }
        // Every byte was re-credited, so one more byte still fits.
        let reqs = conn.receive_data(&client.data(1, b"!", true)).unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].body.len(), window + 1);
    }

    #[test]
    fn response_blocked_by_send_window_resumes_on_update() {
        let (mut conn, mut client) = conn();
        conn.receive_data(&client.preface_and_settings()).unwrap();
        conn.receive_data(&client.headers(1, &get_request("/dl"), true))
            .unwrap();
        let _ = conn.take_output();

        let body = vec![7u8; DEFAULT_WINDOW as usize + 500];
        conn.send_response_headers(1, 200, &[], false).unwrap();
        let outcome = conn.send_body(1, &body, true).unwrap();
        assert_eq!(outcome, SendOutcome::Blocked);
        let out = conn.take_output();
        let sent: usize = frames_of(&out, TYPE_DATA).iter().map(|(_, p)| p.len()).sum();
        assert_eq!(sent, DEFAULT_WINDOW as usize);

        // WINDOW_UPDATE on both levels lets the tail through.
        conn.receive_data(&client.window_update(0, 1000)).unwrap();
        conn.receive_data(&client.window_update(1, 1000)).unwrap();
        assert_eq!(conn.pump(1).unwrap(), SendOutcome::Complete);
        let out = conn.take_output();
        let tail: usize = frames_of(&out, TYPE_DATA).iter().map(|(_, p)| p.len()).sum();
        assert_eq!(tail, 500);
    }

    #[test]
    fn writes_to_reset_stream_return_false() {
        let (mut conn, mut client) = conn();
        conn.receive_data(&client.preface_and_settings()).unwrap();
        conn.receive_data(&client.headers(1, &get_request("/x"), true))
            .unwrap();
        conn.receive_data(&client.rst(1, ERROR_CANCEL)).unwrap();
        assert!(!conn.send_response(1, 200, &[], Some(b"late")).unwrap());
    }

    #[test]
    fn too_many_streams_refused() {
        let cfg = Config {
            http2_max_concurrent_streams: 1,
            ..Config::default()
        };
        let mut conn = H2Connection::new(&cfg);
        conn.initiate();
        let mut client = TestClient::new();
        conn.receive_data(&client.preface_and_settings()).unwrap();
        conn.receive_data(&client.headers(1, &get_request("/a"), false))
            .unwrap();
        let err = conn
            .receive_data(&client.headers(3, &get_request("/b"), false))
            .unwrap_err();
        assert_eq!(err.code, ERROR_REFUSED_STREAM);
    }

    #[test]
    fn initial_window_size_overflow_is_flow_control_error() {
        let (mut conn, mut client) = conn();
        conn.receive_data(&client.preface_and_settings()).unwrap();
        // SETTINGS with INITIAL_WINDOW_SIZE = 2^31 (invalid).
        let mut raw = Vec::new();
        raw.extend_from_slice(&[0, 0, 6, TYPE_SETTINGS, 0, 0, 0, 0, 0]);
        raw.extend_from_slice(&SETTINGS_INITIAL_WINDOW_SIZE.to_be_bytes());
        raw.extend_from_slice(&0x8000_0000u32.to_be_bytes());
        let err = conn.receive_data(&raw).unwrap_err();
        assert_eq!(err.code, ERROR_FLOW_CONTROL_ERROR);
    }

    #[test]
    fn stream_ids_never_reused() {
        let (mut conn, mut client) = conn();
        conn.receive_data(&client.preface_and_settings()).unwrap();
        conn.receive_data(&client.headers(5, &get_request("/a"), true))
            .unwrap();
        let err = conn
            .receive_data(&client.headers(3, &get_request("/b"), true))
            .unwrap_err();
        assert_eq!(err.code, ERROR_PROTOCOL_ERROR);
    }

    #[test]
    fn trailers_after_response() {
        let (mut conn, mut client) = conn();
        conn.receive_data(&client.preface_and_settings()).unwrap();
        conn.receive_data(&client.headers(1, &get_request("/t"), true))
            .unwrap();
        let _ = conn.take_output();
        conn.send_response_headers(1, 200, &[], false).unwrap();
        assert!(conn
            .send_trailers(1, &[("grpc-status".into(), "0".into())])
            .unwrap());
        let out = conn.take_output();
        let headers = frames_of(&out, TYPE_HEADERS);
        assert_eq!(headers.len(), 2);
        // Pseudo-headers forbidden in trailers.
        conn.receive_data(&client.headers(3, &get_request("/u"), true))
            .unwrap();
        conn.send_response_headers(3, 200, &[], false).unwrap();
        assert!(conn
            .send_trailers(3, &[(":status".into(), "200".into())])
            .is_err());
    }

    #[test]
    fn informational_before_final_response() {
        let (mut conn, mut client) = conn();
        conn.receive_data(&client.preface_and_settings()).unwrap();
        conn.receive_data(&client.headers(1, &get_request("/eh"), true))
            .unwrap();
        let _ = conn.take_output();
        assert!(conn
            .send_informational(1, 103, &[("link".into(), "</s.css>; rel=preload".into())])
            .unwrap());
        assert!(conn.send_response(1, 200, &[], None).unwrap());
        let out = conn.take_output();
        assert_eq!(frames_of(&out, TYPE_HEADERS).len(), 2);
        assert!(conn.send_informational(1, 200, &[]).is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let (mut conn, mut client) = conn();
        conn.receive_data(&client.preface_and_settings()).unwrap();
        conn.close(ERROR_NO_ERROR);
        conn.close(ERROR_NO_ERROR);
        let out = conn.take_output();
        assert_eq!(frames_of(&out, TYPE_GOAWAY).len(), 1);
        assert!(conn.is_closed());
    }

    #[test]
    fn ping_is_ponged() {
        let (mut conn, mut client) = conn();
        conn.receive_data(&client.preface_and_settings()).unwrap();
        let _ = conn.take_output();
        let mut raw = vec![0, 0, 8, TYPE_PING, 0, 0, 0, 0, 0];
        raw.extend_from_slice(&42u64.to_be_bytes());
        conn.receive_data(&raw).unwrap();
        let out = conn.take_output();
        let pings = frames_of(&out, TYPE_PING);
        assert_eq!(pings.len(), 1);
        assert_eq!(pings[0].1, 42u64.to_be_bytes());
    }
}
