/*
 * writer.rs
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

//! HTTP/2 frame writer: serializes frames into a buffer the connection
//! drains to the transport. Header blocks larger than the peer's
//! max-frame-size are split into HEADERS + CONTINUATION.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;

use super::frame::*;

/// Writes HTTP/2 frames into a BytesMut; the connection takes the buffer
/// and owns the actual socket write.
pub struct H2Writer {
    buf: BytesMut,
    /// Peer's SETTINGS_MAX_FRAME_SIZE, bounding every frame we emit.
    peer_max_frame_size: usize,
}

impl H2Writer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(DEFAULT_MAX_FRAME_SIZE + FRAME_HEADER_LENGTH),
            peer_max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn set_peer_max_frame_size(&mut self, size: usize) {
        self.peer_max_frame_size = size.clamp(MIN_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE);
    }

    pub fn peer_max_frame_size(&self) -> usize {
        self.peer_max_frame_size
    }

    fn write_frame_header(&mut self, length: usize, frame_type: u8, flags: u8, stream_id: u32) {
        self.buf.put_u8((length >> 16) as u8);
        self.buf.put_u8((length >> 8) as u8);
        self.buf.put_u8(length as u8);
        self.buf.put_u8(frame_type);
        self.buf.put_u8(flags);
        self.buf.put_u32(stream_id & 0x7fff_ffff);
    }

    /// Append a DATA frame. The caller has already clamped `data` to the
    /// flow-control window and the peer's max frame size.
    pub fn write_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> io::Result<usize> {
        if stream_id == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "DATA frame stream_id must be non-zero",
            ));
        }
        if data.len() > self.peer_max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "DATA frame exceeds peer max frame size",
            ));
        }
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        self.write_frame_header(data.len(), TYPE_DATA, flags, stream_id);
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    /// Append a HEADERS frame carrying an HPACK block, splitting into
    /// CONTINUATION frames when the block exceeds the peer max frame size.
    pub fn write_headers(
        &mut self,
        stream_id: u32,
        header_block: &[u8],
        end_stream: bool,
    ) -> io::Result<()> {
        if stream_id == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "HEADERS frame stream_id must be non-zero",
            ));
        }
        let max = self.peer_max_frame_size;
        let first_len = header_block.len().min(max);
        let (first, mut rest) = header_block.split_at(first_len);
        let mut flags = 0u8;
        if end_stream {
            flags |= FLAG_END_STREAM;
        }
        if rest.is_empty() {
            flags |= FLAG_END_HEADERS;
        }
        self.write_frame_header(first.len(), TYPE_HEADERS, flags, stream_id);
        self.buf.extend_from_slice(first);

        while !rest.is_empty() {
            let take = rest.len().min(max);
            let (part, tail) = rest.split_at(take);
            let flags = if tail.is_empty() { FLAG_END_HEADERS } else { 0 };
            self.write_frame_header(part.len(), TYPE_CONTINUATION, flags, stream_id);
            self.buf.extend_from_slice(part);
            rest = tail;
        }
        Ok(())
    }

    pub fn write_rst_stream(&mut self, stream_id: u32, error_code: u32) -> io::Result<()> {
        if stream_id == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "RST_STREAM stream_id must be non-zero",
            ));
        }
        self.write_frame_header(4, TYPE_RST_STREAM, 0, stream_id);
        self.buf.put_u32(error_code);
        Ok(())
    }

    /// SETTINGS with parameters (empty for a bare preface frame).
    pub fn write_settings(&mut self, settings: &[(u16, u32)]) -> io::Result<()> {
        let payload_len = settings.len() * 6;
        self.write_frame_header(payload_len, TYPE_SETTINGS, 0, 0);
        for (id, value) in settings {
            self.buf.put_u16(*id);
            self.buf.put_u32(*value);
        }
        Ok(())
    }

    pub fn write_settings_ack(&mut self) -> io::Result<()> {
        self.write_frame_header(0, TYPE_SETTINGS, FLAG_ACK, 0);
        Ok(())
    }

    pub fn write_ping(&mut self, opaque_data: u64, ack: bool) -> io::Result<()> {
        let flags = if ack { FLAG_ACK } else { 0 };
        self.write_frame_header(8, TYPE_PING, flags, 0);
        self.buf.put_u64(opaque_data);
        Ok(())
    }

    /// WINDOW_UPDATE for a stream (or the connection when stream_id is 0).
    pub fn write_window_update(&mut self, stream_id: u32, increment: u32) -> io::Result<()> {
        if increment == 0 || increment > 0x7fff_ffff {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "WINDOW_UPDATE increment out of range",
            ));
        }
        self.write_frame_header(4, TYPE_WINDOW_UPDATE, 0, stream_id);
        self.buf.put_u32(increment);
        Ok(())
    }

    pub fn write_goaway(
        &mut self,
        last_stream_id: u32,
        error_code: u32,
        debug_data: &[u8],
    ) -> io::Result<()> {
        self.write_frame_header(8 + debug_data.len(), TYPE_GOAWAY, 0, 0);
        self.buf.put_u32(last_stream_id & 0x7fff_ffff);
        self.buf.put_u32(error_code);
        self.buf.extend_from_slice(debug_data);
        Ok(())
    }

    /// Take the accumulated buffer; the writer stays usable.
    pub fn take_buffer(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for H2Writer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_layout() {
        let mut w = H2Writer::new();
        w.write_data(1, b"abc", true).unwrap();
        let out = w.take_buffer();
        assert_eq!(&out[..], &[0, 0, 3, TYPE_DATA, FLAG_END_STREAM, 0, 0, 0, 1, b'a', b'b', b'c']);
    }

    #[test]
    fn headers_split_into_continuation() {
        let mut w = H2Writer::new();
        let block = vec![0u8; DEFAULT_MAX_FRAME_SIZE + 100];
        w.write_headers(3, &block, false).unwrap();
        let out = w.take_buffer();
        // First frame: HEADERS without END_HEADERS.
        assert_eq!(out[3], TYPE_HEADERS);
        assert_eq!(out[4] & FLAG_END_HEADERS, 0);
        // Second frame starts after header + max payload.
        let second = &out[FRAME_HEADER_LENGTH + DEFAULT_MAX_FRAME_SIZE..];
        assert_eq!(second[3], TYPE_CONTINUATION);
        assert_eq!(second[4] & FLAG_END_HEADERS, FLAG_END_HEADERS);
        let cont_len = (second[0] as usize) << 16 | (second[1] as usize) << 8 | second[2] as usize;
        assert_eq!(cont_len, 100);
    }

    #[test]
    fn window_update_bounds() {
        let mut w = H2Writer::new();
        assert!(w.write_window_update(0, 0).is_err());
        w.write_window_update(0, 65535).unwrap();
        let out = w.take_buffer();
        assert_eq!(out[3], TYPE_WINDOW_UPDATE);
        assert_eq!(&out[9..], &[0, 0, 0xff, 0xff]);
    }

    #[test]
    fn goaway_carries_code_and_last_stream() {
        let mut w = H2Writer::new();
        w.write_goaway(7, ERROR_FLOW_CONTROL_ERROR, b"dbg").unwrap();
        let out = w.take_buffer();
        assert_eq!(out[3], TYPE_GOAWAY);
        assert_eq!(&out[9..13], &[0, 0, 0, 7]);
        assert_eq!(&out[13..17], &[0, 0, 0, 3]);
        assert_eq!(&out[17..], b"dbg");
    }

    #[test]
    fn oversize_data_rejected() {
        let mut w = H2Writer::new();
        let big = vec![0u8; DEFAULT_MAX_FRAME_SIZE + 1];
        assert!(w.write_data(1, &big, false).is_err());
    }
}
