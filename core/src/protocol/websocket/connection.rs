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

//! WebSocket connection after the 101: drives the frame parser, reassembles
//! fragmented messages, answers control frames, and queues complete messages
//! for the application. Transport-free: the engine feeds bytes in and drains
//! the output buffer.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;

use super::frame::{
    encode_frame, FrameError, FrameParser, ParsedFrame, OP_BINARY, OP_CLOSE, OP_CONTINUATION,
    OP_PING, OP_PONG, OP_TEXT,
};

/// Messages delivered to the application.
#[derive(Debug, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
    /// Peer sent a close frame (or the connection died); code 1005 when the
    /// close payload carried none.
    Disconnect { code: u16 },
}

/// A protocol violation; the close frame naming `close_code` has been
/// queued in the output buffer when this is returned.
#[derive(Debug)]
pub struct WsError {
    pub close_code: u16,
    pub message: String,
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "websocket error {}: {}", self.close_code, self.message)
    }
}

impl std::error::Error for WsError {}

/// Upper bound on messages queued ahead of the application.
const RECEIVE_QUEUE_LIMIT: usize = 64;
/// Upper bound on a reassembled message.
const MAX_MESSAGE_SIZE: usize = 4 << 20;

pub struct WsConnection {
    parser: FrameParser,
    read_buf: BytesMut,
    out: BytesMut,
    /// Open fragmentation sequence: initial opcode + accumulated payload.
    fragment: Option<(u8, BytesMut)>,
    messages: VecDeque<WsMessage>,
    close_sent: bool,
    closed: bool,
}

impl WsConnection {
    pub fn new() -> Self {
        WsConnection {
            parser: FrameParser::new(),
            read_buf: BytesMut::new(),
            out: BytesMut::new(),
            fragment: None,
            messages: VecDeque::new(),
            close_sent: false,
            closed: false,
        }
    }

    /// Feed transport bytes; parsed messages become available via
    /// [`next_message`]. On a protocol violation the close frame is queued
    /// and the connection is marked closed.
    pub fn receive(&mut self, data: &[u8]) -> Result<(), WsError> {
        if self.closed {
            return Ok(());
        }
        self.read_buf.extend_from_slice(data);
        loop {
            match self.parser.next_frame(&mut self.read_buf) {
                Ok(Some(frame)) => self.handle_frame(frame)?,
                Ok(None) => return Ok(()),
                Err(FrameError { close_code, message }) => {
                    return Err(self.fail(close_code, message));
                }
            }
            if self.closed {
                return Ok(());
            }
        }
    }

    fn fail(&mut self, code: u16, message: &str) -> WsError {
        self.queue_close(code, "");
        self.closed = true;
        WsError {
            close_code: code,
            message: message.into(),
        }
    }

    fn handle_frame(&mut self, frame: ParsedFrame) -> Result<(), WsError> {
        match frame.opcode {
            OP_PING => {
                // Echo the payload back as PONG.
                encode_frame(OP_PONG, true, &frame.payload, &mut self.out);
                Ok(())
            }
            OP_PONG => Ok(()),
            OP_CLOSE => {
                let code = if frame.payload.len() >= 2 {
                    u16::from_be_bytes([frame.payload[0], frame.payload[1]])
                } else {
                    1005
                };
                if !self.close_sent {
                    self.queue_close(1000, "");
                }
                self.closed = true;
                self.push_message(WsMessage::Disconnect { code })
            }
            OP_TEXT | OP_BINARY => {
                if self.fragment.is_some() {
                    return Err(self.fail(1002, "data frame inside fragmented message"));
                }
                if frame.fin {
                    self.deliver(frame.opcode, frame.payload.freeze())
                } else {
                    self.fragment = Some((frame.opcode, frame.payload));
                    Ok(())
                }
            }
            OP_CONTINUATION => {
                let Some((opcode, mut acc)) = self.fragment.take() else {
                    return Err(self.fail(1002, "CONTINUATION with no open message"));
                };
                if acc.len() + frame.payload.len() > MAX_MESSAGE_SIZE {
                    return Err(self.fail(1009, "fragmented message too large"));
                }
                acc.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.deliver(opcode, acc.freeze())
                } else {
                    self.fragment = Some((opcode, acc));
                    Ok(())
                }
            }
            other => {
                tracing::debug!(opcode = other, "unknown websocket opcode");
                Err(self.fail(1002, "unknown opcode"))
            }
        }
    }

    fn deliver(&mut self, opcode: u8, payload: Bytes) -> Result<(), WsError> {
        let message = if opcode == OP_TEXT {
            match String::from_utf8(payload.to_vec()) {
                Ok(text) => WsMessage::Text(text),
                Err(_) => return Err(self.fail(1007, "text message is not UTF-8")),
            }
        } else {
            WsMessage::Binary(payload)
        };
        self.push_message(message)
    }

    fn push_message(&mut self, message: WsMessage) -> Result<(), WsError> {
        if self.messages.len() >= RECEIVE_QUEUE_LIMIT {
            return Err(self.fail(1008, "receive queue overflow"));
        }
        self.messages.push_back(message);
        Ok(())
    }

    /// Next complete message, if any.
    pub fn next_message(&mut self) -> Option<WsMessage> {
        self.messages.pop_front()
    }

    /// True while the engine should keep the read side open.
    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn send_text(&mut self, text: &str) {
        encode_frame(OP_TEXT, true, text.as_bytes(), &mut self.out);
    }

    pub fn send_binary(&mut self, data: &[u8]) {
        encode_frame(OP_BINARY, true, data, &mut self.out);
    }

    pub fn send_ping(&mut self, data: &[u8]) {
        encode_frame(OP_PING, true, data, &mut self.out);
    }

    /// Queue our close frame (once).
    pub fn queue_close(&mut self, code: u16, reason: &str) {
        if self.close_sent {
            return;
        }
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        payload.truncate(125);
        encode_frame(OP_CLOSE, true, &payload, &mut self.out);
        self.close_sent = true;
    }

    /// Server-to-client bytes awaiting the transport.
    pub fn take_output(&mut self) -> Bytes {
        self.out.split().freeze()
    }
}

impl Default for WsConnection {
    fn default() -> Self {
        Self::new()
    }
}
