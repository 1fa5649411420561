// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Outbound message contract and the default packet layout.
//!
//! A packet on the wire is a 4 byte big-endian body length followed by the
//! body. The body starts with a 2 byte protocol id.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

pub const HEADER_SIZE: usize = 4;
pub const KEEPALIVE_PROTOCOL_ID: u16 = 0;

/// What a session needs from a message it transmits.
pub trait OutboundMessage: Send + 'static {
    /// Current write position, i.e. the number of bytes to put on the wire.
    fn position(&self) -> usize;

    /// Stamps the size header. Called right before the bytes are copied out.
    fn record_size(&mut self);

    fn as_bytes(&self) -> &[u8];

    fn protocol_id(&self) -> Option<u16> {
        None
    }
}

/// Already framed bytes, sent as they are.
impl OutboundMessage for Bytes {
    fn position(&self) -> usize {
        self.len()
    }

    fn record_size(&mut self) {}

    fn as_bytes(&self) -> &[u8] {
        self
    }
}

#[derive(Debug, Clone)]
pub struct Packet {
    protocol_id: u16,
    buf: BytesMut,
}

impl Packet {
    pub fn create(protocol_id: u16) -> Packet {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(0);
        buf.put_u16(protocol_id);
        Packet { protocol_id, buf }
    }

    /// Zero-payload packet used to keep idle connections alive.
    pub fn keepalive() -> Packet {
        Packet::create(KEEPALIVE_PROTOCOL_ID)
    }

    pub fn push_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn push_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    pub fn push_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn push_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    pub fn push_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    /// u16 length prefix followed by the utf-8 bytes. Strings longer than
    /// `u16::MAX` bytes are rejected and leave the packet untouched.
    pub fn push_str(&mut self, value: &str) -> AppResult<&mut Self> {
        let len = u16::try_from(value.len()).map_err(|_| {
            AppError::MessageTooLarge(format!(
                "string of {} bytes exceeds the {} byte field limit",
                value.len(),
                u16::MAX
            ))
        })?;
        self.buf.put_u16(len);
        self.buf.put_slice(value.as_bytes());
        Ok(self)
    }

    /// Everything after the size header, protocol id included.
    pub fn body(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }
}

impl OutboundMessage for Packet {
    fn position(&self) -> usize {
        self.buf.len()
    }

    fn record_size(&mut self) {
        let body_size = (self.buf.len() - HEADER_SIZE) as u32;
        self.buf[..HEADER_SIZE].copy_from_slice(&body_size.to_be_bytes());
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn protocol_id(&self) -> Option<u16> {
        Some(self.protocol_id)
    }
}

/// Reads fields back out of a decoded packet body.
#[derive(Debug)]
pub struct PacketReader {
    payload: Bytes,
}

impl PacketReader {
    pub fn new(payload: Bytes) -> PacketReader {
        PacketReader { payload }
    }

    fn ensure(&self, needed: usize) -> AppResult<()> {
        if self.payload.remaining() < needed {
            return Err(AppError::MalformedFrame(format!(
                "need {} bytes, {} left in packet",
                needed,
                self.payload.remaining()
            )));
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.payload.remaining()
    }

    pub fn pop_u8(&mut self) -> AppResult<u8> {
        self.ensure(1)?;
        Ok(self.payload.get_u8())
    }

    pub fn pop_u16(&mut self) -> AppResult<u16> {
        self.ensure(2)?;
        Ok(self.payload.get_u16())
    }

    pub fn pop_u32(&mut self) -> AppResult<u32> {
        self.ensure(4)?;
        Ok(self.payload.get_u32())
    }

    pub fn pop_i32(&mut self) -> AppResult<i32> {
        self.ensure(4)?;
        Ok(self.payload.get_i32())
    }

    pub fn pop_bytes(&mut self, len: usize) -> AppResult<Bytes> {
        self.ensure(len)?;
        Ok(self.payload.split_to(len))
    }

    pub fn pop_str(&mut self) -> AppResult<String> {
        let len = self.pop_u16()? as usize;
        let bytes = self.pop_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| AppError::MalformedFrame(format!("invalid utf-8 string: {}", e)))
    }

    /// Whatever has not been read yet.
    pub fn rest(self) -> Bytes {
        self.payload
    }
}
