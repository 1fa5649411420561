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

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use super::packet::HEADER_SIZE;
use crate::{AppError, AppResult};

/// Turns the raw byte stream of one connection into discrete messages.
///
/// A resolver is owned by exactly one session and only ever sees that
/// session's bytes, in arrival order.
pub trait MessageResolver: Send {
    /// Consumes one received window, calling `on_message` once for every
    /// message it completes. An error tears the session down.
    fn on_receive(&mut self, data: &[u8], on_message: &mut dyn FnMut(Bytes)) -> AppResult<()>;
}

/// Creates a fresh resolver for every new session.
pub type ResolverFactory = Arc<dyn Fn() -> Box<dyn MessageResolver> + Send + Sync>;

/// Decodes frames made of a 4 byte big-endian body length and the body,
/// the layout written by [`Packet`](super::Packet). Delivers the body.
#[derive(Debug)]
pub struct LengthPrefixedResolver {
    buffer: BytesMut,
    max_message_size: usize,
}

impl LengthPrefixedResolver {
    pub fn new(max_message_size: usize) -> LengthPrefixedResolver {
        LengthPrefixedResolver {
            buffer: BytesMut::with_capacity(max_message_size),
            max_message_size,
        }
    }

    pub fn factory(max_message_size: usize) -> ResolverFactory {
        Arc::new(move || -> Box<dyn MessageResolver> {
            Box::new(LengthPrefixedResolver::new(max_message_size))
        })
    }

    /// Body length of the next complete frame, or None while it is still partial.
    fn check(&mut self) -> AppResult<Option<usize>> {
        if self.buffer.remaining() < HEADER_SIZE {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&self.buffer[..HEADER_SIZE]);
        let body_size = u32::from_be_bytes(header) as usize;
        let frame_size = body_size.saturating_add(HEADER_SIZE);
        if frame_size > self.max_message_size {
            return Err(AppError::MessageTooLarge(format!(
                "frame of {} bytes exceeds limit {}",
                frame_size, self.max_message_size
            )));
        }
        if self.buffer.remaining() < frame_size {
            self.buffer.reserve(frame_size - self.buffer.remaining());
            return Ok(None);
        }
        Ok(Some(body_size))
    }
}

impl MessageResolver for LengthPrefixedResolver {
    fn on_receive(&mut self, data: &[u8], on_message: &mut dyn FnMut(Bytes)) -> AppResult<()> {
        self.buffer.extend_from_slice(data);
        while let Some(body_size) = self.check()? {
            self.buffer.advance(HEADER_SIZE);
            let body = self.buffer.split_to(body_size).freeze();
            on_message(body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{OutboundMessage, Packet};

    fn frame(protocol_id: u16, text: &str) -> Vec<u8> {
        let mut packet = Packet::create(protocol_id);
        packet.push_str(text).unwrap();
        packet.record_size();
        packet.as_bytes().to_vec()
    }

    fn resolve(resolver: &mut LengthPrefixedResolver, data: &[u8]) -> AppResult<Vec<Bytes>> {
        let mut messages = Vec::new();
        resolver.on_receive(data, &mut |message| messages.push(message))?;
        Ok(messages)
    }

    #[test]
    fn test_fragments_are_accumulated() -> AppResult<()> {
        let mut resolver = LengthPrefixedResolver::new(128);
        let bytes = frame(1, "fragmented");

        assert!(resolve(&mut resolver, &bytes[..2])?.is_empty());
        assert!(resolve(&mut resolver, &bytes[2..7])?.is_empty());
        let messages = resolve(&mut resolver, &bytes[7..])?;

        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0][..], &bytes[HEADER_SIZE..]);
        Ok(())
    }

    #[test]
    fn test_messages_keep_arrival_order() -> AppResult<()> {
        let mut resolver = LengthPrefixedResolver::new(128);
        let mut stream = Vec::new();
        for id in 1..=3u16 {
            stream.extend(frame(id, "x"));
        }
        // split in the middle of the second frame
        let cut = stream.len() / 2;
        let mut messages = resolve(&mut resolver, &stream[..cut])?;
        messages.extend(resolve(&mut resolver, &stream[cut..])?);

        let ids: Vec<u16> = messages
            .iter()
            .map(|m| u16::from_be_bytes([m[0], m[1]]))
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut resolver = LengthPrefixedResolver::new(16);
        let bytes = frame(1, "this body is longer than sixteen bytes");
        let result = resolve(&mut resolver, &bytes[..HEADER_SIZE]);
        assert!(matches!(result, Err(AppError::MessageTooLarge(_))));
    }

    #[test]
    fn test_factory_builds_independent_resolvers() -> AppResult<()> {
        let factory = LengthPrefixedResolver::factory(64);
        let mut first = factory();
        let mut second = factory();
        let bytes = frame(9, "abc");

        let mut count = 0;
        first.on_receive(&bytes[..3], &mut |_| count += 1)?;
        second.on_receive(&bytes, &mut |_| count += 1)?;
        assert_eq!(count, 1);
        Ok(())
    }
}
