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

//! Fixed-capacity byte arena.
//!
//! One region is allocated up front and sliced into equal segments on demand.
//! Segments are identified by their start offset and handed back on release,
//! so the memory used by the network layer never grows past the arena size.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::trace;

use crate::{AppError, AppResult};

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// arena id of segments allocated outside any arena
const DETACHED: u64 = 0;

/// A fixed-size window of bytes.
///
/// Contents are never cleared between owners; whoever holds the segment
/// overwrites the bytes it is about to use.
pub struct Segment {
    arena_id: u64,
    offset: usize,
    buf: BytesMut,
}

impl Segment {
    /// A standalone segment with its own allocation, not owned by any arena.
    pub fn detached(size: usize) -> Segment {
        Segment {
            arena_id: DETACHED,
            offset: 0,
            buf: BytesMut::zeroed(size),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_detached(&self) -> bool {
        self.arena_id == DETACHED
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    /// Address of the first byte, stable for the life of the segment.
    pub fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("arena_id", &self.arena_id)
            .field("offset", &self.offset)
            .field("len", &self.buf.len())
            .finish()
    }
}

struct ArenaState {
    /// not yet sliced tail of the region
    region: BytesMut,
    cursor: usize,
    free: Vec<Segment>,
}

pub struct BufferArena {
    id: u64,
    capacity: usize,
    segment_size: usize,
    state: Mutex<ArenaState>,
}

impl BufferArena {
    /// Allocates the whole region immediately.
    pub fn new(capacity: usize, segment_size: usize) -> AppResult<BufferArena> {
        if segment_size == 0 {
            return Err(AppError::InvalidValue(
                "arena segment size must be greater than 0".to_string(),
            ));
        }
        Ok(BufferArena {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            segment_size,
            state: Mutex::new(ArenaState {
                region: BytesMut::zeroed(capacity),
                cursor: 0,
                free: Vec::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Maximum number of segments that can be live at once.
    pub fn segment_count(&self) -> usize {
        self.capacity / self.segment_size
    }

    /// Segments currently handed out.
    pub fn live(&self) -> usize {
        let state = self.state.lock();
        state.cursor / self.segment_size - state.free.len()
    }

    /// Reclaimed segments are reused before fresh ones are cut from the region.
    pub fn acquire(&self) -> AppResult<Segment> {
        let mut state = self.state.lock();
        if let Some(segment) = state.free.pop() {
            trace!("arena {} reuse segment at {}", self.id, segment.offset);
            return Ok(segment);
        }
        if state.cursor + self.segment_size > self.capacity {
            return Err(AppError::PoolExhausted(format!(
                "buffer arena of {} bytes has no free {} byte segment",
                self.capacity, self.segment_size
            )));
        }
        let offset = state.cursor;
        let buf = state.region.split_to(self.segment_size);
        state.cursor += self.segment_size;
        trace!("arena {} cut segment at {}", self.id, offset);
        Ok(Segment {
            arena_id: self.id,
            offset,
            buf,
        })
    }

    pub fn release(&self, segment: Segment) -> AppResult<()> {
        if segment.arena_id != self.id {
            return Err(AppError::InvalidOperation(format!(
                "segment at {} does not belong to arena {}",
                segment.offset, self.id
            )));
        }
        self.state.lock().free.push(segment);
        Ok(())
    }
}

impl fmt::Debug for BufferArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferArena")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("segment_size", &self.segment_size)
            .finish()
    }
}
