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

//! Reusable I/O completion contexts.
//!
//! A context couples one direction of socket I/O with the buffer segment the
//! operation reads into or writes from. Contexts are created once, then cycle
//! between a pool and the session that currently owns them.

use std::fmt;

use parking_lot::Mutex;
use tracing::trace;

use super::buffer_arena::Segment;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Receive,
    Send,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Receive => write!(f, "receive"),
            Direction::Send => write!(f, "send"),
        }
    }
}

pub struct IoContext {
    direction: Direction,
    /// pool slot, shared by the receive and send context created together
    slot: usize,
    segment: Segment,
    transferred: usize,
    session_id: Option<u64>,
}

impl IoContext {
    pub fn new(direction: Direction, slot: usize, segment: Segment) -> IoContext {
        IoContext {
            direction,
            slot,
            segment,
            transferred: 0,
            session_id: None,
        }
    }

    /// A context with its own single-segment allocation, never returned to a pool.
    pub fn detached(direction: Direction, segment_size: usize) -> IoContext {
        IoContext::new(direction, usize::MAX, Segment::detached(segment_size))
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_pooled(&self) -> bool {
        !self.segment.is_detached()
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn capacity(&self) -> usize {
        self.segment.len()
    }

    pub fn buffer(&self) -> &[u8] {
        self.segment.as_slice()
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.segment.as_mut_slice()
    }

    /// Bytes moved by the last completed operation.
    pub fn transferred(&self) -> usize {
        self.transferred
    }

    pub fn set_transferred(&mut self, transferred: usize) {
        self.transferred = transferred;
    }

    /// The valid part of the buffer after a receive completed.
    pub fn received(&self) -> &[u8] {
        &self.segment.as_slice()[..self.transferred]
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    pub fn bind(&mut self, session_id: u64) {
        self.session_id = Some(session_id);
    }

    fn unbind(&mut self) {
        self.session_id = None;
        self.transferred = 0;
    }
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("direction", &self.direction)
            .field("slot", &self.slot)
            .field("offset", &self.segment.offset())
            .field("transferred", &self.transferred)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Stack of idle contexts of one direction.
pub struct ContextPool {
    direction: Direction,
    capacity: usize,
    contexts: Mutex<Vec<IoContext>>,
}

impl ContextPool {
    pub fn new(direction: Direction, capacity: usize) -> ContextPool {
        ContextPool {
            direction,
            capacity,
            contexts: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn take(&self) -> AppResult<IoContext> {
        self.contexts.lock().pop().ok_or_else(|| {
            AppError::PoolExhausted(format!(
                "{} context pool is empty (capacity {})",
                self.direction, self.capacity
            ))
        })
    }

    /// Returns a context to the pool. The buffer is left as is; the next
    /// owner overwrites it before use.
    pub fn give(&self, mut context: IoContext) -> AppResult<()> {
        if context.direction != self.direction {
            return Err(AppError::InvalidOperation(format!(
                "{} context given to {} pool",
                context.direction, self.direction
            )));
        }
        if !context.is_pooled() {
            return Err(AppError::InvalidOperation(format!(
                "detached {} context cannot join a pool",
                context.direction
            )));
        }
        let mut contexts = self.contexts.lock();
        if contexts.len() >= self.capacity {
            return Err(AppError::IllegalStateError(format!(
                "{} context pool already holds {} contexts",
                self.direction, self.capacity
            )));
        }
        trace!(
            "{} context slot {} back from session {:?}",
            self.direction,
            context.slot,
            context.session_id
        );
        context.unbind();
        contexts.push(context);
        Ok(())
    }
}

impl fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPool")
            .field("direction", &self.direction)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}
