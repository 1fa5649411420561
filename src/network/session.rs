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

//! Per-connection state.
//!
//! The receive side hands every received window to the session's resolver and
//! forwards decoded messages to the peer. The send side keeps a FIFO queue and
//! at most one transmission in flight: the head message is copied into the
//! session's send context and handed to the writer task, and only the
//! completion of that write pops it and starts the next one.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::SendError};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::context_pool::IoContext;
use super::packet::{OutboundMessage, Packet};
use super::peer::Peer;
use super::resolver::MessageResolver;
use crate::{AppError, AppResult};

pub type SessionHandle = Arc<ConnectionSession>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// accepted by the listen loop, contexts come from the pools
    Inbound,
    /// opened by a connector, contexts are allocated for the session
    Outbound,
}

/// A write handed to the session's writer task. The context travels with the
/// operation and comes back through the send completion.
#[derive(Debug)]
pub struct SendRequest {
    pub context: IoContext,
    pub len: usize,
}

struct SendState {
    queue: VecDeque<Box<dyn OutboundMessage>>,
    /// None while a send is in flight
    context: Option<IoContext>,
    removed: bool,
}

pub struct ConnectionSession {
    id: u64,
    origin: SessionOrigin,
    peer_addr: SocketAddr,
    send_capacity: usize,
    send_state: Mutex<SendState>,
    send_tx: mpsc::UnboundedSender<SendRequest>,
    resolver: Mutex<Box<dyn MessageResolver>>,
    peer: RwLock<Option<Arc<dyn Peer>>>,
    closed: CancellationToken,
    sent_count: AtomicU64,
}

impl ConnectionSession {
    pub(crate) fn new(
        id: u64,
        origin: SessionOrigin,
        peer_addr: SocketAddr,
        mut send_context: IoContext,
        resolver: Box<dyn MessageResolver>,
        send_tx: mpsc::UnboundedSender<SendRequest>,
    ) -> SessionHandle {
        send_context.bind(id);
        Arc::new(ConnectionSession {
            id,
            origin,
            peer_addr,
            send_capacity: send_context.capacity(),
            send_state: Mutex::new(SendState {
                queue: VecDeque::new(),
                context: Some(send_context),
                removed: false,
            }),
            send_tx,
            resolver: Mutex::new(resolver),
            peer: RwLock::new(None),
            closed: CancellationToken::new(),
            sent_count: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn origin(&self) -> SessionOrigin {
        self.origin
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn set_peer(&self, peer: Arc<dyn Peer>) {
        *self.peer.write() = Some(peer);
    }

    /// Messages whose transmission completed in full.
    pub fn sent_count(&self) -> u64 {
        self.sent_count.load(Ordering::Relaxed)
    }

    /// Messages waiting, the one in flight included.
    pub fn queued(&self) -> usize {
        self.send_state.lock().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Stops both I/O paths. The receive path then runs the regular teardown.
    pub fn disconnect(&self) {
        if !self.closed.is_cancelled() {
            debug!("session {} disconnect requested", self.id);
            self.closed.cancel();
        }
    }

    pub(crate) async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Feeds one received window through the resolver.
    pub(crate) fn on_receive(&self, data: &[u8]) -> AppResult<()> {
        let peer = self.peer.read().clone();
        let mut resolver = self.resolver.lock();
        resolver.on_receive(data, &mut |message: Bytes| match &peer {
            Some(peer) => peer.on_message(message),
            None => trace!(
                "session {} dropped a {} byte message, no peer attached",
                self.id,
                message.len()
            ),
        })
    }

    /// Queues a message for transmission.
    ///
    /// With an empty queue the message goes out right away; otherwise a send
    /// is already in flight and its completion will drain the queue in order.
    pub fn send<M: OutboundMessage>(&self, message: M) -> AppResult<()> {
        if message.position() > self.send_capacity {
            return Err(AppError::MessageTooLarge(format!(
                "message of {} bytes exceeds send buffer of {} bytes",
                message.position(),
                self.send_capacity
            )));
        }
        let mut state = self.send_state.lock();
        if state.removed || self.closed.is_cancelled() {
            return Err(AppError::SessionClosed(self.id));
        }
        if state.queue.is_empty() {
            state.queue.push_back(Box::new(message));
            if let Err(e) = self.begin_send(&mut state) {
                state.queue.pop_back();
                return Err(e);
            }
            return Ok(());
        }
        trace!(
            "session {} queue not empty, enqueue message {:?} behind {} others",
            self.id,
            message.protocol_id(),
            state.queue.len()
        );
        state.queue.push_back(Box::new(message));
        Ok(())
    }

    /// Copies the head message into the send context and issues the write.
    /// The head stays queued until its completion arrives.
    fn begin_send(&self, state: &mut SendState) -> AppResult<()> {
        let Some(mut context) = state.context.take() else {
            return Err(AppError::IllegalStateError(format!(
                "session {} already has a send in flight",
                self.id
            )));
        };
        let Some(head) = state.queue.front_mut() else {
            state.context = Some(context);
            return Ok(());
        };
        head.record_size();
        let len = head.position();
        if len > context.capacity() {
            state.context = Some(context);
            return Err(AppError::MessageTooLarge(format!(
                "message of {} bytes exceeds send buffer of {} bytes",
                len, self.send_capacity
            )));
        }
        context.buffer_mut()[..len].copy_from_slice(&head.as_bytes()[..len]);
        context.set_transferred(0);
        trace!("session {} issue send of {} bytes", self.id, len);

        if let Err(SendError(request)) = self.send_tx.send(SendRequest { context, len }) {
            state.context = Some(request.context);
            return Err(AppError::ChannelSendError(format!(
                "writer of session {} is gone",
                self.id
            )));
        }
        Ok(())
    }

    /// Completion of the write issued by `begin_send`.
    ///
    /// A short write is not resumed: the head message stays queued, nothing
    /// else is issued and the error is returned. Returns the context when the
    /// session has already been removed so the caller can reclaim it.
    pub(crate) fn process_send(
        &self,
        mut context: IoContext,
        result: io::Result<usize>,
    ) -> AppResult<Option<IoContext>> {
        let mut state = self.send_state.lock();
        if state.removed {
            return Ok(Some(context));
        }
        let transferred = match result {
            Ok(transferred) => transferred,
            Err(e) => {
                state.context = Some(context);
                return Err(AppError::Send(format!("session {}: {}", self.id, e)));
            }
        };
        context.set_transferred(transferred);

        let Some(size) = state.queue.front().map(|head| head.position()) else {
            state.context = Some(context);
            return Err(AppError::SendQueueInvariantViolation(self.id));
        };
        if transferred != size {
            state.context = Some(context);
            return Err(AppError::Send(format!(
                "session {} transferred {} of {} bytes, message abandoned",
                self.id, transferred, size
            )));
        }

        state.queue.pop_front();
        let sent = self.sent_count.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(
            "session {} send complete, transferred {}, sent count {}",
            self.id,
            transferred,
            sent
        );

        state.context = Some(context);
        if !state.queue.is_empty() {
            self.begin_send(&mut state)?;
        }
        Ok(None)
    }

    /// Takes back a send context whose write was never performed. Returns it
    /// when the session is already removed.
    pub(crate) fn recover_send_context(&self, context: IoContext) -> Option<IoContext> {
        let mut state = self.send_state.lock();
        if state.removed {
            return Some(context);
        }
        state.context = Some(context);
        None
    }

    /// Drops the queue without transmitting and tells the peer. Returns the
    /// send context if it is not out with an in-flight write.
    pub(crate) fn on_removed(&self) -> Option<IoContext> {
        let context = {
            let mut state = self.send_state.lock();
            if state.removed {
                return None;
            }
            state.removed = true;
            if !state.queue.is_empty() {
                debug!(
                    "session {} removed with {} unsent messages",
                    self.id,
                    state.queue.len()
                );
            }
            state.queue.clear();
            state.context.take()
        };
        self.closed.cancel();

        let peer = self.peer.write().take();
        if let Some(peer) = peer {
            peer.on_removed();
        }
        context
    }

    /// Enqueues a zero-payload packet every `interval` until the session closes.
    pub fn start_keepalive(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = session.closed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = session.send(Packet::keepalive()) {
                            debug!("session {} keepalive stopped: {}", session.id, e);
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        trace!("session {} dropped", self.id);
    }
}
