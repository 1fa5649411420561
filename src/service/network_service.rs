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

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use super::config::{CapacityConfig, ServiceConfig};
use super::Shutdown;
use crate::network::{
    BufferArena, ConnectedCallback, ConnectionSession, Connector, ContextPool, Direction,
    IoContext, LengthPrefixedResolver, ListenLoop, NewClientCallback, ResolverFactory,
    SendRequest, SessionHandle, SessionOrigin,
};
use crate::{AppError, AppResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Called with every new inbound session before its first receive is issued.
pub type SessionCallback = Arc<dyn Fn(SessionHandle) + Send + Sync>;

/// Owns the buffer arena and context pools, turns accepted or connected
/// sockets into sessions and routes their I/O completions.
///
/// Every session runs two tasks: a receiver that always has exactly one read
/// outstanding on the receive context, and a sender that performs the writes
/// the session issues. Either completion comes back through this type, which
/// also reclaims the contexts once the session is torn down.
pub struct ConnectionService {
    capacity: CapacityConfig,
    arena: BufferArena,
    receive_pool: ContextPool,
    send_pool: ContextPool,
    resolver_factory: ResolverFactory,
    keepalive: Option<Duration>,
    connected_count: AtomicUsize,
    sessions: DashMap<u64, SessionHandle>,
    session_created_callback: RwLock<Option<SessionCallback>>,
    notify_shutdown: broadcast::Sender<()>,
}

impl ConnectionService {
    /// Uses the length-prefixed resolver for every session.
    pub fn initialize(config: &ServiceConfig) -> AppResult<Arc<ConnectionService>> {
        let factory = LengthPrefixedResolver::factory(config.session.max_message_size);
        ConnectionService::with_resolver(config, factory)
    }

    /// Allocates the arena and fills both pools. Capacity is fixed from here on.
    pub fn with_resolver(
        config: &ServiceConfig,
        resolver_factory: ResolverFactory,
    ) -> AppResult<Arc<ConnectionService>> {
        config.validate()?;
        let capacity = config.capacity.clone();
        let arena = BufferArena::new(capacity.arena_capacity()?, capacity.segment_size)?;
        let receive_pool = ContextPool::new(Direction::Receive, capacity.max_connections);
        let send_pool = ContextPool::new(Direction::Send, capacity.max_connections);

        // receive and send contexts of one slot are handed out together
        for slot in 0..capacity.max_connections {
            receive_pool.give(IoContext::new(Direction::Receive, slot, arena.acquire()?))?;
            send_pool.give(IoContext::new(Direction::Send, slot, arena.acquire()?))?;
        }
        info!(
            "connection service initialized: {} connections, {} byte segments, {} byte arena",
            capacity.max_connections,
            capacity.segment_size,
            arena.capacity()
        );

        let keepalive = match config.session.keepalive_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let (notify_shutdown, _) = broadcast::channel(1);

        Ok(Arc::new(ConnectionService {
            capacity,
            arena,
            receive_pool,
            send_pool,
            resolver_factory,
            keepalive,
            connected_count: AtomicUsize::new(0),
            sessions: DashMap::new(),
            session_created_callback: RwLock::new(None),
            notify_shutdown,
        }))
    }

    pub fn set_session_created_callback(&self, callback: SessionCallback) {
        *self.session_created_callback.write() = Some(callback);
    }

    /// Binds `host:port` and feeds every accepted socket into a new session.
    pub fn listen(self: &Arc<Self>, host: &str, port: u16, backlog: u32) -> AppResult<ListenLoop> {
        let service = Arc::clone(self);
        let callback: NewClientCallback =
            Arc::new(move |stream, peer_addr| service.on_new_client(stream, peer_addr));
        ListenLoop::start(host, port, backlog, callback, &self.notify_shutdown)
    }

    /// A connector for one outbound destination.
    pub fn connector(self: &Arc<Self>) -> Connector {
        Connector::new(Arc::clone(self))
    }

    /// One-shot outbound connection through a fresh connector.
    pub async fn connect_to(
        self: &Arc<Self>,
        remote: SocketAddr,
        callback: Option<ConnectedCallback>,
    ) -> AppResult<SessionHandle> {
        let connector = self.connector();
        if let Some(callback) = callback {
            connector.set_connected_callback(callback);
        }
        connector.connect(remote).await
    }

    /// Total inbound sessions accepted so far.
    pub fn connected_count(&self) -> usize {
        self.connected_count.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, id: u64) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn capacity(&self) -> &CapacityConfig {
        &self.capacity
    }

    /// Idle (receive, send) contexts left in the pools.
    pub fn available_contexts(&self) -> (usize, usize) {
        (self.receive_pool.available(), self.send_pool.available())
    }

    pub fn arena(&self) -> &BufferArena {
        &self.arena
    }

    /// Closes a session. Teardown and context reclamation run on the
    /// session's receive path as soon as it observes the close.
    pub fn close_session(&self, session: &SessionHandle) {
        session.disconnect();
    }

    /// Stops the listen loops and tears down every live session.
    pub fn shutdown(&self) {
        info!("connection service shutting down, {} sessions", self.sessions.len());
        let _ = self.notify_shutdown.send(());
        for entry in self.sessions.iter() {
            entry.value().disconnect();
        }
    }

    fn on_new_client(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let count = self.connected_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!("client {} connected, count {}", peer_addr, count);

        let receive_context = match self.receive_pool.take() {
            Ok(context) => context,
            Err(e) => {
                error!("rejecting client {}: {}", peer_addr, e);
                return;
            }
        };
        let send_context = match self.send_pool.take() {
            Ok(context) => context,
            Err(e) => {
                error!("rejecting client {}: {}", peer_addr, e);
                self.reclaim(receive_context);
                return;
            }
        };
        let callback = self.session_created_callback.read().clone();
        self.bind_session(
            stream,
            peer_addr,
            SessionOrigin::Inbound,
            receive_context,
            send_context,
            callback,
        );
    }

    /// Outbound sessions get their own contexts, sized to one segment, and
    /// leave the pools and the connected count alone.
    pub(crate) fn on_connect_completed(
        self: &Arc<Self>,
        stream: TcpStream,
        callback: Option<ConnectedCallback>,
    ) -> AppResult<SessionHandle> {
        let peer_addr = stream.peer_addr()?;
        let segment_size = self.capacity.segment_size;
        let session = self.bind_session(
            stream,
            peer_addr,
            SessionOrigin::Outbound,
            IoContext::detached(Direction::Receive, segment_size),
            IoContext::detached(Direction::Send, segment_size),
            callback,
        );
        Ok(session)
    }

    fn bind_session(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        origin: SessionOrigin,
        mut receive_context: IoContext,
        send_context: IoContext,
        callback: Option<SessionCallback>,
    ) -> SessionHandle {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        receive_context.bind(id);
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let session = ConnectionSession::new(
            id,
            origin,
            peer_addr,
            send_context,
            (self.resolver_factory)(),
            send_tx,
        );
        self.sessions.insert(id, session.clone());
        debug!(
            "session {} bound to {} ({:?}, slot {})",
            id,
            peer_addr,
            origin,
            receive_context.slot()
        );

        if let Some(callback) = callback {
            callback(session.clone());
        }
        if let Some(interval) = self.keepalive {
            let _ = session.start_keepalive(interval);
        }

        let (reader, writer) = stream.into_split();
        tokio::spawn(Arc::clone(self).run_sender(session.clone(), writer, send_rx));
        tokio::spawn(Arc::clone(self).run_receiver(session.clone(), reader, receive_context));
        session
    }

    async fn run_receiver(
        self: Arc<Self>,
        session: SessionHandle,
        mut reader: OwnedReadHalf,
        mut context: IoContext,
    ) {
        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
        loop {
            let result = tokio::select! {
                result = reader.read(context.buffer_mut()) => result,
                _ = session.closed() => break,
                _ = shutdown.recv() => break,
            };
            if !self.process_receive(&session, &mut context, result) {
                break;
            }
        }
        self.teardown(&session, context);
    }

    /// Returns whether the session stays alive and the next read should be issued.
    fn process_receive(
        &self,
        session: &ConnectionSession,
        context: &mut IoContext,
        result: io::Result<usize>,
    ) -> bool {
        match result {
            Ok(0) => {
                debug!("session {} closed by {}", session.id(), session.peer_addr());
                false
            }
            Ok(transferred) => {
                context.set_transferred(transferred);
                trace!("session {} received {} bytes", session.id(), transferred);
                match session.on_receive(context.received()) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("session {} dropped: {}", session.id(), e);
                        false
                    }
                }
            }
            Err(e) => {
                let e = AppError::Receive(e.to_string());
                debug!("session {} error: {}", session.id(), e);
                false
            }
        }
    }

    async fn run_sender(
        self: Arc<Self>,
        session: SessionHandle,
        mut writer: OwnedWriteHalf,
        mut send_rx: mpsc::UnboundedReceiver<SendRequest>,
    ) {
        loop {
            let request = tokio::select! {
                request = send_rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = session.closed() => break,
            };
            let SendRequest { context, len } = request;
            // a single write, its length is checked by the session
            let result = tokio::select! {
                result = writer.write(&context.buffer()[..len]) => result,
                _ = session.closed() => Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "session closed",
                )),
            };
            self.process_send(&session, context, result);
        }

        // requests issued after the close still carry a context
        send_rx.close();
        while let Ok(request) = send_rx.try_recv() {
            if let Some(context) = session.recover_send_context(request.context) {
                self.reclaim(context);
            }
        }
        let _ = writer.shutdown().await;
        trace!("session {} sender exited", session.id());
    }

    fn process_send(&self, session: &ConnectionSession, context: IoContext, result: io::Result<usize>) {
        match session.process_send(context, result) {
            Ok(Some(context)) => self.reclaim(context),
            Ok(None) => {}
            Err(AppError::SendQueueInvariantViolation(id)) => {
                error!("send queue invariant violated on session {}, disconnecting", id);
                session.disconnect();
            }
            Err(e) => warn!("{}", e),
        }
    }

    /// Removal notice first, then both contexts go back to their pools. The
    /// session leaves the registry last.
    fn teardown(&self, session: &ConnectionSession, receive_context: IoContext) {
        if let Some(send_context) = session.on_removed() {
            self.reclaim(send_context);
        }
        self.reclaim(receive_context);
        self.sessions.remove(&session.id());
        info!(
            "session {} with {} removed, {} active",
            session.id(),
            session.peer_addr(),
            self.sessions.len()
        );
    }

    fn reclaim(&self, context: IoContext) {
        if !context.is_pooled() {
            trace!("dropping detached {} context", context.direction());
            return;
        }
        let pool = match context.direction() {
            Direction::Receive => &self.receive_pool,
            Direction::Send => &self.send_pool,
        };
        if let Err(e) = pool.give(context) {
            error!("failed to reclaim context: {}", e);
        }
    }
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService")
            .field("capacity", &self.capacity)
            .field("connected_count", &self.connected_count())
            .field("active_sessions", &self.sessions.len())
            .field("receive_pool", &self.receive_pool)
            .field("send_pool", &self.send_pool)
            .finish()
    }
}

impl Drop for ConnectionService {
    fn drop(&mut self) {
        debug!("connection service dropped");
    }
}
