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
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::service::{Shutdown, ANY_ADDRESS};
use crate::{AppError, AppResult};

/// Receives every accepted socket. Runs on a runtime worker and must not block.
pub type NewClientCallback = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

#[derive(Debug, Default)]
struct AcceptStats {
    accepted: AtomicU64,
    failed: AtomicU64,
}

/// Accept loop with a single outstanding accept.
///
/// A one-permit semaphore gates the loop: the permit is taken before each
/// accept and released by the completion handler, so the next accept is only
/// issued once the previous one has been fully handled.
#[derive(Debug)]
pub struct ListenLoop {
    local_addr: SocketAddr,
    stats: Arc<AcceptStats>,
    handle: JoinHandle<()>,
}

pub(crate) fn resolve_bind_address(host: &str, port: u16) -> AppResult<SocketAddr> {
    let ip = if host == ANY_ADDRESS {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse::<IpAddr>()
            .map_err(|e| AppError::Bind(format!("invalid host {}: {}", host, e)))?
    };
    Ok(SocketAddr::new(ip, port))
}

fn bind(address: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match address {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(address)?;
    socket.listen(backlog)
}

impl ListenLoop {
    /// Binds and starts accepting. Must be called from within a tokio runtime.
    pub fn start(
        host: &str,
        port: u16,
        backlog: u32,
        callback: NewClientCallback,
        notify_shutdown: &broadcast::Sender<()>,
    ) -> AppResult<ListenLoop> {
        let address = resolve_bind_address(host, port)?;
        let listener = bind(address, backlog).map_err(|e| {
            AppError::Bind(format!("failed to bind server to {}: {}", address, e))
        })?;
        let local_addr = listener.local_addr()?;
        info!("tcp server listening on {} with backlog {}", local_addr, backlog);

        let stats = Arc::new(AcceptStats::default());
        let shutdown = Shutdown::subscribe(notify_shutdown);
        let handle = tokio::spawn(accept_loop(listener, callback, stats.clone(), shutdown));

        Ok(ListenLoop {
            local_addr,
            stats,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn accepted(&self) -> u64 {
        self.stats.accepted.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    /// Waits until the loop has observed shutdown.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!("listen loop on {} ended abnormally: {}", self.local_addr, e);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    callback: NewClientCallback,
    stats: Arc<AcceptStats>,
    mut shutdown: Shutdown,
) {
    let flow_control = Arc::new(Semaphore::new(1));
    while !shutdown.is_shutdown() {
        let permit = tokio::select! {
            permit = flow_control.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.recv() => break,
        };
        let accepted = tokio::select! {
            accepted = listener.accept() => {
                accepted.map_err(|e| AppError::Accept(e.to_string()))
            }
            _ = shutdown.recv() => break,
        };
        let callback = callback.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            on_accept_completed(accepted, permit, &callback, &stats);
        });
    }
    debug!("listen loop stopped");
}

fn on_accept_completed(
    accepted: AppResult<(TcpStream, SocketAddr)>,
    permit: OwnedSemaphorePermit,
    callback: &NewClientCallback,
    stats: &AcceptStats,
) {
    match accepted {
        Ok((stream, peer_addr)) => {
            stats.accepted.fetch_add(1, Ordering::Relaxed);
            // re-arm before handing the socket over
            drop(permit);
            callback(stream, peer_addr);
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!("{}, listen loop continues", e);
            drop(permit);
        }
    }
}
