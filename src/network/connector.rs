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

use std::net::SocketAddr;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tracing::{error, info};

use super::session::SessionHandle;
use crate::service::ConnectionService;
use crate::{AppError, AppResult};

/// Called with the new session once an outbound connection is established.
pub type ConnectedCallback = Arc<dyn Fn(SessionHandle) + Send + Sync>;

/// Opens outbound connections to a single remote endpoint.
///
/// One connector serves one destination for its whole life; use another
/// instance for every other server. Failed attempts are not retried.
pub struct Connector {
    service: Arc<ConnectionService>,
    target: OnceCell<SocketAddr>,
    connected_callback: RwLock<Option<ConnectedCallback>>,
}

impl Connector {
    pub fn new(service: Arc<ConnectionService>) -> Connector {
        Connector {
            service,
            target: OnceCell::new(),
            connected_callback: RwLock::new(None),
        }
    }

    pub fn set_connected_callback(&self, callback: ConnectedCallback) {
        *self.connected_callback.write() = Some(callback);
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.target.get().copied()
    }

    pub async fn connect(&self, remote: SocketAddr) -> AppResult<SessionHandle> {
        let target = *self.target.get_or_init(|| remote);
        if target != remote {
            return Err(AppError::InvalidOperation(format!(
                "connector bound to {} cannot connect to {}",
                target, remote
            )));
        }

        let stream = match TcpStream::connect(remote).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("failed to connect to {}: {}", remote, e);
                return Err(AppError::Connect(format!("{}: {}", remote, e)));
            }
        };
        info!("connected to {}", remote);

        let callback = self.connected_callback.read().clone();
        self.service.on_connect_completed(stream, callback)
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("target", &self.target.get())
            .finish()
    }
}
