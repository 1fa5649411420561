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
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use dotenv::dotenv;
use netservice::{
    setup_tracing, AppError, AppResult, ConnectedCallback, ConnectionService, ConnectionSession,
    Packet, PacketReader, Peer, ServiceConfig, SessionHandle, KEEPALIVE_PROTOCOL_ID,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::{runtime, signal, time};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// directory for rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
}

#[derive(Parser)]
pub enum Command {
    /// run an echo server (default)
    Serve,
    /// connect to a server, send one packet and print the echo
    Ping {
        remote: SocketAddr,
        #[arg(default_value = "ping")]
        message: String,
    },
    PrintConfig,
}

/// Sends every decoded packet straight back, keep-alives excepted.
struct EchoPeer {
    session: Weak<ConnectionSession>,
}

impl Peer for EchoPeer {
    fn on_message(&self, payload: Bytes) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let mut reader = PacketReader::new(payload);
        let protocol_id = match reader.pop_u16() {
            Ok(protocol_id) => protocol_id,
            Err(e) => {
                warn!("session {} sent a malformed packet: {}", session.id(), e);
                return;
            }
        };
        if protocol_id == KEEPALIVE_PROTOCOL_ID {
            return;
        }
        let mut reply = Packet::create(protocol_id);
        reply.push_bytes(&reader.rest());
        if let Err(e) = session.send(reply) {
            warn!("session {} echo failed: {}", session.id(), e);
        }
    }

    fn on_removed(&self) {
        debug!("echo peer removed");
    }
}

/// Hands the first non keep-alive reply to the waiting ping.
struct PingPeer {
    reply_tx: Mutex<Option<oneshot::Sender<Bytes>>>,
}

impl Peer for PingPeer {
    fn on_message(&self, payload: Bytes) {
        if payload.len() >= 2 && u16::from_be_bytes([payload[0], payload[1]]) == KEEPALIVE_PROTOCOL_ID
        {
            return;
        }
        if let Some(reply_tx) = self.reply_tx.lock().take() {
            let _ = reply_tx.send(payload);
        }
    }

    fn on_removed(&self) {
        self.reply_tx.lock().take();
    }
}

fn load_config(conf: Option<&str>) -> AppResult<ServiceConfig> {
    match conf {
        Some(path) => ServiceConfig::set_up_config(path),
        None if Path::new("conf.toml").exists() => ServiceConfig::set_up_config("conf.toml"),
        None => Ok(ServiceConfig::default()),
    }
}

async fn serve(config: ServiceConfig) -> AppResult<()> {
    let service = ConnectionService::initialize(&config)?;
    service.set_session_created_callback(Arc::new(|session: SessionHandle| {
        session.set_peer(Arc::new(EchoPeer {
            session: Arc::downgrade(&session),
        }));
    }));

    let network = &config.network;
    let listen_loop = service.listen(&network.host, network.port, network.backlog)?;
    info!("echo server ready on {}", listen_loop.local_addr());

    signal::ctrl_c().await?;
    info!("get shutdown signal");
    service.shutdown();
    listen_loop.join().await;
    Ok(())
}

async fn ping(mut config: ServiceConfig, remote: SocketAddr, message: String) -> AppResult<()> {
    // a client only needs its own detached contexts
    config.capacity.max_connections = 1;
    let service = ConnectionService::initialize(&config)?;

    let (reply_tx, reply_rx) = oneshot::channel();
    let peer = Arc::new(PingPeer {
        reply_tx: Mutex::new(Some(reply_tx)),
    });
    let on_connected: ConnectedCallback = Arc::new(move |session: SessionHandle| {
        session.set_peer(peer.clone());
    });
    let session = service.connect_to(remote, Some(on_connected)).await?;

    let mut packet = Packet::create(1);
    packet.push_str(&message)?;
    session.send(packet)?;

    let reply = time::timeout(Duration::from_secs(5), reply_rx)
        .await
        .map_err(|_| AppError::Receive(format!("no reply from {} within 5s", remote)))?
        .map_err(|_| AppError::SessionClosed(session.id()))?;
    let mut reader = PacketReader::new(reply);
    let protocol_id = reader.pop_u16()?;
    println!("reply from {}: protocol {} {:?}", remote, protocol_id, reader.pop_str()?);

    service.close_session(&session);
    service.shutdown();
    Ok(())
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();
    let config = load_config(commandline.conf.as_deref())?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let _log_guard = setup_tracing(&commandline.log_dir, commandline.verbose)?;

    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.effective_worker_threads())
        .thread_name("netservice-worker")
        .enable_all()
        .build()?;

    match commandline.command {
        Some(Command::Ping { remote, message }) => rt.block_on(ping(config, remote, message)),
        _ => rt.block_on(serve(config)),
    }
}
