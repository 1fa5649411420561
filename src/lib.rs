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

mod network;
mod service;

pub use network::{
    BufferArena, ConnectedCallback, ConnectionSession, Connector, ContextPool, Direction,
    IoContext, LengthPrefixedResolver, ListenLoop, MessageResolver, NewClientCallback,
    OutboundMessage, Packet, PacketReader, Peer, ResolverFactory, Segment, SessionHandle,
    SessionOrigin, HEADER_SIZE, KEEPALIVE_PROTOCOL_ID,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, CapacityConfig, ConnectionService,
    NetworkConfig, RuntimeConfig, ServiceConfig, SessionCallback, SessionConfig, Shutdown,
    ANY_ADDRESS, CONTEXTS_PER_CONNECTION,
};
