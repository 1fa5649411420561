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

//! Network Module Implementation
//!
//! Connection plumbing built on tokio's async I/O primitives:
//! - `BufferArena`: one pre-allocated region sliced into fixed segments
//! - `ContextPool`: reusable receive/send contexts bound to arena segments
//! - `ListenLoop`: accept loop with a single outstanding accept
//! - `Connector`: outbound connection to one remote endpoint
//! - `ConnectionSession`: per-connection state and the ordered send queue
//!
//! Framing and application behaviour are plugged in through
//! `MessageResolver`, `OutboundMessage` and `Peer`.

pub use buffer_arena::{BufferArena, Segment};
pub use connector::{ConnectedCallback, Connector};
pub use context_pool::{ContextPool, Direction, IoContext};
pub use listener::{ListenLoop, NewClientCallback};
pub use packet::{OutboundMessage, Packet, PacketReader, HEADER_SIZE, KEEPALIVE_PROTOCOL_ID};
pub use peer::Peer;
pub use resolver::{LengthPrefixedResolver, MessageResolver, ResolverFactory};
pub use session::{ConnectionSession, SendRequest, SessionHandle, SessionOrigin};

mod buffer_arena;
mod connector;
mod context_pool;
mod listener;
mod packet;
mod peer;
mod resolver;
mod session;
