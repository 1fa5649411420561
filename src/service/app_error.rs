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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// connection lifecycle errors
    #[error("bind error: {0}")]
    Bind(String),

    #[error("accept error: {0}")]
    Accept(String),

    #[error("connect error: {0}")]
    Connect(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("receive error: {0}")]
    Receive(String),

    #[error("send error: {0}")]
    Send(String),

    #[error("send completion observed with an empty queue on session {0}")]
    SendQueueInvariantViolation(u64),

    #[error("session {0} is closed")]
    SessionClosed(u64),

    /// framing errors
    #[error("message too large: {0}")]
    MessageTooLarge(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}
