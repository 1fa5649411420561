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

extern crate config as _;

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Host token that binds every local interface.
pub const ANY_ADDRESS: &str = "0.0.0.0";

/// Each connection holds one receive and one send segment.
pub const CONTEXTS_PER_CONNECTION: usize = 2;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: ANY_ADDRESS.to_string(),
            port: 7979,
            backlog: 100,
        }
    }
}

/// Fixed at service initialization, never resized afterwards.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CapacityConfig {
    pub max_connections: usize,
    pub segment_size: usize,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        CapacityConfig {
            max_connections: 10_000,
            segment_size: 1024,
        }
    }
}

impl CapacityConfig {
    /// Total bytes of the shared arena backing every pooled context.
    pub fn arena_capacity(&self) -> AppResult<usize> {
        self.max_connections
            .checked_mul(self.segment_size)
            .and_then(|bytes| bytes.checked_mul(CONTEXTS_PER_CONNECTION))
            .ok_or_else(|| {
                AppError::InvalidValue(format!(
                    "arena of {} connections x {} bytes overflows",
                    self.max_connections, self.segment_size
                ))
            })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub max_message_size: usize,
    /// 0 disables keep-alive
    pub keepalive_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_message_size: 1024,
            keepalive_interval_ms: 3000,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 0 means one worker per cpu
    pub worker_threads: usize,
}

impl RuntimeConfig {
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub network: NetworkConfig,
    pub capacity: CapacityConfig,
    pub session: SessionConfig,
    pub runtime: RuntimeConfig,
}

impl ServiceConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServiceConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let service_config: ServiceConfig = config.try_deserialize()?;
        service_config.validate()?;

        Ok(service_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.capacity.max_connections == 0 {
            return Err(AppError::InvalidValue(
                "capacity.max_connections must be greater than 0".to_string(),
            ));
        }
        if self.capacity.segment_size == 0 {
            return Err(AppError::InvalidValue(
                "capacity.segment_size must be greater than 0".to_string(),
            ));
        }
        if self.session.max_message_size > self.capacity.segment_size {
            return Err(AppError::InvalidValue(format!(
                "session.max_message_size {} exceeds capacity.segment_size {}",
                self.session.max_message_size, self.capacity.segment_size
            )));
        }
        self.capacity.arena_capacity()?;
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }
}
