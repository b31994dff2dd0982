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

use std::path::Path;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::Framing;

pub static GLOBAL_CONFIG: OnceCell<ServerConfig> = OnceCell::new();

/// The process-wide configuration, falling back to defaults when the binary
/// has not installed one.
pub fn global_config() -> &'static ServerConfig {
    GLOBAL_CONFIG.get_or_init(ServerConfig::default)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// How often closed connections are dropped from the registry.
    pub reclaim_interval_secs: u64,
    /// Idle blocks kept by the pool shared by every outgoing buffer.
    pub memory_pool_blocks: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 9527,
            max_connection: 4096,
            reclaim_interval_secs: 10,
            memory_pool_blocks: 1024,
        }
    }
}

/// Per-connection engine settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Unpacker scratch capacity and the largest framed message.
    pub msg_buffer_size: usize,
    /// Capacity of the send queue, and of the receive backlog.
    pub max_msg_num: usize,
    /// Byte budget of one batch write.
    pub max_send_size: usize,
    pub graceful_shutdown_timeout_ms: u64,
    pub graceful_shutdown_poll_ms: u64,
    pub safe_send_interval_ms: u64,
    pub msg_handling_interval_ms: u64,
    /// Write one message at a time and report each through `on_message_sent`.
    pub want_msg_send_notify: bool,
    pub want_all_msg_send_notify: bool,
    pub framing: Framing,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            msg_buffer_size: 4000,
            max_msg_num: 1024,
            max_send_size: 65536,
            graceful_shutdown_timeout_ms: 5000,
            graceful_shutdown_poll_ms: 10,
            safe_send_interval_ms: 50,
            msg_handling_interval_ms: 50,
            want_msg_send_notify: false,
            want_all_msg_send_notify: false,
            framing: Framing::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.max_msg_num == 0 {
            return Err(AppError::InvalidValue(
                "message capacity must be bigger than zero".into(),
            ));
        }
        if self.graceful_shutdown_timeout_ms == 0 || self.graceful_shutdown_poll_ms == 0 {
            return Err(AppError::InvalidValue(
                "graceful shutdown duration must be bigger than zero".into(),
            ));
        }
        if self.safe_send_interval_ms == 0 || self.msg_handling_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "retry intervals must be bigger than zero".into(),
            ));
        }
        self.framing.validate(self.msg_buffer_size)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    pub fn graceful_shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_poll_ms)
    }

    pub fn safe_send_interval(&self) -> Duration {
        Duration::from_millis(self.safe_send_interval_ms)
    }

    pub fn msg_handling_interval(&self) -> Duration {
        Duration::from_millis(self.msg_handling_interval_ms)
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub connection: ConnectionConfig,
}

impl ServerConfig {
    /// Loads a config file, then applies `STONENET__SECTION__KEY` environment
    /// overrides.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("STONENET").separator("__"))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.connection.validate()?;

        Ok(server_config)
    }
}
