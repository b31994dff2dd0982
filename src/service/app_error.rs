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
    /// framing errors
    #[error("framing overflow: {0}")]
    FramingOverflow(String),

    #[error("unpack protocol error: {0}")]
    UnpackProtocolError(String),

    /// flow control and lifecycle
    #[error("send queue is full, capacity: {0}")]
    QueueFull(usize),

    #[error("connection is shutting down")]
    ShuttingDown,

    #[error("failed to graceful shutdown within {0} ms")]
    ShutdownTimeout(u64),

    #[error("transport error: {0}")]
    TransportError(String),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("Accept error = {0}")]
    Accept(String),
}

impl AppError {
    /// Whether the error is a flow-control signal rather than a failure.
    ///
    /// `QueueFull` only means "try again later"; callers looping on `send`
    /// use this to decide whether to back off or give up.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, AppError::QueueFull(_))
    }
}
