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

use crate::protocol::CommId;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    /// frame scoped errors, the connection may survive them
    #[error("frame decode error: {0}")]
    FrameDecode(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("serialization range error: {0}")]
    SerializationRange(String),

    /// session errors
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("disallowed reply: {0}")]
    DisallowedReply(String),

    #[error("session creation failed: {0}")]
    SessionCreation(String),

    /// connection errors
    #[error("unknown communicator: {0}")]
    UnknownCommunicator(CommId),

    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: SocketAddr, reason: String },
}

impl AppError {
    /// Whether the error is confined to one frame of the incoming stream.
    pub fn is_decode_error(&self) -> bool {
        matches!(self, AppError::FrameDecode(_))
    }

    pub fn handler(reason: impl Into<String>) -> Self {
        AppError::Handler(reason.into())
    }
}
