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

//! Connection plumbing.
//!
//! Every attached stream becomes a [`CommLink`] driven by two tokio tasks:
//! the reader appends raw bytes to the link's [`SharedBuffer`], the writer
//! drains frames the dispatch loop hands it. Protocol work happens in the
//! [`Communicator`], which only the dispatch loop touches.
//!
//! [`BinaryFrameCodec`] exposes the same framing through `tokio_util::codec`
//! for peers that do not run a dispatcher.

pub use communicator::{CommState, Communicator, Progress};
pub use frame::{BinaryFrameCodec, DEFAULT_MAX_FRAME_SIZE};
pub use link::{ChannelError, CommLink, SentRecord};
pub use outgoing::{OutgoingMessage, OutgoingQueue};
pub use protocol_context::{ProtocolContext, SendReceipt};
pub use shared_buffer::SharedBuffer;

mod communicator;
mod frame;
mod link;
mod outgoing;
mod protocol_context;
mod shared_buffer;
