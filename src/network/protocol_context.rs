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

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{CommLink, OutgoingMessage};
use crate::protocol::{Codec, Message, MessageCatalog, MessageFactory, MessageId, Priority};
use crate::{AppError, AppResult};

/// Outcome of queueing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    /// Id the message went out with, engine assigned or caller provided.
    pub id: Option<MessageId>,
    /// `false` when a message with the same id was already queued.
    pub queued: bool,
}

/// Everything a communicator needs to speak the protocol, fixed at dispatcher
/// start and shared read-only afterwards.
#[derive(Debug)]
pub struct ProtocolContext {
    pub catalog: MessageCatalog,
    pub codec: Codec,
    pub factory: Arc<MessageFactory>,
    pub engine_managed_ids: bool,
    pub timeouts_enabled: bool,
    pub close_on_decode_error: bool,
    /// Buffered bytes without a complete frame that count as a broken peer.
    pub max_frame_size: usize,
    pub max_priority: Priority,
    pub incoming_quantum: usize,
    pub outgoing_quantum: usize,
    pub idle_timeout: Duration,
}

impl ProtocolContext {
    /// Encodes `message` and puts it on the outgoing queue of `link`.
    ///
    /// The message itself is left untouched: an engine managed id and the
    /// resolved priority only go into the queued frame.
    pub fn enqueue(&self, link: &CommLink, message: &dyn Message) -> AppResult<SendReceipt> {
        if link.is_closed() {
            return Err(AppError::UnknownCommunicator(link.commid()));
        }
        let mut header = *message.header();
        if self.engine_managed_ids && header.id.is_none() {
            header.id = Some(link.next_message_id());
        }
        let priority = match header.priority {
            Some(priority) if priority > self.max_priority => {
                return Err(AppError::SerializationRange(format!(
                    "priority {} of {} above max priority {}",
                    priority,
                    message.name(),
                    self.max_priority
                )));
            }
            Some(priority) => priority,
            None => self.catalog.priority(message.name()),
        };
        header.priority = Some(priority);

        let frame = self.codec.encoder.encode(message, &header)?;
        let queued = link.outgoing().push(OutgoingMessage {
            id: header.id,
            name: message.name().to_string(),
            priority,
            frame: frame.freeze(),
        });
        if queued {
            link.kick();
        } else {
            debug!(
                "message {} with id {:?} already queued on communicator {}",
                message.name(),
                header.id,
                link.commid()
            );
        }
        Ok(SendReceipt {
            id: header.id,
            queued,
        })
    }
}
