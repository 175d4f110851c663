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

use std::any::Any;
use std::fmt;
use std::num::{NonZeroU32, NonZeroU64};

use bytes::{Bytes, BytesMut};

use crate::AppResult;

/// Process-unique identifier of one connection.
pub type CommId = u64;

/// Message priority, higher values leave the outgoing queue first.
pub type Priority = NonZeroU32;

pub const MIN_PRIORITY: Priority = NonZeroU32::MIN;
pub const MAX_PRIORITY: Priority = NonZeroU32::MAX;

/// Identifier of one message instance, unique per connection while in flight.
///
/// Zero is reserved on the wire for "undefined", so the id is never zero; an
/// absent id is `None` in [`MessageHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(NonZeroU64);

impl MessageId {
    pub fn new(value: u64) -> Option<MessageId> {
        NonZeroU64::new(value).map(MessageId)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation and scheduling fields every message carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: Option<MessageId>,
    /// Id of the message this one answers.
    pub rid: Option<MessageId>,
    /// `None` means the catalog or config default applies when queued.
    pub priority: Option<Priority>,
}

/// A typed, named unit of application data.
///
/// Implementations own their payload layout; the codec owns the header and the
/// framing around it.
pub trait Message: Any + Send + fmt::Debug {
    /// Protocol type tag, used to pick the handler and the factory entry.
    fn name(&self) -> &str;

    fn header(&self) -> &MessageHeader;

    fn header_mut(&mut self) -> &mut MessageHeader;

    fn serialize_payload(&self, out: &mut BytesMut) -> AppResult<()>;

    fn deserialize_payload(&mut self, payload: &[u8]) -> AppResult<()>;

    fn as_any(&self) -> &dyn Any;
}

impl<'a> dyn Message + 'a {
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn id(&self) -> Option<MessageId> {
        self.header().id
    }

    pub fn rid(&self) -> Option<MessageId> {
        self.header().rid
    }
}

/// Message whose payload stays opaque bytes.
///
/// Used as the fallback type of the message factory and by tools that relay
/// frames without knowing their schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    name: String,
    header: MessageHeader,
    payload: Bytes,
}

impl RawMessage {
    pub fn new(name: impl Into<String>) -> Self {
        RawMessage {
            name: name.into(),
            header: MessageHeader::default(),
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        RawMessage {
            name: name.into(),
            header: MessageHeader::default(),
            payload: payload.into(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.header.priority = Some(priority);
        self
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.header.id = Some(id);
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl Message for RawMessage {
    fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> &MessageHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut MessageHeader {
        &mut self.header
    }

    fn serialize_payload(&self, out: &mut BytesMut) -> AppResult<()> {
        out.extend_from_slice(&self.payload);
        Ok(())
    }

    fn deserialize_payload(&mut self, payload: &[u8]) -> AppResult<()> {
        self.payload = Bytes::copy_from_slice(payload);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
