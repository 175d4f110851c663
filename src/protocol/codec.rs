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

//! Pluggable wire formats.
//!
//! A wire format is an encoder/decoder pair. The decoder is driven by the
//! communicator over the bytes swapped out of a connection's shared buffer:
//!
//! 1. `find_frame` locates one complete frame, or nothing if only a partial
//!    frame is buffered.
//! 2. `decode_frame` strips framing and escaping from that frame.
//! 3. `extract_type_name` reads the type tag so the factory can build the
//!    right message before the payload is parsed.
//! 4. `read_message` fills the header fields and deserializes the payload.
//!
//! Every failure in steps 2-4 is scoped to the frame it came from; the frame
//! bytes are already consumed, so the next frame stays aligned.

use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;

use bytes::BytesMut;

use super::binary::BinaryCodec;
use super::{Message, MessageFactory, MessageHeader};
use crate::{AppError, AppResult};

pub const BINARY_FORMAT: &str = "binary";

pub trait MessageDecoder: Send + Sync + Debug {
    /// Bounds of the first complete frame in `buffer`.
    fn find_frame(&self, buffer: &[u8]) -> Option<Range<usize>>;

    fn decode_frame(&self, raw: &[u8]) -> AppResult<BytesMut>;

    fn extract_type_name(&self, decoded: &[u8]) -> AppResult<String>;

    fn read_message(&self, decoded: &[u8], message: &mut dyn Message) -> AppResult<()>;

    /// Runs steps 2-4 over one raw frame.
    fn decode(&self, raw: &[u8], factory: &MessageFactory) -> AppResult<Box<dyn Message>> {
        let decoded = self.decode_frame(raw)?;
        let name = self.extract_type_name(&decoded)?;
        let mut message = factory.create(&name)?;
        if message.name() != name {
            return Err(AppError::FrameDecode(format!(
                "factory built {} for type {}",
                message.name(),
                name
            )));
        }
        self.read_message(&decoded, message.as_mut())?;
        Ok(message)
    }
}

pub trait MessageEncoder: Send + Sync + Debug {
    /// Serializes and frames `message`, taking correlation fields from `header`
    /// instead of the message's own header.
    fn encode(&self, message: &dyn Message, header: &MessageHeader) -> AppResult<BytesMut>;
}

/// An encoder/decoder pair registered under one wire format name.
#[derive(Debug, Clone)]
pub struct Codec {
    pub encoder: Arc<dyn MessageEncoder>,
    pub decoder: Arc<dyn MessageDecoder>,
}

impl Codec {
    pub fn new(encoder: Arc<dyn MessageEncoder>, decoder: Arc<dyn MessageDecoder>) -> Self {
        Codec { encoder, decoder }
    }

    pub fn binary() -> Self {
        let codec = Arc::new(BinaryCodec);
        Codec {
            encoder: codec.clone(),
            decoder: codec,
        }
    }
}

/// Wire formats known to a dispatcher, looked up by the configured name.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    formats: HashMap<String, Codec>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut formats = HashMap::new();
        formats.insert(BINARY_FORMAT.to_string(), Codec::binary());
        CodecRegistry { formats }
    }
}

impl CodecRegistry {
    pub fn register(&mut self, name: impl Into<String>, codec: Codec) -> &mut Self {
        self.formats.insert(name.into(), codec);
        self
    }

    pub fn resolve(&self, name: &str) -> AppResult<Codec> {
        self.formats
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::Misconfiguration(format!("unknown wire format: {}", name)))
    }
}
