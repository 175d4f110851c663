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

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{BinaryCodec, Message, MessageDecoder, MessageEncoder, MessageFactory};
use crate::{AppError, AppResult};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Binary wire format as a `tokio_util` codec.
///
/// Lets a plain peer speak the protocol through `Framed` without running a
/// dispatcher. Unlike a communicator, any frame error ends the stream.
#[derive(Debug, Clone)]
pub struct BinaryFrameCodec {
    factory: Arc<MessageFactory>,
    max_frame_size: usize,
}

impl BinaryFrameCodec {
    pub fn new(factory: Arc<MessageFactory>) -> Self {
        BinaryFrameCodec {
            factory,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl Decoder for BinaryFrameCodec {
    type Item = Box<dyn Message>;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<Self::Item>> {
        match BinaryCodec.find_frame(src) {
            Some(bounds) => {
                let frame = src.split_to(bounds.end);
                BinaryCodec
                    .decode(&frame[bounds.start..], &self.factory)
                    .map(Some)
            }
            None if src.len() > self.max_frame_size => Err(AppError::FrameDecode(format!(
                "frame of length {} is too large",
                src.len()
            ))),
            None => Ok(None),
        }
    }
}

impl<M: Message> Encoder<M> for BinaryFrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: M, dst: &mut BytesMut) -> AppResult<()> {
        let frame = BinaryCodec.encode(&item, item.header())?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
