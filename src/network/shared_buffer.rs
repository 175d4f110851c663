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

use std::mem;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Incoming bytes of one connection.
///
/// The reader task appends, the dispatch loop swaps the whole buffer out and
/// parses it without holding the lock, then gives back what it could not
/// parse yet.
#[derive(Debug, Default)]
pub struct SharedBuffer {
    inner: Mutex<BytesMut>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, bytes: &[u8]) {
        self.inner.lock().extend_from_slice(bytes);
    }

    pub fn take_and_clear(&self) -> BytesMut {
        mem::take(&mut *self.inner.lock())
    }

    /// Puts an unparsed remainder back in front of anything appended since
    /// the last `take_and_clear`.
    pub fn restore(&self, mut remainder: BytesMut) {
        if remainder.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.is_empty() {
            remainder.extend_from_slice(&inner);
        }
        *inner = remainder;
    }

    /// Looks at the buffered bytes under the lock.
    pub fn peek<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
