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

use bytes::Bytes;
use parking_lot::Mutex;

use crate::protocol::{MessageId, Priority};
use crate::utils::UniquePriorityQueue;

/// An encoded message waiting for its turn on the wire.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub id: Option<MessageId>,
    pub name: String,
    pub priority: Priority,
    pub frame: Bytes,
}

/// Pending outgoing messages of one connection.
///
/// Ordered by priority, FIFO among equal priorities, unique by message id.
/// Pushed from any thread, popped by the dispatch loop.
#[derive(Debug, Default)]
pub struct OutgoingQueue {
    inner: Mutex<UniquePriorityQueue<MessageId, Priority, OutgoingMessage>>,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when a message with the same id is already queued.
    pub fn push(&self, message: OutgoingMessage) -> bool {
        let key = message.id;
        let priority = message.priority;
        self.inner.lock().push(key, priority, message)
    }

    pub fn pop(&self) -> Option<OutgoingMessage> {
        self.inner.lock().pop()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.inner.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;

    fn message(id: u64, priority: u32, name: &str) -> OutgoingMessage {
        OutgoingMessage {
            id: MessageId::new(id),
            name: name.to_string(),
            priority: NonZeroU32::new(priority).unwrap(),
            frame: Bytes::from_static(b"\xff"),
        }
    }

    #[test]
    fn same_id_is_rejected_and_length_unchanged() {
        let queue = OutgoingQueue::new();
        assert!(queue.push(message(1, 5, "a")));
        assert!(!queue.push(message(1, 5, "a")));
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(MessageId::new(1).unwrap()));
    }

    #[test]
    fn pops_by_priority_then_insertion() {
        let queue = OutgoingQueue::new();
        queue.push(message(1, 5, "five-a"));
        queue.push(message(2, 5, "five-b"));
        queue.push(message(3, 7, "seven"));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|m| m.name)
            .collect();
        assert_eq!(order, vec!["seven", "five-a", "five-b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn messages_without_id_never_collide() {
        let queue = OutgoingQueue::new();
        assert!(queue.push(message(0, 1, "x")));
        assert!(queue.push(message(0, 1, "x")));
        assert_eq!(queue.len(), 2);
    }
}
