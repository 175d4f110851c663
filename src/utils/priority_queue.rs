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

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::hash::Hash;

#[derive(Debug)]
struct Entry<P, T> {
    priority: P,
    seq: u64,
    item: T,
}

impl<P: Ord, T> PartialEq for Entry<P, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P: Ord, T> Eq for Entry<P, T> {}

impl<P: Ord, T> PartialOrd for Entry<P, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P: Ord, T> Ord for Entry<P, T> {
    // max-heap: higher priority first, then the earlier insertion
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue that keeps FIFO order among equal priorities.
#[derive(Debug)]
pub struct StablePriorityQueue<P, T> {
    heap: BinaryHeap<Entry<P, T>>,
    next_seq: u64,
}

impl<P: Ord, T> Default for StablePriorityQueue<P, T> {
    fn default() -> Self {
        StablePriorityQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }
}

impl<P: Ord, T> StablePriorityQueue<P, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: P, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            priority,
            seq,
            item,
        });
    }

    pub fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|entry| entry.item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

/// Stable priority queue that refuses an element whose key is already queued.
///
/// Elements pushed without a key are always accepted.
#[derive(Debug)]
pub struct UniquePriorityQueue<K, P, T> {
    queue: StablePriorityQueue<P, (Option<K>, T)>,
    keys: HashSet<K>,
}

impl<K: Eq + Hash, P: Ord, T> Default for UniquePriorityQueue<K, P, T> {
    fn default() -> Self {
        UniquePriorityQueue {
            queue: StablePriorityQueue::new(),
            keys: HashSet::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, P: Ord, T> UniquePriorityQueue<K, P, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the element was inserted.
    pub fn push(&mut self, key: Option<K>, priority: P, item: T) -> bool {
        if let Some(key) = &key {
            if !self.keys.insert(key.clone()) {
                return false;
            }
        }
        self.queue.push(priority, (key, item));
        true
    }

    pub fn pop(&mut self) -> Option<T> {
        let (key, item) = self.queue.pop()?;
        if let Some(key) = key {
            self.keys.remove(&key);
        }
        Some(item)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.keys.clear();
    }
}
