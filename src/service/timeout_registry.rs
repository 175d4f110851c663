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

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::protocol::{CommId, MessageId, ReplyTimeout};

#[derive(Debug, Clone)]
struct PendingReply {
    name: String,
    /// `None` waits forever.
    deadline: Option<Instant>,
}

/// A request whose reply did not arrive in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredReply {
    pub commid: CommId,
    pub id: MessageId,
    pub name: String,
}

/// Sent requests still waiting for their reply, keyed by connection and
/// message id.
///
/// An entry leaves the registry exactly once: fulfilled by a reply, expired by
/// a sweep, or cancelled with its connection.
#[derive(Debug, Default)]
pub struct TimeoutRegistry {
    pending: DashMap<(CommId, MessageId), PendingReply>,
}

impl TimeoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        commid: CommId,
        id: MessageId,
        name: &str,
        timeout: ReplyTimeout,
        now: Instant,
    ) {
        let deadline = match timeout {
            ReplyTimeout::Never => None,
            ReplyTimeout::After(after) => Some(now + after),
        };
        trace!(
            "communicator {} waits for reply to {} {}, deadline: {:?}",
            commid,
            name,
            id,
            deadline
        );
        self.pending.insert(
            (commid, id),
            PendingReply {
                name: name.to_string(),
                deadline,
            },
        );
    }

    /// Type name of the request `id` on `commid`, if still pending.
    pub fn request_name(&self, commid: CommId, id: MessageId) -> Option<String> {
        self.pending
            .get(&(commid, id))
            .map(|entry| entry.name.clone())
    }

    /// Removes the entry answered by a reply. Returns whether it was pending.
    pub fn fulfill(&self, commid: CommId, id: MessageId) -> bool {
        self.pending.remove(&(commid, id)).is_some()
    }

    /// Removes and returns every entry whose deadline is at or before `now`.
    pub fn take_expired(&self, now: Instant) -> Vec<ExpiredReply> {
        let mut expired = Vec::new();
        self.pending.retain(|(commid, id), entry| match entry.deadline {
            Some(deadline) if deadline <= now => {
                expired.push(ExpiredReply {
                    commid: *commid,
                    id: *id,
                    name: entry.name.clone(),
                });
                false
            }
            _ => true,
        });
        expired.sort_by_key(|e| (e.commid, e.id));
        expired
    }

    /// Drops every entry of a closed connection.
    pub fn cancel_comm(&self, commid: CommId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(owner, _), _| *owner != commid);
        before - self.pending.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().filter_map(|entry| entry.deadline).min()
    }

    pub fn contains(&self, commid: CommId, id: MessageId) -> bool {
        self.pending.contains_key(&(commid, id))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&self) {
        self.pending.clear();
    }
}
