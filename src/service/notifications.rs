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

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::Dispatcher;
use crate::protocol::CommId;
use crate::session::DisconnectReason;

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedEvent {
    pub commid: CommId,
    pub peer: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedEvent {
    pub commid: CommId,
    pub reason: DisconnectReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectErrorEvent {
    pub addr: SocketAddr,
    pub reason: String,
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;
pub(crate) type AfterAllProcessed = Arc<dyn Fn(&Dispatcher) + Send + Sync>;

/// Subscribers of one event, called in subscription order.
struct Subscribers<E> {
    list: Mutex<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Subscribers {
            list: Mutex::new(Vec::new()),
        }
    }
}

impl<E> Subscribers<E> {
    fn add(&self, id: SubscriptionId, callback: Callback<E>) {
        self.list.lock().push((id, callback));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut list = self.list.lock();
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        list.len() != before
    }

    fn notify(&self, event: &E) {
        // callbacks may subscribe or unsubscribe, so call them unlocked
        let callbacks: Vec<Callback<E>> = self
            .list
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    fn len(&self) -> usize {
        self.list.lock().len()
    }
}

/// Dispatcher level observers, on top of the per-connection sessions.
#[derive(Default)]
pub(crate) struct Notifications {
    next_id: AtomicU64,
    connected: Subscribers<ConnectedEvent>,
    disconnected: Subscribers<DisconnectedEvent>,
    connect_error: Subscribers<ConnectErrorEvent>,
    after_all_processed: Mutex<Option<AfterAllProcessed>>,
}

impl Notifications {
    fn next_id(&self) -> SubscriptionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn on_connected(&self, callback: Callback<ConnectedEvent>) -> SubscriptionId {
        let id = self.next_id();
        self.connected.add(id, callback);
        id
    }

    pub fn on_disconnected(&self, callback: Callback<DisconnectedEvent>) -> SubscriptionId {
        let id = self.next_id();
        self.disconnected.add(id, callback);
        id
    }

    pub fn on_connect_error(&self, callback: Callback<ConnectErrorEvent>) -> SubscriptionId {
        let id = self.next_id();
        self.connect_error.add(id, callback);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.connected.remove(id) || self.disconnected.remove(id) || self.connect_error.remove(id)
    }

    pub fn set_after_all_processed(&self, callback: Option<AfterAllProcessed>) {
        *self.after_all_processed.lock() = callback;
    }

    pub fn connected(&self, event: &ConnectedEvent) {
        self.connected.notify(event);
    }

    pub fn disconnected(&self, event: &DisconnectedEvent) {
        self.disconnected.notify(event);
    }

    pub fn connect_error(&self, event: &ConnectErrorEvent) {
        self.connect_error.notify(event);
    }

    pub fn after_all_processed(&self, dispatcher: &Dispatcher) {
        let callback = self.after_all_processed.lock().clone();
        if let Some(callback) = callback {
            callback(dispatcher);
        }
    }
}

impl fmt::Debug for Notifications {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifications")
            .field("connected", &self.connected.len())
            .field("disconnected", &self.disconnected.len())
            .field("connect_error", &self.connect_error.len())
            .field(
                "after_all_processed",
                &self.after_all_processed.lock().is_some(),
            )
            .finish()
    }
}
