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

use tokio::sync::broadcast;

/// Listens for the dispatcher stop signal.
///
/// The server accept loop holds one. Once the signal has been observed,
/// `recv` returns immediately on every later call.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // a lagged or closed channel means the signal went out as well
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_is_sticky_after_first_signal() {
        let (tx, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(tx.subscribe());
        assert!(!shutdown.is_shutdown());

        tx.send(()).unwrap();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());

        // no second signal is sent, recv must still return
        shutdown.recv().await;
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_signal() {
        let (tx, _) = broadcast::channel::<()>(1);
        let mut shutdown = Shutdown::new(tx.subscribe());
        drop(tx);
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
    }
}
