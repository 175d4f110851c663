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

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::notifications::{
    ConnectErrorEvent, ConnectedEvent, DisconnectedEvent, Notifications, SubscriptionId,
};
use super::{CommConfig, Shutdown, TimeoutRegistry};
use crate::network::{CommLink, Communicator, ProtocolContext, Progress, SendReceipt};
use crate::protocol::{Codec, CodecRegistry, CommId, Message, MessageFactory};
use crate::session::{DisconnectReason, SessionFactory};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

enum LoopEvent {
    Attached(Arc<CommLink>),
    ConnectError(ConnectErrorEvent),
}

struct RunningLoop {
    handle: JoinHandle<()>,
    done_rx: mpsc::Receiver<()>,
}

struct DispatcherInner {
    config: CommConfig,
    factory: Arc<MessageFactory>,
    session_factory: SessionFactory,
    codecs: Mutex<CodecRegistry>,
    state: Mutex<DispatcherState>,
    protocol: Mutex<Option<Arc<ProtocolContext>>>,
    links: DashMap<CommId, Arc<CommLink>>,
    registry: TimeoutRegistry,
    notifications: Notifications,
    kick: Arc<Notify>,
    next_commid: AtomicU64,
    events_tx: async_channel::Sender<LoopEvent>,
    events_rx: async_channel::Receiver<LoopEvent>,
    notify_shutdown: broadcast::Sender<()>,
    running: Mutex<Option<RunningLoop>>,
    // set when a stop gave up on the loop; it must not run callbacks anymore
    halted: AtomicBool,
}

/// Owns every connection of one endpoint and runs the loop that drives them.
///
/// Cheap to clone; clones share the same loop. All session callbacks run on
/// the single dispatch task, while the send, disconnect and introspection
/// calls below may be made from any task or thread.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        config: CommConfig,
        session_factory: SessionFactory,
        factory: MessageFactory,
    ) -> AppResult<Dispatcher> {
        config.validate()?;
        let (events_tx, events_rx) = async_channel::unbounded();
        let (notify_shutdown, _) = broadcast::channel(1);
        Ok(Dispatcher {
            inner: Arc::new(DispatcherInner {
                config,
                factory: Arc::new(factory),
                session_factory,
                codecs: Mutex::new(CodecRegistry::default()),
                state: Mutex::new(DispatcherState::Stopped),
                protocol: Mutex::new(None),
                links: DashMap::new(),
                registry: TimeoutRegistry::new(),
                notifications: Notifications::default(),
                kick: Arc::new(Notify::new()),
                next_commid: AtomicU64::new(1),
                events_tx,
                events_rx,
                notify_shutdown,
                running: Mutex::new(None),
                halted: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &CommConfig {
        &self.inner.config
    }

    pub fn state(&self) -> DispatcherState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == DispatcherState::Running
    }

    /// Makes a wire format available to `start` under `name`.
    pub fn register_codec(&self, name: impl Into<String>, codec: Codec) {
        self.inner.codecs.lock().register(name, codec);
    }

    /// Resolves the wire format and the message catalog, then spawns the
    /// dispatch loop on the current tokio runtime.
    pub fn start(&self) -> AppResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            AppError::IllegalStateError(format!("dispatcher needs a tokio runtime: {}", e))
        })?;
        {
            let mut state = self.inner.state.lock();
            if *state != DispatcherState::Stopped {
                return Err(AppError::IllegalStateError(format!(
                    "cannot start a {:?} dispatcher",
                    *state
                )));
            }
            *state = DispatcherState::Starting;
        }

        let protocol = match self.build_protocol() {
            Ok(protocol) => Arc::new(protocol),
            Err(e) => {
                *self.inner.state.lock() = DispatcherState::Stopped;
                return Err(e);
            }
        };
        *self.inner.protocol.lock() = Some(protocol.clone());
        self.inner.halted.store(false, Ordering::Release);

        let (done_tx, done_rx) = mpsc::channel(1);
        let handle = runtime.spawn(dispatch_loop(self.inner.clone(), protocol, done_tx));
        *self.inner.running.lock() = Some(RunningLoop { handle, done_rx });
        *self.inner.state.lock() = DispatcherState::Running;
        info!("dispatcher started");
        Ok(())
    }

    fn build_protocol(&self) -> AppResult<ProtocolContext> {
        let config = &self.inner.config;
        let codec = self
            .inner
            .codecs
            .lock()
            .resolve(&config.protocol.wire_format)?;
        Ok(ProtocolContext {
            catalog: config.catalog()?,
            codec,
            factory: self.inner.factory.clone(),
            engine_managed_ids: config.protocol.engine_managed_ids,
            timeouts_enabled: config.protocol.timeouts_enabled,
            close_on_decode_error: config.protocol.close_on_decode_error,
            max_frame_size: config.network.max_frame_size,
            max_priority: config.max_priority()?,
            incoming_quantum: config.dispatcher.incoming_quantum,
            outgoing_quantum: config.dispatcher.outgoing_quantum,
            idle_timeout: config.idle_timeout(),
        })
    }

    fn protocol(&self) -> AppResult<Arc<ProtocolContext>> {
        self.inner
            .protocol
            .lock()
            .clone()
            .ok_or_else(|| AppError::IllegalStateError("dispatcher is not running".to_string()))
    }

    fn ensure_running(&self) -> AppResult<()> {
        match self.state() {
            DispatcherState::Running => Ok(()),
            state => Err(AppError::IllegalStateError(format!(
                "dispatcher is {:?}",
                state
            ))),
        }
    }

    /// Adopts a connected byte stream. Its session is created on the next tick.
    pub fn attach<S>(&self, stream: S, peer: Option<SocketAddr>) -> AppResult<CommId>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.ensure_running()?;
        let commid = self.inner.next_commid.fetch_add(1, Ordering::Relaxed);
        let link = CommLink::spawn(
            commid,
            stream,
            peer,
            self.inner.config.network.read_buffer_size,
            self.inner.kick.clone(),
        );
        self.inner.links.insert(commid, link.clone());
        self.push_event(LoopEvent::Attached(link));
        Ok(commid)
    }

    /// Queues a connect failure for the connect-error subscribers.
    pub(crate) fn report_connect_error(&self, addr: SocketAddr, reason: String) {
        self.push_event(LoopEvent::ConnectError(ConnectErrorEvent { addr, reason }));
    }

    fn push_event(&self, event: LoopEvent) {
        // the receiver lives as long as the dispatcher
        if self.inner.events_tx.try_send(event).is_err() {
            error!("dispatcher event channel closed");
        }
        self.inner.kick.notify_one();
    }

    pub(crate) fn subscribe_shutdown(&self) -> Shutdown {
        Shutdown::new(self.inner.notify_shutdown.subscribe())
    }

    /// Queues `message` for connection `commid`.
    pub fn send_one(&self, commid: CommId, message: &dyn Message) -> AppResult<SendReceipt> {
        let protocol = self.protocol()?;
        let link = self
            .inner
            .links
            .get(&commid)
            .map(|entry| entry.value().clone())
            .ok_or(AppError::UnknownCommunicator(commid))?;
        protocol.enqueue(&link, message)
    }

    /// Queues `message` on every open connection. Each copy gets its own id.
    pub fn send_all(&self, message: &dyn Message) -> AppResult<HashMap<CommId, SendReceipt>> {
        let protocol = self.protocol()?;
        let links: Vec<Arc<CommLink>> = self
            .inner
            .links
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut receipts = HashMap::with_capacity(links.len());
        for link in links {
            match protocol.enqueue(&link, message) {
                Ok(receipt) => {
                    receipts.insert(link.commid(), receipt);
                }
                // closed while we were iterating
                Err(AppError::UnknownCommunicator(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(receipts)
    }

    /// Closes connection `commid` on the next tick.
    pub fn disconnect_one(&self, commid: CommId) -> AppResult<()> {
        let link = self
            .inner
            .links
            .get(&commid)
            .map(|entry| entry.value().clone())
            .ok_or(AppError::UnknownCommunicator(commid))?;
        link.request_close();
        Ok(())
    }

    pub fn disconnect_all(&self) {
        for entry in self.inner.links.iter() {
            entry.value().request_close();
        }
    }

    pub fn connections(&self) -> Vec<CommId> {
        let mut ids: Vec<CommId> = self.inner.links.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn connections_count(&self) -> usize {
        self.inner.links.len()
    }

    pub fn remote_addr(&self, commid: CommId) -> Option<SocketAddr> {
        self.inner
            .links
            .get(&commid)
            .and_then(|entry| entry.value().peer())
    }

    /// Requests still waiting for their reply, over all connections.
    pub fn pending_replies(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn on_connected<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ConnectedEvent) + Send + Sync + 'static,
    {
        self.inner.notifications.on_connected(Arc::new(callback))
    }

    pub fn on_disconnected<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DisconnectedEvent) + Send + Sync + 'static,
    {
        self.inner.notifications.on_disconnected(Arc::new(callback))
    }

    pub fn on_connect_error<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ConnectErrorEvent) + Send + Sync + 'static,
    {
        self.inner.notifications.on_connect_error(Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.notifications.unsubscribe(id)
    }

    /// Runs `callback` at the end of every dispatch loop iteration.
    pub fn set_after_all_processed<F>(&self, callback: F)
    where
        F: Fn(&Dispatcher) + Send + Sync + 'static,
    {
        self.inner
            .notifications
            .set_after_all_processed(Some(Arc::new(callback)));
    }

    pub fn clear_after_all_processed(&self) {
        self.inner.notifications.set_after_all_processed(None);
    }

    /// Stops accepting work, drains every connection and waits for the loop.
    ///
    /// Returns `false` when `wait` ran out first. Remaining connections are
    /// then torn down without their session's `disconnected` callback, and
    /// the dispatcher stays `Stopping` until the abandoned loop has exited.
    pub async fn stop(&self, wait: Duration) -> AppResult<bool> {
        {
            let mut state = self.inner.state.lock();
            if *state != DispatcherState::Running {
                return Err(AppError::IllegalStateError(format!(
                    "cannot stop a {:?} dispatcher",
                    *state
                )));
            }
            *state = DispatcherState::Stopping;
        }
        info!("dispatcher stopping, waiting up to {:?}", wait);
        // no receiver just means no accept loop is running
        let _ = self.inner.notify_shutdown.send(());
        self.inner.kick.notify_one();

        let running = self.inner.running.lock().take();
        if let Some(RunningLoop {
            handle,
            mut done_rx,
        }) = running
        {
            if tokio::time::timeout(wait, done_rx.recv()).await.is_err() {
                warn!("dispatch loop still busy after {:?}, aborting it", wait);
                self.inner.halted.store(true, Ordering::Release);
                handle.abort();
                self.abort_leftovers();
                // a handler may still hold the loop's thread; Stopped waits for it
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.await {
                        debug!("aborted dispatch loop: {}", e);
                    }
                    inner.finish_stop(false);
                });
                return Ok(false);
            }
        }

        self.abort_leftovers();
        self.inner.finish_stop(true);
        Ok(true)
    }

    fn abort_leftovers(&self) {
        while let Ok(event) = self.inner.events_rx.try_recv() {
            if let LoopEvent::Attached(link) = event {
                link.abort();
            }
        }
        let leftovers: Vec<Arc<CommLink>> = self
            .inner
            .links
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for link in leftovers {
            let commid = link.commid();
            link.abort();
            self.inner.links.remove(&commid);
            self.inner.registry.cancel_comm(commid);
            warn!("communicator {} aborted by stop", commid);
            self.inner.notifications.disconnected(&DisconnectedEvent {
                commid,
                reason: DisconnectReason::Shutdown,
            });
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("connections", &self.connections_count())
            .field("pending_replies", &self.pending_replies())
            .field("notifications", &self.inner.notifications)
            .finish()
    }
}

impl DispatcherInner {
    fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn finish_stop(&self, graceful: bool) {
        self.registry.clear();
        *self.protocol.lock() = None;
        *self.state.lock() = DispatcherState::Stopped;
        info!("dispatcher stopped, graceful: {}", graceful);
    }

    fn open_comm(
        &self,
        comms: &mut HashMap<CommId, Communicator>,
        link: Arc<CommLink>,
        protocol: &ProtocolContext,
        draining: bool,
    ) {
        let commid = link.commid();
        let peer = link.peer();
        match Communicator::open(link.clone(), &self.session_factory, protocol) {
            Ok(mut comm) => {
                if draining {
                    comm.begin_drain();
                }
                comms.insert(commid, comm);
                debug!("communicator {} opened, peer: {:?}", commid, peer);
                self.notifications
                    .connected(&ConnectedEvent { commid, peer });
            }
            Err(e) => {
                error!("communicator {} rejected: {}", commid, e);
                link.abort();
                self.links.remove(&commid);
            }
        }
    }

    fn close_comm(
        &self,
        comm: &mut Communicator,
        protocol: &ProtocolContext,
        reason: DisconnectReason,
    ) {
        let commid = comm.link().commid();
        // already gone when a timed out stop tore the link down
        let removed = self.links.remove(&commid).is_some();
        let cancelled = self.registry.cancel_comm(commid);
        if cancelled > 0 {
            debug!(
                "communicator {} closed with {} requests unanswered",
                commid, cancelled
            );
        }
        comm.close(protocol, &reason);
        if removed {
            self.notifications
                .disconnected(&DisconnectedEvent { commid, reason });
        }
    }
}

/// The dispatch loop: the only place communicators are processed, opened and
/// closed.
async fn dispatch_loop(
    inner: Arc<DispatcherInner>,
    protocol: Arc<ProtocolContext>,
    _done_tx: mpsc::Sender<()>,
) {
    let dispatcher = Dispatcher {
        inner: inner.clone(),
    };
    let mut comms: HashMap<CommId, Communicator> = HashMap::new();
    let mut draining = false;
    debug!("dispatch loop started");

    loop {
        if inner.halted() {
            break;
        }
        let mut busy = false;

        while let Ok(event) = inner.events_rx.try_recv() {
            busy = true;
            match event {
                LoopEvent::Attached(link) => inner.open_comm(&mut comms, link, &protocol, draining),
                LoopEvent::ConnectError(event) => {
                    warn!("connect to {} failed: {}", event.addr, event.reason);
                    inner.notifications.connect_error(&event);
                }
            }
        }

        if !draining && *inner.state.lock() == DispatcherState::Stopping {
            draining = true;
            info!("dispatch loop draining {} connections", comms.len());
            for comm in comms.values_mut() {
                comm.begin_drain();
            }
        }

        let commids: Vec<CommId> = comms.keys().copied().collect();
        for commid in commids {
            let Some(comm) = comms.get_mut(&commid) else {
                continue;
            };
            let progress = comm.process(&protocol, &inner.registry);
            if inner.halted() {
                info!("dispatch loop abandoned by stop");
                return;
            }
            let reason = match progress {
                Progress::Idle => None,
                Progress::Busy => {
                    busy = true;
                    None
                }
                Progress::Close(reason) => Some(reason),
            };
            let reason = reason
                .or_else(|| (draining && comm.is_drained()).then_some(DisconnectReason::Shutdown));
            if let Some(reason) = reason {
                if let Some(mut comm) = comms.remove(&commid) {
                    inner.close_comm(&mut comm, &protocol, reason);
                }
                busy = true;
            }
        }

        for expired in inner.registry.take_expired(Instant::now()) {
            if inner.halted() {
                return;
            }
            busy = true;
            match comms.get_mut(&expired.commid) {
                Some(comm) => comm.fire_timeout(&protocol, expired.id, &expired.name),
                None => debug!(
                    "request {} of closed communicator {} expired",
                    expired.id, expired.commid
                ),
            }
        }

        if inner.halted() {
            break;
        }
        inner.notifications.after_all_processed(&dispatcher);

        if draining && comms.is_empty() && inner.events_rx.is_empty() {
            break;
        }

        if busy {
            tokio::task::yield_now().await;
        } else {
            let mut wake = Instant::now() + protocol.idle_timeout;
            if let Some(deadline) = inner.registry.next_deadline() {
                wake = wake.min(deadline);
            }
            tokio::select! {
                _ = inner.kick.notified() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
    info!("dispatch loop finished");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::protocol::{BinaryCodec, MessageDecoder, MessageEncoder, MessageId, RawMessage};
    use crate::session::{session_factory, HandlerSession};

    fn echo_dispatcher() -> Dispatcher {
        let factory = session_factory(|_| {
            Ok(HandlerSession::new().on("ping", |ctx, _msg| {
                ctx.reply(RawMessage::new("pong"));
                Ok(())
            }))
        });
        Dispatcher::new(
            CommConfig::default(),
            factory,
            MessageFactory::with_raw_fallback(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn attach_requires_running_dispatcher() {
        let dispatcher = echo_dispatcher();
        let (ours, _theirs) = tokio::io::duplex(64);
        assert!(matches!(
            dispatcher.attach(ours, None),
            Err(AppError::IllegalStateError(_))
        ));
        assert!(dispatcher.send_one(1, &RawMessage::new("x")).is_err());
    }

    #[tokio::test]
    async fn unknown_wire_format_fails_start() {
        let mut config = CommConfig::default();
        config.protocol.wire_format = "json".to_string();
        let dispatcher = Dispatcher::new(
            config,
            session_factory(|_| Ok(HandlerSession::new())),
            MessageFactory::with_raw_fallback(),
        )
        .unwrap();
        assert!(matches!(
            dispatcher.start(),
            Err(AppError::Misconfiguration(_))
        ));
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplex_echo_and_graceful_stop() {
        let dispatcher = echo_dispatcher();
        let connected = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(Mutex::new(Vec::new()));
        {
            let connected = connected.clone();
            dispatcher.on_connected(move |_| {
                connected.fetch_add(1, Ordering::SeqCst);
            });
            let disconnected = disconnected.clone();
            dispatcher.on_disconnected(move |e| disconnected.lock().push(e.reason.clone()));
        }
        dispatcher.start().unwrap();

        let (ours, mut theirs) = tokio::io::duplex(4096);
        let commid = dispatcher.attach(ours, None).unwrap();
        assert_eq!(dispatcher.connections(), vec![commid]);

        let ping = RawMessage::new("ping").with_id(MessageId::new(9).unwrap());
        theirs
            .write_all(&BinaryCodec.encode(&ping, ping.header()).unwrap())
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(2), theirs.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let pong = BinaryCodec
            .decode(&buf[..n], &MessageFactory::with_raw_fallback())
            .unwrap();
        assert_eq!(pong.name(), "pong");
        assert_eq!(pong.rid(), MessageId::new(9));

        assert!(dispatcher.stop(Duration::from_secs(2)).await.unwrap());
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(*disconnected.lock(), vec![DisconnectReason::Shutdown]);
        assert_eq!(dispatcher.connections_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_one_closes_locally() {
        let dispatcher = echo_dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.on_disconnected(move |e| {
            let _ = tx.send(e.clone());
        });
        dispatcher.start().unwrap();

        let (ours, mut theirs) = tokio::io::duplex(64);
        let commid = dispatcher.attach(ours, None).unwrap();
        dispatcher.disconnect_one(commid).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.commid, commid);
        assert_eq!(event.reason, DisconnectReason::LocalClose);

        // the peer sees end of stream
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), theirs.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(matches!(
            dispatcher.disconnect_one(commid),
            Err(AppError::UnknownCommunicator(_))
        ));
        dispatcher.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn after_all_processed_runs_each_iteration() {
        let dispatcher = echo_dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.set_after_all_processed(move |d| {
            let _ = tx.send(d.connections_count());
        });
        dispatcher.start().unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(0));
        dispatcher.clear_after_all_processed();
        dispatcher.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_stop_waits_for_abandoned_loop() {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let factory = session_factory(move |_| {
            let started_tx = started_tx.clone();
            Ok(HandlerSession::new().on("slow", move |_ctx, _msg| {
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(400));
                Ok(())
            }))
        });
        let dispatcher = Dispatcher::new(
            CommConfig::default(),
            factory,
            MessageFactory::with_raw_fallback(),
        )
        .unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        {
            let ticks = ticks.clone();
            dispatcher.set_after_all_processed(move |_| {
                ticks.fetch_add(1, Ordering::SeqCst);
            });
        }
        dispatcher.start().unwrap();

        let (ours, mut theirs) = tokio::io::duplex(4096);
        dispatcher.attach(ours, None).unwrap();
        let slow = RawMessage::new("slow");
        theirs
            .write_all(&BinaryCodec.encode(&slow, slow.header()).unwrap())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), started_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(!dispatcher.stop(Duration::from_millis(50)).await.unwrap());
        assert_eq!(dispatcher.state(), DispatcherState::Stopping);
        assert_eq!(dispatcher.connections_count(), 0);
        assert!(matches!(
            dispatcher.start(),
            Err(AppError::IllegalStateError(_))
        ));
        let ticks_at_stop = ticks.load(Ordering::SeqCst);

        tokio::time::timeout(Duration::from_secs(2), async {
            while dispatcher.state() != DispatcherState::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), ticks_at_stop);

        dispatcher.clear_after_all_processed();
        dispatcher.start().unwrap();
        assert!(dispatcher.stop(Duration::from_secs(1)).await.unwrap());
    }
}
