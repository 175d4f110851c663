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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::{OutgoingMessage, OutgoingQueue, SharedBuffer};
use crate::protocol::{CommId, MessageId};
use crate::{AppError, AppResult};

/// Why the byte channel of a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    PeerClosed,
    Io(String),
}

/// A frame the writer task has put on the wire.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub id: Option<MessageId>,
    pub name: String,
}

#[derive(Debug)]
struct WriteRequest {
    id: Option<MessageId>,
    name: String,
    frame: Bytes,
}

/// State of one connection shared between its reader and writer tasks, the
/// dispatch loop and API callers on any thread.
///
/// Only the dispatch loop decides the connection's fate; everybody else records
/// facts here and kicks the loop.
#[derive(Debug)]
pub struct CommLink {
    commid: CommId,
    peer: Option<SocketAddr>,
    incoming: SharedBuffer,
    outgoing: OutgoingQueue,
    sent: Mutex<Vec<SentRecord>>,
    channel_error: Mutex<Option<ChannelError>>,
    close_requested: AtomicBool,
    closed: AtomicBool,
    next_message_id: AtomicU64,
    in_flight: AtomicUsize,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
    tasks: Mutex<Vec<AbortHandle>>,
    kick: Arc<Notify>,
}

impl CommLink {
    /// Splits `stream` and starts its reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S>(
        commid: CommId,
        stream: S,
        peer: Option<SocketAddr>,
        read_buffer_size: usize,
        kick: Arc<Notify>,
    ) -> Arc<CommLink>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let link = Arc::new(CommLink {
            commid,
            peer,
            incoming: SharedBuffer::new(),
            outgoing: OutgoingQueue::new(),
            sent: Mutex::new(Vec::new()),
            channel_error: Mutex::new(None),
            close_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_message_id: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            writer_tx: Mutex::new(Some(writer_tx)),
            tasks: Mutex::new(Vec::with_capacity(2)),
            kick,
        });

        let read_task = tokio::spawn(read_loop(link.clone(), reader, read_buffer_size));
        let write_task = tokio::spawn(write_loop(link.clone(), writer, writer_rx));
        {
            let mut tasks = link.tasks.lock();
            tasks.push(read_task.abort_handle());
            tasks.push(write_task.abort_handle());
        }
        debug!("communicator {} attached, peer: {:?}", commid, peer);
        link
    }

    pub fn commid(&self) -> CommId {
        self.commid
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn incoming(&self) -> &SharedBuffer {
        &self.incoming
    }

    pub fn outgoing(&self) -> &OutgoingQueue {
        &self.outgoing
    }

    /// Next engine managed message id, never zero.
    pub fn next_message_id(&self) -> MessageId {
        loop {
            let value = self
                .next_message_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if let Some(id) = MessageId::new(value) {
                return id;
            }
        }
    }

    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Hands an encoded message to the writer task.
    pub fn submit(&self, message: OutgoingMessage) -> AppResult<()> {
        let guard = self.writer_tx.lock();
        let Some(writer_tx) = guard.as_ref() else {
            return Err(AppError::ChannelSendError(format!(
                "writer of communicator {} is gone",
                self.commid
            )));
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let request = WriteRequest {
            id: message.id,
            name: message.name,
            frame: message.frame,
        };
        writer_tx.send(request).map_err(|e| {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            AppError::ChannelSendError(e.to_string())
        })
    }

    pub fn take_sent(&self) -> Vec<SentRecord> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Gives back sent records a handler did not get to.
    pub fn restore_sent(&self, mut remainder: Vec<SentRecord>) {
        if remainder.is_empty() {
            return;
        }
        let mut sent = self.sent.lock();
        remainder.append(&mut sent);
        *sent = remainder;
    }

    pub fn has_sent(&self) -> bool {
        !self.sent.lock().is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn channel_error(&self) -> Option<ChannelError> {
        self.channel_error.lock().clone()
    }

    fn report(&self, error: ChannelError) {
        {
            let mut slot = self.channel_error.lock();
            // the first failure wins, a write error after EOF says nothing new
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.kick();
    }

    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
        self.kick();
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops reading and lets the writer flush what it already holds.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(read_task) = self.tasks.lock().first() {
            read_task.abort();
        }
        self.writer_tx.lock().take();
        self.outgoing.clear();
        debug!("communicator {} closed", self.commid);
    }

    /// Tears down both I/O tasks without waiting for pending writes.
    pub fn abort(&self) {
        self.close_requested.store(true, Ordering::Release);
        self.closed.store(true, Ordering::Release);
        self.writer_tx.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.outgoing.clear();
    }
}

async fn read_loop<R>(link: Arc<CommLink>, mut reader: R, buffer_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(buffer_size);
    loop {
        buffer.clear();
        buffer.reserve(buffer_size);
        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                debug!("communicator {} closed by peer", link.commid);
                link.report(ChannelError::PeerClosed);
                break;
            }
            Ok(n) => {
                trace!("communicator {} read {} bytes", link.commid, n);
                link.incoming.append(&buffer[..n]);
                link.kick();
            }
            Err(e) => {
                warn!("communicator {} read error: {}", link.commid, e);
                link.report(ChannelError::Io(e.to_string()));
                break;
            }
        }
    }
}

async fn write_loop<W>(
    link: Arc<CommLink>,
    writer: W,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    while let Some(request) = rx.recv().await {
        let result = async {
            writer.write_all(&request.frame).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => {
                link.sent.lock().push(SentRecord {
                    id: request.id,
                    name: request.name,
                });
                link.in_flight.fetch_sub(1, Ordering::AcqRel);
                link.kick();
            }
            Err(e) => {
                link.in_flight.fetch_sub(1, Ordering::AcqRel);
                warn!("communicator {} write error: {}", link.commid, e);
                link.report(ChannelError::Io(e.to_string()));
                // whatever is still queued will never reach the peer
                while rx.try_recv().is_ok() {
                    link.in_flight.fetch_sub(1, Ordering::AcqRel);
                }
                return;
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("communicator {} shutdown write half: {}", link.commid, e);
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::time::Duration;

    use super::*;

    fn outgoing(id: u64, bytes: &'static [u8]) -> OutgoingMessage {
        OutgoingMessage {
            id: MessageId::new(id),
            name: "test".to_string(),
            priority: NonZeroU32::MIN,
            frame: Bytes::from_static(bytes),
        }
    }

    #[tokio::test]
    async fn message_ids_start_at_one() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let link = CommLink::spawn(1, ours, None, 64, Arc::new(Notify::new()));
        assert_eq!(link.next_message_id().get(), 1);
        assert_eq!(link.next_message_id().get(), 2);
        link.abort();
    }

    #[tokio::test]
    async fn reader_fills_shared_buffer_and_reports_eof() {
        let kick = Arc::new(Notify::new());
        let (ours, mut theirs) = tokio::io::duplex(64);
        let link = CommLink::spawn(7, ours, None, 64, kick.clone());

        theirs.write_all(b"hello").await.unwrap();
        drop(theirs);

        tokio::time::timeout(Duration::from_secs(1), async {
            while link.channel_error().is_none() {
                kick.notified().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(link.incoming().take_and_clear().as_ref(), b"hello");
        assert_eq!(link.channel_error(), Some(ChannelError::PeerClosed));
    }

    #[tokio::test]
    async fn writer_records_sent_frames() {
        let kick = Arc::new(Notify::new());
        let (ours, mut theirs) = tokio::io::duplex(64);
        let link = CommLink::spawn(3, ours, None, 64, kick.clone());

        link.submit(outgoing(1, b"ab\xff")).unwrap();
        link.submit(outgoing(2, b"cd\xff")).unwrap();

        let mut wire = [0u8; 6];
        theirs.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire, b"ab\xffcd\xff");

        tokio::time::timeout(Duration::from_secs(1), async {
            while link.in_flight() > 0 {
                kick.notified().await;
            }
        })
        .await
        .unwrap();
        let sent: Vec<u64> = link
            .take_sent()
            .into_iter()
            .filter_map(|record| record.id.map(MessageId::get))
            .collect();
        assert_eq!(sent, vec![1, 2]);
    }

    #[tokio::test]
    async fn submit_after_close_fails() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let link = CommLink::spawn(4, ours, None, 64, Arc::new(Notify::new()));
        link.close();
        assert!(link.is_closed());
        assert!(link.submit(outgoing(1, b"\xff")).is_err());
        assert_eq!(link.in_flight(), 0);
    }
}
