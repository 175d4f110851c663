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

//! Per-connection protocol state machine.
//!
//! A communicator is owned by the dispatch loop. Each tick runs, in order:
//! sent confirmations, incoming decode, outgoing hand-off, channel error check
//! and the session's `after_processed`. A handler error skips the rest of the
//! tick for that connection; whatever was not attempted stays queued.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::{ChannelError, CommLink, ProtocolContext};
use crate::protocol::{Message, MessageId};
use crate::service::TimeoutRegistry;
use crate::session::{ConnectionInfo, DisconnectReason, Session, SessionContext, SessionFactory};
use crate::{AppError, AppResult};

/// Lifecycle of a communicator.
///
/// There is no connecting state here: a connection only becomes a
/// communicator once its socket is attached. `Draining` is the closing
/// phase, entered when the dispatcher stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
    Open,
    /// Finishing its outgoing queue before a dispatcher stop closes it.
    Draining,
    Closed,
}

/// Result of one tick over a communicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Idle,
    /// Work is left for the next tick.
    Busy,
    Close(DisconnectReason),
}

enum Abort {
    Handler(AppError),
    Close(DisconnectReason),
}

type StepResult = Result<bool, Abort>;

pub struct Communicator {
    link: Arc<CommLink>,
    session: Box<dyn Session>,
    state: CommState,
}

impl Communicator {
    /// Creates the session of a freshly attached link and runs its
    /// `connected` callback.
    pub fn open(
        link: Arc<CommLink>,
        factory: &SessionFactory,
        protocol: &ProtocolContext,
    ) -> AppResult<Communicator> {
        let info = ConnectionInfo {
            commid: link.commid(),
            peer: link.peer(),
        };
        let session = factory(&info).map_err(|e| AppError::SessionCreation(e.to_string()))?;
        let mut communicator = Communicator {
            link,
            session,
            state: CommState::Open,
        };
        let mut ctx = SessionContext::new(&communicator.link, protocol);
        if let Err(e) = communicator.session.connected(&mut ctx) {
            communicator.session.error(&mut ctx, &e);
        }
        Ok(communicator)
    }

    pub fn link(&self) -> &Arc<CommLink> {
        &self.link
    }

    pub fn state(&self) -> CommState {
        self.state
    }

    pub fn begin_drain(&mut self) {
        if self.state == CommState::Open {
            self.state = CommState::Draining;
        }
    }

    /// Nothing queued, nothing on its way to the socket, no confirmations to
    /// report.
    pub fn is_drained(&self) -> bool {
        self.link.outgoing().is_empty() && self.link.in_flight() == 0 && !self.link.has_sent()
    }

    pub fn process(&mut self, protocol: &ProtocolContext, registry: &TimeoutRegistry) -> Progress {
        if self.state == CommState::Closed {
            return Progress::Idle;
        }
        if self.link.close_requested() {
            return Progress::Close(DisconnectReason::LocalClose);
        }
        match self.run_steps(protocol, registry) {
            Ok(true) => Progress::Busy,
            Ok(false) => Progress::Idle,
            Err(Abort::Close(reason)) => Progress::Close(reason),
            Err(Abort::Handler(e)) => {
                self.report_error(protocol, &e);
                if self.has_pending_work(protocol) {
                    Progress::Busy
                } else {
                    Progress::Idle
                }
            }
        }
    }

    fn has_pending_work(&self, protocol: &ProtocolContext) -> bool {
        !self.link.outgoing().is_empty()
            || self.link.has_sent()
            || self
                .link
                .incoming()
                .peek(|bytes| protocol.codec.decoder.find_frame(bytes).is_some())
    }

    /// A close requested by a handler or another thread ends the tick before
    /// the next callback.
    fn check_close(&self) -> Result<(), Abort> {
        if self.link.close_requested() {
            return Err(Abort::Close(DisconnectReason::LocalClose));
        }
        Ok(())
    }

    fn run_steps(&mut self, protocol: &ProtocolContext, registry: &TimeoutRegistry) -> StepResult {
        let mut busy = self.process_sent(protocol)?;
        self.check_close()?;
        let more_incoming = self.process_arrived(protocol, registry)?;
        busy |= more_incoming;
        self.check_close()?;
        busy |= self.process_write(protocol, registry)?;

        if let Some(channel_error) = self.link.channel_error() {
            // frames that arrived before EOF still get their turn
            if !more_incoming {
                return Err(Abort::Close(match channel_error {
                    ChannelError::PeerClosed => DisconnectReason::PeerClosed,
                    ChannelError::Io(e) => DisconnectReason::Io(e),
                }));
            }
        }
        self.check_close()?;

        let mut ctx = SessionContext::new(&self.link, protocol);
        self.session
            .after_processed(&mut ctx)
            .map_err(Abort::Handler)?;
        Ok(busy || !self.link.outgoing().is_empty())
    }

    fn process_sent(&mut self, protocol: &ProtocolContext) -> StepResult {
        let mut records = self.link.take_sent().into_iter();
        let mut ctx = SessionContext::new(&self.link, protocol);
        while let Some(record) = records.next() {
            if self.link.close_requested() {
                return Err(Abort::Close(DisconnectReason::LocalClose));
            }
            trace!(
                "communicator {} sent {} {:?}",
                self.link.commid(),
                record.name,
                record.id
            );
            if let Err(e) = self.session.message_sent(&mut ctx, record.id) {
                self.link.restore_sent(records.collect());
                return Err(Abort::Handler(e));
            }
        }
        Ok(false)
    }

    fn process_arrived(
        &mut self,
        protocol: &ProtocolContext,
        registry: &TimeoutRegistry,
    ) -> StepResult {
        if self.link.incoming().is_empty() {
            return Ok(false);
        }
        let mut buffer = self.link.incoming().take_and_clear();
        let result = self.decode_frames(&mut buffer, protocol, registry);
        self.link.incoming().restore(buffer);
        result
    }

    fn decode_frames(
        &mut self,
        buffer: &mut BytesMut,
        protocol: &ProtocolContext,
        registry: &TimeoutRegistry,
    ) -> StepResult {
        let decoder = protocol.codec.decoder.clone();
        for _ in 0..protocol.incoming_quantum {
            self.check_close()?;
            let Some(bounds) = decoder.find_frame(buffer) else {
                if buffer.len() > protocol.max_frame_size {
                    let e = AppError::FrameDecode(format!(
                        "{} bytes buffered without a frame end",
                        buffer.len()
                    ));
                    warn!("communicator {} gave up on its input: {}", self.link.commid(), e);
                    self.report_error(protocol, &e);
                    return Err(Abort::Close(DisconnectReason::Decode(e.to_string())));
                }
                return Ok(false);
            };
            let frame = buffer.split_to(bounds.end);
            match decoder.decode(&frame[bounds.start..], &protocol.factory) {
                Ok(message) => self.deliver(message, protocol, registry)?,
                Err(e) if e.is_decode_error() => {
                    warn!(
                        "communicator {} dropped a malformed frame: {}",
                        self.link.commid(),
                        e
                    );
                    self.report_error(protocol, &e);
                    if protocol.close_on_decode_error {
                        return Err(Abort::Close(DisconnectReason::Decode(e.to_string())));
                    }
                }
                Err(e) => {
                    debug!(
                        "communicator {} could not build message: {}",
                        self.link.commid(),
                        e
                    );
                    self.report_error(protocol, &e);
                }
            }
        }
        Ok(decoder.find_frame(buffer).is_some())
    }

    fn deliver(
        &mut self,
        message: Box<dyn Message>,
        protocol: &ProtocolContext,
        registry: &TimeoutRegistry,
    ) -> Result<(), Abort> {
        let commid = self.link.commid();
        if let (Some(rid), true) = (message.rid(), protocol.timeouts_enabled) {
            let Some(request) = registry.request_name(commid, rid) else {
                warn!(
                    "communicator {} dropped {} answering {}, no request is waiting for it",
                    commid,
                    message.name(),
                    rid
                );
                return Ok(());
            };
            if !protocol.catalog.is_allowed_reply(&request, message.name()) {
                let e = AppError::DisallowedReply(format!(
                    "{} is not an answer to {} {}",
                    message.name(),
                    request,
                    rid
                ));
                self.report_error(protocol, &e);
                return Ok(());
            }
            registry.fulfill(commid, rid);
        }

        let mut ctx = SessionContext::new(&self.link, protocol);
        let handled = if self.session.handles(message.name()) {
            self.session.dispatch(&mut ctx, &*message)
        } else {
            self.session.unhandled(&mut ctx, &*message)
        };
        let reply = ctx.take_reply();
        handled.map_err(Abort::Handler)?;

        if let Some(mut reply) = reply {
            reply.header_mut().rid = message.id();
            protocol
                .enqueue(&self.link, &*reply)
                .map_err(Abort::Handler)?;
        }
        Ok(())
    }

    fn process_write(
        &mut self,
        protocol: &ProtocolContext,
        registry: &TimeoutRegistry,
    ) -> StepResult {
        let commid = self.link.commid();
        for _ in 0..protocol.outgoing_quantum {
            let Some(outgoing) = self.link.outgoing().pop() else {
                return Ok(false);
            };
            if protocol.timeouts_enabled && protocol.catalog.need_reply(&outgoing.name) {
                match outgoing.id {
                    Some(id) => registry.register(
                        commid,
                        id,
                        &outgoing.name,
                        protocol.catalog.reply_timeout(&outgoing.name),
                        Instant::now(),
                    ),
                    None => warn!(
                        "communicator {} sends {} without an id, its reply cannot be matched",
                        commid, outgoing.name
                    ),
                }
            }
            if let Err(e) = self.link.submit(outgoing) {
                // the writer is gone and has reported why
                debug!("communicator {} cannot write: {}", commid, e);
                return Ok(false);
            }
        }
        Ok(!self.link.outgoing().is_empty())
    }

    /// Runs the session's timeout callback for the request `id`.
    pub fn fire_timeout(&mut self, protocol: &ProtocolContext, id: MessageId, name: &str) {
        debug!(
            "communicator {} request {} {} timed out",
            self.link.commid(),
            name,
            id
        );
        let mut ctx = SessionContext::new(&self.link, protocol);
        if let Err(e) = self.session.message_timeout(&mut ctx, id, name) {
            self.session.error(&mut ctx, &e);
        }
    }

    fn report_error(&mut self, protocol: &ProtocolContext, e: &AppError) {
        let mut ctx = SessionContext::new(&self.link, protocol);
        self.session.error(&mut ctx, e);
    }

    /// Closes the link and runs the session's last callback.
    pub fn close(&mut self, protocol: &ProtocolContext, reason: &DisconnectReason) {
        if self.state == CommState::Closed {
            return;
        }
        self.state = CommState::Closed;
        self.link.close();
        match reason {
            DisconnectReason::Io(_) | DisconnectReason::Decode(_) => error!(
                "communicator {} closed: {}",
                self.link.commid(),
                reason
            ),
            _ => debug!("communicator {} closed: {}", self.link.commid(), reason),
        }
        let mut ctx = SessionContext::new(&self.link, protocol);
        self.session.disconnected(&mut ctx, reason);
    }
}
