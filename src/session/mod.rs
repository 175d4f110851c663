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

//! Per-connection application logic.
//!
//! A [`Session`] is created by the dispatcher's [`SessionFactory`] when a
//! connection is attached and lives exactly as long as that connection. All of
//! its callbacks run on the dispatch loop, one at a time, so a session needs no
//! locking of its own.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error};

pub use handler_session::HandlerSession;

use crate::network::{CommLink, ProtocolContext, SendReceipt};
use crate::protocol::{CommId, Message, MessageId};
use crate::{AppError, AppResult};

mod handler_session;

pub type HandlerResult = AppResult<()>;

/// What a session factory learns about a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub commid: CommId,
    pub peer: Option<SocketAddr>,
}

pub type SessionFactory =
    Arc<dyn Fn(&ConnectionInfo) -> AppResult<Box<dyn Session>> + Send + Sync>;

/// Wraps a closure as a [`SessionFactory`].
pub fn session_factory<F, S>(make: F) -> SessionFactory
where
    F: Fn(&ConnectionInfo) -> AppResult<S> + Send + Sync + 'static,
    S: Session + 'static,
{
    Arc::new(move |info| Ok(Box::new(make(info)?) as Box<dyn Session>))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    PeerClosed,
    /// Closed through the disconnect API or by a handler.
    LocalClose,
    Shutdown,
    Io(String),
    Decode(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "closed by peer"),
            DisconnectReason::LocalClose => write!(f, "closed locally"),
            DisconnectReason::Shutdown => write!(f, "dispatcher shutdown"),
            DisconnectReason::Io(e) => write!(f, "i/o error: {}", e),
            DisconnectReason::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

/// Handle a session callback gets on its own connection.
pub struct SessionContext<'a> {
    link: &'a CommLink,
    protocol: &'a ProtocolContext,
    reply: Option<Box<dyn Message>>,
}

impl<'a> SessionContext<'a> {
    pub(crate) fn new(link: &'a CommLink, protocol: &'a ProtocolContext) -> Self {
        SessionContext {
            link,
            protocol,
            reply: None,
        }
    }

    pub fn commid(&self) -> CommId {
        self.link.commid()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.link.peer()
    }

    /// Queues `message` on this connection.
    pub fn send(&mut self, message: &dyn Message) -> AppResult<SendReceipt> {
        self.protocol.enqueue(self.link, message)
    }

    /// Answers the message being dispatched.
    ///
    /// Sent once the handler returns successfully, with its `rid` set to the id
    /// of the message being answered. A later call replaces an earlier one.
    pub fn reply<M: Message>(&mut self, message: M) {
        self.reply = Some(Box::new(message));
    }

    /// Closes this connection after the current callback.
    pub fn disconnect(&mut self) {
        self.link.request_close();
    }

    pub(crate) fn take_reply(&mut self) -> Option<Box<dyn Message>> {
        self.reply.take()
    }
}

impl fmt::Debug for SessionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("commid", &self.commid())
            .field("peer", &self.peer())
            .field("reply", &self.reply.as_ref().map(|m| m.name().to_string()))
            .finish()
    }
}

/// Application side of one connection.
///
/// Only `handles` and `dispatch` are required. A callback returning an error
/// is reported through `error` and the connection stays open.
pub trait Session: Send {
    /// Whether `dispatch` takes messages of type `name`.
    fn handles(&self, name: &str) -> bool;

    fn dispatch(&mut self, ctx: &mut SessionContext<'_>, message: &dyn Message) -> HandlerResult;

    /// Messages no handler takes.
    fn unhandled(&mut self, ctx: &mut SessionContext<'_>, message: &dyn Message) -> HandlerResult {
        debug!(
            "communicator {} has no handler for {}",
            ctx.commid(),
            message.name()
        );
        Ok(())
    }

    fn connected(&mut self, _ctx: &mut SessionContext<'_>) -> HandlerResult {
        Ok(())
    }

    /// Last callback of the session. Sending from here fails.
    fn disconnected(&mut self, _ctx: &mut SessionContext<'_>, _reason: &DisconnectReason) {}

    /// A frame reached the peer's socket. `id` is absent for messages sent
    /// without one.
    fn message_sent(
        &mut self,
        _ctx: &mut SessionContext<'_>,
        _id: Option<MessageId>,
    ) -> HandlerResult {
        Ok(())
    }

    /// No reply arrived in time for the message `id` of type `name`.
    fn message_timeout(
        &mut self,
        _ctx: &mut SessionContext<'_>,
        _id: MessageId,
        _name: &str,
    ) -> HandlerResult {
        Ok(())
    }

    fn error(&mut self, ctx: &mut SessionContext<'_>, error: &AppError) {
        error!("communicator {} error: {}", ctx.commid(), error);
    }

    /// Runs at the end of each pass of the dispatch loop over this connection.
    fn after_processed(&mut self, _ctx: &mut SessionContext<'_>) -> HandlerResult {
        Ok(())
    }
}
