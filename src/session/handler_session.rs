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

use super::{DisconnectReason, HandlerResult, Session, SessionContext};
use crate::protocol::{Message, MessageId};
use crate::AppError;

type MessageHandler = Box<dyn FnMut(&mut SessionContext<'_>, &dyn Message) -> HandlerResult + Send>;
type EventHandler = Box<dyn FnMut(&mut SessionContext<'_>) -> HandlerResult + Send>;
type DisconnectHandler = Box<dyn FnMut(&mut SessionContext<'_>, &DisconnectReason) + Send>;
type SentHandler =
    Box<dyn FnMut(&mut SessionContext<'_>, Option<MessageId>) -> HandlerResult + Send>;
type TimeoutHandler =
    Box<dyn FnMut(&mut SessionContext<'_>, MessageId, &str) -> HandlerResult + Send>;
type ErrorHandler = Box<dyn FnMut(&mut SessionContext<'_>, &AppError) + Send>;

/// A [`Session`] assembled from closures, one per message type plus optional
/// lifecycle callbacks.
///
/// ```ignore
/// let session = HandlerSession::new()
///     .on("ping", |ctx, _msg| {
///         ctx.reply(RawMessage::new("pong"));
///         Ok(())
///     })
///     .on_disconnected(|ctx, reason| info!("{} gone: {}", ctx.commid(), reason));
/// ```
#[derive(Default)]
pub struct HandlerSession {
    handlers: HashMap<String, MessageHandler>,
    unhandled: Option<MessageHandler>,
    connected: Option<EventHandler>,
    after_processed: Option<EventHandler>,
    disconnected: Option<DisconnectHandler>,
    sent: Option<SentHandler>,
    timeout: Option<TimeoutHandler>,
    error: Option<ErrorHandler>,
}

impl HandlerSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles messages of type `name`, replacing an earlier handler.
    pub fn on<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(&mut SessionContext<'_>, &dyn Message) -> HandlerResult + Send + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    pub fn on_unhandled<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut SessionContext<'_>, &dyn Message) -> HandlerResult + Send + 'static,
    {
        self.unhandled = Some(Box::new(handler));
        self
    }

    pub fn on_connected<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut SessionContext<'_>) -> HandlerResult + Send + 'static,
    {
        self.connected = Some(Box::new(handler));
        self
    }

    pub fn on_after_processed<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut SessionContext<'_>) -> HandlerResult + Send + 'static,
    {
        self.after_processed = Some(Box::new(handler));
        self
    }

    pub fn on_disconnected<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut SessionContext<'_>, &DisconnectReason) + Send + 'static,
    {
        self.disconnected = Some(Box::new(handler));
        self
    }

    pub fn on_sent<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut SessionContext<'_>, Option<MessageId>) -> HandlerResult + Send + 'static,
    {
        self.sent = Some(Box::new(handler));
        self
    }

    pub fn on_timeout<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut SessionContext<'_>, MessageId, &str) -> HandlerResult + Send + 'static,
    {
        self.timeout = Some(Box::new(handler));
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut SessionContext<'_>, &AppError) + Send + 'static,
    {
        self.error = Some(Box::new(handler));
        self
    }
}

impl fmt::Debug for HandlerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSession")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Session for HandlerSession {
    fn handles(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    fn dispatch(&mut self, ctx: &mut SessionContext<'_>, message: &dyn Message) -> HandlerResult {
        match self.handlers.get_mut(message.name()) {
            Some(handler) => handler(ctx, message),
            None => self.unhandled(ctx, message),
        }
    }

    fn unhandled(&mut self, ctx: &mut SessionContext<'_>, message: &dyn Message) -> HandlerResult {
        match self.unhandled.as_mut() {
            Some(handler) => handler(ctx, message),
            None => Ok(()),
        }
    }

    fn connected(&mut self, ctx: &mut SessionContext<'_>) -> HandlerResult {
        match self.connected.as_mut() {
            Some(handler) => handler(ctx),
            None => Ok(()),
        }
    }

    fn disconnected(&mut self, ctx: &mut SessionContext<'_>, reason: &DisconnectReason) {
        if let Some(handler) = self.disconnected.as_mut() {
            handler(ctx, reason);
        }
    }

    fn message_sent(
        &mut self,
        ctx: &mut SessionContext<'_>,
        id: Option<MessageId>,
    ) -> HandlerResult {
        match self.sent.as_mut() {
            Some(handler) => handler(ctx, id),
            None => Ok(()),
        }
    }

    fn message_timeout(
        &mut self,
        ctx: &mut SessionContext<'_>,
        id: MessageId,
        name: &str,
    ) -> HandlerResult {
        match self.timeout.as_mut() {
            Some(handler) => handler(ctx, id, name),
            None => Ok(()),
        }
    }

    fn error(&mut self, ctx: &mut SessionContext<'_>, error: &AppError) {
        match self.error.as_mut() {
            Some(handler) => handler(ctx, error),
            None => tracing::error!("communicator {} error: {}", ctx.commid(), error),
        }
    }

    fn after_processed(&mut self, ctx: &mut SessionContext<'_>) -> HandlerResult {
        match self.after_processed.as_mut() {
            Some(handler) => handler(ctx),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::network::{CommLink, ProtocolContext, DEFAULT_MAX_FRAME_SIZE};
    use crate::protocol::{
        Codec, MessageCatalog, MessageFactory, RawMessage, ReplyTimeout, MAX_PRIORITY,
    };

    fn protocol() -> ProtocolContext {
        ProtocolContext {
            catalog: MessageCatalog::build(&[], ReplyTimeout::Never, NonZeroU32::MIN, MAX_PRIORITY)
                .unwrap(),
            codec: Codec::binary(),
            factory: Arc::new(MessageFactory::with_raw_fallback()),
            engine_managed_ids: true,
            timeouts_enabled: true,
            close_on_decode_error: true,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_priority: MAX_PRIORITY,
            incoming_quantum: 100,
            outgoing_quantum: 100,
            idle_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn routes_by_name_and_falls_back() {
        let protocol = protocol();
        let (ours, _theirs) = tokio::io::duplex(64);
        let link = CommLink::spawn(1, ours, None, 64, Arc::new(Notify::new()));
        let mut ctx = SessionContext::new(&link, &protocol);

        let mut session = HandlerSession::new()
            .on("ping", |ctx, _msg| {
                ctx.reply(RawMessage::new("pong"));
                Ok(())
            })
            .on_unhandled(|_ctx, msg| {
                Err(AppError::handler(format!("no handler: {}", msg.name())))
            });

        assert!(session.handles("ping"));
        assert!(!session.handles("other"));

        session.dispatch(&mut ctx, &RawMessage::new("ping")).unwrap();
        assert_eq!(ctx.take_reply().map(|m| m.name().to_string()).as_deref(), Some("pong"));

        let err = session.dispatch(&mut ctx, &RawMessage::new("other")).unwrap_err();
        assert!(matches!(err, AppError::Handler(_)));
        link.abort();
    }

    #[tokio::test]
    async fn disconnect_from_handler_marks_link() {
        let protocol = protocol();
        let (ours, _theirs) = tokio::io::duplex(64);
        let link = CommLink::spawn(2, ours, None, 64, Arc::new(Notify::new()));
        let mut ctx = SessionContext::new(&link, &protocol);

        let mut session = HandlerSession::new().on("bye", |ctx, _msg| {
            ctx.disconnect();
            Ok(())
        });
        session.dispatch(&mut ctx, &RawMessage::new("bye")).unwrap();
        assert!(link.close_requested());
        link.abort();
    }
}
