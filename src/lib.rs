pub mod network;
pub mod protocol;
pub mod service;
pub mod session;
pub mod utils;

pub use network::{BinaryFrameCodec, SendReceipt};
pub use protocol::{
    BinaryCodec, Codec, CodecRegistry, CommId, Message, MessageFactory, MessageHeader, MessageId,
    MessageInfo, Priority, RawMessage, ReplyTimeout,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Client, CommConfig,
    ConnectErrorEvent, ConnectedEvent, DisconnectedEvent, Dispatcher, DispatcherState, Server,
    SubscriptionId,
};
pub use session::{
    session_factory, ConnectionInfo, DisconnectReason, HandlerResult, HandlerSession, Session,
    SessionContext, SessionFactory,
};
