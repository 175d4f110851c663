pub use app_error::{AppError, AppResult};
pub use client::Client;
pub use config::{CommConfig, DispatcherConfig, NetworkConfig, ProtocolConfig};
pub use dispatcher::{Dispatcher, DispatcherState};
pub use notifications::{ConnectErrorEvent, ConnectedEvent, DisconnectedEvent, SubscriptionId};
pub use server::Server;
pub use shutdown::Shutdown;
pub use timeout_registry::{ExpiredReply, TimeoutRegistry};
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod client;
mod config;
mod dispatcher;
mod notifications;
mod server;
mod shutdown;
mod timeout_registry;
mod tracing_config;
