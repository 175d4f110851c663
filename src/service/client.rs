use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{CommConfig, Dispatcher};
use crate::protocol::{CommId, MessageFactory};
use crate::session::SessionFactory;
use crate::{AppError, AppResult};

/// Dialing endpoint. Connections it opens run on its own dispatcher, exactly
/// like accepted ones do on a server.
#[derive(Debug)]
pub struct Client {
    dispatcher: Dispatcher,
}

impl Client {
    pub fn new(
        config: CommConfig,
        session_factory: SessionFactory,
        factory: MessageFactory,
    ) -> AppResult<Self> {
        Ok(Client {
            dispatcher: Dispatcher::new(config, session_factory, factory)?,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn start(&self) -> AppResult<()> {
        self.dispatcher.start()
    }

    /// Dials `addr` once. A failure is returned and also delivered to the
    /// connect-error subscribers on the next tick.
    pub async fn connect(&self, addr: SocketAddr) -> AppResult<CommId> {
        if !self.dispatcher.is_running() {
            return Err(AppError::IllegalStateError(
                "client is not started".to_string(),
            ));
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("set_nodelay failed for {}: {}", addr, e);
                }
                let commid = self.dispatcher.attach(stream, Some(addr))?;
                debug!("connected to {} as communicator {}", addr, commid);
                Ok(commid)
            }
            Err(e) => {
                let reason = e.to_string();
                self.dispatcher.report_connect_error(addr, reason.clone());
                Err(AppError::Connect { addr, reason })
            }
        }
    }

    pub async fn stop(&self, wait: Duration) -> AppResult<bool> {
        self.dispatcher.stop(wait).await
    }
}
