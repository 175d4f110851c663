use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::{CommConfig, Dispatcher, Shutdown};
use crate::protocol::MessageFactory;
use crate::session::SessionFactory;
use crate::{AppError, AppResult};

const DEFAULT_BACKLOG: u32 = 1024;

/// Listening endpoint: every accepted socket becomes a communicator of the
/// server's dispatcher.
#[derive(Debug)]
pub struct Server {
    dispatcher: Dispatcher,
    local_addr: Option<SocketAddr>,
    acceptor: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(
        config: CommConfig,
        session_factory: SessionFactory,
        factory: MessageFactory,
    ) -> AppResult<Self> {
        Ok(Server {
            dispatcher: Dispatcher::new(config, session_factory, factory)?,
            local_addr: None,
            acceptor: None,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The bound address, known once `start` succeeded. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds the listener, starts the dispatcher and spawns the accept loop.
    pub async fn start(&mut self) -> AppResult<SocketAddr> {
        let network = &self.dispatcher.config().network;
        let listen_address = self.dispatcher.config().listen_address()?;
        let listener = match bind(listen_address, network.backlog) {
            Ok(listener) => listener,
            Err(e) => {
                let error_msg = format!(
                    "Failed to bind server to address: {} - Error: {}",
                    listen_address, e
                );
                error!(error_msg);
                return Err(AppError::IllegalStateError(error_msg));
            }
        };
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);

        self.dispatcher.start()?;
        let acceptor = Acceptor {
            listener,
            local_addr,
            dispatcher: self.dispatcher.clone(),
            shutdown: self.dispatcher.subscribe_shutdown(),
        };
        self.acceptor = Some(tokio::spawn(acceptor.run()));
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stops accepting, then stops the dispatcher. See [`Dispatcher::stop`].
    pub async fn stop(&mut self, wait: Duration) -> AppResult<bool> {
        let graceful = self.dispatcher.stop(wait).await?;
        if let Some(acceptor) = self.acceptor.take() {
            if let Err(e) = acceptor.await {
                error!("accept loop ended abnormally: {}", e);
            }
        }
        Ok(graceful)
    }

    /// Serves until ctrl-c, then stops within the configured stop wait.
    pub async fn run_until_ctrl_c(&mut self) -> AppResult<bool> {
        if self.local_addr.is_none() {
            self.start().await?;
        }
        tokio::signal::ctrl_c().await?;
        info!("received ctrl-c, shutting down");
        let wait = self.dispatcher.config().stop_wait();
        self.stop(wait).await
    }
}

fn bind(addr: SocketAddr, backlog: u32) -> AppResult<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let backlog = if backlog == 0 { DEFAULT_BACKLOG } else { backlog };
    Ok(socket.listen(backlog)?)
}

struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Dispatcher,
    shutdown: Shutdown,
}

impl Acceptor {
    #[tracing::instrument(skip(self), fields(addr = %self.local_addr))]
    async fn run(self) {
        let Acceptor {
            listener,
            local_addr,
            dispatcher,
            mut shutdown,
        } = self;
        loop {
            let accepted = tokio::select! {
                res = accept(&listener, local_addr, &dispatcher) => res,
                _ = shutdown.recv() => {
                    debug!("accept loop exit after recv shutdown signal");
                    break;
                }
            };
            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept loop gave up: {}", e);
                    break;
                }
            };
            if let Err(e) = socket.set_nodelay(true) {
                warn!("set_nodelay failed for {}: {}", peer, e);
            }
            match dispatcher.attach(socket, Some(peer)) {
                Ok(commid) => debug!("accepted {} as communicator {}", peer, commid),
                Err(e) => {
                    // only happens once the dispatcher is stopping
                    debug!("dropping connection from {}: {}", peer, e);
                    break;
                }
            }
        }
    }
}

async fn accept(
    listener: &TcpListener,
    local_addr: SocketAddr,
    dispatcher: &Dispatcher,
) -> AppResult<(TcpStream, SocketAddr)> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok(accepted) => return Ok(accepted),
            Err(err) => {
                warn!("accept failed, retry in {}s: {}", backoff, err);
                dispatcher.report_connect_error(local_addr, err.to_string());
                if backoff > 64 {
                    return Err(AppError::DetailedIoError(format!(
                        "accept tcp server error: {}",
                        err
                    )));
                }
            }
        }

        time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
        debug!("tcp server dropped");
    }
}
