use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use msgcomm::service::setup_tracing;
use msgcomm::{
    session_factory, AppError, AppResult, Client, CommConfig, HandlerSession, MessageFactory,
    MessageInfo, RawMessage, Server,
};
use tokio::runtime;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for rolled log files
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser)]
pub enum Command {
    /// Run an echo server, the default
    Serve,
    PrintConfig,
    /// Send pings to an echo server and report round trips
    Ping {
        #[arg(short, long)]
        addr: SocketAddr,
        #[arg(short = 'n', long, default_value_t = 3)]
        count: usize,
    },
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = if config_path.exists() {
        CommConfig::load(&config_path)?
    } else {
        CommConfig::default()
    };

    match commandline.command.unwrap_or(Command::Serve) {
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
        Command::Serve => {
            let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
            let _guard = setup_tracing(&commandline.log_dir)?;
            rt.block_on(serve(config))
        }
        Command::Ping { addr, count } => {
            let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
            let _guard = setup_tracing(&commandline.log_dir)?;
            rt.block_on(ping(config, addr, count))
        }
    }
}

/// Answers `ping` with `pong` and every other message with a copy of itself.
async fn serve(config: CommConfig) -> AppResult<()> {
    let factory = session_factory(|info| {
        info!("echo session for {:?}", info.peer);
        Ok(HandlerSession::new()
            .on("ping", |ctx, _message| {
                ctx.reply(RawMessage::new("pong"));
                Ok(())
            })
            .on_unhandled(|ctx, message| {
                let payload = message
                    .downcast_ref::<RawMessage>()
                    .map(|raw| raw.payload().clone())
                    .unwrap_or_default();
                ctx.reply(RawMessage::with_payload(message.name(), payload));
                Ok(())
            }))
    });
    let mut server = Server::new(config, factory, MessageFactory::with_raw_fallback())?;
    let addr = server.start().await?;
    info!("echo server listening on {}", addr);
    let graceful = server.run_until_ctrl_c().await?;
    info!("echo server stopped, graceful: {}", graceful);
    Ok(())
}

async fn ping(mut config: CommConfig, addr: SocketAddr, count: usize) -> AppResult<()> {
    // pongs only reach the session when a request is waiting for them
    if !config.messages.iter().any(|info| info.name == "ping") {
        config = config.with_message(
            MessageInfo::new("ping")
                .need_reply(Some(PING_TIMEOUT))
                .answers(["pong"]),
        );
    }
    let (tx, mut rx) = mpsc::unbounded_channel();
    let factory = session_factory(move |_| {
        let tx = tx.clone();
        Ok(HandlerSession::new().on("pong", move |_ctx, message| {
            tx.send(message.rid())
                .map_err(|e| AppError::ChannelSendError(e.to_string()))
        }))
    });
    let stop_wait = config.stop_wait();
    let client = Client::new(config, factory, MessageFactory::with_raw_fallback())?;
    client.start()?;
    let commid = client.connect(addr).await?;

    for seq in 0..count {
        let started = Instant::now();
        let receipt = client
            .dispatcher()
            .send_one(commid, &RawMessage::with_payload("ping", seq.to_string()))?;
        match tokio::time::timeout(PING_TIMEOUT, rx.recv()).await {
            Ok(Some(rid)) if rid == receipt.id => {
                println!("pong from {}: seq={} time={:?}", addr, seq, started.elapsed())
            }
            Ok(Some(rid)) => warn!("unexpected reply to {:?}", rid),
            Ok(None) => break,
            Err(_) => println!("ping seq={} timed out", seq),
        }
    }
    client.stop(stop_wait).await?;
    Ok(())
}
