use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use msgcomm::{
    session_factory, Client, CommConfig, CommId, DisconnectReason, HandlerSession, Message,
    MessageFactory, MessageInfo, RawMessage, Server, SessionFactory,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(3);

async fn start_server(config: CommConfig, factory: SessionFactory) -> (Server, SocketAddr) {
    let mut server = Server::new(config, factory, MessageFactory::with_raw_fallback()).unwrap();
    let addr = server.start().await.unwrap();
    (server, addr)
}

async fn connect_client(
    config: CommConfig,
    factory: SessionFactory,
    addr: SocketAddr,
) -> (Client, CommId) {
    let client = Client::new(config, factory, MessageFactory::with_raw_fallback()).unwrap();
    client.start().unwrap();
    let commid = client.connect(addr).await.unwrap();
    (client, commid)
}

fn silent() -> SessionFactory {
    session_factory(|_| Ok(HandlerSession::new()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_reaches_server_handler_without_timeout_entry() {
    let config = CommConfig::default().with_message(MessageInfo::new("ping"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (mut server, addr) = start_server(
        config.clone(),
        session_factory(move |_| {
            let tx = tx.clone();
            Ok(HandlerSession::new().on("ping", move |_ctx, message| {
                let _ = tx.send(message.name().to_string());
                Ok(())
            }))
        }),
    )
    .await;
    let (client, commid) = connect_client(config, silent(), addr).await;

    let receipt = client
        .dispatcher()
        .send_one(commid, &RawMessage::new("ping"))
        .unwrap();
    assert!(receipt.queued);
    assert!(receipt.id.is_some());

    let name = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(name, "ping");
    assert_eq!(client.dispatcher().pending_replies(), 0);

    client.stop(WAIT).await.unwrap();
    server.stop(WAIT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unanswered_request_times_out_exactly_once() {
    let (mut server, addr) = start_server(CommConfig::default(), silent()).await;

    let config = CommConfig::default()
        .with_message(MessageInfo::new("request").need_reply(Some(Duration::from_millis(100))));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let factory = session_factory(move |_| {
        let tx = tx.clone();
        Ok(HandlerSession::new().on_timeout(move |_ctx, id, name| {
            let _ = tx.send((id, name.to_string()));
            Ok(())
        }))
    });
    let (client, commid) = connect_client(config, factory, addr).await;

    let receipt = client
        .dispatcher()
        .send_one(commid, &RawMessage::new("request"))
        .unwrap();
    let (id, name) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(Some(id), receipt.id);
    assert_eq!(name, "request");

    sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(client.dispatcher().pending_replies(), 0);

    client.stop(WAIT).await.unwrap();
    server.stop(WAIT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reply_before_deadline_prevents_timeout() {
    let (mut server, addr) = start_server(
        CommConfig::default(),
        session_factory(|_| {
            Ok(HandlerSession::new().on("request", |ctx, _message| {
                ctx.reply(RawMessage::new("answer"));
                Ok(())
            }))
        }),
    )
    .await;

    let config = CommConfig::default().with_message(
        MessageInfo::new("request")
            .need_reply(Some(Duration::from_millis(200)))
            .answers(["answer"]),
    );
    let timeouts = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let factory = {
        let timeouts = timeouts.clone();
        session_factory(move |_| {
            let tx = tx.clone();
            let timeouts = timeouts.clone();
            Ok(HandlerSession::new()
                .on("answer", move |_ctx, message| {
                    let _ = tx.send(message.rid());
                    Ok(())
                })
                .on_timeout(move |_ctx, _id, _name| {
                    timeouts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
        })
    };
    let (client, commid) = connect_client(config, factory, addr).await;

    let receipt = client
        .dispatcher()
        .send_one(commid, &RawMessage::new("request"))
        .unwrap();
    let rid = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(rid, receipt.id);

    sleep(Duration::from_millis(400)).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    assert_eq!(client.dispatcher().pending_replies(), 0);

    client.stop(WAIT).await.unwrap();
    server.stop(WAIT).await.unwrap();
}

fn slow_handler(
    handler_time: Duration,
    started: mpsc::UnboundedSender<()>,
    done: Arc<AtomicBool>,
) -> SessionFactory {
    session_factory(move |_| {
        let started = started.clone();
        let done = done.clone();
        Ok(HandlerSession::new().on("slow", move |_ctx, _message| {
            let _ = started.send(());
            std::thread::sleep(handler_time);
            done.store(true, Ordering::SeqCst);
            Ok(())
        }))
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_lets_in_flight_handler_finish() {
    let done = Arc::new(AtomicBool::new(false));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let (mut server, addr) = start_server(
        CommConfig::default(),
        slow_handler(Duration::from_millis(300), started_tx, done.clone()),
    )
    .await;
    let closed = Arc::new(Mutex::new(Vec::new()));
    {
        let closed = closed.clone();
        let done = done.clone();
        server.dispatcher().on_disconnected(move |event| {
            closed
                .lock()
                .push((event.reason.clone(), done.load(Ordering::SeqCst)));
        });
    }

    let (client, commid) = connect_client(CommConfig::default(), silent(), addr).await;
    client
        .dispatcher()
        .send_one(commid, &RawMessage::new("slow"))
        .unwrap();
    timeout(WAIT, started_rx.recv()).await.unwrap().unwrap();

    assert!(server.stop(WAIT).await.unwrap());
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(*closed.lock(), vec![(DisconnectReason::Shutdown, true)]);

    client.stop(WAIT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_gives_up_after_wait() {
    let done = Arc::new(AtomicBool::new(false));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let (mut server, addr) = start_server(
        CommConfig::default(),
        slow_handler(Duration::from_millis(800), started_tx, done.clone()),
    )
    .await;

    let (client, commid) = connect_client(CommConfig::default(), silent(), addr).await;
    client
        .dispatcher()
        .send_one(commid, &RawMessage::new("slow"))
        .unwrap();
    timeout(WAIT, started_rx.recv()).await.unwrap().unwrap();

    assert!(!server.stop(Duration::from_millis(50)).await.unwrap());
    assert!(!done.load(Ordering::SeqCst));
    assert_eq!(server.dispatcher().connections_count(), 0);

    client.stop(WAIT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_disconnect_is_seen_as_peer_close() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (mut server, addr) = start_server(CommConfig::default(), silent()).await;
    server.dispatcher().on_disconnected(move |event| {
        let _ = tx.send(event.reason.clone());
    });
    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    server.dispatcher().on_connected(move |event| {
        let _ = connected_tx.send(event.commid);
    });

    let (client, commid) = connect_client(CommConfig::default(), silent(), addr).await;
    timeout(WAIT, connected_rx.recv()).await.unwrap().unwrap();
    assert!(client.dispatcher().remote_addr(commid).is_some());

    client.dispatcher().disconnect_one(commid).unwrap();
    let reason = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(reason, DisconnectReason::PeerClosed);
    assert_eq!(server.dispatcher().connections_count(), 0);

    client.stop(WAIT).await.unwrap();
    server.stop(WAIT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn send_all_reaches_every_connection() {
    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let (mut server, addr) = start_server(CommConfig::default(), silent()).await;
    server.dispatcher().on_connected(move |event| {
        let _ = connected_tx.send(event.commid);
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let factory = session_factory(move |info| {
        let tx = tx.clone();
        let commid = info.commid;
        Ok(HandlerSession::new().on("notice", move |_ctx, _message| {
            let _ = tx.send(commid);
            Ok(())
        }))
    });
    let (first, _) = connect_client(CommConfig::default(), factory.clone(), addr).await;
    let (second, _) = connect_client(CommConfig::default(), factory, addr).await;
    for _ in 0..2 {
        timeout(WAIT, connected_rx.recv()).await.unwrap().unwrap();
    }

    let receipts = server
        .dispatcher()
        .send_all(&RawMessage::new("notice"))
        .unwrap();
    assert_eq!(receipts.len(), 2);
    // ids are unique per connection, so each copy gets one
    assert!(receipts.values().all(|r| r.queued && r.id.is_some()));

    for _ in 0..2 {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    }

    first.stop(WAIT).await.unwrap();
    second.stop(WAIT).await.unwrap();
    server.stop(WAIT).await.unwrap();
}
