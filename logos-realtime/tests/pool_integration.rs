//! Integration tests for pooled document sessions.
//!
//! A minimal relay server forwards binary sync frames between every socket
//! joined to the same room path. Two pools with distinct peer identities
//! edit the same document through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use logos_realtime::pool::{DocumentSession, PoolConfig, SessionPool};
use logos_realtime::protocol::{MessageType, PeerInfo, SyncMessage};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use yrs::{GetString, Text, Transact, WriteTxn};

type Rooms = Arc<Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>>>>;

/// Start the relay, return its base URL and the live room table.
async fn start_relay() -> (String, Rooms) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));

    let table = rooms.clone();
    tokio::spawn(async move {
        let mut next_id = 0u64;
        while let Ok((stream, _)) = listener.accept().await {
            let path = Arc::new(Mutex::new(String::new()));
            let seen = path.clone();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *seen.lock() = req.uri().path().to_string();
                Ok(resp)
            };
            let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                continue;
            };

            next_id += 1;
            let id = next_id;
            let room = path.lock().clone();
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            table.lock().entry(room.clone()).or_default().push((id, tx));

            let table = table.clone();
            tokio::spawn(async move {
                let (mut writer, mut reader) = ws.split();
                loop {
                    tokio::select! {
                        outgoing = rx.recv() => match outgoing {
                            Some(bytes) => {
                                if writer.send(WsMessage::Binary(bytes.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        incoming = reader.next() => match incoming {
                            Some(Ok(WsMessage::Binary(data))) => {
                                let peers = table.lock();
                                for (other, tx) in peers.get(&room).into_iter().flatten() {
                                    if *other != id {
                                        let _ = tx.send(data.to_vec());
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                    }
                }
                if let Some(peers) = table.lock().get_mut(&room) {
                    peers.retain(|(other, _)| *other != id);
                }
            });
        }
    });

    (format!("ws://127.0.0.1:{port}"), rooms)
}

type Frames = Arc<Mutex<Vec<Vec<SyncMessage>>>>;

/// Accepts sync sockets and records the frames each one sends. The first
/// socket is closed by the server shortly after it opens.
async fn start_flaky_server() -> (String, Arc<AtomicUsize>, Frames) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicUsize::new(0));
    let frames: Frames = Arc::new(Mutex::new(Vec::new()));

    let (count, seen) = (accepts.clone(), frames.clone());
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            let index = {
                let mut seen = seen.lock();
                seen.push(Vec::new());
                seen.len() - 1
            };
            count.fetch_add(1, Ordering::SeqCst);

            let seen = seen.clone();
            tokio::spawn(async move {
                let close_at = (index == 0).then(|| Instant::now() + Duration::from_millis(200));
                loop {
                    let next = match close_at {
                        Some(deadline) => match tokio::time::timeout_at(deadline, ws.next()).await {
                            Ok(next) => next,
                            Err(_) => {
                                let _ = ws.close(None).await;
                                break;
                            }
                        },
                        None => ws.next().await,
                    };
                    match next {
                        Some(Ok(WsMessage::Binary(data))) => {
                            if let Ok(frame) = SyncMessage::decode(&data) {
                                seen.lock()[index].push(frame);
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
            });
        }
    });

    (format!("ws://127.0.0.1:{port}"), accepts, frames)
}

fn room_size(rooms: &Rooms, path: &str) -> usize {
    rooms.lock().get(path).map_or(0, |peers| peers.len())
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "Timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

fn pool_for(name: &str) -> SessionPool {
    let _ = env_logger::builder().is_test(true).try_init();
    SessionPool::with_peer(PoolConfig::default(), PeerInfo::new(name))
}

fn text_of(session: &DocumentSession) -> String {
    session
        .with_doc(|doc| {
            let text = doc.get_or_insert_text("content");
            text.get_string(&doc.transact())
        })
        .unwrap_or_default()
}

fn append(session: &DocumentSession, chunk: &str) {
    session
        .edit(|txn| {
            let text = txn.get_or_insert_text("content");
            let len = text.len(&*txn);
            text.insert(txn, len, chunk);
        })
        .unwrap();
}

#[tokio::test]
async fn test_edits_propagate_between_pools() {
    let (url, _rooms) = start_relay().await;
    let alice = pool_for("Alice");
    let bob = pool_for("Bob");

    let a = alice.get_connection("doc1", &url);
    let b = bob.get_connection("doc1", &url);
    wait_until("both channels", || a.is_connected() && b.is_connected()).await;

    append(&a, "hello");
    wait_until("bob to see alice's edit", || text_of(&b) == "hello").await;

    append(&b, " world");
    wait_until("alice to see bob's edit", || text_of(&a) == "hello world").await;

    alice.destroy();
    bob.destroy();
}

#[tokio::test]
async fn test_late_joiner_receives_existing_state() {
    let (url, _rooms) = start_relay().await;
    let alice = pool_for("Alice");
    let bob = pool_for("Bob");

    let a = alice.get_connection("doc1", &url);
    wait_until("alice connected", || a.is_connected()).await;
    append(&a, "early bird");

    let b = bob.get_connection("doc1", &url);
    wait_until("state handshake", || text_of(&b) == "early bird").await;

    alice.destroy();
    bob.destroy();
}

#[tokio::test]
async fn test_offline_edits_replayed_on_connect() {
    let (url, _rooms) = start_relay().await;
    let alice = pool_for("Alice");
    let bob = pool_for("Bob");

    let b = bob.get_connection("doc1", &url);
    wait_until("bob connected", || b.is_connected()).await;

    // The connect task has not run yet, so this edit is queued.
    let a = alice.get_connection("doc1", &url);
    append(&a, "queued");
    assert_eq!(a.channel().offline_queue_len(), 1);

    wait_until("replay", || a.channel().offline_queue_len() == 0).await;
    wait_until("bob to see queued edit", || text_of(&b) == "queued").await;

    alice.destroy();
    bob.destroy();
}

#[tokio::test]
async fn test_peers_and_disposal() {
    let (url, rooms) = start_relay().await;
    let alice = pool_for("Alice");
    let bob = pool_for("Bob");

    let a = alice.get_connection("doc1", &url);
    alice.register_listener("doc1", "editor");
    wait_until("alice connected", || a.is_connected()).await;
    bob.get_connection("doc1", &url);
    bob.register_listener("doc1", "editor");

    wait_until("alice to see bob", || a.peer_count() == 1).await;
    assert_eq!(room_size(&rooms, "/doc-doc1"), 2);

    let stats = alice.get_connection_stats();
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.connections[0].peers, 1);

    // Last listener gone: bob's session is disposed and its socket closed.
    assert!(bob.unregister_listener("doc1", "editor"));
    assert!(!bob.has_connection("doc1"));
    wait_until("bob to leave", || a.peer_count() == 0).await;
    wait_until("relay to drop bob", || room_size(&rooms, "/doc-doc1") == 1).await;

    alice.destroy();
    wait_until("relay to drop alice", || room_size(&rooms, "/doc-doc1") == 0).await;
    bob.destroy();
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let (url, _rooms) = start_relay().await;
    let alice = pool_for("Alice");
    let bob = pool_for("Bob");

    let a1 = alice.get_connection("doc1", &url);
    let b1 = bob.get_connection("doc1", &url);
    let b2 = bob.get_connection("doc2", &url);
    wait_until("channels", || a1.is_connected() && b1.is_connected() && b2.is_connected()).await;

    append(&a1, "only doc1");
    wait_until("doc1 sync", || text_of(&b1) == "only doc1").await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(text_of(&b2), "");

    alice.destroy();
    bob.destroy();
}

#[tokio::test]
async fn test_channel_reconnects_after_server_close() {
    let (url, accepts, frames) = start_flaky_server().await;
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = SessionPool::with_peer(
        PoolConfig {
            reconnect_interval: Duration::from_millis(50),
            ..PoolConfig::default()
        },
        PeerInfo::new("Alice"),
    );

    let session = pool.get_connection("doc1", &url);
    wait_until("first connection", || session.is_connected()).await;
    wait_until("server close", || !session.is_connected()).await;

    append(&session, "a");
    append(&session, "b");
    append(&session, "c");

    wait_until("second connection", || accepts.load(Ordering::SeqCst) == 2 && session.is_connected()).await;
    wait_until("offline replay", || session.channel().offline_queue_len() == 0).await;
    wait_until("deltas on the new socket", || {
        frames.lock()[1].iter().filter(|f| f.msg_type == MessageType::Delta).count() == 3
    })
    .await;

    // The new socket starts with a fresh handshake.
    {
        let frames = frames.lock();
        assert_eq!(frames[1][0].msg_type, MessageType::PeerJoined);
        assert_eq!(frames[1][1].msg_type, MessageType::SyncStep1);
        assert!(!frames[1][1].payload.is_empty());
    }
    assert!(Arc::ptr_eq(&session, &pool.get_connection("doc1", &url)));

    pool.destroy();
}
