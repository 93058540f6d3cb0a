//! Integration tests — full connection lifecycle, admission, ordering,
//! reconnect, and error scenarios over real TCP connections on
//! localhost.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use tether::{
    Client, ClientConfig, CompressionAlgo, DisconnectReason, EncryptionAlgo, Event, EventReceiver,
    PolicySet, SendOptions, Server, ServerConfig,
};

// ── Helpers ──────────────────────────────────────────────────────

/// Start a server on an OS-assigned port and return it with its event
/// stream and port.
async fn ephemeral_server(mut config: ServerConfig) -> (Server, EventReceiver, u16) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    config.host = "127.0.0.1".into();
    let (tx, rx) = mpsc::unbounded_channel();
    let server = Server::listen(config, tx).await.unwrap();
    let port = server.local_addr().port();
    (server, rx, port)
}

fn client_config(port: u16, name: &str, guid: &str) -> ClientConfig {
    ClientConfig {
        host: "127.0.0.1".into(),
        port,
        name: name.into(),
        guid: guid.into(),
        reconnect_secs: 1,
        ..Default::default()
    }
}

/// Connect a client and wait until it is ready.
async fn connected_client(config: ClientConfig) -> (Client, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = Client::connect(config, tx).await.unwrap();
    assert!(
        timeout(Duration::from_secs(5), client.ready()).await.unwrap(),
        "client did not become ready"
    );
    (client, rx)
}

/// Receive the next event or panic after five seconds.
async fn next_event(rx: &mut EventReceiver) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

// ── Seed scenario ────────────────────────────────────────────────

#[tokio::test]
async fn identify_then_message_with_metadata() {
    let (_server, mut events, port) = ephemeral_server(ServerConfig::default()).await;
    let (client, _client_events) = connected_client(client_config(port, "alice", "g-1")).await;

    client
        .send_message("hello", SendOptions::new().with_metadata("room", "lobby"))
        .await
        .unwrap();

    match next_event(&mut events).await {
        Event::Connected(info) => assert_eq!(info.id, 1),
        other => panic!("expected Connected, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::MessageReceived {
            from,
            text,
            metadata,
        } => {
            assert_eq!(text, "hello");
            assert_eq!(metadata.get("room"), Some("lobby"));
            assert_eq!(from.name, "alice");
            assert_eq!(from.guid, "g-1");
        }
        other => panic!("expected MessageReceived, got {other:?}"),
    }
}

// ── Queries ──────────────────────────────────────────────────────

#[tokio::test]
async fn client_lookup_by_id_and_guid() {
    let (server, mut events, port) = ephemeral_server(ServerConfig::default()).await;
    let (client, _c) = connected_client(client_config(port, "bob", "g-bob")).await;

    // wait for the auth round-trip to land
    let _ = next_event(&mut events).await; // Connected
    client.send_message("ping", SendOptions::new()).await.unwrap();
    let _ = next_event(&mut events).await; // MessageReceived

    assert!(server.is_client_connected(1));
    assert!(!server.is_client_connected(99));
    assert_eq!(server.client(1).unwrap().name, "bob");
    assert_eq!(server.client_by_guid("g-bob").unwrap().id, 1);
    assert!(server.client_by_guid("nope").is_none());
    assert_eq!(server.clients().len(), 1);
}

// ── Admission ────────────────────────────────────────────────────

#[tokio::test]
async fn whitelist_refuses_unlisted_peer() {
    let config = ServerConfig {
        policy: PolicySet {
            allow: vec!["10.0.0.1".parse().unwrap()],
            ..Default::default()
        },
        ..Default::default()
    };
    let (_server, mut events, port) = ephemeral_server(config).await;

    // we dial from 127.0.0.1, which is not whitelisted; the socket is
    // closed right after accept and no server event ever fires
    let (tx, _rx) = mpsc::unbounded_channel();
    let client = Client::connect(client_config(port, "eve", "g-eve"), tx)
        .await
        .unwrap();
    assert!(
        timeout(Duration::from_millis(800), events.recv()).await.is_err(),
        "no event may fire for a refused connection"
    );
    client.disconnect();
}

#[tokio::test]
async fn whitelist_admits_listed_peer() {
    let config = ServerConfig {
        policy: PolicySet {
            allow: vec!["127.0.0.1".parse().unwrap()],
            deny: vec!["127.0.0.1".parse().unwrap()], // ignored: whitelist wins
            ..Default::default()
        },
        ..Default::default()
    };
    let (_server, mut events, port) = ephemeral_server(config).await;
    let (_client, _c) = connected_client(client_config(port, "ann", "g-ann")).await;
    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));
}

#[tokio::test]
async fn max_connections_gates_accepts() {
    let config = ServerConfig {
        policy: PolicySet {
            max_connections: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let (_server, mut events, port) = ephemeral_server(config).await;

    let (first, _c1) = connected_client(client_config(port, "one", "g-1")).await;
    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));

    // the second connection parks in the backlog until a slot frees
    let (tx, _rx) = mpsc::unbounded_channel();
    let second = Client::connect(client_config(port, "two", "g-2"), tx)
        .await
        .unwrap();
    assert!(
        timeout(Duration::from_millis(400), events.recv()).await.is_err(),
        "second session must not be admitted while the map is full"
    );

    first.disconnect();
    loop {
        match next_event(&mut events).await {
            Event::Disconnected { .. } => continue,
            Event::Connected(_) => break,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    second.disconnect();
}

// ── Disconnect semantics ─────────────────────────────────────────

#[tokio::test]
async fn racing_shutdowns_emit_one_disconnect_event() {
    let (server, mut events, port) = ephemeral_server(ServerConfig::default()).await;
    let (client, _c) = connected_client(client_config(port, "race", "g-r")).await;
    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));

    // peer FIN and local shutdown at the same time
    client.disconnect();
    let _ = server.shutdown_client(1, DisconnectReason::Normal);

    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);
    let drain = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if matches!(event, Event::Disconnected { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(600)).await;
    drain.abort();
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn identification_timeout_closes_session() {
    let config = ServerConfig {
        identification_timeout_secs: 1,
        ..Default::default()
    };
    let (_server, mut events, port) = ephemeral_server(config).await;

    // raw socket that never sends auth
    let _socket = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));
    match next_event(&mut events).await {
        Event::Disconnected { reason, .. } => assert_eq!(reason, DisconnectReason::Timeout),
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

#[tokio::test]
async fn non_auth_first_frame_is_protocol_error() {
    use bytes::BytesMut;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::Encoder;

    let (_server, mut events, port) = ephemeral_server(ServerConfig::default()).await;
    let mut socket = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();

    let mut codec = tether::FrameCodec::new(tether::DEFAULT_MAX_FRAME_BYTES, None);
    let mut wire = BytesMut::new();
    codec
        .encode(tether::Frame::message("not an auth frame"), &mut wire)
        .unwrap();
    socket.write_all(&wire).await.unwrap();

    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));
    match next_event(&mut events).await {
        Event::Disconnected { reason, .. } => {
            assert_eq!(reason, DisconnectReason::ProtocolError)
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

// ── Ordering ─────────────────────────────────────────────────────

#[tokio::test]
async fn per_client_message_order_is_preserved() {
    const COUNT: usize = 1000;

    let (_server, mut events, port) = ephemeral_server(ServerConfig::default()).await;
    let (c1, _e1) = connected_client(client_config(port, "c1", "guid-1")).await;
    let (c2, _e2) = connected_client(client_config(port, "c2", "guid-2")).await;

    let send1 = tokio::spawn(async move {
        for i in 0..COUNT {
            c1.send_message(i.to_string(), SendOptions::new()).await.unwrap();
        }
        c1
    });
    let send2 = tokio::spawn(async move {
        for i in 0..COUNT {
            c2.send_message(i.to_string(), SendOptions::new()).await.unwrap();
        }
        c2
    });

    let mut seen1 = Vec::new();
    let mut seen2 = Vec::new();
    while seen1.len() < COUNT || seen2.len() < COUNT {
        match next_event(&mut events).await {
            Event::MessageReceived { from, text, .. } => {
                let n: usize = text.parse().unwrap();
                match from.guid.as_str() {
                    "guid-1" => seen1.push(n),
                    "guid-2" => seen2.push(n),
                    other => panic!("unknown sender {other}"),
                }
            }
            Event::Connected(_) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    let expected: Vec<usize> = (0..COUNT).collect();
    assert_eq!(seen1, expected);
    assert_eq!(seen2, expected);
    let _ = send1.await.unwrap();
    let _ = send2.await.unwrap();
}

// ── Reconnect ────────────────────────────────────────────────────

#[tokio::test]
async fn client_reconnects_after_server_restart() {
    let (server, mut events, port) = ephemeral_server(ServerConfig::default()).await;
    let (client, mut client_events) =
        connected_client(client_config(port, "phoenix", "g-p")).await;
    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));
    assert!(matches!(
        next_event(&mut client_events).await,
        Event::Connected(_)
    ));

    // stop the server entirely
    server.shutdown(Duration::from_secs(1)).await;
    drop(server);
    match next_event(&mut client_events).await {
        Event::Disconnected { .. } => {}
        other => panic!("expected Disconnected, got {other:?}"),
    }

    // restart on the same port after a moment; the client is probing
    // every second
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port,
        ..Default::default()
    };
    let (tx, mut events2) = mpsc::unbounded_channel();
    let _server2 = Server::listen(config, tx).await.unwrap();

    // exactly one new Connected on each side, then traffic flows again
    assert!(matches!(
        next_event(&mut client_events).await,
        Event::Connected(_)
    ));
    assert!(matches!(next_event(&mut events2).await, Event::Connected(_)));

    client.send_message("back", SendOptions::new()).await.unwrap();
    match next_event(&mut events2).await {
        Event::MessageReceived { text, .. } => assert_eq!(text, "back"),
        other => panic!("expected MessageReceived, got {other:?}"),
    }

    assert!(
        timeout(Duration::from_millis(300), client_events.recv()).await.is_err(),
        "no duplicate connect/disconnect events"
    );
    client.disconnect();
}

// ── Encryption & compression end-to-end ──────────────────────────

#[tokio::test]
async fn encrypted_compressed_roundtrip_end_to_end() {
    let config = ServerConfig {
        passphrase: Some("shared-secret".into()),
        ..Default::default()
    };
    let (_server, mut events, port) = ephemeral_server(config).await;

    let mut client_cfg = client_config(port, "vault", "g-v");
    client_cfg.passphrase = Some("shared-secret".into());
    let (client, _c) = connected_client(client_cfg).await;

    client
        .send_message(
            "classified",
            SendOptions::new()
                .with_metadata("level", "9")
                .with_compression(CompressionAlgo::Gzip)
                .with_encryption(EncryptionAlgo::Aes256Cbc),
        )
        .await
        .unwrap();

    let _ = next_event(&mut events).await; // Connected
    match next_event(&mut events).await {
        Event::MessageReceived { text, metadata, .. } => {
            assert_eq!(text, "classified");
            assert_eq!(metadata.get("level"), Some("9"));
        }
        other => panic!("expected MessageReceived, got {other:?}"),
    }
}

#[tokio::test]
async fn passphrase_mismatch_drops_connection() {
    let config = ServerConfig {
        passphrase: Some("alpha".into()),
        ..Default::default()
    };
    let (_server, mut events, port) = ephemeral_server(config).await;

    let mut client_cfg = client_config(port, "mism", "g-m");
    client_cfg.passphrase = Some("beta".into());
    let (client, _c) = connected_client(client_cfg).await;

    // auth travels unencrypted, so the session comes up; the first
    // encrypted frame fails to decode on the server
    client
        .send_message(
            "garbled",
            SendOptions::new().with_encryption(EncryptionAlgo::Aes256Cbc),
        )
        .await
        .unwrap();

    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));
    match next_event(&mut events).await {
        Event::Disconnected { reason, .. } => {
            assert_eq!(reason, DisconnectReason::ProtocolError)
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

// ── Bounds ───────────────────────────────────────────────────────

#[tokio::test]
async fn oversize_frame_closes_connection() {
    let config = ServerConfig {
        max_frame_bytes: 1024,
        ..Default::default()
    };
    let (_server, mut events, port) = ephemeral_server(config).await;
    let (client, _c) = connected_client(client_config(port, "big", "g-b")).await;

    // the client-side cap is the default, so the send goes out; the
    // server rejects it from the header alone
    client
        .send_bytes(vec![0u8; 8192], SendOptions::new())
        .await
        .unwrap();

    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));
    match next_event(&mut events).await {
        Event::Disconnected { reason, .. } => {
            assert_eq!(reason, DisconnectReason::ProtocolError)
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

// ── Dynamic callbacks ────────────────────────────────────────────

#[tokio::test]
async fn dynamic_callback_routes_and_unroutes() {
    let (server, mut events, port) = ephemeral_server(ServerConfig::default()).await;
    let (client, _c) = connected_client(client_config(port, "cb", "g-cb")).await;
    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_in_handler = Arc::clone(&hits);
    server.register_callback("K", move |from, inbound, _metadata| {
        assert_eq!(from.name, "cb");
        assert!(matches!(inbound, tether::Inbound::Message { .. }));
        hits_in_handler.fetch_add(1, Ordering::SeqCst);
    });

    client
        .send_message("routed", SendOptions::new().with_callback_key("K"))
        .await
        .unwrap();
    // no default event fires for the routed frame
    assert!(timeout(Duration::from_millis(400), events.recv()).await.is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // unregistering restores the default event
    assert!(server.unregister_callback("K"));
    client
        .send_message("default again", SendOptions::new().with_callback_key("K"))
        .await
        .unwrap();
    match next_event(&mut events).await {
        Event::MessageReceived { text, .. } => assert_eq!(text, "default again"),
        other => panic!("expected MessageReceived, got {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

// ── Broadcast ────────────────────────────────────────────────────

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let (server, mut events, port) = ephemeral_server(ServerConfig::default()).await;
    let (c1, mut e1) = connected_client(client_config(port, "b1", "g-b1")).await;
    let (c2, mut e2) = connected_client(client_config(port, "b2", "g-b2")).await;
    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));
    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));

    let queued = server.broadcast_message("all hands", SendOptions::new());
    assert_eq!(queued, 2);

    for rx in [&mut e1, &mut e2] {
        loop {
            match next_event(rx).await {
                Event::MessageReceived { text, .. } => {
                    assert_eq!(text, "all hands");
                    break;
                }
                Event::Connected(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
    c1.disconnect();
    c2.disconnect();
}

// ── Send-state errors ────────────────────────────────────────────

#[tokio::test]
async fn send_to_unknown_session_fails_fast() {
    let (server, _events, _port) = ephemeral_server(ServerConfig::default()).await;
    let err = server
        .send_message(42, "nobody home", SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, tether::TetherError::NotConnected));
}

#[tokio::test]
async fn disconnected_client_send_fails_fast() {
    let (_server, _events, port) = ephemeral_server(ServerConfig::default()).await;
    let (client, _c) = connected_client(client_config(port, "gone", "g-g")).await;
    client.disconnect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let err = client
        .send_message("too late", SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        tether::TetherError::NotConnected | tether::TetherError::ChannelClosed
    ));
}
