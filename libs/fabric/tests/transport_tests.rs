use courier_fabric::{
    channel::{Channel, KICK},
    codec::JsonCodec,
    error::Error,
    request::request_reply,
    transport::{
        Address, FrameReader, TcpTransport, TcpTransportListener, TlsClientConfig,
        TlsServerConfig, Transport, TransportListener, UnixTransport, UnixTransportListener,
    },
};
use serde_json::json;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Helper to get a free port
async fn get_listener() -> (TcpTransportListener, std::net::SocketAddr) {
    let listener = TcpTransportListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn framed(transport: impl Transport + 'static) -> Channel {
    let (channel, pump) = Channel::framed(Box::new(transport), JsonCodec);
    pump.start();
    channel
}

#[tokio::test]
async fn tcp_channel_round_trip() {
    let (listener, addr) = get_listener().await;

    // Echo server
    tokio::spawn(async move {
        let (transport, _addr) = listener.accept().await.unwrap();
        let server = framed(transport);
        let mut pings = server.on("ping");
        while let Some(args) = pings.recv().await {
            server.emit("pong", args).unwrap();
        }
    });

    let client = framed(TcpTransport::connect(addr.to_string()).await.unwrap());
    let reply = request_reply(
        &client,
        "ping",
        "pong",
        vec![json!("hello"), json!({"n": 1})],
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    assert_eq!(reply, vec![json!("hello"), json!({"n": 1})]);
}

#[tokio::test]
async fn tcp_channel_preserves_event_order() {
    let (listener, addr) = get_listener().await;

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (transport, _addr) = listener.accept().await.unwrap();
        let server = framed(transport);
        let mut inbox = server.inbox();
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(inbox.recv().await.unwrap().event);
        }
        done_tx.send(seen).unwrap();
    });

    let client = framed(TcpTransport::connect(addr.to_string()).await.unwrap());
    client.emit("first", vec![]).unwrap();
    client.emit("second", vec![]).unwrap();
    client.emit("third", vec![]).unwrap();

    assert_eq!(done_rx.await.unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn rejects_oversized_frame() {
    // Send a raw malformed frame header claiming 200MB (over the 100MB limit)
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_u32(200 * 1024 * 1024).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let transport = TcpTransport::connect(addr.to_string()).await.unwrap();
    let (reader, _writer) = Box::new(transport).split();
    let mut reader = FrameReader::new(reader);

    match reader.read_frame().await {
        Err(Error::InvalidFrame(msg)) => assert!(msg.contains("too large")),
        other => panic!("Expected InvalidFrame error, got {:?}", other.map(|b| b.len())),
    }
}

#[tokio::test]
async fn peer_disconnect_kicks_and_closes_channel() {
    let (listener, addr) = get_listener().await;

    tokio::spawn(async move {
        let (transport, _addr) = listener.accept().await.unwrap();
        let server = framed(transport);
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close();
    });

    let client = framed(TcpTransport::connect(addr.to_string()).await.unwrap());
    let kick = client.once(KICK);

    tokio::time::timeout(Duration::from_secs(2), client.closed())
        .await
        .expect("channel should close when the peer goes away");
    assert_eq!(kick.await, Some(vec![]));
    assert!(matches!(
        client.emit("late", vec![]),
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn emit_right_before_close_is_flushed() {
    let (listener, addr) = get_listener().await;

    tokio::spawn(async move {
        let (transport, _addr) = listener.accept().await.unwrap();
        let server = framed(transport);
        server.emit("bye", vec![json!(1)]).unwrap();
        server.close();
    });

    let (client, pump) = Channel::framed(
        Box::new(TcpTransport::connect(addr.to_string()).await.unwrap()),
        JsonCodec,
    );
    let bye = client.once("bye");
    pump.start();

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), bye).await.unwrap(),
        Some(vec![json!(1)])
    );
}

#[tokio::test]
async fn transport_listener_trait_usage() {
    let (listener, addr) = get_listener().await;
    let mut listener: Box<dyn TransportListener> = Box::new(listener);
    assert_eq!(listener.local_addr(), Some(addr));

    tokio::spawn(async move {
        let client = framed(TcpTransport::connect(addr.to_string()).await.unwrap());
        client.emit("test", vec![json!(true)]).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let (server, pump) = Channel::framed(listener.accept().await.unwrap(), JsonCodec);
    let test = server.once("test");
    pump.start();
    assert_eq!(test.await, Some(vec![json!(true)]));

    listener.close().await.unwrap();
}

#[tokio::test]
async fn address_connects_and_binds() {
    let address = Address::tcp("127.0.0.1", 0);
    let listener = address.bind().await.unwrap();
    let bound = Address::Tcp(listener.local_addr().unwrap().to_string());

    tokio::spawn(async move {
        let server = framed_boxed(listener.accept().await.unwrap());
        let mut pings = server.on("ping");
        let args = pings.recv().await.unwrap();
        server.emit("pong", args).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let client = framed_boxed(bound.connect(Some(Duration::from_secs(1))).await.unwrap());
    let reply = request_reply(&client, "ping", "pong", vec![json!(3)], Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply, vec![json!(3)]);
}

fn framed_boxed(transport: Box<dyn Transport>) -> Channel {
    let (channel, pump) = Channel::framed(transport, JsonCodec);
    pump.start();
    channel
}

// Unix Socket Tests

#[tokio::test]
async fn unix_channel_round_trip() {
    let socket_path = "/tmp/courier_test_unix_round_trip.sock";
    let _ = std::fs::remove_file(socket_path);

    let listener = UnixTransportListener::bind(socket_path).await.unwrap();

    tokio::spawn(async move {
        let server = framed_boxed(TransportListener::accept(&listener).await.unwrap());
        let mut pings = server.on("ping");
        while let Some(args) = pings.recv().await {
            server.emit("pong", args).unwrap();
        }
    });

    let client = framed(UnixTransport::connect(socket_path).await.unwrap());
    let reply = request_reply(
        &client,
        "ping",
        "pong",
        vec![json!("hello unix")],
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    assert_eq!(reply, vec![json!("hello unix")]);

    let _ = std::fs::remove_file(socket_path);
}

#[tokio::test]
async fn unix_listener_cleans_up_socket() {
    let socket_path = "/tmp/courier_test_unix_cleanup.sock";
    let _ = std::fs::remove_file(socket_path);

    {
        let mut listener = UnixTransportListener::bind(socket_path).await.unwrap();
        assert!(std::path::Path::new(socket_path).exists());
        assert_eq!(listener.path(), std::path::Path::new(socket_path));

        // Explicitly close
        listener.close().await.unwrap();
    }

    assert!(!std::path::Path::new(socket_path).exists());
}

#[tokio::test]
async fn unix_connect_to_missing_socket_fails() {
    let result = UnixTransport::builder()
        .path("/tmp/courier_test_unix_missing.sock")
        .connect_timeout(Duration::from_millis(100))
        .connect()
        .await;
    assert!(matches!(result, Err(Error::Io(_))));
}

const TEST_KEY: &[u8] = include_bytes!("fixtures/localhost.key");
const TEST_CERT: &[u8] = include_bytes!("fixtures/localhost.pem");

#[tokio::test]
async fn tls_channel_round_trip() {
    let server_tls = TlsServerConfig::from_pem(TEST_KEY, TEST_CERT).unwrap();
    let address = Address::tcp("127.0.0.1", 0);
    let listener = address.bind_tls(&server_tls).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let transport = listener.accept().await.unwrap();
        assert!(transport.peer().starts_with("tls://"));
        let server = framed_boxed(transport);
        let mut pings = server.on("ping");
        while let Some(args) = pings.recv().await {
            server.emit("pong", args).unwrap();
        }
    });

    let client_tls = TlsClientConfig::from_pem(TEST_CERT).unwrap();
    let transport = Address::Tcp(addr.to_string())
        .connect_tls(&client_tls, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    let client = framed_boxed(transport);
    let reply = request_reply(&client, "ping", "pong", vec![json!("secure")], Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply, vec![json!("secure")]);
}

#[tokio::test]
async fn tls_rejects_untrusted_server_name() {
    let server_tls = TlsServerConfig::from_pem(TEST_KEY, TEST_CERT).unwrap();
    let listener = Address::tcp("127.0.0.1", 0).bind_tls(&server_tls).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let client_tls = TlsClientConfig::from_pem(TEST_CERT)
        .unwrap()
        .server_name("broker.example.com");
    let outcome = Address::Tcp(addr.to_string())
        .connect_tls(&client_tls, Some(Duration::from_secs(2)))
        .await;
    assert!(matches!(outcome, Err(Error::Tls(_))));
}

#[tokio::test]
async fn tls_over_unix_is_refused() {
    let client_tls = TlsClientConfig::from_pem(TEST_CERT).unwrap();
    let outcome = Address::Unix("/tmp/courier-none.sock".into())
        .connect_tls(&client_tls, None)
        .await;
    assert!(matches!(outcome, Err(Error::Tls(_))));
}
