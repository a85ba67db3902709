use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    arg, Address, Broker, BrokerHooks, ClientHooks, ConnectState, Error, Service,
    ServiceOptions, SocketAdapter, SocketServer, SocketServerOptions, Teardown, Timing,
    TlsClientConfig, TlsServerConfig,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Notify};

fn fast_timing() -> Timing {
    Timing {
        identify_retry: Duration::from_millis(200),
        reconnect_delay: Duration::from_millis(100),
        ..Timing::default()
    }
}

async fn server(broker: &Broker) -> SocketServer {
    SocketServer::bind(broker, SocketServerOptions::new(Address::tcp("127.0.0.1", 0)))
        .await
        .unwrap()
}

fn remote(name: &str, adapter: SocketAdapter) -> Service {
    Service::with_options(
        name,
        adapter,
        ServiceOptions {
            timing: fast_timing(),
            ..ServiceOptions::default()
        },
    )
}

async fn wait_for_state(state: &mut watch::Receiver<ConnectState>, wanted: ConnectState) {
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|state| *state == wanted))
        .await
        .expect("adapter should reach the state in time")
        .unwrap();
}

#[tokio::test]
async fn remote_service_serves_local_callers() {
    let broker = Broker::new();
    let server = server(&broker).await;

    let adapter = SocketAdapter::new(server.address());
    let mut state = adapter.state();
    let calculator = remote("calculator", adapter);
    calculator.add_method("multiply", |args| async move {
        Ok(arg::<i64>(&args, 0)? * arg::<i64>(&args, 1)?)
    });
    wait_for_state(&mut state, ConnectState::Connected).await;
    assert_eq!(
        broker.registry().instances("calculator"),
        vec![calculator.instance_id().to_string()]
    );

    let client = broker.local_service("local");
    let product = client
        .proxy("calculator")
        .call("multiply", vec![json!(2), json!(3)])
        .await
        .unwrap();
    assert_eq!(product, json!(6));
}

#[tokio::test]
async fn remote_client_subscribes_to_local_service() {
    let broker = Broker::new();
    let server = server(&broker).await;

    let clock = broker.local_service("clock");
    clock.add_subscription("ticks", |emit, _args| {
        let task = tokio::spawn(async move {
            for n in 0.. {
                emit.next(n);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        Ok(Teardown::new(move || task.abort()))
    });

    let client = remote("local", SocketAdapter::new(server.address()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = client
        .proxy("clock")
        .subscribe("ticks", vec![], move |event| {
            let _ = tx.send(event);
        });

    for expected in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event, vec![json!(expected)]);
    }

    subscription.unsubscribe();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(broker.in_flight().is_empty());
}

#[derive(Default)]
struct Recorder {
    errors: Mutex<Vec<String>>,
    broker_identity: Mutex<Option<Value>>,
}

struct RecordingHooks(Arc<Recorder>);

#[async_trait]
impl ClientHooks for RecordingHooks {
    async fn verify_broker(&self, identity: &Value) -> bool {
        *self.0.broker_identity.lock() = Some(identity.clone());
        true
    }

    async fn identity(&self, mut base: Value, _broker_identity: &Value) -> Value {
        base["token"] = json!("secret");
        // Overridden by the adapter
        base["type"] = json!("impostor");
        base
    }

    async fn handle_error(&self, error: &Error) -> bool {
        self.0.errors.lock().push(error.to_string());
        true
    }
}

struct TokenGate;

#[async_trait]
impl BrokerHooks for TokenGate {
    async fn identity(&self) -> Value {
        json!({"name": "gate"})
    }

    async fn verify_client(&self, identity: &Value) -> bool {
        identity["token"] == "secret" && identity["type"] != "blocked"
    }
}

#[tokio::test]
async fn identity_hooks_run_on_both_sides() {
    let broker = Broker::new();
    let server = SocketServer::bind(
        &broker,
        SocketServerOptions::new(Address::tcp("127.0.0.1", 0)).hooks(TokenGate),
    )
    .await
    .unwrap();

    let recorder = Arc::new(Recorder::default());
    let adapter = SocketAdapter::builder(server.address())
        .hooks(RecordingHooks(recorder.clone()))
        .build();
    let mut state = adapter.state();
    let _service = remote("allowed", adapter);

    wait_for_state(&mut state, ConnectState::Connected).await;
    assert_eq!(*recorder.broker_identity.lock(), Some(json!({"name": "gate"})));
    assert_eq!(broker.registry().instances("allowed").len(), 1);
    assert!(recorder.errors.lock().is_empty());
}

#[tokio::test]
async fn rejected_identity_reaches_error_hook() {
    let broker = Broker::new();
    let server = SocketServer::bind(
        &broker,
        SocketServerOptions::new(Address::tcp("127.0.0.1", 0)).hooks(TokenGate),
    )
    .await
    .unwrap();

    let recorder = Arc::new(Recorder::default());
    let adapter = SocketAdapter::builder(server.address())
        .hooks(RecordingHooks(recorder.clone()))
        .build();
    let mut state = adapter.state();
    let _service = remote("blocked", adapter);

    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.errors.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    // The hook gave up, so the adapter stays down
    wait_for_state(&mut state, ConnectState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*recorder.errors.lock(), vec![Error::Identity.to_string()]);
    assert_eq!(*state.borrow(), ConnectState::Disconnected);
    assert_eq!(broker.registry().count(), 0);
}

#[tokio::test]
async fn adapter_reconnects_after_link_drops() {
    let broker = Broker::new();
    let server = server(&broker).await;

    let adapter = SocketAdapter::new(server.address());
    let mut state = adapter.state();
    let worker = remote("worker", adapter.clone());
    worker.add_method("ping", |_args| async move { Ok("pong") });
    wait_for_state(&mut state, ConnectState::Connected).await;

    // Drop the link from the broker's side
    broker
        .registry()
        .get("worker", None)
        .unwrap()
        .close();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state != ConnectState::Connected),
    )
    .await
    .unwrap()
    .unwrap();
    wait_for_state(&mut state, ConnectState::Connected).await;

    let client = broker.local_service("local");
    let reply = client.proxy("worker").call("ping", vec![]).await.unwrap();
    assert_eq!(reply, json!("pong"));

    worker.close();
    wait_for_state(&mut state, ConnectState::Disconnected).await;
}

#[tokio::test]
async fn unreachable_broker_keeps_retrying() {
    // Reserve a port, then free it so nothing listens there
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = Address::Tcp(listener.local_addr().unwrap().to_string());
    drop(listener);

    let adapter = SocketAdapter::new(address);
    let mut state = adapter.state();
    let service = remote("lonely", adapter);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!service.is_connected());
    assert_ne!(*state.borrow(), ConnectState::Connected);
    service.close();
    wait_for_state(&mut state, ConnectState::Disconnected).await;
}

#[tokio::test]
async fn unix_socket_round_trip() {
    let path = std::env::temp_dir().join(format!("courier-core-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let broker = Broker::new();
    let server = SocketServer::bind(&broker, SocketServerOptions::new(Address::Unix(path.clone())))
        .await
        .unwrap();
    assert_eq!(server.address(), Address::Unix(path.clone()));

    let echo = remote("echo", SocketAdapter::new(server.address()));
    echo.add_method("echo", |args| async move { Ok(args) });

    let client = broker.local_service("local");
    let reply = client
        .proxy("echo")
        .call("echo", vec![json!("hello"), json!(1)])
        .await
        .unwrap();
    assert_eq!(reply, json!(["hello", 1]));

    server.close();
    broker.close();
}

#[tokio::test]
async fn broker_close_disconnects_remote_services() {
    let broker = Broker::new();
    let server = server(&broker).await;

    let adapter = SocketAdapter::new(server.address());
    let mut state = adapter.state();
    let service = remote("worker", adapter);
    wait_for_state(&mut state, ConnectState::Connected).await;

    let mut connected = service.connected();
    broker.close();
    tokio::time::timeout(Duration::from_secs(5), connected.wait_for(|up| !*up))
        .await
        .unwrap()
        .unwrap();
    service.close();
}

const TEST_KEY: &[u8] = include_bytes!("../../fabric/tests/fixtures/localhost.key");
const TEST_CERT: &[u8] = include_bytes!("../../fabric/tests/fixtures/localhost.pem");

#[tokio::test]
async fn services_connect_over_tls() {
    let broker = Broker::new();
    let tls = TlsServerConfig::from_pem(TEST_KEY, TEST_CERT).unwrap();
    let server = SocketServer::bind(
        &broker,
        SocketServerOptions::new(Address::tcp("127.0.0.1", 0)).tls(tls),
    )
    .await
    .unwrap();

    let adapter = SocketAdapter::builder(server.address())
        .tls(TlsClientConfig::from_pem(TEST_CERT).unwrap())
        .build();
    let mut state = adapter.state();
    let calculator = remote("calculator", adapter);
    calculator.add_method("multiply", |args| async move {
        Ok(arg::<i64>(&args, 0)? * arg::<i64>(&args, 1)?)
    });
    wait_for_state(&mut state, ConnectState::Connected).await;

    let client = broker.local_service("local");
    let product = client
        .proxy("calculator")
        .call("multiply", vec![json!(6), json!(7)])
        .await
        .unwrap();
    assert_eq!(product, json!(42));
}

#[tokio::test]
async fn plain_client_cannot_join_tls_listener() {
    let broker = Broker::new();
    let tls = TlsServerConfig::from_pem(TEST_KEY, TEST_CERT).unwrap();
    let server = SocketServer::bind(
        &broker,
        SocketServerOptions::new(Address::tcp("127.0.0.1", 0)).tls(tls),
    )
    .await
    .unwrap();

    let service = remote("plain", SocketAdapter::new(server.address()));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!service.is_connected());
    assert_eq!(broker.registry().count(), 0);
    service.close();
}

struct Gate(Arc<Notify>);

#[async_trait]
impl ClientHooks for Gate {
    async fn verify_broker(&self, _identity: &Value) -> bool {
        self.0.notified().await;
        true
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn calls_racing_registration_are_all_served() {
    for _ in 0..5 {
        let broker = Broker::new();
        let server = server(&broker).await;
        let client = broker.local_service("local");

        let callers: Vec<_> = (0..8)
            .map(|n| {
                let proxy = client.proxy("calculator");
                tokio::spawn(async move {
                    for _ in 0..5 {
                        let product = proxy.call("multiply", vec![json!(n), json!(2)]).await?;
                        assert_eq!(product, json!(n * 2));
                    }
                    Ok::<_, Error>(())
                })
            })
            .collect();

        // Hold the handshake until the method is registered
        let gate = Arc::new(Notify::new());
        let adapter = SocketAdapter::builder(server.address())
            .hooks(Gate(gate.clone()))
            .build();
        let calculator = remote("calculator", adapter);
        calculator.add_method("multiply", |args| async move {
            Ok(arg::<i64>(&args, 0)? * arg::<i64>(&args, 1)?)
        });
        gate.notify_one();

        for caller in callers {
            caller.await.unwrap().unwrap();
        }
        calculator.close();
        broker.close();
    }
}
