//! End-to-end session tests over an in-memory duplex transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use topowatch::{
    ClientFrame, ConnectionManager, ConnectionState, Connector, Edge, GraphStore, LineTransport,
    LiveMode, MetricEvent, Node, NodeKind, Reconciler, ServerFrame, Status, SubscriptionRegistry,
    SyncConfig, Transport, TransportError,
};

/// Hands out pre-arranged duplex streams, one per connection attempt.
struct ScriptedConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
}

impl ScriptedConnector {
    fn new(streams: Vec<DuplexStream>) -> Self {
        Self {
            streams: Mutex::new(streams.into()),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let stream = self
            .streams
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Connect("no endpoint available".into()))?;
        Ok(Box::new(LineTransport::new(stream)))
    }
}

/// Remote half of a test connection.
struct TestServer {
    /// Every client frame received, in order.
    log: Arc<Mutex<Vec<ClientFrame>>>,
    /// Push frames to the client.
    inject: mpsc::Sender<ServerFrame>,
    /// Drop the connection from the server side.
    kill: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawn a minimal broker on one duplex half: answers CONNECT with
    /// CONNECTED and PING with PONG, records everything else.
    fn spawn(stream: DuplexStream) -> Self {
        Self::spawn_with(stream, true)
    }

    /// Spawn a broker that completes the handshake but never answers
    /// PING, simulating a hung backend.
    fn spawn_unresponsive(stream: DuplexStream) -> Self {
        Self::spawn_with(stream, false)
    }

    fn spawn_with(stream: DuplexStream, answer_pings: bool) -> Self {
        let log: Arc<Mutex<Vec<ClientFrame>>> = Arc::new(Mutex::new(Vec::new()));
        let (inject, mut inject_rx) = mpsc::channel::<ServerFrame>(32);
        let (kill, mut kill_rx) = oneshot::channel::<()>();

        let frames = Arc::clone(&log);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = BufReader::new(read).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Ok(Some(line)) = line else { break };
                        let Ok(frame) = serde_json::from_str::<ClientFrame>(&line) else {
                            continue;
                        };
                        frames.lock().push(frame.clone());
                        let reply = match frame {
                            ClientFrame::Connect => Some(ServerFrame::Connected),
                            ClientFrame::Ping if answer_pings => Some(ServerFrame::Pong),
                            _ => None,
                        };
                        if let Some(reply) = reply {
                            if write_frame(&mut write, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    frame = inject_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if write_frame(&mut write, &frame).await.is_err() {
                            break;
                        }
                    }
                    _ = &mut kill_rx => break,
                }
            }
        });

        Self {
            log,
            inject,
            kill: Some(kill),
        }
    }

    fn subscribes(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                ClientFrame::Subscribe { channel } => Some(channel.clone()),
                _ => None,
            })
            .collect()
    }

    fn unsubscribes(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                ClientFrame::Unsubscribe { channel } => Some(channel.clone()),
                _ => None,
            })
            .collect()
    }

    fn drop_connection(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

async fn write_frame(
    write: &mut tokio::io::WriteHalf<DuplexStream>,
    frame: &ServerFrame,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(frame).expect("frame serializes");
    line.push('\n');
    write.write_all(line.as_bytes()).await?;
    write.flush().await
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_missed_limit: 2,
        reconnect_delay: Duration::from_millis(20),
        max_reconnect_attempts: 3,
        handshake_timeout: Duration::from_secs(1),
        ..SyncConfig::default()
    }
}

fn sample_store() -> GraphStore {
    let mut store = GraphStore::new();
    store.insert_node(
        Node::new("topic-42", NodeKind::Topic, "orders")
            .with_backend_id("42")
            .monitored(),
    );
    store.insert_node(Node::new("app-1", NodeKind::Application, "checkout"));
    store.insert_edge(Edge::new("e1", "app-1", "topic-42"));
    store
}

async fn wait_for_subscribes(server: &TestServer, count: usize) {
    timeout(Duration::from_secs(2), async {
        while server.subscribes().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriptions should reach the server");
}

#[tokio::test]
async fn handshake_rejection_surfaces_connection_error() {
    let (client, server) = tokio::io::duplex(4096);

    // A server that refuses the handshake.
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();
        if let Ok(Some(_connect)) = lines.next_line().await {
            let _ = write_frame(
                &mut write,
                &ServerFrame::Error {
                    message: "not authorized".into(),
                },
            )
            .await;
        }
    });

    let manager = ConnectionManager::new(
        Arc::new(ScriptedConnector::new(vec![client])),
        Arc::new(SubscriptionRegistry::new()),
        fast_config(),
    );
    let result = manager.connect().await;
    assert!(result.is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn subscriptions_issued_before_connect_are_flushed() {
    let (client, remote) = tokio::io::duplex(4096);
    let server = TestServer::spawn(remote);

    let manager = ConnectionManager::new(
        Arc::new(ScriptedConnector::new(vec![client])),
        Arc::new(SubscriptionRegistry::new()),
        fast_config(),
    );

    let (events, _queue) = mpsc::channel(16);
    manager.subscribe("topics.update", events.clone()).await;
    manager.subscribe("topics.metrics", events).await;

    manager.connect().await.unwrap();
    wait_for_subscribes(&server, 2).await;

    let mut subscribed = server.subscribes();
    subscribed.sort();
    assert_eq!(subscribed, ["topics.metrics", "topics.update"]);
}

#[tokio::test]
async fn duplicate_subscribe_hits_the_wire_once() {
    let (client, remote) = tokio::io::duplex(4096);
    let server = TestServer::spawn(remote);

    let manager = ConnectionManager::new(
        Arc::new(ScriptedConnector::new(vec![client])),
        Arc::new(SubscriptionRegistry::new()),
        fast_config(),
    );
    manager.connect().await.unwrap();

    let (tx1, mut rx1) = mpsc::channel(16);
    let (tx2, mut rx2) = mpsc::channel(16);
    let first = manager.subscribe("topics.metrics", tx1).await;
    let second = manager.subscribe("topics.metrics", tx2).await;
    assert_eq!(first, second);

    wait_for_subscribes(&server, 1).await;
    // Give any (incorrect) second SUBSCRIBE a chance to show up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.subscribes(), ["topics.metrics"]);

    // One inbound message, exactly one delivery, to the first binding.
    server
        .inject
        .send(ServerFrame::Message {
            channel: "topics.metrics".into(),
            body: json!({"type": "TOPIC_METRICS", "payload": {"topicId": 42}}),
        })
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(1), rx1.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind(), "TOPIC_METRICS");
    assert!(rx1.try_recv().is_err());
    assert!(rx2.try_recv().is_err());
}

#[tokio::test]
async fn reconnect_replays_subscriptions_without_duplicates() {
    let (client1, remote1) = tokio::io::duplex(4096);
    let (client2, remote2) = tokio::io::duplex(4096);
    let mut server1 = TestServer::spawn(remote1);
    let server2 = TestServer::spawn(remote2);

    let manager = ConnectionManager::new(
        Arc::new(ScriptedConnector::new(vec![client1, client2])),
        Arc::new(SubscriptionRegistry::new()),
        fast_config(),
    );
    let (events, mut queue) = mpsc::channel(16);
    manager.subscribe("topics.update", events.clone()).await;
    manager.subscribe("topics.metrics", events).await;
    manager.connect().await.unwrap();
    wait_for_subscribes(&server1, 2).await;

    // Sever the first connection; the manager must retry and replay.
    server1.drop_connection();
    wait_for_subscribes(&server2, 2).await;

    let mut replayed = server2.subscribes();
    replayed.sort();
    assert_eq!(replayed, ["topics.metrics", "topics.update"]);
    // Exactly one SUBSCRIBE per channel on the fresh transport.
    assert_eq!(server2.subscribes().len(), 2);
    assert_eq!(manager.state(), ConnectionState::Connected);

    // The original handler bindings still receive events.
    server2
        .inject
        .send(ServerFrame::Message {
            channel: "topics.update".into(),
            body: json!({"type": "TOPIC_UPDATE", "payload": {"topicName": "orders"}}),
        })
        .await
        .unwrap();
    let event = timeout(Duration::from_secs(1), queue.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.topic_name(), Some("orders"));
}

#[tokio::test]
async fn retries_exhausted_settles_disconnected() {
    let (client1, remote1) = tokio::io::duplex(4096);
    let mut server1 = TestServer::spawn(remote1);

    // Only one endpoint ever exists: every reconnect attempt fails.
    let manager = ConnectionManager::new(
        Arc::new(ScriptedConnector::new(vec![client1])),
        Arc::new(SubscriptionRegistry::new()),
        fast_config(),
    );
    let mut states = manager.states();
    manager.connect().await.unwrap();
    server1.drop_connection();

    let deadline = timeout(Duration::from_secs(2), async {
        loop {
            match states.recv().await {
                Ok(ConnectionState::Disconnected) => break,
                Ok(_) => continue,
                Err(_) => panic!("state stream closed early"),
            }
        }
    })
    .await;
    assert!(deadline.is_ok(), "should settle at DISCONNECTED");
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn end_to_end_event_pipeline_updates_graph() {
    let (client, remote) = tokio::io::duplex(4096);
    let server = TestServer::spawn(remote);

    let (reconciler, mut snapshots) = Reconciler::new(sample_store(), LiveMode::new(true));
    let (events, queue) = mpsc::channel::<MetricEvent>(64);
    tokio::spawn(reconciler.run(queue));

    let manager = ConnectionManager::new(
        Arc::new(ScriptedConnector::new(vec![client])),
        Arc::new(SubscriptionRegistry::new()),
        fast_config(),
    );
    manager.subscribe("topics.metrics", events).await;
    manager.connect().await.unwrap();
    wait_for_subscribes(&server, 1).await;

    // Initial derivation: monitored and quiet reads CONNECTED.
    assert_eq!(
        snapshots.borrow().node("topic-42").unwrap().status,
        Status::Connected
    );

    // A malformed payload first: dropped without consequence.
    server
        .inject
        .send(ServerFrame::Message {
            channel: "topics.metrics".into(),
            body: json!({"type": "NOT_A_THING", "payload": []}),
        })
        .await
        .unwrap();

    server
        .inject
        .send(ServerFrame::Message {
            channel: "topics.metrics".into(),
            body: json!({
                "type": "TOPIC_METRICS",
                "payload": {
                    "topicId": 42,
                    "throughputPerSecond": 3.0,
                    "consumerActive": true
                }
            }),
        })
        .await
        .unwrap();

    timeout(Duration::from_secs(2), async {
        loop {
            snapshots.changed().await.expect("reconciler alive");
            let snapshot = snapshots.borrow().clone();
            if snapshot.node("topic-42").unwrap().status == Status::Active {
                let edge = snapshot.edge("e1").unwrap();
                assert!(edge.animated);
                assert_eq!(edge.status, Status::Active);
                assert_eq!(edge.color, Status::Active.color());
                break;
            }
        }
    })
    .await
    .expect("metrics event should activate the node");
}

#[tokio::test]
async fn disconnect_unsubscribes_all_channels_first() {
    let (client, remote) = tokio::io::duplex(4096);
    let server = TestServer::spawn(remote);

    let manager = ConnectionManager::new(
        Arc::new(ScriptedConnector::new(vec![client])),
        Arc::new(SubscriptionRegistry::new()),
        fast_config(),
    );
    let (events, _queue) = mpsc::channel(16);
    manager.subscribe("topics.update", events.clone()).await;
    manager.subscribe("topics.metrics", events).await;
    manager.connect().await.unwrap();
    wait_for_subscribes(&server, 2).await;

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.registry().is_empty());

    // The frames are on the wire; wait for the server task to read them.
    timeout(Duration::from_secs(2), async {
        while !server.log.lock().contains(&ClientFrame::Disconnect) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("teardown frames should reach the server");

    let mut released = server.unsubscribes();
    released.sort();
    assert_eq!(released, ["topics.metrics", "topics.update"]);
    // The teardown frame went out after the unsubscribes.
    let last = server.log.lock().last().cloned();
    assert_eq!(last, Some(ClientFrame::Disconnect));
}

#[tokio::test]
async fn missed_heartbeats_trigger_reconnect_with_replay() {
    let (client1, remote1) = tokio::io::duplex(4096);
    let (client2, remote2) = tokio::io::duplex(4096);
    // The first backend completes the handshake but never answers PING.
    let _server1 = TestServer::spawn_unresponsive(remote1);
    let server2 = TestServer::spawn(remote2);

    let config = SyncConfig {
        heartbeat_interval: Duration::from_millis(30),
        heartbeat_missed_limit: 1,
        reconnect_delay: Duration::from_millis(10),
        max_reconnect_attempts: 3,
        ..fast_config()
    };
    let manager = ConnectionManager::new(
        Arc::new(ScriptedConnector::new(vec![client1, client2])),
        Arc::new(SubscriptionRegistry::new()),
        config,
    );
    let (events, _queue) = mpsc::channel(16);
    manager.subscribe("topics.metrics", events).await;

    let mut states = manager.states();
    manager.connect().await.unwrap();

    // Unanswered pings must drop the transport: ERRORED, then a fresh
    // handshake on the second endpoint.
    timeout(Duration::from_secs(2), async {
        let mut errored = false;
        loop {
            match states.recv().await {
                Ok(ConnectionState::Errored) => errored = true,
                Ok(ConnectionState::Connected) if errored => break,
                Ok(_) => continue,
                Err(_) => panic!("state stream closed early"),
            }
        }
    })
    .await
    .expect("session should pass through ERRORED and reconnect");

    wait_for_subscribes(&server2, 1).await;
    assert_eq!(server2.subscribes(), ["topics.metrics"]);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn disconnect_during_outage_aborts_retries() {
    let (client, remote) = tokio::io::duplex(4096);
    let mut server = TestServer::spawn(remote);

    // A long retry schedule: 5 attempts x 5 s. A disconnect issued during
    // the outage must not wait for any of it.
    let config = SyncConfig {
        reconnect_delay: Duration::from_secs(5),
        max_reconnect_attempts: 5,
        ..fast_config()
    };
    let manager = ConnectionManager::new(
        Arc::new(ScriptedConnector::new(vec![client])),
        Arc::new(SubscriptionRegistry::new()),
        config,
    );
    let (events, _queue) = mpsc::channel(16);
    manager.subscribe("topics.update", events).await;

    let mut states = manager.states();
    manager.connect().await.unwrap();
    server.drop_connection();

    // Wait until the session has entered the retry path.
    timeout(Duration::from_secs(2), async {
        loop {
            match states.recv().await {
                Ok(ConnectionState::Errored) => break,
                Ok(_) => continue,
                Err(_) => panic!("state stream closed early"),
            }
        }
    })
    .await
    .expect("dropped transport should surface as ERRORED");

    timeout(Duration::from_millis(500), manager.disconnect())
        .await
        .expect("disconnect should resolve without waiting out the retry delay");
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn connect_twice_is_rejected() {
    let (client, remote) = tokio::io::duplex(4096);
    let _server = TestServer::spawn(remote);

    let manager = ConnectionManager::new(
        Arc::new(ScriptedConnector::new(vec![client])),
        Arc::new(SubscriptionRegistry::new()),
        fast_config(),
    );
    manager.connect().await.unwrap();
    assert!(manager.connect().await.is_err());
}
