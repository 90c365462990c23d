//! Bridge Integration Tests
//!
//! Runs the supervisor with the real MQTT client against an in-process fake
//! broker that speaks just enough MQTT v3.1.1 through the crate's codec.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use nofp_bridge::codec::{Decoder, Encoder};
use nofp_bridge::config::BridgeConfig;
use nofp_bridge::protocol::{ConnAck, ConnectReturnCode, Connect, Packet, Publish, QoS, SubAck};
use nofp_bridge::supervisor::{ConnectionSupervisor, StopFlag, Termination, TokioSleeper};
use nofp_bridge::transport::{ClientOptions, MqttClient};

const WAIT: Duration = Duration::from_secs(5);

/// One accepted client connection on the fake broker
struct BrokerConn {
    stream: TcpStream,
    buf: BytesMut,
    decoder: Decoder,
    encoder: Encoder,
}

impl BrokerConn {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        }
    }

    async fn recv(&mut self) -> Packet {
        loop {
            if let Some((packet, used)) = self.decoder.decode(&self.buf).unwrap() {
                self.buf.advance(used);
                return packet;
            }
            let n = timeout(WAIT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for a packet")
                .unwrap();
            assert!(n > 0, "client closed the connection");
        }
    }

    async fn send(&mut self, packet: Packet) {
        self.send_all(vec![packet]).await;
    }

    /// Write several packets with a single `write_all`
    async fn send_all(&mut self, packets: Vec<Packet>) {
        let mut out = BytesMut::new();
        for packet in &packets {
            self.encoder.encode(packet, &mut out).unwrap();
        }
        self.stream.write_all(&out).await.unwrap();
    }

    /// CONNECT -> CONNACK, returns the client's CONNECT
    async fn handshake(&mut self, return_code: ConnectReturnCode) -> Connect {
        let connect = match self.recv().await {
            Packet::Connect(connect) => *connect,
            other => panic!("expected CONNECT, got {:?}", other),
        };
        self.send(Packet::ConnAck(ConnAck {
            session_present: false,
            return_code,
        }))
        .await;
        connect
    }

    /// SUBSCRIBE -> SUBACK, returns the subscribed filter
    async fn expect_subscribe(&mut self) -> String {
        let subscribe = match self.recv().await {
            Packet::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        self.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes: vec![0],
        }))
        .await;
        subscribe.subscriptions[0].filter.clone()
    }

    async fn expect_publish(&mut self) -> (String, String) {
        match self.recv().await {
            Packet::Publish(publish) => (
                publish.topic,
                String::from_utf8(publish.payload.to_vec()).unwrap(),
            ),
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &str) {
        self.send(Packet::Publish(Publish {
            topic: topic.to_string(),
            payload: Bytes::from(payload.to_string()),
            ..Default::default()
        }))
        .await;
    }
}

fn bridge_config(port: u16, extra: &str) -> BridgeConfig {
    BridgeConfig::parse(&format!(
        r#"
name = "nofp"
broker = "127.0.0.1"
port = {}
timeout = 5
topic = "hal/nofp"
param_conv = [["voltage", "mv"], ["current", "ma"]]
client_id = "nofp-bridge-test"
retry_backoff = "10ms"
loop_timeout = "50ms"
{}
"#,
        port, extra
    ))
    .unwrap()
}

fn spawn_bridge(config: BridgeConfig) -> (StopFlag, JoinHandle<Termination>) {
    let stop = StopFlag::new();
    let running = stop.clone();
    let handle = tokio::spawn(async move {
        let transport = MqttClient::new(ClientOptions::from_config(&config));
        let mut supervisor = ConnectionSupervisor::new(&config, transport, TokioSleeper, running);
        supervisor.run().await
    });
    (stop, handle)
}

async fn finished(handle: JoinHandle<Termination>) -> Termination {
    timeout(WAIT, handle)
        .await
        .expect("bridge did not terminate")
        .unwrap()
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn test_bridge_converts_and_publishes() {
    let (listener, port) = listener().await;
    let (stop, handle) = spawn_bridge(bridge_config(port, ""));

    let mut broker = BrokerConn::accept(&listener).await;
    let connect = broker.handshake(ConnectReturnCode::Accepted).await;
    assert_eq!(connect.client_id, "nofp-bridge-test");
    assert_eq!(connect.keep_alive, 5);
    assert_eq!(broker.expect_subscribe().await, "hal/nofp");

    // dropped without side effects
    broker.publish("hal/nofp", "not json").await;
    broker.publish("hal/nofp", r#"{"voltage": 1.0}"#).await;

    broker
        .publish("hal/nofp", r#"{"voltage": 12.345, "current": -0.0004}"#)
        .await;
    assert_eq!(
        broker.expect_publish().await,
        ("nofp/mv".to_string(), "12345".to_string())
    );
    assert_eq!(
        broker.expect_publish().await,
        ("nofp/ma".to_string(), "0".to_string())
    );

    stop.request_stop();
    let termination = finished(handle).await;
    assert_eq!(termination, Termination::Shutdown);
    assert_eq!(termination.exit_code(), 0);
    assert!(matches!(broker.recv().await, Packet::Disconnect));
}

#[tokio::test]
async fn test_message_queued_behind_connack_is_converted() {
    let (listener, port) = listener().await;
    let (stop, handle) = spawn_bridge(bridge_config(
        port,
        "keep_alive = 60\nclean_session = false",
    ));

    let mut broker = BrokerConn::accept(&listener).await;
    match broker.recv().await {
        Packet::Connect(_) => {}
        other => panic!("expected CONNECT, got {:?}", other),
    }
    // a persistent session: the backlog follows the CONNACK in one write
    broker
        .send_all(vec![
            Packet::ConnAck(ConnAck {
                session_present: true,
                return_code: ConnectReturnCode::Accepted,
            }),
            Packet::Publish(Publish {
                topic: "hal/nofp".to_string(),
                payload: Bytes::from_static(br#"{"voltage": 4.2, "current": 0.25}"#),
                ..Default::default()
            }),
        ])
        .await;

    // left unanswered so nothing else reaches the client
    match broker.recv().await {
        Packet::Subscribe(_) => {}
        other => panic!("expected SUBSCRIBE, got {:?}", other),
    }
    assert_eq!(
        broker.expect_publish().await,
        ("nofp/mv".to_string(), "4200".to_string())
    );
    assert_eq!(
        broker.expect_publish().await,
        ("nofp/ma".to_string(), "250".to_string())
    );

    stop.request_stop();
    assert_eq!(finished(handle).await, Termination::Shutdown);
}

#[tokio::test]
async fn test_qos1_delivery_is_acknowledged() {
    let (listener, port) = listener().await;
    let (stop, handle) = spawn_bridge(bridge_config(port, "qos = 1"));

    let mut broker = BrokerConn::accept(&listener).await;
    broker.handshake(ConnectReturnCode::Accepted).await;
    broker.expect_subscribe().await;

    broker
        .send(Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            topic: "hal/nofp".to_string(),
            packet_id: Some(42),
            payload: Bytes::from_static(br#"{"voltage": 2, "current": 3}"#),
            ..Default::default()
        }))
        .await;

    match broker.recv().await {
        Packet::PubAck(puback) => assert_eq!(puback.packet_id, 42),
        other => panic!("expected PUBACK, got {:?}", other),
    }
    match broker.recv().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic, "nofp/mv");
            assert_eq!(publish.qos, QoS::AtLeastOnce);
            assert!(publish.packet_id.is_some());
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }

    stop.request_stop();
    assert_eq!(finished(handle).await, Termination::Shutdown);
}

#[tokio::test]
async fn test_startup_exhaustion_against_closed_port() {
    let (listener, port) = listener().await;
    drop(listener);

    let (_stop, handle) = spawn_bridge(bridge_config(port, "max_startup = 2"));

    let termination = finished(handle).await;
    assert_eq!(termination, Termination::StartupExhausted { attempts: 2 });
    assert_eq!(termination.exit_code(), 1);
}

#[tokio::test]
async fn test_refused_connack_counts_as_failed_startup() {
    let (listener, port) = listener().await;
    let (_stop, handle) = spawn_bridge(bridge_config(port, "max_startup = 2"));

    for _ in 0..2 {
        let mut broker = BrokerConn::accept(&listener).await;
        broker.handshake(ConnectReturnCode::NotAuthorized).await;
    }

    assert_eq!(
        finished(handle).await,
        Termination::StartupExhausted { attempts: 2 }
    );
}

#[tokio::test]
async fn test_reconnects_after_broker_drops_connection() {
    let (listener, port) = listener().await;
    let (stop, handle) = spawn_bridge(bridge_config(port, ""));

    let mut first = BrokerConn::accept(&listener).await;
    first.handshake(ConnectReturnCode::Accepted).await;
    first.expect_subscribe().await;
    drop(first);

    let mut second = BrokerConn::accept(&listener).await;
    second.handshake(ConnectReturnCode::Accepted).await;
    assert_eq!(second.expect_subscribe().await, "hal/nofp");

    second
        .publish("hal/nofp", r#"{"voltage": 0.001, "current": 1}"#)
        .await;
    assert_eq!(
        second.expect_publish().await,
        ("nofp/mv".to_string(), "1".to_string())
    );

    stop.request_stop();
    assert_eq!(finished(handle).await, Termination::Shutdown);
}

#[tokio::test]
async fn test_unexpected_packet_is_fatal() {
    let (listener, port) = listener().await;
    let (_stop, handle) = spawn_bridge(bridge_config(port, ""));

    let mut broker = BrokerConn::accept(&listener).await;
    broker.handshake(ConnectReturnCode::Accepted).await;
    broker.expect_subscribe().await;
    broker
        .send(Packet::Connect(Box::new(Connect {
            client_id: "rogue".to_string(),
            ..Default::default()
        })))
        .await;

    let termination = finished(handle).await;
    assert!(matches!(termination, Termination::UnexpectedFault(_)));
    assert_eq!(termination.exit_code(), 2);
}
