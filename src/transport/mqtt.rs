//! MQTT v3.1.1 Client Transport
//!
//! A single-session client over TCP. Unlike a callback-driven client, every
//! CONNACK, inbound PUBLISH, disconnect and diagnostic line is queued as a
//! `TransportEvent` and handed back from the next `tick()`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{
    Publisher, Transport, TransportError, TransportEvent, TransportLogLevel,
    DISCONNECT_CONNECTION_LOST, DISCONNECT_KEEPALIVE, DISCONNECT_NORMAL,
};
use crate::codec::{Decoder, Encoder, DEFAULT_MAX_PACKET_SIZE};
use crate::config::BridgeConfig;
use crate::protocol::{Connect, Packet, PubAck, Publish, QoS, Subscribe, Subscription};

const READ_CHUNK: usize = 4096;

/// Client session options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Client ID presented in CONNECT
    pub client_id: String,
    /// Username for authentication
    pub username: Option<String>,
    /// Password for authentication
    pub password: Option<String>,
    /// Clean session flag
    pub clean_session: bool,
    /// Bound on TCP connect and on waiting for CONNACK
    pub connect_timeout: Duration,
    /// Bound on a single `tick()`
    pub loop_timeout: Duration,
    /// Largest inbound packet accepted
    pub max_packet_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            username: None,
            password: None,
            clean_session: true,
            connect_timeout: Duration::from_secs(60),
            loop_timeout: Duration::from_secs(1),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            clean_session: config.clean_session,
            connect_timeout: config.connect_timeout_duration(),
            loop_timeout: config.loop_timeout,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
    keep_alive: Duration,
}

struct Session {
    stream: TcpStream,
    read_buf: BytesMut,
    last_outbound: Instant,
    ping_sent_at: Option<Instant>,
}

/// MQTT client implementing [`Transport`]
pub struct MqttClient {
    options: ClientOptions,
    endpoint: Option<Endpoint>,
    session: Option<Session>,
    encoder: Encoder,
    decoder: Decoder,
    pending: Vec<TransportEvent>,
    next_packet_id: u16,
}

impl MqttClient {
    pub fn new(options: ClientOptions) -> Self {
        let decoder = Decoder::new().with_max_packet_size(options.max_packet_size);
        Self {
            options,
            endpoint: None,
            session: None,
            encoder: Encoder::new(),
            decoder,
            pending: Vec::new(),
            next_packet_id: 1,
        }
    }

    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }

    fn log(&mut self, level: TransportLogLevel, message: String) {
        self.pending.push(TransportEvent::Log { level, message });
    }

    /// Forget the session and report it to the next tick
    fn drop_session(&mut self, reason: u8) {
        self.session = None;
        self.pending.push(TransportEvent::Disconnected { reason });
    }

    /// Open TCP, send CONNECT and wait for an accepting CONNACK
    async fn establish(&mut self) -> Result<(), TransportError> {
        let endpoint = self.endpoint.clone().ok_or(TransportError::NotConnected)?;
        self.session = None;

        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        let mut stream = timeout(self.options.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;

        let keep_alive = u16::try_from(endpoint.keep_alive.as_secs()).unwrap_or(u16::MAX);
        let connect = Packet::Connect(Box::new(Connect {
            client_id: self.options.client_id.clone(),
            clean_session: self.options.clean_session,
            keep_alive,
            username: self.options.username.clone(),
            password: self
                .options
                .password
                .as_ref()
                .map(|p| Bytes::from(p.clone())),
        }));

        let mut buf = BytesMut::new();
        self.encoder.encode(&connect, &mut buf)?;
        stream.write_all(&buf).await?;

        let mut read_buf = BytesMut::with_capacity(READ_CHUNK);
        let reply = timeout(
            self.options.connect_timeout,
            read_packet(&self.decoder, &mut stream, &mut read_buf),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let connack = match reply {
            Packet::ConnAck(connack) => connack,
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected CONNACK, got {}",
                    other.name()
                )))
            }
        };
        if !connack.return_code.is_accepted() {
            return Err(TransportError::Refused(connack.return_code));
        }

        self.session = Some(Session {
            stream,
            read_buf,
            last_outbound: Instant::now(),
            ping_sent_at: None,
        });
        self.log(
            TransportLogLevel::Debug,
            format!(
                "Sending CONNECT (c{}, k{}) client_id={}",
                u8::from(self.options.clean_session),
                keep_alive,
                self.options.client_id
            ),
        );
        self.log(
            TransportLogLevel::Debug,
            format!(
                "Received CONNACK ({}, {})",
                u8::from(connack.session_present),
                connack.return_code as u8
            ),
        );
        self.pending.push(TransportEvent::Connected {
            return_code: connack.return_code,
        });
        Ok(())
    }

    /// Encode and write one packet on the live session
    async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf)?;

        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        match session.stream.write_all(&buf).await {
            Ok(()) => {
                session.last_outbound = Instant::now();
            }
            Err(e) => {
                self.session = None;
                return Err(TransportError::ConnectionLost(e.to_string()));
            }
        }

        self.log(TransportLogLevel::Debug, format!("Sending {}", packet.name()));
        Ok(())
    }

    /// Send PINGREQ when the link has been idle for the keep-alive period,
    /// and give up on the session if the previous one went unanswered
    async fn service_keep_alive(&mut self) -> Result<(), TransportError> {
        let keep_alive = match &self.endpoint {
            Some(endpoint) if !endpoint.keep_alive.is_zero() => endpoint.keep_alive,
            _ => return Ok(()),
        };
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        let ping_sent_at = session.ping_sent_at;
        let idle = session.last_outbound.elapsed();

        match ping_sent_at {
            Some(sent) if sent.elapsed() >= keep_alive => {
                self.log(
                    TransportLogLevel::Warning,
                    "No PINGRESP within keep-alive period, closing connection".to_string(),
                );
                self.drop_session(DISCONNECT_KEEPALIVE);
            }
            Some(_) => {}
            None if idle >= keep_alive => {
                self.send(&Packet::PingReq).await?;
                if let Some(session) = self.session.as_mut() {
                    session.ping_sent_at = Some(Instant::now());
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Process every complete packet already buffered, returning how many
    /// there were
    async fn drain_buffered(&mut self) -> Result<usize, TransportError> {
        let mut handled = 0;
        loop {
            let Some(session) = self.session.as_mut() else {
                return Ok(handled);
            };
            let Some((packet, used)) = self.decoder.decode(&session.read_buf)? else {
                return Ok(handled);
            };
            session.read_buf.advance(used);
            self.handle_incoming(packet).await?;
            handled += 1;
        }
    }

    /// Process buffered packets, or wait up to the loop timeout for inbound
    /// data and process every complete packet it contains
    async fn read_round(&mut self) -> Result<(), TransportError> {
        // Bytes that arrived together with the CONNACK, or after a partial frame
        if self.drain_buffered().await? > 0 {
            return Ok(());
        }

        let loop_timeout = self.options.loop_timeout;
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        session.read_buf.reserve(READ_CHUNK);
        let read = match timeout(loop_timeout, session.stream.read_buf(&mut session.read_buf)).await
        {
            Ok(read) => read,
            // Nothing arrived within this tick
            Err(_) => return Ok(()),
        };

        match read {
            Ok(0) => {
                self.log(
                    TransportLogLevel::Info,
                    "Connection closed by broker".to_string(),
                );
                self.drop_session(DISCONNECT_CONNECTION_LOST);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                self.session = None;
                return Err(TransportError::Timeout);
            }
            Err(e) => {
                self.session = None;
                return Err(TransportError::ConnectionLost(e.to_string()));
            }
        }

        self.drain_buffered().await?;
        Ok(())
    }

    async fn handle_incoming(&mut self, packet: Packet) -> Result<(), TransportError> {
        match packet {
            Packet::Publish(publish) => {
                self.log(
                    TransportLogLevel::Debug,
                    format!(
                        "Received PUBLISH (d{}, q{}, r{}, m{}), '{}', ... ({} bytes)",
                        u8::from(publish.dup),
                        publish.qos,
                        u8::from(publish.retain),
                        publish.packet_id.unwrap_or(0),
                        publish.topic,
                        publish.payload.len()
                    ),
                );
                match (publish.qos, publish.packet_id) {
                    (QoS::AtMostOnce, _) => {}
                    (QoS::AtLeastOnce, Some(packet_id)) => {
                        self.send(&Packet::PubAck(PubAck { packet_id })).await?;
                    }
                    _ => {
                        return Err(TransportError::Protocol(format!(
                            "unsupported QoS {} delivery on '{}'",
                            publish.qos, publish.topic
                        )));
                    }
                }
                self.pending.push(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                });
            }
            Packet::PingResp => {
                if let Some(session) = self.session.as_mut() {
                    session.ping_sent_at = None;
                }
                self.log(TransportLogLevel::Debug, "Received PINGRESP".to_string());
            }
            Packet::SubAck(suback) => {
                if suback.has_failures() {
                    self.log(
                        TransportLogLevel::Warning,
                        format!("Subscription refused by broker (mid {})", suback.packet_id),
                    );
                } else {
                    self.log(
                        TransportLogLevel::Debug,
                        format!(
                            "Received SUBACK (mid {}, granted {:?})",
                            suback.packet_id, suback.return_codes
                        ),
                    );
                }
            }
            Packet::PubAck(puback) => {
                self.log(
                    TransportLogLevel::Debug,
                    format!("Received PUBACK (mid {})", puback.packet_id),
                );
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "unexpected {} from broker",
                    other.name()
                )));
            }
        }
        Ok(())
    }
}

/// Read until the decoder yields one packet
async fn read_packet(
    decoder: &Decoder,
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<Packet, TransportError> {
    loop {
        if let Some((packet, used)) = decoder.decode(buf)? {
            buf.advance(used);
            return Ok(packet);
        }
        buf.reserve(READ_CHUNK);
        let n = stream
            .read_buf(buf)
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
        if n == 0 {
            return Err(TransportError::ConnectionLost(
                "connection closed by broker".to_string(),
            ));
        }
    }
}

#[async_trait]
impl Publisher for MqttClient {
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let packet_id = self.next_packet_id();
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: topic.to_string(),
                qos,
            }],
        }))
        .await
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(self.next_packet_id()),
        };
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload,
        }))
        .await
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        keep_alive: Duration,
    ) -> Result<(), TransportError> {
        self.endpoint = Some(Endpoint {
            host: host.to_string(),
            port,
            keep_alive,
        });
        self.establish().await
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        if let Some(mut session) = self.session.take() {
            let _ = session.stream.shutdown().await;
        }
        self.establish().await
    }

    async fn disconnect(&mut self) {
        if self.session.is_none() {
            return;
        }
        // Best effort: the session is gone either way
        let _ = self.send(&Packet::Disconnect).await;
        if let Some(mut session) = self.session.take() {
            let _ = session.stream.shutdown().await;
        }
        self.pending.push(TransportEvent::Disconnected {
            reason: DISCONNECT_NORMAL,
        });
    }

    async fn tick(&mut self) -> Result<Vec<TransportEvent>, TransportError> {
        // Queued events stay queued until a session is back
        if self.session.is_none() {
            return Err(TransportError::NotConnected);
        }

        self.service_keep_alive().await?;
        self.read_round().await?;
        Ok(std::mem::take(&mut self.pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ConnAck;

    /// Accept one client and answer its CONNECT with `reply` in a single
    /// write. The socket stays open while the handle is alive.
    async fn serve_once(reply: Vec<Packet>) -> (u16, tokio::task::JoinHandle<TcpStream>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let packet = read_packet(&Decoder::new(), &mut stream, &mut buf)
                .await
                .unwrap();
            assert!(matches!(packet, Packet::Connect(_)));

            let mut encoder = Encoder::new();
            let mut out = BytesMut::new();
            for packet in &reply {
                encoder.encode(packet, &mut out).unwrap();
            }
            stream.write_all(&out).await.unwrap();
            stream
        });
        (port, handle)
    }

    fn test_options() -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_secs(2),
            loop_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn test_packet_ids_skip_zero() {
        let mut client = MqttClient::new(ClientOptions::default());
        client.next_packet_id = u16::MAX;
        assert_eq!(client.next_packet_id(), u16::MAX);
        assert_eq!(client.next_packet_id(), 1);
    }

    #[test]
    fn test_options_from_config() {
        let config = BridgeConfig {
            client_id: "bridge-1".to_string(),
            username: Some("user".to_string()),
            timeout: 5,
            loop_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let options = ClientOptions::from_config(&config);
        assert_eq!(options.client_id, "bridge-1");
        assert_eq!(options.username.as_deref(), Some("user"));
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.loop_timeout, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_tick_without_session_is_not_connected() {
        let mut client = MqttClient::new(ClientOptions::default());
        assert!(client.session.is_none());
        assert!(matches!(
            client.tick().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_before_connect() {
        let mut client = MqttClient::new(ClientOptions::default());
        assert!(matches!(
            client.reconnect().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_publish_without_session() {
        let mut client = MqttClient::new(ClientOptions::default());
        let result = client
            .publish("nofp/mv", Bytes::from_static(b"1"), QoS::AtMostOnce, false)
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_refused_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = MqttClient::new(ClientOptions {
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let err = client
            .connect("127.0.0.1", port, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(client.session.is_none());
    }

    #[tokio::test]
    async fn test_publish_sharing_a_segment_with_connack_is_delivered() {
        let (port, _broker) = serve_once(vec![
            Packet::ConnAck(ConnAck::default()),
            Packet::Publish(Publish {
                topic: "hal/nofp".to_string(),
                payload: Bytes::from_static(br#"{"voltage": 1}"#),
                ..Default::default()
            }),
        ])
        .await;

        let mut client = MqttClient::new(test_options());
        client
            .connect("127.0.0.1", port, Duration::from_secs(60))
            .await
            .unwrap();

        // the broker sends nothing more, so the first tick must decode
        // what is already buffered
        let events = client.tick().await.unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, TransportEvent::Connected { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::Message { topic, .. } if topic == "hal/nofp"
        )));
    }

    #[tokio::test]
    async fn test_tick_after_lost_session_keeps_events_queued() {
        let (port, _broker) = serve_once(vec![Packet::ConnAck(ConnAck::default())]).await;

        let mut client = MqttClient::new(test_options());
        client
            .connect("127.0.0.1", port, Duration::from_secs(60))
            .await
            .unwrap();
        client.tick().await.unwrap();

        // state left behind by a failed write
        client.session = None;
        client.log(TransportLogLevel::Debug, "Sending PUBLISH".to_string());

        assert!(matches!(
            client.tick().await,
            Err(TransportError::NotConnected)
        ));
        assert_eq!(client.pending.len(), 1);
    }
}
