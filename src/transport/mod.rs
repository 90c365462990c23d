//! Transport Layer
//!
//! The connection primitives the supervisor drives and the router publishes
//! through. `MqttClient` is the production implementation; tests inject
//! their own.

mod mqtt;

pub use mqtt::{ClientOptions, MqttClient};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::{ConnectReturnCode, DecodeError, EncodeError, QoS};

/// Disconnect reason: requested by this client
pub const DISCONNECT_NORMAL: u8 = 0;
/// Disconnect reason: the broker closed the connection
pub const DISCONNECT_CONNECTION_LOST: u8 = 7;
/// Disconnect reason: no PINGRESP within the keep-alive window
pub const DISCONNECT_KEEPALIVE: u8 = 16;

/// Error type for transport operations
#[derive(Debug)]
pub enum TransportError {
    /// Operating-system level socket failure (DNS, refused, unreachable)
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Connection dropped while in use
    ConnectionLost(String),
    /// Operation needs a live connection and there is none
    NotConnected,
    /// Broker answered CONNECT with a non-zero return code
    Refused(ConnectReturnCode),
    /// Broker sent something this client cannot make sense of
    Protocol(String),
}

impl TransportError {
    /// Whether the error is an expected network fault that a reconnect may
    /// cure. Everything else is an internal or protocol fault.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Protocol(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "I/O error: {}", e),
            TransportError::Timeout => write!(f, "Operation timed out"),
            TransportError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            TransportError::NotConnected => write!(f, "Not connected"),
            TransportError::Refused(code) => write!(f, "Connection refused: {}", code),
            TransportError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        TransportError::Protocol(format!("decode error: {}", e))
    }
}

impl From<EncodeError> for TransportError {
    fn from(e: EncodeError) -> Self {
        TransportError::Protocol(format!("encode error: {}", e))
    }
}

/// Severity of a transport diagnostic line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportLogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
}

/// Something that happened on the connection during a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// CONNACK received
    Connected { return_code: ConnectReturnCode },
    /// The session ended; `reason` is 0 when this client asked for it
    Disconnected { reason: u8 },
    /// Application message received on a subscribed topic
    Message { topic: String, payload: Bytes },
    /// Diagnostic line from the transport
    Log {
        level: TransportLogLevel,
        message: String,
    },
}

/// Publish/subscribe half of a transport, the part the router may use
#[async_trait]
pub trait Publisher: Send {
    /// Subscribe to a topic filter
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Publish an application message
    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;
}

/// Connection lifecycle half of a transport, owned by the supervisor
#[async_trait]
pub trait Transport: Publisher {
    /// Open a session to `host:port`
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        keep_alive: Duration,
    ) -> Result<(), TransportError>;

    /// Re-open the session to the last endpoint passed to `connect`
    async fn reconnect(&mut self) -> Result<(), TransportError>;

    /// Close the session; a no-op when not connected
    async fn disconnect(&mut self);

    /// Drive one round of network I/O, bounded by the transport's loop
    /// timeout, and return what happened
    async fn tick(&mut self) -> Result<Vec<TransportEvent>, TransportError>;
}
