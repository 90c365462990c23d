//! Message Router
//!
//! Bridges inbound telemetry to converted per-field publications and turns
//! transport lifecycle events into log lines and subscriptions.

mod transform;


pub use transform::{to_milli, MilliScale, Transform};

use std::fmt;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, ParamConversion};
use crate::protocol::{ConnectReturnCode, QoS};
use crate::transport::{Publisher, TransportLogLevel};

/// Why an inbound payload could not be converted
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Payload is not UTF-8
    InvalidUtf8,
    /// Payload is not JSON
    InvalidJson(String),
    /// Payload is JSON but not an object
    NotAnObject,
    /// A configured field is absent
    MissingField(String),
    /// A configured field holds something other than a finite number
    NotNumeric(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidUtf8 => write!(f, "payload is not valid UTF-8"),
            ParseError::InvalidJson(e) => write!(f, "payload is not valid JSON: {}", e),
            ParseError::NotAnObject => write!(f, "payload is not a JSON object"),
            ParseError::MissingField(field) => write!(f, "field '{}' is missing", field),
            ParseError::NotNumeric(field) => write!(f, "field '{}' is not numeric", field),
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of routing one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Topic is not the subscribed one
    Ignored,
    /// Payload failed to parse; nothing was published
    Dropped(ParseError),
    /// Number of conversions handed to the transport
    Published(usize),
}

/// Read every configured field from a JSON payload, in table order
pub fn extract_fields(
    payload: &[u8],
    conversions: &[ParamConversion],
) -> Result<Vec<f64>, ParseError> {
    let text = std::str::from_utf8(payload).map_err(|_| ParseError::InvalidUtf8)?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let object = value.as_object().ok_or(ParseError::NotAnObject)?;

    conversions
        .iter()
        .map(|conv| {
            let raw = object
                .get(&conv.field)
                .ok_or_else(|| ParseError::MissingField(conv.field.clone()))?;
            numeric_value(raw).ok_or_else(|| ParseError::NotNumeric(conv.field.clone()))
        })
        .collect()
}

fn numeric_value(raw: &Value) -> Option<f64> {
    let number = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}

/// Routes bus messages through a [`Transform`] and reacts to connection
/// lifecycle events
pub struct MessageRouter<X = MilliScale> {
    topic: String,
    conversions: Vec<ParamConversion>,
    qos: QoS,
    retain: bool,
    transform: X,
}

impl MessageRouter<MilliScale> {
    pub fn from_config(config: &BridgeConfig) -> Self {
        MessageRouter::new(
            config.topic.clone(),
            config.param_conv.clone(),
            MilliScale::new(config.name.clone()),
        )
        .with_delivery(config.qos(), config.retain)
    }
}

impl<X: Transform> MessageRouter<X> {
    pub fn new(topic: String, conversions: Vec<ParamConversion>, transform: X) -> Self {
        Self {
            topic,
            conversions,
            qos: QoS::AtMostOnce,
            retain: false,
            transform,
        }
    }

    /// QoS and retain flag used for the subscription and publications
    pub fn with_delivery(mut self, qos: QoS, retain: bool) -> Self {
        self.qos = qos;
        self.retain = retain;
        self
    }

    /// Convert an inbound message and publish one message per configured
    /// field. A malformed payload is logged and dropped as a whole.
    pub async fn on_message<P>(&self, topic: &str, payload: &[u8], publisher: &mut P) -> Routed
    where
        P: Publisher + ?Sized,
    {
        if topic != self.topic {
            return Routed::Ignored;
        }

        let values = match extract_fields(payload, &self.conversions) {
            Ok(values) => values,
            Err(e) => {
                warn!(
                    "Message failed to parse: {} {:?} ({})",
                    topic,
                    String::from_utf8_lossy(payload),
                    e
                );
                return Routed::Dropped(e);
            }
        };

        let mut published = 0;
        for (conv, value) in self.conversions.iter().zip(values) {
            let (out_topic, out_payload) = self.transform.apply(conv, value);
            debug!("Publishing {} -> {} = {}", conv.field, out_topic, out_payload);
            match publisher
                .publish(&out_topic, Bytes::from(out_payload), self.qos, self.retain)
                .await
            {
                Ok(()) => published += 1,
                Err(e) => warn!("Failed to publish to {}: {}", out_topic, e),
            }
        }
        Routed::Published(published)
    }

    /// Log the CONNACK result and subscribe to the telemetry topic
    pub async fn on_connect<P>(&self, return_code: ConnectReturnCode, publisher: &mut P)
    where
        P: Publisher + ?Sized,
    {
        info!("MQTT Connected: {}", return_code);
        if !return_code.is_accepted() {
            warn!("Broker refused the connection, not subscribing");
            return;
        }
        if let Err(e) = publisher.subscribe(&self.topic, self.qos).await {
            warn!("Failed to subscribe to {}: {}", self.topic, e);
        }
    }

    /// Log a disconnect notification
    pub fn on_disconnect(&self, reason: u8) {
        warn!("MQTT Disconnected: {}", reason);
    }

    /// Re-emit a transport diagnostic at the matching severity
    pub fn on_log(&self, level: TransportLogLevel, message: &str) {
        match level {
            TransportLogLevel::Debug => debug!("MQTT transport: {}", message),
            TransportLogLevel::Info => info!("MQTT transport: {}", message),
            TransportLogLevel::Notice | TransportLogLevel::Warning => {
                warn!("MQTT transport: {}", message)
            }
            TransportLogLevel::Error => error!("MQTT transport: {}", message),
        }
    }
}
