//! MQTT Protocol definitions and types
//!
//! Defines the MQTT v3.1.1 types the bridge speaks as a client. The codec
//! also accepts the server side of each exchange so the same types can be
//! used by test brokers.

mod error;
mod packet;
mod return_code;

pub use error::{DecodeError, EncodeError};
pub use packet::*;
pub use return_code::ConnectReturnCode;

/// Protocol level sent in CONNECT for MQTT v3.1.1
pub const PROTOCOL_LEVEL_V311: u8 = 4;

/// Protocol name sent in CONNECT for MQTT v3.1.1
pub const PROTOCOL_NAME: &str = "MQTT";

/// SUBACK return code signalling a rejected subscription
pub const SUBACK_FAILURE: u8 = 0x80;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl std::fmt::Display for QoS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}
