//! nofp-bridge - MQTT telemetry bridge
//!
//! Subscribes to one MQTT topic carrying JSON telemetry, scales the
//! configured numeric fields to milli-units and republishes each one to its
//! own `<name>/<suffix>` topic, while keeping the broker connection alive
//! under bounded retry budgets.

pub mod codec;
pub mod config;
pub mod protocol;
pub mod router;
pub mod supervisor;
pub mod transport;

pub use config::{BridgeConfig, ConfigError, ParamConversion};
pub use protocol::QoS;
pub use router::{MessageRouter, MilliScale, ParseError, Transform};
pub use supervisor::{ConnectionSupervisor, StopFlag, Termination, TokioSleeper};
pub use transport::{ClientOptions, MqttClient, Transport, TransportError, TransportEvent};
