//! # MQTT Session Module
//!
//! Keeps a single MQTT connection usable for many logical subscribers. The
//! module sits between the device application and one wire client and owns
//! everything that has to survive a reconnect: which topics are wanted, by
//! whom, at which QoS, and which of those the broker has confirmed.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs              - Connection parameters and session settings
//! ├── error.rs               - Error taxonomy of the session layer
//! ├── message_manager.rs     - Inbound messages, handlers, outward notifications
//! ├── subscription_table.rs  - Bounded registry of (topic, handler) registrations
//! ├── reassembly.rs          - Rebuilds chunked publish payloads
//! ├── event_translator.rs    - Transport events -> table mutations and notifications
//! ├── transport.rs           - Contract of the wire client collaborator
//! ├── rumqtt_transport.rs    - Transport implementation over rumqttc
//! └── mqtt_handler.rs        - Session controller (public entry point)
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! caller ──► MqttHandler ──► SubscriptionTable ──► Transport (subscribe/publish)
//!                                                      │
//! handlers ◄── SubscriptionTable ◄── EventTranslator ◄─┘ (TransportEvent)
//!                                        │
//!                                        └──► Notification stream
//! ```
//!
//! All mutable state sits behind one lock inside [`MqttHandler`]. Caller
//! operations and the transport's event stream both go through that lock, so
//! they never interleave on the table or the reassembly buffer.

pub mod config;
pub mod error;
pub mod event_translator;
pub mod message_manager;
pub mod mqtt_handler;
pub mod reassembly;
pub mod rumqtt_transport;
pub mod subscription_table;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use config::{ConnectionParams, SessionSettings};
pub use error::SessionError;
pub use message_manager::{InboundMessage, MessageHandler, Notification};
pub use mqtt_handler::{ConnectionState, MqttHandler, MqttStatus};
pub use rumqtt_transport::RumqttTransport;
pub use subscription_table::{SubscriptionInfo, SubscriptionState};
pub use transport::{DataChunk, EventSink, RequestId, Transport, TransportError, TransportEvent};

/// Delivery guarantee requested for a subscription or a publish.
///
/// Ordered so that `max()` picks the stronger guarantee; the table relies on
/// that when several registrations share one topic.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// QoS 0, fire and forget
    #[default]
    AtMostOnce = 0,
    /// QoS 1, acknowledged delivery, duplicates possible
    AtLeastOnce = 1,
    /// QoS 2, assured single delivery
    ExactlyOnce = 2,
}

/// Raised when a numeric QoS level outside 0..=2 is converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid QoS level: {0} (expected 0, 1 or 2)")]
pub struct InvalidQoS(pub u8);

impl TryFrom<u8> for QoS {
    type Error = InvalidQoS;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}
