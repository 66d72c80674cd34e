//! MQTT v5 connection built on rumqttc
//!
//! Split into pure parts (state transitions, option building, event routing)
//! and the impure client that owns the event loop.

pub mod client;
pub mod event_router;
pub mod options;

pub use client::MqttConnection;
pub use event_router::{route_mqtt_event, EventRoute};
pub use options::{
    configure_mqtt_options, ConnectionEvent, ConnectionState, MqttError, ReconnectConfig,
    ReconnectionDecision,
};
