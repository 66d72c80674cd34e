//! MQTT Timestamper
//!
//! A relay that subscribes to a source topic filter, makes sure every JSON
//! object passing through carries a `timestamp`, and republishes it on a
//! rewritten topic.
//!
//! # Overview
//!
//! - [`relay::Relay`]: the timestamping relay, generic over any [`Connection`]
//! - [`connection::mqtt::MqttConnection`]: the production connection over rumqttc (MQTT v5)
//! - [`config::TimestamperConfig`]: TOML configuration for the service binary
//! - [`testing::MockConnection`]: a recording connection for tests
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_timestamper::connection::{InboundMessage, QoS};
//! use mqtt_timestamper::relay::{envelope::PublishOverrides, Relay, TopicRewrite};
//! use mqtt_timestamper::testing::MockConnection;
//! use std::sync::Arc;
//!
//! let connection = Arc::new(MockConnection::new());
//! let relay = Relay::new(
//!     connection.clone(),
//!     "raw/#",
//!     TopicRewrite {
//!         strip_prefix: Some("raw/".to_string()),
//!         prepend: Some("stamped/".to_string()),
//!         append: None,
//!     },
//!     Some(PublishOverrides::new(QoS::AtLeastOnce, false)),
//! )
//! .unwrap();
//!
//! // Subscribes once the connection comes up, and again after every reconnect
//! connection.fire_connect();
//! assert_eq!(connection.get_subscriptions().len(), 1);
//!
//! connection.fire_message(InboundMessage::new("raw/door", br#"{"open":true}"#.to_vec()));
//! let published = connection.get_published_messages();
//! assert_eq!(published[0].topic, "stamped/door");
//! assert_eq!(published[0].options.qos, QoS::AtLeastOnce);
//!
//! relay.stop();
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod observability;
pub mod relay;
pub mod testing;

pub use config::{ConfigError, TimestamperConfig};
pub use connection::{Connection, InboundMessage, PublishOptions, QoS};
pub use error::{TimestamperError, TimestamperResult};
pub use relay::envelope::PublishOverrides;
pub use relay::topic::{TopicRewrite, TopicTransformer};
pub use relay::Relay;
