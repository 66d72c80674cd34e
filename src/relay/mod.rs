//! The timestamping relay
//!
//! A [`Relay`] subscribes to a source topic filter, and for every fresh JSON
//! object it receives, makes sure a `timestamp` field is set and republishes
//! the object on the topic its [`TopicTransformer`] derives.
//!
//! ```
//! use mqtt_timestamper::relay::Relay;
//! use mqtt_timestamper::testing::MockConnection;
//! use mqtt_timestamper::connection::InboundMessage;
//! use std::sync::Arc;
//!
//! let connection = Arc::new(MockConnection::connected());
//! let relay = Relay::new(
//!     connection.clone(),
//!     "sensors/#",
//!     |topic: &str| format!("timestamped/{topic}"),
//!     None,
//! )
//! .unwrap();
//!
//! connection.fire_message(InboundMessage::new("sensors/kitchen", br#"{"temp":21}"#.to_vec()));
//!
//! let published = connection.get_published_messages();
//! assert_eq!(published[0].topic, "timestamped/sensors/kitchen");
//! assert!(published[0].json()["timestamp"].is_string());
//! relay.stop();
//! ```

pub mod envelope;
pub mod topic;

use crate::connection::{Connection, InboundMessage, ListenerId, QoS, TransportError};
use crate::error::{TimestamperError, TimestamperResult};
use chrono::Utc;
use envelope::{prepare_republish, PublishOverrides};
use std::sync::{Arc, Mutex, Weak};
use topic::validate_topic_filter;
use tracing::{debug, error, info};

pub use envelope::{Rejection, Republish, TIMESTAMP_FIELD};
pub use topic::{TopicError, TopicRewrite, TopicTransformer};

/// QoS requested for the source subscription unless configured otherwise
pub const DEFAULT_SUBSCRIBE_QOS: QoS = QoS::ExactlyOnce;

/// State shared with the listeners installed on the connection
struct RelayCore<C: Connection> {
    connection: Weak<C>,
    source_topic: String,
    subscribe_qos: QoS,
    transformer: Arc<dyn TopicTransformer>,
    overrides: PublishOverrides,
}

impl<C: Connection> RelayCore<C> {
    fn subscribe(&self) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        match connection.subscribe(&self.source_topic, self.subscribe_qos) {
            Ok(()) => debug!(
                target: "timestamper",
                source = %self.source_topic,
                qos = u8::from(self.subscribe_qos),
                "Subscribed to source topic"
            ),
            Err(e) => error!(
                target: "timestamper",
                source = %self.source_topic,
                "Failed to subscribe to source topic: {}", e
            ),
        }
    }

    fn handle_message(&self, message: &InboundMessage) {
        let _span =
            crate::relay_span!(source = %self.source_topic, topic = %message.topic).entered();

        let now = Utc::now();
        let republish =
            match prepare_republish(message, self.transformer.as_ref(), &self.overrides, now) {
                Ok(republish) => republish,
                Err(rejection) => {
                    debug!(target: "timestamper", "{}", rejection);
                    return;
                }
            };

        let Some(connection) = self.connection.upgrade() else {
            return;
        };

        let destination = republish.topic.clone();
        connection.publish(
            &republish.topic,
            republish.payload,
            republish.options,
            Box::new(move |result: Result<(), TransportError>| {
                if let Err(e) = result {
                    error!(
                        target: "timestamper",
                        destination = %destination,
                        "Error publishing timestamped message: {}", e
                    );
                }
            }),
        );
    }
}

/// Republishes JSON objects from a source filter with a guaranteed timestamp
///
/// The relay never owns the connection's lifecycle. It holds listeners on it
/// until [`Relay::stop`] is called or the relay is dropped.
pub struct Relay<C: Connection> {
    connection: Arc<C>,
    core: Arc<RelayCore<C>>,
    listeners: Mutex<Option<(ListenerId, ListenerId)>>,
}

impl<C: Connection> Relay<C> {
    /// Create a relay subscribing at [`DEFAULT_SUBSCRIBE_QOS`]
    ///
    /// Subscribes immediately when the connection is already up, and again on
    /// every later connect event.
    pub fn new<T>(
        connection: Arc<C>,
        source_topic: impl Into<String>,
        transformer: T,
        overrides: Option<PublishOverrides>,
    ) -> TimestamperResult<Self>
    where
        T: TopicTransformer + 'static,
    {
        Self::with_subscribe_qos(
            connection,
            source_topic,
            transformer,
            overrides,
            DEFAULT_SUBSCRIBE_QOS,
        )
    }

    /// Create a relay with an explicit QoS for the source subscription
    pub fn with_subscribe_qos<T>(
        connection: Arc<C>,
        source_topic: impl Into<String>,
        transformer: T,
        overrides: Option<PublishOverrides>,
        subscribe_qos: QoS,
    ) -> TimestamperResult<Self>
    where
        T: TopicTransformer + 'static,
    {
        let source_topic = source_topic.into();
        if source_topic.is_empty() {
            return Err(TimestamperError::invalid_argument(
                "source topic must not be empty",
            ));
        }
        validate_topic_filter(&source_topic)
            .map_err(|e| TimestamperError::invalid_topic(source_topic.clone(), e))?;

        let core = Arc::new(RelayCore {
            connection: Arc::downgrade(&connection),
            source_topic,
            subscribe_qos,
            transformer: Arc::new(transformer),
            overrides: overrides.unwrap_or_default(),
        });

        // Register before checking the state so a connect landing in between is not lost
        let on_connect = core.clone();
        let connect_id = connection.on_connect(Arc::new(move || on_connect.subscribe()));
        let on_message = core.clone();
        let message_id = connection.on_message(Arc::new(move |message: &InboundMessage| {
            on_message.handle_message(message)
        }));

        if connection.is_connected() {
            core.subscribe();
        }

        info!(target: "timestamper", source = %core.source_topic, "Relay started");

        Ok(Self {
            connection,
            core,
            listeners: Mutex::new(Some((connect_id, message_id))),
        })
    }

    /// Remove both listeners; later events no longer reach this relay
    ///
    /// Publishes already handed to the connection still complete.
    pub fn stop(&self) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some((connect_id, message_id)) = listeners {
            self.connection.remove_listener(connect_id);
            self.connection.remove_listener(message_id);
            info!(target: "timestamper", source = %self.core.source_topic, "Relay stopped");
        }
    }

    /// Drop the broker subscription for the source filter
    ///
    /// Independent of [`Relay::stop`]: a running relay subscribes again on
    /// the next connect event.
    pub fn unsubscribe(&self) -> TimestamperResult<()> {
        self.connection
            .unsubscribe(&self.core.source_topic)
            .map_err(|e| {
                error!(
                    target: "timestamper",
                    source = %self.core.source_topic,
                    "Failed to unsubscribe from source topic: {}", e
                );
                TimestamperError::from(e)
            })
    }

    /// Whether listeners are still installed
    pub fn is_running(&self) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// The filter this relay subscribes to
    pub fn source_topic(&self) -> &str {
        &self.core.source_topic
    }

    /// QoS requested for the source subscription
    pub fn subscribe_qos(&self) -> QoS {
        self.core.subscribe_qos
    }
}

impl<C: Connection> Drop for Relay<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<C: Connection> std::fmt::Debug for Relay<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("source_topic", &self.core.source_topic)
            .field("subscribe_qos", &self.core.subscribe_qos)
            .field("overrides", &self.core.overrides)
            .field("running", &self.is_running())
            .finish()
    }
}
