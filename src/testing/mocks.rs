//! Mock implementations for testing
//!
//! Provides a mock [`Connection`] that records every protocol call and lets
//! tests fire connect and message events by hand.

use crate::connection::{
    ConnectHandler, Connection, InboundMessage, ListenerId, ListenerRegistry, MessageHandler,
    PublishCallback, PublishOptions, QoS, TransportError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A publish as the connection received it
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

impl PublishedMessage {
    /// Parse the payload as JSON
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Mock connection for testing
///
/// Publish completions run inline, before `publish` returns.
#[derive(Debug, Default)]
pub struct MockConnection {
    connected: AtomicBool,
    pub listeners: ListenerRegistry,
    pub subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    pub unsubscriptions: Arc<Mutex<Vec<String>>>,
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub should_fail_publish: AtomicBool,
    pub should_fail_subscribe: AtomicBool,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that already reports an established connection
    pub fn connected() -> Self {
        let mock = Self::default();
        mock.connected.store(true, Ordering::SeqCst);
        mock
    }

    /// A mock whose publishes all complete with an error
    pub fn with_publish_failure() -> Self {
        let mock = Self::connected();
        mock.should_fail_publish.store(true, Ordering::SeqCst);
        mock
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Mark the connection established and notify connect listeners
    pub fn fire_connect(&self) {
        self.set_connected(true);
        self.listeners.dispatch_connect();
    }

    /// Deliver a message to every message listener
    pub fn fire_message(&self, message: InboundMessage) {
        self.listeners.dispatch_message(&message);
    }

    pub fn get_subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_history(&self) {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.unsubscriptions.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.published_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Connection for MockConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn on_connect(&self, handler: ConnectHandler) -> ListenerId {
        self.listeners.add_connect(handler)
    }

    fn on_message(&self, handler: MessageHandler) -> ListenerId {
        self.listeners.add_message(handler)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        if self.should_fail_subscribe.load(Ordering::SeqCst) {
            return Err("Mock subscribe failure".into());
        }
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((filter.to_string(), qos));
        Ok(())
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.unsubscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(filter.to_string());
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
        on_complete: PublishCallback,
    ) {
        self.published_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                options,
            });

        if self.should_fail_publish.load(Ordering::SeqCst) {
            on_complete(Err("Mock publish failure".into()));
        } else {
            on_complete(Ok(()));
        }
    }
}
