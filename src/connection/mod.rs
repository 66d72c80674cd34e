//! Broker connection contract consumed by the relay
//!
//! This module provides the connection abstraction the [`Relay`](crate::relay::Relay)
//! registers its listeners against, plus the MQTT implementation used in production.
//! The relay never owns the connection: it only adds/removes listeners and issues
//! subscribe, unsubscribe and publish calls.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub mod mqtt;

/// Error reported by a connection operation
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// Handler invoked every time the connection is (re-)established
pub type ConnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Handler invoked for every inbound message
pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Completion signal for a single publish; may run long after `publish` returned
pub type PublishCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Delivery-guarantee tier for subscribe and publish operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("QoS level must be 0, 1 or 2, got {other}")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos as u8
    }
}

/// A message delivered by the broker, with its delivery metadata
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    /// Set when the broker replays its stored last value rather than a fresh publish
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Effective options for one publish call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

/// Stable identity of a registered listener, used to deregister it later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Publish/subscribe connection as seen by the relay
///
/// Implementations dispatch connect and message events to every registered
/// listener, in registration order, on their own dispatch context. Handlers
/// must not block.
pub trait Connection: Send + Sync + 'static {
    /// Whether the connection is currently established
    fn is_connected(&self) -> bool;

    /// Register a listener for connection-established events
    fn on_connect(&self, handler: ConnectHandler) -> ListenerId;

    /// Register a listener for message-received events
    fn on_message(&self, handler: MessageHandler) -> ListenerId;

    /// Remove a previously registered listener; returns false if it was not registered
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Request a subscription to a topic filter
    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    /// Request removal of a subscription
    fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Start a publish; `on_complete` observes the outcome independently
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
        on_complete: PublishCallback,
    );
}

/// Listener bookkeeping shared by connection implementations
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    connect: Mutex<Vec<(ListenerId, ConnectHandler)>>,
    message: Mutex<Vec<(ListenerId, MessageHandler)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_connect(&self, handler: ConnectHandler) -> ListenerId {
        let id = self.allocate_id();
        lock(&self.connect).push((id, handler));
        id
    }

    pub fn add_message(&self, handler: MessageHandler) -> ListenerId {
        let id = self.allocate_id();
        lock(&self.message).push((id, handler));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut connect = lock(&self.connect);
        if let Some(pos) = connect.iter().position(|(existing, _)| *existing == id) {
            connect.remove(pos);
            return true;
        }
        drop(connect);

        let mut message = lock(&self.message);
        if let Some(pos) = message.iter().position(|(existing, _)| *existing == id) {
            message.remove(pos);
            return true;
        }
        false
    }

    /// Number of registered (connect, message) listeners
    pub fn counts(&self) -> (usize, usize) {
        (lock(&self.connect).len(), lock(&self.message).len())
    }

    pub fn dispatch_connect(&self) {
        // Snapshot first: handlers may add or remove listeners while running.
        let handlers: Vec<ConnectHandler> = lock(&self.connect)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler();
        }
    }

    pub fn dispatch_message(&self, message: &InboundMessage) {
        let handlers: Vec<MessageHandler> = lock(&self.message)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(message);
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (connect, message) = self.counts();
        f.debug_struct("ListenerRegistry")
            .field("connect_listeners", &connect)
            .field("message_listeners", &message)
            .finish()
    }
}

/// A panicking listener must not disable the registry for everyone else
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_qos_from_level() {
        assert_eq!(QoS::try_from(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3).is_err());
        assert_eq!(u8::from(QoS::ExactlyOnce), 2);
    }

    #[test]
    fn test_qos_serde_as_integer() {
        let qos: QoS = serde_json::from_str("1").unwrap();
        assert_eq!(qos, QoS::AtLeastOnce);
        assert_eq!(serde_json::to_string(&QoS::ExactlyOnce).unwrap(), "2");
        assert!(serde_json::from_str::<QoS>("7").is_err());
    }

    #[test]
    fn test_inbound_message_builder() {
        let message = InboundMessage::new("a/b", b"{}".to_vec())
            .with_qos(QoS::AtLeastOnce)
            .with_retain(true);
        assert_eq!(message.topic, "a/b");
        assert_eq!(message.payload, b"{}");
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert!(message.retain);
    }

    #[test]
    fn test_registry_dispatch_and_remove() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let id = registry.add_connect(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispatch_connect();
        registry.dispatch_connect();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(registry.remove(id));
        assert!(!registry.remove(id), "second removal is a no-op");

        registry.dispatch_connect();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_registry_ids_are_unique_across_kinds() {
        let registry = ListenerRegistry::new();
        let a = registry.add_connect(Arc::new(|| {}));
        let b = registry.add_message(Arc::new(|_: &InboundMessage| {}));
        assert_ne!(a, b);
        assert_eq!(registry.counts(), (1, 1));

        assert!(registry.remove(b));
        assert_eq!(registry.counts(), (1, 0));
    }

    #[test]
    fn test_registry_handler_may_deregister_itself() {
        let registry = Arc::new(ListenerRegistry::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let registry_ref = Arc::downgrade(&registry);
        let slot_ref = slot.clone();
        let id = registry.add_message(Arc::new(move |_: &InboundMessage| {
            if let (Some(registry), Some(id)) = (registry_ref.upgrade(), *slot_ref.lock().unwrap())
            {
                registry.remove(id);
            }
        }));
        *slot.lock().unwrap() = Some(id);

        registry.dispatch_message(&InboundMessage::new("t", b"{}".to_vec()));
        assert_eq!(registry.counts(), (0, 0));
    }
}
