//! Test helpers and utilities for integration tests

use mqtt_timestamper::config::MqttSection;
use mqtt_timestamper::connection::InboundMessage;
use mqtt_timestamper::relay::Relay;
use mqtt_timestamper::testing::MockConnection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Broker settings pointing at a port nothing listens on
#[allow(dead_code)]
pub fn unreachable_mqtt_config() -> MqttSection {
    MqttSection {
        broker_url: "mqtt://127.0.0.1:1".to_string(),
        client_id: "stamper-test".to_string(),
        username_env: None,
        password_env: None,
        keep_alive_secs: 60,
    }
}

/// Transformer that records every topic it sees and maps all of them to `newTopic`
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct RecordingTransformer {
    pub seen: Arc<Mutex<Vec<String>>>,
    pub calls: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl RecordingTransformer {
    pub fn transform(&self, topic: &str) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(topic.to_string());
        "newTopic".to_string()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_topics(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

/// A relay on `#` that sends everything to `newTopic`
#[allow(dead_code)]
pub fn new_topic_relay(connection: &Arc<MockConnection>) -> Relay<MockConnection> {
    Relay::new(connection.clone(), "#", |_: &str| "newTopic".to_string(), None).unwrap()
}

#[allow(dead_code)]
pub fn message(topic: &str, payload: &[u8]) -> InboundMessage {
    InboundMessage::new(topic, payload.to_vec())
}
