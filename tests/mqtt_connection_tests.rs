//! Broker-free tests for the MQTT connection
//!
//! Covers construction, state reporting and the fail-fast paths that do not
//! need a broker. Nothing listens on the configured port, so every connection
//! attempt is refused.

mod test_helpers;

use mqtt_timestamper::connection::mqtt::{
    ConnectionState, MqttConnection, MqttError, ReconnectConfig,
};
use mqtt_timestamper::connection::{Connection, PublishOptions, QoS, TransportError};
use mqtt_timestamper::relay::Relay;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::unreachable_mqtt_config;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_mqtt_connection_creation() {
    let result = MqttConnection::new(&unreachable_mqtt_config(), ReconnectConfig::default()).await;

    assert!(result.is_ok(), "Connection creation should not wait for the broker");
    let connection = result.unwrap();
    assert!(!connection.is_connected());
    assert!(!connection.connection_state().is_usable());
}

#[tokio::test]
async fn test_invalid_broker_url_fails_fast() {
    let mut config = unreachable_mqtt_config();
    config.broker_url = "not-a-url".to_string();

    let result = MqttConnection::new(&config, ReconnectConfig::default()).await;
    assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
}

#[tokio::test]
async fn test_publish_while_disconnected_reports_not_connected() {
    let connection = MqttConnection::new(&unreachable_mqtt_config(), ReconnectConfig::default())
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    connection.publish(
        "stamped/topic",
        br#"{"timestamp":"2020-01-01T00:00:00.000Z"}"#.to_vec(),
        PublishOptions {
            qos: QoS::AtLeastOnce,
            retain: false,
        },
        Box::new(move |result: Result<(), TransportError>| {
            let _ = tx.send(result.map_err(|e| e.to_string()));
        }),
    );

    let outcome = rx.await.unwrap();
    let err_msg = outcome.unwrap_err();
    assert!(err_msg.contains("Not connected"), "got: {err_msg}");
}

#[tokio::test]
async fn test_relay_registers_on_unconnected_mqtt_connection() {
    let connection = MqttConnection::new(&unreachable_mqtt_config(), ReconnectConfig::default())
        .await
        .unwrap();

    let relay = Relay::new(
        connection.clone(),
        "sensors/#",
        |topic: &str| format!("stamped/{topic}"),
        None,
    )
    .unwrap();
    assert_eq!(connection.listener_counts(), (1, 1));

    relay.stop();
    assert_eq!(connection.listener_counts(), (0, 0));
}

#[tokio::test]
async fn test_gives_up_after_max_reconnect_attempts() {
    let reconnect = ReconnectConfig {
        max_attempts: Some(2),
        backoff_pattern: vec![1, 1],
        sustained_delay: 1,
    };
    let connection = MqttConnection::new(&unreachable_mqtt_config(), reconnect)
        .await
        .unwrap();

    assert_err!(connection.wait_until_connected(Duration::from_secs(20)).await);
    assert!(connection.is_permanently_disconnected());
    assert!(matches!(
        connection.connection_state(),
        ConnectionState::PermanentlyDisconnected(_)
    ));
}

#[tokio::test]
async fn test_disconnect_is_clean_without_broker() {
    let connection: Arc<MqttConnection> =
        MqttConnection::new(&unreachable_mqtt_config(), ReconnectConfig::default())
            .await
            .unwrap();

    assert_ok!(connection.disconnect().await);

    assert!(!connection.is_connected());
    assert!(matches!(
        connection.connection_state(),
        ConnectionState::Disconnected(_)
    ));
}

#[tokio::test]
async fn test_subscribe_waits_for_room_in_full_request_queue() {
    let connection = MqttConnection::new(&unreachable_mqtt_config(), ReconnectConfig::default())
        .await
        .unwrap();

    // The request queue holds 64 entries and is never drained without a broker
    for i in 0..100 {
        assert_ok!(connection.subscribe(&format!("sensors/{i}"), QoS::AtLeastOnce));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(connection.pending_subscriptions() > 0);
    assert!(connection.pending_subscriptions() <= 100);

    assert_ok!(connection.disconnect().await);
}
