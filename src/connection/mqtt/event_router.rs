//! Pure routing of rumqttc events
//!
//! Maps raw MQTT v5 events onto the small set of outcomes the event loop
//! acts on, so routing decisions can be tested without a broker.

use crate::connection::InboundMessage;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived(InboundMessage),
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed with reason codes
    SubscriptionConfirmed { packet_id: u16, reason_codes: String },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Route MQTT event to appropriate handler
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
            Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.to_vec(),
                qos: publish.qos.into(),
                retain: publish.retain,
            }),
            Packet::Disconnect(_) => EventRoute::Disconnected,
            Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                packet_id: suback.pkid,
                reason_codes: format!("{:?}", suback.return_codes),
            },
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::QoS;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Publish,
    };
    use rumqttc::v5::mqttbytes::QoS as RumqttcQoS;

    fn publish_event(retain: bool, qos: RumqttcQoS) -> Event {
        Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: Bytes::from("sensors/kitchen"),
            pkid: 1,
            payload: Bytes::from(r#"{"temp":21.5}"#),
            properties: None,
        }))
    }

    #[test]
    fn test_connack_routes_to_acknowledged() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        );
    }

    #[test]
    fn test_disconnect_routes_to_disconnected() {
        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert_eq!(route_mqtt_event(&disconnect), EventRoute::Disconnected);
    }

    #[test]
    fn test_publish_carries_delivery_metadata() {
        match route_mqtt_event(&publish_event(true, RumqttcQoS::ExactlyOnce)) {
            EventRoute::MessageReceived(message) => {
                assert_eq!(message.topic, "sensors/kitchen");
                assert_eq!(message.payload, br#"{"temp":21.5}"#);
                assert_eq!(message.qos, QoS::ExactlyOnce);
                assert!(message.retain);
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }

        match route_mqtt_event(&publish_event(false, RumqttcQoS::AtMostOnce)) {
            EventRoute::MessageReceived(message) => {
                assert_eq!(message.qos, QoS::AtMostOnce);
                assert!(!message.retain);
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }
}
