use crate::compute::{ComputeResponse, MqttComputeClient, COMPUTE_RESPONSE_TOPIC};
use crate::config::MqttConf;
use crate::dispatcher::Dispatcher;
use crate::health::HealthTracker;
use crate::models::NotificationIn;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info, warn};

pub const NOTIFICATIONS_TOPIC: &str = "vigil/notifications/failure@v1";

pub fn create_mqtt_client(conf: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    AsyncClient::new(opts, 64)
}

/// What an inbound publish turned out to be
#[derive(Debug)]
pub enum Inbound {
    Notification(NotificationIn),
    ComputeResponse(ComputeResponse),
    Invalid { topic: String, error: String },
    Other(String),
}

pub fn parse_publish(topic: &str, payload: &[u8]) -> Inbound {
    match topic {
        NOTIFICATIONS_TOPIC => match serde_json::from_slice::<NotificationIn>(payload) {
            Ok(n) => Inbound::Notification(n),
            Err(e) => Inbound::Invalid { topic: topic.to_string(), error: e.to_string() },
        },
        COMPUTE_RESPONSE_TOPIC => match serde_json::from_slice::<ComputeResponse>(payload) {
            Ok(r) => Inbound::ComputeResponse(r),
            Err(e) => Inbound::Invalid { topic: topic.to_string(), error: e.to_string() },
        },
        other => Inbound::Other(other.to_string()),
    }
}

/// Drives the MQTT event loop: inbound failure notifications go to the dispatcher,
/// compute replies go to the compute client. Subscriptions are renewed on every
/// connection since the broker session is not persistent.
pub fn spawn_mqtt_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    dispatcher: Arc<Dispatcher>,
    compute: Arc<MqttComputeClient>,
    health: HealthTracker,
) {
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("MQTT connected");
                    health.mark_mqtt_connected();
                    for topic in [NOTIFICATIONS_TOPIC, COMPUTE_RESPONSE_TOPIC] {
                        if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                            warn!("subscribe to {topic} failed: {e}");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => match parse_publish(&p.topic, &p.payload) {
                    Inbound::Notification(incoming) => {
                        if let Err(e) = dispatcher.submit(incoming).await {
                            warn!("rejected failure notification: {e}");
                        }
                    }
                    Inbound::ComputeResponse(response) => compute.handle_response(response),
                    Inbound::Invalid { topic, error } => warn!("invalid JSON on {topic}: {error}"),
                    Inbound::Other(topic) => debug!("ignoring publish on {topic}"),
                },
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT error: {e}");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationType;

    #[test]
    fn test_parse_publish_routes_by_topic() {
        let payload = br#"{"hostname":"compute-1","type":"COMPUTE_HOST","payload":{"event":"STOPPED"}}"#;
        match parse_publish(NOTIFICATIONS_TOPIC, payload) {
            Inbound::Notification(n) => {
                assert_eq!(n.hostname, "compute-1");
                assert_eq!(n.notification_type, NotificationType::ComputeHost);
            }
            other => panic!("unexpected {other:?}"),
        }

        let reply = br#"{"type":"success","request_id":"r1","data":null}"#;
        assert!(matches!(parse_publish(COMPUTE_RESPONSE_TOPIC, reply), Inbound::ComputeResponse(_)));

        assert!(matches!(parse_publish(NOTIFICATIONS_TOPIC, b"{"), Inbound::Invalid { .. }));
        assert!(matches!(parse_publish("vigil/other", b"{}"), Inbound::Other(_)));
    }
}
