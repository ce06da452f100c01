use rumqttc::{AsyncClient, QoS};
use tracing::{debug, warn};

/// Outbound half of the message bus. Publishing is fire-and-forget.
pub trait Bus: Send + Sync {
    fn publish(&self, topic: &str, payload: String);
}

#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl Bus for MqttBus {
    fn publish(&self, topic: &str, payload: String) {
        debug!(topic, %payload, "publish");
        if let Err(err) = self
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
        {
            warn!("mqtt publish to {topic} failed: {err}");
        }
    }
}

#[cfg(test)]
pub use recording::RecordingBus;
