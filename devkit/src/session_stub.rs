/*!
Mock gateway session for development without a broker

Implements `GatewaySession` in memory. Every publish is recorded so tests can
assert on topics, payloads and QoS; publish failures and a dropped connection
can be simulated, as can publishes that never complete.
*/

use anyhow::Result;
use blink_gateway::session::{event_topic, DeviceRef, GatewaySession};
use blink_gateway::{GatewayError, TelemetryEvent};
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Identity an event was published under
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    Gateway,
    Device(DeviceRef),
}

#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub target: PublishTarget,
    pub topic: String,
    pub event: String,
    pub payload: TelemetryEvent,
    pub qos: QoS,
}

impl PublishedEvent {
    /// Payload as it would go on the wire
    pub fn json(&self) -> serde_json::Value {
        serde_json::to_value(&self.payload).unwrap_or_default()
    }
}

/// In-memory `GatewaySession`; clones share the same recordings
#[derive(Clone)]
pub struct MockGatewaySession {
    gateway: DeviceRef,
    published_events: Arc<Mutex<Vec<PublishedEvent>>>,
    connected: Arc<AtomicBool>,
    fail_publishes: Arc<AtomicBool>,
    stall_publishes: Arc<AtomicBool>,
    disconnects: Arc<AtomicUsize>,
}

impl MockGatewaySession {
    /// Connected session for `gateway`
    pub fn new(gateway: DeviceRef) -> Self {
        Self {
            gateway,
            published_events: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
            fail_publishes: Arc::new(AtomicBool::new(false)),
            stall_publishes: Arc::new(AtomicBool::new(false)),
            disconnects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn gateway(&self) -> &DeviceRef {
        &self.gateway
    }

    /// Make every following publish fail (or succeed again)
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Make every following publish hang, like a client whose request queue is full
    pub fn stall_publishes(&self, stall: bool) {
        self.stall_publishes.store(stall, Ordering::SeqCst);
    }

    /// Simulate a session that never reached the broker
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn get_published_events(&self) -> Vec<PublishedEvent> {
        self.published_events.lock().clone()
    }

    pub fn gateway_events(&self) -> Vec<PublishedEvent> {
        self.filter_events(|e| e.target == PublishTarget::Gateway)
    }

    pub fn device_events(&self, device: &DeviceRef) -> Vec<PublishedEvent> {
        self.filter_events(|e| matches!(&e.target, PublishTarget::Device(d) if d == device))
    }

    pub fn find_events_by_topic(&self, topic: &str) -> Vec<PublishedEvent> {
        self.filter_events(|e| e.topic == topic)
    }

    /// Parse the last payload published on a topic
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_events_by_topic(topic).last() {
            Some(event) => Ok(Some(serde_json::from_value(event.json())?)),
            None => Ok(None),
        }
    }

    /// Drop all recordings
    pub fn clear(&self) {
        self.published_events.lock().clear();
    }

    fn filter_events(&self, predicate: impl Fn(&PublishedEvent) -> bool) -> Vec<PublishedEvent> {
        self.published_events
            .lock()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    async fn stall_if_requested(&self) {
        if self.stall_publishes.load(Ordering::SeqCst) {
            tracing::warn!("[MOCK] Stalling publish");
            std::future::pending::<()>().await;
        }
    }

    fn record(
        &self,
        target: PublishTarget,
        device: &DeviceRef,
        event: &str,
        payload: &TelemetryEvent,
        qos: QoS,
    ) -> blink_gateway::Result<()> {
        let topic = event_topic(device, event);

        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            tracing::warn!("[MOCK] Rejecting publish to {}", topic);
            return Err(GatewayError::publish(topic, "simulated publish failure"));
        }

        tracing::info!("[MOCK] Published to {}: {:?}", topic, payload);
        self.published_events.lock().push(PublishedEvent {
            target,
            topic,
            event: event.to_string(),
            payload: payload.clone(),
            qos,
        });
        Ok(())
    }
}

impl GatewaySession for MockGatewaySession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish_gateway_event(
        &self,
        event: &str,
        payload: &TelemetryEvent,
        qos: QoS,
    ) -> blink_gateway::Result<()> {
        self.stall_if_requested().await;
        self.record(PublishTarget::Gateway, &self.gateway, event, payload, qos)
    }

    async fn publish_device_event(
        &self,
        device: &DeviceRef,
        event: &str,
        payload: &TelemetryEvent,
        qos: QoS,
    ) -> blink_gateway::Result<()> {
        self.stall_if_requested().await;
        self.record(PublishTarget::Device(device.clone()), device, event, payload, qos)
    }

    async fn disconnect(&mut self) -> blink_gateway::Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            tracing::info!("[MOCK] Gateway {} disconnected", self.gateway);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str) -> TelemetryEvent {
        TelemetryEvent {
            name: name.to_string(),
            cpu: Some(0.5),
            mem: 2048,
        }
    }

    #[tokio::test]
    async fn test_mock_session_records_publishes() {
        let session = MockGatewaySession::new(DeviceRef::new("gwType", "G1"));
        let device = DeviceRef::new("iotsample-deviceType", "SimulatorDevice01");

        session
            .publish_gateway_event("blink", &event("gw"), QoS::ExactlyOnce)
            .await
            .unwrap();
        session
            .publish_device_event(&device, "blink", &event("gwsimulator"), QoS::ExactlyOnce)
            .await
            .unwrap();

        let gateway_events = session.gateway_events();
        assert_eq!(gateway_events.len(), 1);
        assert_eq!(gateway_events[0].topic, "iot-2/type/gwType/id/G1/evt/blink/fmt/json");
        assert_eq!(gateway_events[0].qos, QoS::ExactlyOnce);

        let device_events = session.device_events(&device);
        assert_eq!(device_events.len(), 1);
        assert_eq!(device_events[0].payload.name, "gwsimulator");
    }

    #[tokio::test]
    async fn test_json_message_parsing() {
        let session = MockGatewaySession::new(DeviceRef::new("gwType", "G1"));
        session
            .publish_gateway_event("blink", &event("gw"), QoS::AtLeastOnce)
            .await
            .unwrap();

        let parsed: Option<serde_json::Value> = session
            .get_last_json_message("iot-2/type/gwType/id/G1/evt/blink/fmt/json")
            .unwrap();
        assert_eq!(parsed.unwrap()["mem"], 2048);
    }

    #[tokio::test]
    async fn test_simulated_failures() {
        let mut session = MockGatewaySession::new(DeviceRef::new("gwType", "G1"));

        session.fail_publishes(true);
        let err = session
            .publish_gateway_event("blink", &event("gw"), QoS::ExactlyOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Publish { .. }));
        assert!(session.get_published_events().is_empty());

        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(session.disconnect_count(), 1);
        assert!(!session.is_connected());

        session.fail_publishes(false);
        let err = session
            .publish_gateway_event("blink", &event("gw"), QoS::ExactlyOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));
    }
}
