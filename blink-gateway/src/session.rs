//! Gateway session with the IoT broker
//!
//! A gateway publishes on its own identity and on behalf of the devices
//! connected behind it. Both go through one MQTT connection:
//! - self events:      `iot-2/type/<gwType>/id/<gwId>/evt/<event>/fmt/json`
//! - on-behalf events: `iot-2/type/<devType>/id/<devId>/evt/<event>/fmt/json`

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS, Transport,
};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{GatewayConfig, TOKEN_AUTH_USERNAME};
use crate::error::{GatewayError, Result};
use crate::event::TelemetryEvent;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Device type / id pair on the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceRef {
    pub device_type: String,
    pub device_id: String,
}

impl DeviceRef {
    pub fn new(device_type: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_type, self.device_id)
    }
}

/// Event topic for `device`
pub fn event_topic(device: &DeviceRef, event: &str) -> String {
    format!(
        "iot-2/type/{}/id/{}/evt/{}/fmt/json",
        device.device_type, device.device_id, event
    )
}

/// Map an integer QoS level (0, 1, 2) to [`QoS`]
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Operations the publisher needs from a live gateway connection
pub trait GatewaySession {
    fn is_connected(&self) -> bool;

    /// Publish `event` on the gateway's own identity
    fn publish_gateway_event(
        &self,
        event: &str,
        payload: &TelemetryEvent,
        qos: QoS,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Publish `event` on behalf of `device`
    fn publish_device_event(
        &self,
        device: &DeviceRef,
        event: &str,
        payload: &TelemetryEvent,
        qos: QoS,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Release the connection. Calling it again is a no-op.
    fn disconnect(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Build client options for a gateway connection
pub fn mqtt_options(config: &GatewayConfig) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id(), config.broker_host(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(config.clean_session);

    if let Some(token) = &config.auth_token {
        options.set_credentials(TOKEN_AUTH_USERNAME, token);
    }

    if config.use_tls() {
        options.set_transport(Transport::tls_with_default_config());
    }

    options
}

#[derive(Debug, Default)]
struct ConnectionState {
    connected: AtomicBool,
    closing: AtomicBool,
    reconnects: AtomicU32,
}

/// rumqttc-backed gateway session
pub struct MqttGatewaySession {
    client: AsyncClient,
    gateway: DeviceRef,
    state: Arc<ConnectionState>,
    event_task: Option<JoinHandle<()>>,
}

impl MqttGatewaySession {
    /// Connect and wait for the broker's CONNACK
    pub async fn connect(config: &GatewayConfig) -> Result<Self> {
        let broker = format!("{}:{}", config.broker_host(), config.port);
        info!("Connecting gateway {} to {}", config.client_id(), broker);

        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(config), REQUEST_CHANNEL_CAPACITY);

        match timeout(CONNECT_TIMEOUT, await_connack(&mut eventloop)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GatewayError::HandshakeTimeout {
                    broker,
                    secs: CONNECT_TIMEOUT.as_secs(),
                })
            }
        }

        let state = Arc::new(ConnectionState::default());
        state.connected.store(true, Ordering::SeqCst);

        let event_task = tokio::spawn(drive_event_loop(eventloop, state.clone()));

        info!("Gateway connected to {}", broker);
        Ok(MqttGatewaySession {
            client,
            gateway: config.gateway(),
            state,
            event_task: Some(event_task),
        })
    }

    pub fn gateway(&self) -> &DeviceRef {
        &self.gateway
    }

    /// Times the event loop lost the connection since connect
    pub fn reconnects(&self) -> u32 {
        self.state.reconnects.load(Ordering::Relaxed)
    }

    async fn publish_to(
        &self,
        device: &DeviceRef,
        event: &str,
        payload: &TelemetryEvent,
        qos: QoS,
    ) -> Result<()> {
        if self.event_task.is_none() {
            return Err(GatewayError::NotConnected);
        }

        let topic = event_topic(device, event);
        let bytes = payload.to_payload()?;

        self.client
            .publish(topic.clone(), qos, false, bytes)
            .await
            .map_err(|e| GatewayError::publish(&topic, e.to_string()))?;

        debug!("Published {} ({:?})", topic, qos);
        Ok(())
    }
}

impl GatewaySession for MqttGatewaySession {
    fn is_connected(&self) -> bool {
        self.event_task.is_some() && self.state.connected.load(Ordering::SeqCst)
    }

    async fn publish_gateway_event(
        &self,
        event: &str,
        payload: &TelemetryEvent,
        qos: QoS,
    ) -> Result<()> {
        self.publish_to(&self.gateway, event, payload, qos).await
    }

    async fn publish_device_event(
        &self,
        device: &DeviceRef,
        event: &str,
        payload: &TelemetryEvent,
        qos: QoS,
    ) -> Result<()> {
        self.publish_to(device, event, payload, qos).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(mut task) = self.event_task.take() else {
            return Ok(());
        };

        self.state.closing.store(true, Ordering::SeqCst);
        // request channel may be full of stalled publishes
        let sent = self.client.try_disconnect();

        if let Err(e) = &sent {
            warn!("Could not queue MQTT disconnect ({}), aborting event loop", e);
            task.abort();
        } else if timeout(DISCONNECT_TIMEOUT, &mut task).await.is_err() {
            warn!("MQTT event loop did not stop in time, aborting it");
            task.abort();
        }

        self.state.connected.store(false, Ordering::SeqCst);
        info!("Gateway {} disconnected", self.gateway);
        sent.map_err(GatewayError::from)
    }
}

impl Drop for MqttGatewaySession {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(GatewayError::Refused(code)),
                };
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => return Err(GatewayError::Refused(code)),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Keeps rumqttc moving after the handshake; it reconnects on the next poll
async fn drive_event_loop(mut eventloop: EventLoop, state: Arc<ConnectionState>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                if !state.connected.swap(true, Ordering::SeqCst) {
                    info!("MQTT connection re-established");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if state.closing.load(Ordering::SeqCst) {
                    break;
                }
                state.connected.store(false, Ordering::SeqCst);
                state.reconnects.fetch_add(1, Ordering::Relaxed);
                error!("MQTT connection error: {}", e);
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
    state.connected.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: u16) -> GatewayConfig {
        GatewayConfig {
            org: "abc123".to_string(),
            device_type: "gwType".to_string(),
            device_id: "G1".to_string(),
            auth_token: Some("s3cret".to_string()),
            domain: "invalid".to_string(),
            port,
            clean_session: false,
            keep_alive_secs: 30,
        }
    }

    #[test]
    fn test_event_topics() {
        let gateway = DeviceRef::new("gwType", "G1");
        let device = DeviceRef::new("iotsample-deviceType", "SimulatorDevice01");

        assert_eq!(
            event_topic(&gateway, "blink"),
            "iot-2/type/gwType/id/G1/evt/blink/fmt/json"
        );
        assert_eq!(
            event_topic(&device, "blink"),
            "iot-2/type/iotsample-deviceType/id/SimulatorDevice01/evt/blink/fmt/json"
        );
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_level(0), Some(QoS::AtMostOnce));
        assert_eq!(qos_from_level(1), Some(QoS::AtLeastOnce));
        assert_eq!(qos_from_level(2), Some(QoS::ExactlyOnce));
        assert_eq!(qos_from_level(3), None);
    }

    #[test]
    fn test_mqtt_options() {
        let options = mqtt_options(&config(1883));

        assert_eq!(options.client_id(), "g:abc123:gwType:G1");
        assert_eq!(
            options.broker_address(),
            ("abc123.messaging.invalid".to_string(), 1883)
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(!options.clean_session());
        assert_eq!(
            options.credentials(),
            Some(("use-token-auth".to_string(), "s3cret".to_string()))
        );
    }

    #[test]
    fn test_device_ref_display() {
        assert_eq!(DeviceRef::new("gwType", "G1").to_string(), "gwType/G1");
    }

    #[tokio::test]
    async fn test_disconnect_with_full_request_queue_returns() {
        let (client, _eventloop) = AsyncClient::new(mqtt_options(&config(1883)), 1);
        while client
            .try_publish("iot-2/type/gwType/id/G1/evt/blink/fmt/json", QoS::ExactlyOnce, false, vec![])
            .is_ok()
        {}

        let mut session = MqttGatewaySession {
            client,
            gateway: DeviceRef::new("gwType", "G1"),
            state: Arc::new(ConnectionState::default()),
            event_task: Some(tokio::spawn(std::future::pending::<()>())),
        };
        session.state.connected.store(true, Ordering::SeqCst);

        let result = timeout(Duration::from_secs(3), session.disconnect())
            .await
            .expect("disconnect blocked on the request queue");

        assert!(matches!(result, Err(GatewayError::Client(_))));
        assert!(!session.is_connected());
        assert!(session.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let result = MqttGatewaySession::connect(&config(1883)).await;
        assert!(result.is_err());
    }
}
