//! Blink Gateway - IoT gateway telemetry publisher
//!
//! Connects a gateway device to a Watson IoT style MQTT broker and
//! periodically publishes a `blink` event carrying process CPU and memory:
//! - for the gateway itself
//! - on behalf of a simulated device connected behind the gateway

pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod publisher;
pub mod session;

pub use config::{GatewayConfig, Properties, PublishFailurePolicy, PublisherSettings};
pub use error::{GatewayError, Result};
pub use event::TelemetryEvent;
pub use metrics::{MetricsError, MetricsSource, ProcessMetrics, SysinfoMetrics};
pub use publisher::{initialize, initialize_with, Initialized, Publisher, PublisherReport};
pub use session::{DeviceRef, GatewaySession, MqttGatewaySession};
