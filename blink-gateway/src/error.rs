//! Error types for the gateway session and publisher.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors raised while connecting to the broker or publishing events.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transport level failure reported by the MQTT event loop.
    #[error("MQTT connection error")]
    Connection(#[from] rumqttc::ConnectionError),

    /// Broker answered the CONNECT with a non-success code.
    #[error("Broker refused connection: {0:?}")]
    Refused(rumqttc::ConnectReturnCode),

    /// No CONNACK received in time.
    #[error("No CONNACK from {broker} within {secs}s")]
    HandshakeTimeout { broker: String, secs: u64 },

    /// Request could not be handed to the MQTT client.
    #[error("MQTT client error")]
    Client(#[from] rumqttc::ClientError),

    /// Publish request could not be handed to the client.
    #[error("Failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },

    /// Event payload could not be encoded.
    #[error("Failed to encode event payload")]
    Serialization(#[from] serde_json::Error),

    /// Session was already released.
    #[error("Session is not connected")]
    NotConnected,
}

impl GatewayError {
    /// Create a publish error for `topic`.
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_error_message() {
        let err = GatewayError::publish("iot-2/type/t/id/i/evt/blink/fmt/json", "channel closed");
        assert_eq!(
            err.to_string(),
            "Failed to publish to iot-2/type/t/id/i/evt/blink/fmt/json: channel closed"
        );
    }

    #[test]
    fn test_config_error_converts() {
        let err: GatewayError = ConfigError::Missing("Device-ID").into();
        assert!(matches!(err, GatewayError::Config(ConfigError::Missing("Device-ID"))));
        assert!(err.to_string().contains("Device-ID"));
    }

    #[test]
    fn test_error_chain_names_cause_once() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: GatewayError = ConfigError::Io {
            path: "/etc/blink/device.prop".into(),
            source: io,
        }
        .into();

        let mut chain = vec![err.to_string()];
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        let rendered = chain.join(": ");

        assert_eq!(
            rendered,
            "Failed to read config file /etc/blink/device.prop: no such file"
        );
    }
}
