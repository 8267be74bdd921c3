//! Gateway configuration loaded from a `device.prop` property file
//!
//! Handles:
//! - `key=value` / `key: value` property parsing (`#` and `!` comments)
//! - Broker connection settings (organization, gateway identity, token auth)
//! - Publisher settings that used to be hard-coded (event name, QoS, cadence,
//!   simulated device, publish failure policy)
//! - Config path resolution (env override, samples dir, working dir)

use rumqttc::QoS;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::session::{qos_from_level, DeviceRef};

/// Env var that overrides the config file location
pub const CONFIG_ENV_VAR: &str = "BLINK_GATEWAY_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "device.prop";
pub const DEFAULT_CONFIG_DIR: &str = "samples";

pub const DEFAULT_DOMAIN: &str = "internetofthings.ibmcloud.com";
pub const DEFAULT_PORT: u16 = 8883;
pub const INSECURE_PORT: u16 = 1883;
pub const QUICKSTART_ORG: &str = "quickstart";
pub const TOKEN_AUTH_USERNAME: &str = "use-token-auth";

pub const DEFAULT_EVENT_NAME: &str = "blink";
pub const DEFAULT_QOS_LEVEL: u8 = 2;
pub const DEFAULT_PUBLISH_INTERVAL_MS: u64 = 1000;
pub const SIMULATED_DEVICE_TYPE: &str = "iotsample-deviceType";
pub const SIMULATED_DEVICE_ID: &str = "SimulatorDevice01";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Missing required property '{0}'")]
    Missing(&'static str),
    #[error("Invalid value '{value}' for property '{key}'")]
    Invalid { key: &'static str, value: String },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
        }
    }
}

/// Raw key/value pairs read from a property file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    /// Parse property text. Later duplicates win, like `java.util.Properties`.
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }

            let (key, value) = match line.find(['=', ':']) {
                Some(idx) => (&line[..idx], &line[idx + 1..]),
                None => (line, ""),
            };

            entries.insert(key.trim().to_string(), value.trim().to_string());
        }

        Self { entries }
    }

    /// Read and parse a property file
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let props = Self::parse(&text);
        debug!("Loaded {} properties from {}", props.len(), path.display());
        Ok(props)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First non-empty value among `keys` (canonical name first, then aliases)
    fn lookup(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|key| self.get(key))
            .find(|value| !value.is_empty())
    }

    fn require(&self, keys: &[&'static str]) -> Result<String, ConfigError> {
        self.lookup(keys)
            .map(str::to_string)
            .ok_or(ConfigError::Missing(keys[0]))
    }

    fn parse_or<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.lookup(&[key]) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::invalid(key, raw)),
            None => Ok(default),
        }
    }

    fn bool_or(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.lookup(&[key]) {
            Some(raw) if raw.eq_ignore_ascii_case("true") => Ok(true),
            Some(raw) if raw.eq_ignore_ascii_case("false") => Ok(false),
            Some(raw) => Err(ConfigError::invalid(key, raw)),
            None => Ok(default),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Broker connection settings for the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub org: String,
    pub device_type: String,
    pub device_id: String,
    /// `None` only for the quickstart organization
    pub auth_token: Option<String>,
    pub domain: String,
    pub port: u16,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
}

impl GatewayConfig {
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let org = props.require(&["Organization-ID", "org"])?;
        let device_type = props.require(&["Device-Type", "type"])?;
        let device_id = props.require(&["Device-ID", "id"])?;

        let auth_token = match props.lookup(&["Authentication-Method", "auth-method"]) {
            Some(method) if method.eq_ignore_ascii_case("token") => {
                Some(props.require(&["Authentication-Token", "auth-token"])?)
            }
            Some(method) => return Err(ConfigError::invalid("Authentication-Method", method)),
            None if org == QUICKSTART_ORG => None,
            None => return Err(ConfigError::Missing("Authentication-Method")),
        };

        let domain = props
            .lookup(&["Domain"])
            .unwrap_or(DEFAULT_DOMAIN)
            .to_string();

        Ok(GatewayConfig {
            org,
            device_type,
            device_id,
            auth_token,
            domain,
            port: props.parse_or("Port", DEFAULT_PORT)?,
            clean_session: props.bool_or("Clean-Session", true)?,
            keep_alive_secs: props.parse_or("Keep-Alive", 60)?,
        })
    }

    /// `<org>.messaging.<domain>`
    pub fn broker_host(&self) -> String {
        format!("{}.messaging.{}", self.org, self.domain)
    }

    /// Gateway client ids carry the `g:` prefix
    pub fn client_id(&self) -> String {
        format!("g:{}:{}:{}", self.org, self.device_type, self.device_id)
    }

    pub fn use_tls(&self) -> bool {
        self.port != INSECURE_PORT
    }

    /// The gateway's own identity on the platform
    pub fn gateway(&self) -> DeviceRef {
        DeviceRef::new(&self.device_type, &self.device_id)
    }
}

/// What to do when a publish call fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishFailurePolicy {
    /// Log the failure and keep looping (at-most-once)
    #[default]
    BestEffort,
    /// Stop the publisher and surface the error
    FailFast,
}

impl FromStr for PublishFailurePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "best-effort" | "besteffort" => Ok(Self::BestEffort),
            "fail-fast" | "failfast" => Ok(Self::FailFast),
            _ => Err(()),
        }
    }
}

/// Settings of the publisher loop
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherSettings {
    pub event_name: String,
    pub qos: QoS,
    pub interval: Duration,
    /// Device published on behalf of
    pub simulated_device: DeviceRef,
    pub failure_policy: PublishFailurePolicy,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            event_name: DEFAULT_EVENT_NAME.to_string(),
            qos: QoS::ExactlyOnce,
            interval: Duration::from_millis(DEFAULT_PUBLISH_INTERVAL_MS),
            simulated_device: DeviceRef::new(SIMULATED_DEVICE_TYPE, SIMULATED_DEVICE_ID),
            failure_policy: PublishFailurePolicy::BestEffort,
        }
    }
}

impl PublisherSettings {
    /// Defaults, overridden by any publisher keys present in `props`
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let qos_level: u8 = props.parse_or("QoS", DEFAULT_QOS_LEVEL)?;
        let qos = qos_from_level(qos_level)
            .ok_or_else(|| ConfigError::invalid("QoS", &qos_level.to_string()))?;

        let interval_ms: u64 = props.parse_or("Publish-Interval-Ms", DEFAULT_PUBLISH_INTERVAL_MS)?;
        if interval_ms == 0 {
            return Err(ConfigError::invalid("Publish-Interval-Ms", "0"));
        }

        let failure_policy = match props.lookup(&["Publish-Failure-Policy"]) {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::invalid("Publish-Failure-Policy", raw))?,
            None => defaults.failure_policy,
        };

        let simulated_device = DeviceRef::new(
            props
                .lookup(&["Simulated-Device-Type"])
                .unwrap_or(SIMULATED_DEVICE_TYPE),
            props
                .lookup(&["Simulated-Device-ID"])
                .unwrap_or(SIMULATED_DEVICE_ID),
        );

        Ok(PublisherSettings {
            event_name: props
                .lookup(&["Event-Name"])
                .unwrap_or(DEFAULT_EVENT_NAME)
                .to_string(),
            qos,
            interval: Duration::from_millis(interval_ms),
            simulated_device,
            failure_policy,
        })
    }
}

/// Resolve the property file: env override, then `samples/device.prop`, then `./device.prop`
pub fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    default_config_path(Path::new("."))
}

/// Default lookup relative to `base`
pub fn default_config_path(base: &Path) -> PathBuf {
    let in_samples = base.join(DEFAULT_CONFIG_DIR).join(DEFAULT_CONFIG_FILE);
    if in_samples.exists() {
        in_samples
    } else {
        base.join(DEFAULT_CONFIG_FILE)
    }
}
