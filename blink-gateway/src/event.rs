//! Blink event payload published on every cycle

use serde::{Deserialize, Serialize};

use crate::metrics::ProcessMetrics;

/// Flat JSON record `{"name", "cpu"?, "mem"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub name: String,
    /// Process CPU load in `[0.0, 1.0]`, omitted when sampling failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// Resident memory in bytes
    pub mem: u64,
}

impl TelemetryEvent {
    /// Build an event for `name` from one metrics sample
    pub fn new(name: impl Into<String>, metrics: &ProcessMetrics) -> Self {
        Self {
            name: name.into(),
            cpu: metrics.cpu_load(),
            mem: metrics.mem,
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
