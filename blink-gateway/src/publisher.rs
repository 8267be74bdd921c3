//! Telemetry publisher loop
//!
//! Startup: load `device.prop`, connect the gateway session (fail fast).
//! Then every interval: sample metrics once, publish the gateway's own blink
//! event, publish the blink event on behalf of the simulated device, wait.
//! Waits and pending publishes are cancellable; on cancellation the session is released.

use std::future::Future;
use std::path::Path;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{GatewayConfig, Properties, PublishFailurePolicy, PublisherSettings};
use crate::error::{GatewayError, Result};
use crate::event::TelemetryEvent;
use crate::metrics::{MetricsSource, ProcessMetrics};
use crate::session::{GatewaySession, MqttGatewaySession};

/// Output of a successful startup
#[derive(Debug)]
pub struct Initialized<S> {
    pub config: GatewayConfig,
    pub settings: PublisherSettings,
    pub session: S,
}

/// Load config from `config_path` and connect over MQTT
pub async fn initialize(config_path: &Path) -> Result<Initialized<MqttGatewaySession>> {
    initialize_with(config_path, |config| async move {
        MqttGatewaySession::connect(&config).await
    })
    .await
}

/// Same as [`initialize`] with a custom session factory
///
/// The factory is only called once the configuration is fully valid.
pub async fn initialize_with<S, F, Fut>(config_path: &Path, connect: F) -> Result<Initialized<S>>
where
    S: GatewaySession,
    F: FnOnce(GatewayConfig) -> Fut,
    Fut: Future<Output = Result<S>>,
{
    let props = Properties::load(config_path).await?;
    let config = GatewayConfig::from_properties(&props)?;
    let settings = PublisherSettings::from_properties(&props)?;

    let session = connect(config.clone()).await?;
    if !session.is_connected() {
        return Err(GatewayError::NotConnected);
    }

    Ok(Initialized {
        config,
        settings,
        session,
    })
}

/// Counters kept across cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherReport {
    pub cycles: u64,
    pub published: u64,
    pub failed: u64,
}

/// Name carried by events sent on behalf of the simulated device
pub fn simulator_name(gateway_name: &str) -> String {
    format!("{gateway_name}simulator")
}

pub struct Publisher<S, M> {
    session: S,
    metrics: M,
    settings: PublisherSettings,
    gateway_name: String,
    report: PublisherReport,
}

impl<S: GatewaySession, M: MetricsSource> Publisher<S, M> {
    pub fn new(
        session: S,
        metrics: M,
        settings: PublisherSettings,
        gateway_name: impl Into<String>,
    ) -> Self {
        Self {
            session,
            metrics,
            settings,
            gateway_name: gateway_name.into(),
            report: PublisherReport::default(),
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    pub fn report(&self) -> PublisherReport {
        self.report
    }

    /// Sample once; a CPU failure is logged and the field dropped
    pub fn sample_system_metrics(&mut self) -> ProcessMetrics {
        let metrics = self.metrics.sample();
        if let Err(e) = &metrics.cpu {
            warn!("CPU load unavailable, omitting cpu field: {}", e);
        }
        metrics
    }

    pub async fn publish_gateway_self_event(&mut self, metrics: &ProcessMetrics) -> Result<()> {
        let event = TelemetryEvent::new(self.gateway_name.as_str(), metrics);
        let result = self
            .session
            .publish_gateway_event(&self.settings.event_name, &event, self.settings.qos)
            .await;
        self.record(result)
    }

    pub async fn publish_on_behalf_of_device_event(
        &mut self,
        metrics: &ProcessMetrics,
    ) -> Result<()> {
        let event = TelemetryEvent::new(simulator_name(&self.gateway_name), metrics);
        let result = self
            .session
            .publish_device_event(
                &self.settings.simulated_device,
                &self.settings.event_name,
                &event,
                self.settings.qos,
            )
            .await;
        self.record(result)
    }

    /// One iteration: sample, publish self, publish on behalf
    pub async fn run_cycle(&mut self) -> Result<()> {
        let metrics = self.sample_system_metrics();
        self.publish_gateway_self_event(&metrics).await?;
        self.publish_on_behalf_of_device_event(&metrics).await?;

        self.report.cycles += 1;
        debug!(
            "Cycle {} done (cpu={:?}, mem={})",
            self.report.cycles,
            metrics.cpu_load(),
            metrics.mem
        );
        Ok(())
    }

    /// Loop until `shutdown` flips (or its sender goes away), then disconnect
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<PublisherReport> {
        info!(
            "Publishing '{}' every {:?} for {} and {}",
            self.settings.event_name,
            self.settings.interval,
            self.gateway_name,
            self.settings.simulated_device
        );

        let outcome = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            // a publish stuck on a full client queue must not block shutdown
            let cycle = tokio::select! {
                biased;
                result = self.run_cycle() => result,
                _ = shutdown.changed() => {
                    info!("Shutdown requested during a publish cycle, abandoning it");
                    break Ok(());
                }
            };
            if let Err(e) = cycle {
                break Err(e);
            }

            tokio::select! {
                _ = sleep(self.settings.interval) => {}
                _ = shutdown.changed() => {
                    info!("Shutdown requested, stopping publisher");
                    break Ok(());
                }
            }
        };

        if let Err(e) = self.session.disconnect().await {
            warn!("Disconnect failed: {:?}", e);
        }

        info!(
            "Publisher stopped after {} cycles ({} published, {} failed)",
            self.report.cycles, self.report.published, self.report.failed
        );
        outcome.map(|()| self.report)
    }

    fn record(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.report.published += 1;
                Ok(())
            }
            Err(e) => {
                self.report.failed += 1;
                match self.settings.failure_policy {
                    PublishFailurePolicy::BestEffort => {
                        error!("Publish failed, continuing: {}", e);
                        Ok(())
                    }
                    PublishFailurePolicy::FailFast => {
                        error!("Publish failed, stopping: {}", e);
                        Err(e)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulator_name() {
        assert_eq!(simulator_name("gw-host"), "gw-hostsimulator");
    }

    #[test]
    fn test_report_starts_empty() {
        let report = PublisherReport::default();
        assert_eq!((report.cycles, report.published, report.failed), (0, 0, 0));
    }
}
