//! Process metrics sampling for blink events
//!
//! Provides:
//! - CPU load of the gateway process as a fraction of total host capacity
//! - Resident memory of the gateway process
//! - The gateway system name used in event payloads

use sysinfo::{Pid, System};
use thiserror::Error;
use tracing::debug;

/// Reasons a CPU sample is unavailable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricsError {
    #[error("cannot resolve current pid: {0}")]
    Pid(String),
    #[error("process {0} not found")]
    ProcessNotFound(u32),
    #[error("host reports no CPUs")]
    NoCpus,
}

/// One sample of the gateway process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessMetrics {
    pub cpu: Result<f64, MetricsError>,
    /// Bytes, 0 when the process could not be found
    pub mem: u64,
}

impl ProcessMetrics {
    pub fn cpu_load(&self) -> Option<f64> {
        self.cpu.as_ref().ok().copied()
    }
}

/// Anything able to produce a fresh [`ProcessMetrics`]
pub trait MetricsSource {
    fn sample(&mut self) -> ProcessMetrics;
}

/// sysinfo-backed sampler for the current process
pub struct SysinfoMetrics {
    system: System,
    pid: Result<Pid, MetricsError>,
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();

        let pid = sysinfo::get_current_pid().map_err(|e| MetricsError::Pid(e.to_string()));

        Self { system, pid }
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoMetrics {
    fn sample(&mut self) -> ProcessMetrics {
        self.system.refresh_cpu_usage();

        let pid = match &self.pid {
            Ok(pid) => *pid,
            Err(e) => {
                return ProcessMetrics {
                    cpu: Err(e.clone()),
                    mem: 0,
                }
            }
        };

        let process = if self.system.refresh_process(pid) {
            self.system.process(pid)
        } else {
            None
        };

        let Some(process) = process else {
            return ProcessMetrics {
                cpu: Err(MetricsError::ProcessNotFound(pid.as_u32())),
                mem: 0,
            };
        };

        let mem = process.memory();
        let cpu = normalize_cpu(process.cpu_usage(), self.system.cpus().len());

        debug!("Sampled pid {}: cpu={:?} mem={}", pid, cpu, mem);
        ProcessMetrics { cpu, mem }
    }
}

/// sysinfo reports 100% per core; fold that into a `[0.0, 1.0]` host fraction
pub fn normalize_cpu(usage_percent: f32, cpu_count: usize) -> Result<f64, MetricsError> {
    if cpu_count == 0 {
        return Err(MetricsError::NoCpus);
    }

    let load = f64::from(usage_percent) / (100.0 * cpu_count as f64);
    if load.is_finite() {
        Ok(load.clamp(0.0, 1.0))
    } else {
        Ok(0.0)
    }
}

/// Host name of the gateway
pub fn system_name() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}
