/*!
Scripted metrics source

Replays queued samples, then keeps producing fresh ones (memory grows by one
KiB per sample) so consecutive cycles never see identical values.
*/

use blink_gateway::{MetricsError, MetricsSource, ProcessMetrics};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const BASE_MEM: u64 = 64 * 1024 * 1024;

/// `MetricsSource` fed from a script; clones share the queue and counter
#[derive(Clone, Default)]
pub struct ScriptedMetrics {
    queue: Arc<Mutex<VecDeque<ProcessMetrics>>>,
    sampled: Arc<AtomicUsize>,
}

impl ScriptedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_samples(samples: impl IntoIterator<Item = ProcessMetrics>) -> Self {
        let metrics = Self::new();
        metrics.queue.lock().extend(samples);
        metrics
    }

    pub fn push(&self, sample: ProcessMetrics) {
        self.queue.lock().push_back(sample);
    }

    /// Queue a sample whose CPU read fails
    pub fn push_cpu_failure(&self, error: MetricsError, mem: u64) {
        self.push(ProcessMetrics {
            cpu: Err(error),
            mem,
        });
    }

    /// Number of times `sample` was called
    pub fn sample_count(&self) -> usize {
        self.sampled.load(Ordering::SeqCst)
    }

    fn generated(n: usize) -> ProcessMetrics {
        ProcessMetrics {
            cpu: Ok((n % 100) as f64 / 100.0),
            mem: BASE_MEM + (n as u64) * 1024,
        }
    }
}

impl MetricsSource for ScriptedMetrics {
    fn sample(&mut self) -> ProcessMetrics {
        let n = self.sampled.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| Self::generated(n))
    }
}
