//! Throughput sampling
//!
//! A [`SpeedCollector`] periodically turns the read summary of one
//! [`Trace`] into `bytes_received_cumulative` events. Sampling instants
//! are memoryless so the samples are representative of the transfer.

use crate::archival::ArchivalNetworkEvent;
use crate::memoryless;
use crate::trace::Trace;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Default timing: 250ms mean, clamped to [25ms, 650ms]
pub const DEFAULT_SAMPLER: memoryless::Config = memoryless::Config {
    expected: std::time::Duration::from_millis(250),
    min: std::time::Duration::from_millis(25),
    max: std::time::Duration::from_millis(650),
};

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Background sampler attached to one [`Trace`].
pub struct SpeedCollector {
    trace: Arc<Trace>,
    samples: Arc<Mutex<Vec<ArchivalNetworkEvent>>>,
    worker: Mutex<Option<Worker>>,
}

fn collect_snapshot(trace: &Trace, samples: &Mutex<Vec<ArchivalNetworkEvent>>) {
    let snapshot = trace.sample_read_summary();
    if !snapshot.is_empty() {
        samples.lock().extend(snapshot);
    }
}

impl SpeedCollector {
    /// Start sampling `trace` with the default timing
    pub fn new(trace: Arc<Trace>) -> Self {
        Self::with_config(trace, DEFAULT_SAMPLER)
    }

    /// Start sampling `trace` with explicit timing.
    ///
    /// Inconsistent timing is logged and replaced by [`DEFAULT_SAMPLER`].
    pub fn with_config(trace: Arc<Trace>, config: memoryless::Config) -> Self {
        let config = match config.check() {
            Ok(()) => config,
            Err(e) => {
                warn!("BUG: SpeedCollector: {e}");
                DEFAULT_SAMPLER
            }
        };

        let samples = Arc::new(Mutex::new(Vec::new()));
        let (stop, stopped) = bounded::<()>(1);
        let handle = {
            let trace = Arc::clone(&trace);
            let samples = Arc::clone(&samples);
            std::thread::spawn(move || loop {
                match stopped.recv_timeout(config.wait_time()) {
                    Err(RecvTimeoutError::Timeout) => collect_snapshot(&trace, &samples),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        collect_snapshot(&trace, &samples);
                        debug!("[#{}] speed collector stopped", trace.index());
                        return;
                    }
                }
            })
        };

        Self {
            trace,
            samples,
            worker: Mutex::new(Some(Worker { stop, handle })),
        }
    }

    /// Stop sampling and wait for the final snapshot. Idempotent.
    pub fn close(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        // a full channel means a stop is already pending
        let _ = worker.stop.try_send(());
        if worker.handle.join().is_err() {
            warn!("BUG: SpeedCollector: sampling thread panicked");
        }
    }

    /// Take one snapshot now, then return and forget every sample so far.
    pub fn extract_samples(&self) -> Vec<ArchivalNetworkEvent> {
        collect_snapshot(&self.trace, &self.samples);
        std::mem::take(&mut *self.samples.lock())
    }
}

impl Drop for SpeedCollector {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SpeedCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeedCollector")
            .field("trace", &self.trace.index())
            .field("running", &self.worker.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn fast() -> memoryless::Config {
        memoryless::Config {
            expected: Duration::from_millis(5),
            min: Duration::from_millis(1),
            max: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_periodic_samples() {
        let trace = Arc::new(Trace::new(5, Instant::now(), vec!["speed".to_string()]));
        let collector = SpeedCollector::with_config(Arc::clone(&trace), fast());

        for _ in 0..5 {
            trace.update_read_summary("tcp", "1.1.1.1:443", 1000);
            std::thread::sleep(Duration::from_millis(30));
        }
        collector.close();

        let samples = collector.extract_samples();
        assert!(samples.len() >= 2, "{}", samples.len());
        let total: i64 = samples.iter().map(|s| s.num_bytes).sum();
        assert_eq!(total, 5000);
        for sample in &samples {
            assert_eq!(sample.operation, "bytes_received_cumulative");
            assert_eq!(sample.transaction_id, 5);
            assert_eq!(sample.tags, vec!["speed".to_string()]);
            assert!((sample.t - sample.t0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_close_takes_final_snapshot() {
        let trace = Arc::new(Trace::new(1, Instant::now(), Vec::new()));
        let collector = SpeedCollector::with_config(
            Arc::clone(&trace),
            memoryless::Config {
                expected: Duration::from_secs(60),
                min: Duration::from_secs(60),
                max: Duration::from_secs(60),
            },
        );
        trace.update_read_summary("udp", "8.8.8.8:53", 42);
        collector.close();
        collector.close();

        let samples = collector.extract_samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].num_bytes, 42);
        assert!(collector.extract_samples().is_empty());
    }

    #[test]
    fn test_extract_takes_synchronous_snapshot() {
        let trace = Arc::new(Trace::new(1, Instant::now(), Vec::new()));
        let collector = SpeedCollector::with_config(
            Arc::clone(&trace),
            memoryless::Config {
                expected: Duration::from_secs(60),
                min: Duration::from_secs(60),
                max: Duration::ZERO,
            },
        );
        trace.update_read_summary("tcp", "1.1.1.1:443", 7);
        let samples = collector.extract_samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].num_bytes, 7);
    }

    #[test]
    fn test_bad_config_falls_back() {
        let trace = Arc::new(Trace::new(1, Instant::now(), Vec::new()));
        let collector = SpeedCollector::with_config(
            trace,
            memoryless::Config {
                expected: Duration::from_millis(1),
                min: Duration::from_millis(2),
                max: Duration::from_millis(3),
            },
        );
        drop(collector);
    }
}
