//! Resource Usage Monitoring
//!
//! Samples system-wide CPU and memory while a run is active, together with
//! the number of threads the scheduler has granted to running tasks. The
//! heavy work happens in child processes, so the engine's own process is not
//! what we want to watch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::System;

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    /// When this sample was taken
    pub timestamp: Instant,
    /// System CPU usage percentage (0-100)
    pub cpu_usage: f32,
    /// Used system memory in megabytes
    pub memory_mb: u64,
    /// Threads granted to running tasks
    pub threads_in_use: usize,
}

/// Peak and average values over a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourcePeaks {
    pub average_cpu: f32,
    pub peak_cpu: f32,
    pub peak_memory_mb: u64,
    pub peak_threads: usize,
    pub samples: usize,
}

/// Monitors system resource usage.
///
/// # Example
///
/// ```rust,ignore
/// use ruleflow::monitoring::ResourceMonitor;
/// use std::sync::atomic::AtomicUsize;
/// use std::sync::Arc;
///
/// let threads = Arc::new(AtomicUsize::new(0));
/// let mut monitor = ResourceMonitor::new(Arc::clone(&threads));
/// monitor.sample();
/// println!("{}", monitor.get_summary());
/// ```
pub struct ResourceMonitor {
    system: System,
    threads_in_use: Arc<AtomicUsize>,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    /// Creates a monitor reading the scheduler's thread counter.
    pub fn new(threads_in_use: Arc<AtomicUsize>) -> Self {
        Self {
            system: System::new(),
            threads_in_use,
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a resource usage sample.
    ///
    /// The first call only primes the CPU counters. Subsequent calls are
    /// rate-limited by `min_interval`.
    pub fn sample(&mut self) {
        let now = Instant::now();

        if !self.warmup_done {
            self.system.refresh_cpu();
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }

        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.last_sample = Some(now);

        self.samples.push(ResourceSample {
            timestamp: now,
            cpu_usage: self.system.global_cpu_info().cpu_usage(),
            memory_mb: self.system.used_memory() / (1024 * 1024),
            threads_in_use: self.threads_in_use.load(Ordering::Relaxed),
        });
    }

    /// Returns all collected samples.
    pub fn get_samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    /// Peak and average values over all samples.
    pub fn peaks(&self) -> ResourcePeaks {
        if self.samples.is_empty() {
            return ResourcePeaks::default();
        }
        ResourcePeaks {
            average_cpu: self.samples.iter().map(|s| s.cpu_usage).sum::<f32>()
                / self.samples.len() as f32,
            peak_cpu: self.samples.iter().map(|s| s.cpu_usage).fold(0.0, f32::max),
            peak_memory_mb: self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0),
            peak_threads: self.samples.iter().map(|s| s.threads_in_use).max().unwrap_or(0),
            samples: self.samples.len(),
        }
    }

    /// Returns a human-readable summary of resource usage.
    pub fn get_summary(&self) -> String {
        if self.samples.is_empty() {
            return "No resource data collected".to_string();
        }
        let peaks = self.peaks();
        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak CPU: {:.1}%\n  Peak Memory: {} MB\n  Peak Threads: {}\n  Samples: {}",
            peaks.average_cpu, peaks.peak_cpu, peaks.peak_memory_mb, peaks.peak_threads, peaks.samples
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn monitor() -> (ResourceMonitor, Arc<AtomicUsize>) {
        let threads = Arc::new(AtomicUsize::new(0));
        (ResourceMonitor::new(Arc::clone(&threads)), threads)
    }

    #[test]
    fn test_sampling() {
        let (mut monitor, _) = monitor();

        // First sample is warmup
        monitor.sample();
        assert!(monitor.get_samples().is_empty());

        thread::sleep(Duration::from_millis(300));
        monitor.sample();
        assert_eq!(monitor.get_samples().len(), 1);
    }

    #[test]
    fn test_monitor_with_min_interval() {
        let (monitor, _) = monitor();
        let mut monitor = monitor.with_min_interval(Duration::from_millis(200));

        monitor.sample();
        monitor.sample();
        assert!(monitor.get_samples().is_empty());

        thread::sleep(Duration::from_millis(250));
        monitor.sample();
        assert!(!monitor.get_samples().is_empty());
    }

    #[test]
    fn test_threads_in_use_recorded() {
        let (monitor, threads) = monitor();
        let mut monitor = monitor.with_min_interval(Duration::from_millis(10));
        monitor.sample();

        threads.store(3, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        monitor.sample();
        threads.store(1, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        monitor.sample();

        let peaks = monitor.peaks();
        assert_eq!(peaks.peak_threads, 3);
        assert_eq!(peaks.samples, 2);
        assert!(peaks.peak_cpu >= peaks.average_cpu);
    }

    #[test]
    fn test_summary() {
        let (mut monitor, _) = monitor();
        assert!(monitor.get_summary().contains("No resource data collected"));
        assert_eq!(monitor.peaks(), ResourcePeaks::default());

        monitor.sample();
        thread::sleep(Duration::from_millis(300));
        monitor.sample();

        let summary = monitor.get_summary();
        assert!(summary.contains("Resource Usage"));
        assert!(summary.contains("Peak Memory"));
        assert!(summary.contains("Peak Threads"));
    }
}
