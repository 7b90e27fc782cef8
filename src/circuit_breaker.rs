//! GC and heap circuit breaker.
//!
//! Probe creation asks [`CircuitBreakerService::is_tripped`] before doing any
//! work. The common case is a counter bump and an atomic load: only every
//! `sampling_rate + 1`th call on a worker runs the real check, and that check
//! runs under a `try_lock` so concurrent callers never queue behind it.
//!
//! The breaker trips when, since the worker's previous check, old-generation
//! GC took at least `gc_cpu_threshold` percent of wall-clock time *and* free
//! heap is at or below `memory_threshold` percent. It only resets at a
//! harvest boundary, and only when a fresh check no longer trips.
//!
//! Per-thread state (sampling counter, GC baselines, warning latch) lives in
//! a [`BreakerWorker`] owned by the caller.

use crate::config::CircuitBreakerConfig;
use crate::stats::StatsEngine;
use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

pub const BREAKER_TRIPPED: &str = "AgentCheck/CircuitBreaker/tripped/all";
pub const BREAKER_TRIPPED_MEMORY: &str = "AgentCheck/CircuitBreaker/tripped/memory";

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic clock for [`HeapSample::timestamp_nanos`].
pub fn monotonic_nanos() -> u64 {
    u64::try_from(CLOCK_EPOCH.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Returns `true` once every `rate + 1` calls.
#[derive(Debug, Clone)]
pub struct SamplingCounter {
    rate: u64,
    count: u64,
}

impl SamplingCounter {
    pub fn new(rate: u64) -> Self {
        Self { rate, count: 0 }
    }

    pub fn should_sample(&mut self) -> bool {
        self.count += 1;
        if self.count > self.rate {
            self.count = 0;
            return true;
        }
        false
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }
}

/// Point-in-time reading of GC time and heap occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSample {
    /// Cumulative old-generation collection time.
    pub gc_time_nanos: u64,
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub max_bytes: u64,
    /// Monotonic clock reading taken with the sample.
    pub timestamp_nanos: u64,
}

impl HeapSample {
    /// Free heap as a percentage of the maximum heap, counting memory the
    /// heap may still grow into as free.
    pub fn free_memory_percent(&self) -> f64 {
        if self.max_bytes == 0 {
            return 100.0;
        }
        let headroom = self.max_bytes.saturating_sub(self.total_bytes);
        100.0 * (self.free_bytes.saturating_add(headroom) as f64 / self.max_bytes as f64)
    }
}

/// Source of heap samples: the JVM in production, scripted values in tests.
pub trait HeapSampler: Send + Sync {
    /// `None` when a reading cannot be taken right now.
    fn sample(&self) -> Option<HeapSample>;

    /// Whether this sampler can ever produce readings.
    fn is_available(&self) -> bool {
        true
    }
}

/// Sampler used before the VM is up; never produces a reading.
#[derive(Debug, Default)]
pub struct NoHeapSampler;

impl HeapSampler for NoHeapSampler {
    fn sample(&self) -> Option<HeapSample> {
        None
    }
}

/// Sampler for a VM whose heap figures cannot be read at all. Installing it
/// turns the breaker off.
#[derive(Debug, Default)]
pub struct MissingHeapSampler;

impl HeapSampler for MissingHeapSampler {
    fn sample(&self) -> Option<HeapSample> {
        None
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthCategory {
    CircuitBreaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    /// The breaker tripped on GC time and free heap. Details are the free
    /// memory and GC time percentages.
    GcCircuitBreaker,
}

impl HealthStatus {
    pub fn category(&self) -> HealthCategory {
        match self {
            HealthStatus::GcCircuitBreaker => HealthCategory::CircuitBreaker,
        }
    }

    pub fn describe(&self, details: &[String]) -> String {
        match (self, details) {
            (HealthStatus::GcCircuitBreaker, [memory, gc, ..]) => {
                format!("Circuit breaker tripped: free memory {memory}%, GC CPU time {gc}%")
            }
            (HealthStatus::GcCircuitBreaker, _) => "Circuit breaker tripped".to_string(),
        }
    }
}

/// Observer of agent health changes.
pub trait HealthDataChangeListener: Send + Sync {
    fn on_unhealthy_status(&self, status: HealthStatus, details: &[String]);
    fn on_healthy_status(&self, category: HealthCategory);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Off,
    Ok,
    Tripped,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Off => f.write_str("off"),
            BreakerState::Ok => f.write_str("ok"),
            BreakerState::Tripped => f.write_str("tripped"),
        }
    }
}

/// State one thread carries between breaker checks.
#[derive(Debug, Clone)]
pub struct BreakerWorker {
    counter: SamplingCounter,
    last_gc_time_nanos: Option<u64>,
    last_timestamp_nanos: Option<u64>,
    log_warning: bool,
}

impl BreakerWorker {
    pub fn new(sampling_rate: u64) -> Self {
        Self {
            counter: SamplingCounter::new(sampling_rate),
            last_gc_time_nanos: None,
            last_timestamp_nanos: None,
            log_warning: true,
        }
    }

    /// Overrides the GC baselines the next check measures against.
    pub fn set_previous_checks(&mut self, gc_time_nanos: u64, timestamp_nanos: u64) {
        self.last_gc_time_nanos = Some(gc_time_nanos);
        self.last_timestamp_nanos = Some(timestamp_nanos);
    }

    fn reset_baselines(&mut self, sample: Option<HeapSample>) {
        match sample {
            Some(sample) => self.set_previous_checks(sample.gc_time_nanos, sample.timestamp_nanos),
            None => {
                self.last_gc_time_nanos = None;
                self.last_timestamp_nanos = None;
            }
        }
    }
}

pub struct CircuitBreakerService {
    config: ArcSwap<CircuitBreakerConfig>,
    sampler: RwLock<Arc<dyn HeapSampler>>,
    tripped: AtomicBool,
    check_lock: Mutex<()>,
    missing_data: Mutex<HashMap<String, bool>>,
    listeners: RwLock<Vec<Arc<dyn HealthDataChangeListener>>>,
}

impl CircuitBreakerService {
    pub fn new(config: CircuitBreakerConfig, sampler: Arc<dyn HeapSampler>) -> Self {
        let service = Self {
            config: ArcSwap::from_pointee(config),
            sampler: RwLock::new(Arc::new(NoHeapSampler)),
            tripped: AtomicBool::new(false),
            check_lock: Mutex::new(()),
            missing_data: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        };
        service.set_sampler(sampler);
        service
    }

    /// Replaces the heap sampler. An enabled breaker whose sampler cannot
    /// produce readings is disabled.
    pub fn set_sampler(&self, sampler: Arc<dyn HeapSampler>) {
        if self.is_enabled() && !sampler.is_available() {
            warn!("Circuit breaker: missing required GC readings, disabling the circuit breaker");
            let mut config = **self.config.load();
            config.enabled = false;
            self.config.store(Arc::new(config));
        }
        *self.sampler.write() = sampler;
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        **self.config.load()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.load().enabled
    }

    /// A fresh per-thread state using the configured sampling rate.
    pub fn worker(&self) -> BreakerWorker {
        BreakerWorker::new(self.config.load().sampling_rate)
    }

    pub fn register_health_listener(&self, listener: Arc<dyn HealthDataChangeListener>) {
        self.listeners.write().push(listener);
    }

    pub fn state(&self) -> BreakerState {
        if self.tripped.load(Ordering::Acquire) {
            BreakerState::Tripped
        } else if self.is_enabled() {
            BreakerState::Ok
        } else {
            BreakerState::Off
        }
    }

    /// Hot-path query made before every probe creation.
    pub fn is_tripped(&self, worker: &mut BreakerWorker) -> bool {
        if self.is_enabled() && worker.counter.should_sample() && !self.tripped.load(Ordering::Acquire) {
            self.check_and_trip(worker);
        }
        self.tripped.load(Ordering::Acquire)
    }

    /// Runs the trip check unless another thread is already running it.
    /// Returns `true` only for the call that tripped the breaker.
    pub fn check_and_trip(&self, worker: &mut BreakerWorker) -> bool {
        let Some(_guard) = self.check_lock.try_lock() else {
            return false;
        };
        if !self.tripped.load(Ordering::Acquire) && self.should_trip(worker) {
            self.trip(worker);
            return true;
        }
        false
    }

    fn should_trip(&self, worker: &mut BreakerWorker) -> bool {
        let config = self.config();
        if !config.enabled {
            return false;
        }
        let Some(sample) = self.sampler.read().sample() else {
            trace!("Circuit breaker: no heap sample available");
            return false;
        };
        let (Some(last_gc), Some(last_timestamp)) = (worker.last_gc_time_nanos, worker.last_timestamp_nanos) else {
            worker.reset_baselines(Some(sample));
            return false;
        };

        let elapsed = sample.timestamp_nanos as i128 - last_timestamp as i128;
        if elapsed <= 0 {
            return false;
        }
        let gc_time = sample.gc_time_nanos.saturating_sub(last_gc);
        let gc_cpu_percent = gc_time as f64 / elapsed as f64 * 100.0;
        let free_memory_percent = sample.free_memory_percent();
        worker.set_previous_checks(last_gc + gc_time, sample.timestamp_nanos);

        trace!(
            free_memory_percent,
            gc_cpu_percent,
            memory_threshold = config.memory_threshold,
            gc_cpu_threshold = config.gc_cpu_threshold,
            "Circuit breaker check"
        );

        if gc_cpu_percent >= f64::from(config.gc_cpu_threshold)
            && free_memory_percent <= f64::from(config.memory_threshold)
        {
            warn!(free_memory_percent, gc_cpu_percent, "Circuit breaker tripped");
            let details = [free_memory_percent.to_string(), gc_cpu_percent.to_string()];
            for listener in self.listeners.read().iter() {
                listener.on_unhealthy_status(HealthStatus::GcCircuitBreaker, &details);
            }
            return true;
        }
        false
    }

    fn trip(&self, worker: &mut BreakerWorker) {
        self.tripped.store(true, Ordering::Release);
        for incomplete in self.missing_data.lock().values_mut() {
            *incomplete = true;
        }
        if worker.log_warning {
            worker.log_warning = false;
            warn!(
                "Circuit breaker tripped. The agent ceased to create transaction data to preserve heap memory. \
                 This may cause incomplete transaction data."
            );
        }
    }

    pub fn reset(&self, worker: &mut BreakerWorker) {
        self.tripped.store(false, Ordering::Release);
        debug!("Circuit breaker reset");
        for listener in self.listeners.read().iter() {
            listener.on_healthy_status(HealthCategory::CircuitBreaker);
        }
        worker.log_warning = true;
    }

    /// Start of a harvest: rebases the worker's GC baselines and records
    /// whether `app_name`'s data for the window is incomplete.
    pub fn before_harvest(&self, worker: &mut BreakerWorker, app_name: &str, stats: &mut StatsEngine) {
        let sample = self.sampler.read().sample();
        worker.reset_baselines(sample);

        let incomplete = self.missing_data.lock().get(app_name).copied().unwrap_or(false);
        if incomplete {
            stats.get_stats(BREAKER_TRIPPED).increment_call_count();
            stats.get_stats(BREAKER_TRIPPED_MEMORY).increment_call_count();
        } else {
            stats.record_empty_stats(BREAKER_TRIPPED);
        }
    }

    /// End of a harvest: the only point where a tripped breaker may reset.
    pub fn after_harvest(&self, worker: &mut BreakerWorker, app_name: &str) {
        if self.is_tripped(worker) && !self.should_trip(worker) {
            self.reset(worker);
        }
        if !self.is_tripped(worker) {
            self.missing_data.lock().insert(app_name.to_string(), false);
            // A trip between the two statements above must not be lost.
            if self.is_tripped(worker) {
                self.missing_data.lock().insert(app_name.to_string(), true);
            }
        }
    }

    pub fn add_application(&self, worker: &mut BreakerWorker, app_name: &str) {
        let tripped = self.is_tripped(worker);
        self.missing_data.lock().insert(app_name.to_string(), tripped);
    }

    pub fn remove_application(&self, app_name: &str) {
        self.missing_data.lock().remove(app_name);
    }

    /// Whether `app_name`'s data for the current window is incomplete.
    pub fn is_missing_data(&self, app_name: &str) -> bool {
        self.missing_data.lock().get(app_name).copied().unwrap_or(false)
    }

    pub fn config_changed(&self, config: CircuitBreakerConfig) {
        let current = self.config();
        if current.enabled == config.enabled
            && current.gc_cpu_threshold == config.gc_cpu_threshold
            && current.memory_threshold == config.memory_threshold
        {
            return;
        }
        if let Err(e) = config.validate() {
            warn!(error = %e, "Circuit breaker: ignoring invalid configuration");
            return;
        }
        let updated = CircuitBreakerConfig { sampling_rate: current.sampling_rate, ..config };
        self.config.store(Arc::new(updated));
        info!(
            enabled = updated.enabled,
            gc_cpu_threshold = updated.gc_cpu_threshold,
            memory_threshold = updated.memory_threshold,
            "Circuit breaker: updated configuration"
        );
    }
}

impl fmt::Debug for CircuitBreakerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerService")
            .field("config", &self.config())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSampler(Mutex<HeapSample>);

    impl HeapSampler for FixedSampler {
        fn sample(&self) -> Option<HeapSample> {
            Some(*self.0.lock())
        }
    }

    fn sample(gc_time_nanos: u64, free_bytes: u64, timestamp_nanos: u64) -> HeapSample {
        HeapSample { gc_time_nanos, free_bytes, total_bytes: 1000, max_bytes: 1000, timestamp_nanos }
    }

    #[test]
    fn sampling_counter_fires_every_rate_plus_one() {
        let mut counter = SamplingCounter::new(3);
        let fired: Vec<bool> = (0..8).map(|_| counter.should_sample()).collect();
        assert_eq!(fired, vec![false, false, false, true, false, false, false, true]);
    }

    proptest::proptest! {
        #[test]
        fn prop_sampling_counter_fires_at_multiples(rate in 0u64..50, calls in 1usize..400) {
            let mut counter = SamplingCounter::new(rate);
            let period = rate as usize + 1;
            for call in 1..=calls {
                proptest::prop_assert_eq!(counter.should_sample(), call % period == 0);
            }
        }
    }

    #[test]
    fn free_memory_counts_headroom() {
        let s = HeapSample { gc_time_nanos: 0, free_bytes: 100, total_bytes: 500, max_bytes: 1000, timestamp_nanos: 0 };
        assert!((s.free_memory_percent() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn first_check_only_sets_baselines() {
        let sampler = Arc::new(FixedSampler(Mutex::new(sample(5_000, 10, 1_000))));
        let breaker = CircuitBreakerService::new(CircuitBreakerConfig::default(), sampler);
        let mut worker = breaker.worker();
        assert!(!breaker.check_and_trip(&mut worker));
        assert_eq!(worker.last_gc_time_nanos, Some(5_000));
        assert_eq!(worker.last_timestamp_nanos, Some(1_000));
    }

    #[test]
    fn unavailable_sampler_disables() {
        let breaker = CircuitBreakerService::new(CircuitBreakerConfig::default(), Arc::new(MissingHeapSampler));
        assert!(!breaker.is_enabled());
        assert_eq!(breaker.state(), BreakerState::Off);
    }

    #[test]
    fn config_change_keeps_sampling_rate() {
        let breaker = CircuitBreakerService::new(CircuitBreakerConfig::default(), Arc::new(NoHeapSampler));
        breaker.config_changed(CircuitBreakerConfig {
            enabled: true,
            memory_threshold: 30,
            gc_cpu_threshold: 5,
            sampling_rate: 1,
        });
        let config = breaker.config();
        assert_eq!(config.memory_threshold, 30);
        assert_eq!(config.gc_cpu_threshold, 5);
        assert_eq!(config.sampling_rate, 1000);

        breaker.config_changed(CircuitBreakerConfig { memory_threshold: 0, ..config });
        assert_eq!(breaker.config().memory_threshold, 30);
    }

    #[test]
    fn describe_health_status() {
        let details = ["12.5".to_string(), "40".to_string()];
        assert_eq!(
            HealthStatus::GcCircuitBreaker.describe(&details),
            "Circuit breaker tripped: free memory 12.5%, GC CPU time 40%"
        );
        assert_eq!(HealthStatus::GcCircuitBreaker.category(), HealthCategory::CircuitBreaker);
    }
}
