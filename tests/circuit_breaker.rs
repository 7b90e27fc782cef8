use jvmti_probes::circuit_breaker::{
    BreakerState, CircuitBreakerService, HealthCategory, HealthDataChangeListener, HealthStatus, HeapSample,
    HeapSampler, MissingHeapSampler, NoHeapSampler, BREAKER_TRIPPED, BREAKER_TRIPPED_MEMORY,
};
use jvmti_probes::config::CircuitBreakerConfig;
use jvmti_probes::harvest::HarvestCycle;
use jvmti_probes::rewrite::ProbeRegistry;
use jvmti_probes::runtime::{MetricAggregator, ProbeRuntime, ProbeTable};
use jvmti_probes::trace::TraceDetails;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

/// Hands out queued samples in order and repeats the last one once the
/// queue runs dry.
#[derive(Default)]
struct ScriptedSampler {
    queue: Mutex<VecDeque<HeapSample>>,
    last: Mutex<Option<HeapSample>>,
}

impl ScriptedSampler {
    fn push(&self, gc_time_nanos: u64, free_bytes: u64, timestamp_nanos: u64) {
        self.queue.lock().unwrap().push_back(HeapSample {
            gc_time_nanos,
            free_bytes,
            total_bytes: 1000,
            max_bytes: 1000,
            timestamp_nanos,
        });
    }
}

impl HeapSampler for ScriptedSampler {
    fn sample(&self) -> Option<HeapSample> {
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            *last = Some(next);
        }
        *last
    }
}

#[derive(Default)]
struct HealthLog {
    unhealthy: Mutex<Vec<(HealthStatus, Vec<String>)>>,
    healthy: AtomicUsize,
}

impl HealthDataChangeListener for HealthLog {
    fn on_unhealthy_status(&self, status: HealthStatus, details: &[String]) {
        self.unhealthy.lock().unwrap().push((status, details.to_vec()));
    }

    fn on_healthy_status(&self, category: HealthCategory) {
        assert_eq!(category, HealthCategory::CircuitBreaker);
        self.healthy.fetch_add(1, Ordering::SeqCst);
    }
}

fn breaker_with(sampler: Arc<dyn HeapSampler>) -> (Arc<CircuitBreakerService>, Arc<HealthLog>) {
    let breaker = Arc::new(CircuitBreakerService::new(CircuitBreakerConfig::default(), sampler));
    let log = Arc::new(HealthLog::default());
    breaker.register_health_listener(log.clone());
    (breaker, log)
}

/// Baseline, then a window with 50% GC time and 10% free heap.
fn pressured() -> Arc<ScriptedSampler> {
    let sampler = Arc::new(ScriptedSampler::default());
    sampler.push(0, 500, 1_000);
    sampler.push(500, 100, 2_000);
    sampler
}

#[test]
fn sustained_pressure_trips_once() {
    let (breaker, log) = breaker_with(pressured());
    let mut worker = breaker.worker();

    assert!(!breaker.check_and_trip(&mut worker), "first check only records a baseline");
    assert_eq!(breaker.state(), BreakerState::Ok);
    assert!(breaker.check_and_trip(&mut worker));
    assert_eq!(breaker.state(), BreakerState::Tripped);
    assert!(!breaker.check_and_trip(&mut worker));

    let unhealthy = log.unhealthy.lock().unwrap();
    assert_eq!(unhealthy.len(), 1);
    let (status, details) = &unhealthy[0];
    assert_eq!(*status, HealthStatus::GcCircuitBreaker);
    assert_eq!(details, &vec!["10".to_string(), "50".to_string()]);
    assert_eq!(
        status.describe(details),
        "Circuit breaker tripped: free memory 10%, GC CPU time 50%"
    );
}

#[test]
fn tripped_breaker_suppresses_new_probes() {
    let (breaker, _) = breaker_with(pressured());
    let probes = Arc::new(ProbeTable::new());
    let id = probes.register("com/acme/Orders", "handle", "()V", Arc::new(TraceDetails::builder().dispatcher(true).build()));
    let runtime = ProbeRuntime::new(probes, breaker.clone(), Arc::new(MetricAggregator::new()));

    let mut worker = runtime.worker();
    let handle = runtime.enter(&mut worker, id);
    assert_ne!(handle, 0);
    runtime.exit(&mut worker, handle, 0xb1);

    let mut checker = breaker.worker();
    breaker.check_and_trip(&mut checker);
    assert!(breaker.check_and_trip(&mut checker));

    assert_eq!(runtime.enter(&mut worker, id), 0);
    assert_eq!(runtime.enter_flyweight(&mut worker, id), 0);
    assert_eq!(runtime.stats().suppressed_by_breaker, 2);
    assert_eq!(runtime.stats().transactions_finished, 1);
}

#[test]
fn harvest_marks_the_window_and_resets_once_pressure_ends() {
    let sampler = pressured();
    let (breaker, log) = breaker_with(sampler.clone());
    let aggregator = Arc::new(MetricAggregator::new());
    let mut cycle = HarvestCycle::new("Orders", breaker.clone(), aggregator);
    assert!(!breaker.is_missing_data("Orders"));

    let mut worker = breaker.worker();
    breaker.check_and_trip(&mut worker);
    assert!(breaker.check_and_trip(&mut worker));
    assert!(breaker.is_missing_data("Orders"));

    // Collections stop and the heap frees up.
    sampler.push(500, 800, 3_000);
    let report = cycle.run();
    assert!(report.incomplete);
    assert_eq!(report.breaker_state, BreakerState::Ok);
    assert_eq!(report.stats.get(BREAKER_TRIPPED).map(|s| s.call_count()), Some(1));
    assert_eq!(report.stats.get(BREAKER_TRIPPED_MEMORY).map(|s| s.call_count()), Some(1));
    assert_eq!(log.healthy.load(Ordering::SeqCst), 1);
    assert!(!breaker.is_missing_data("Orders"));

    let report = cycle.run();
    assert!(!report.incomplete);
    assert_eq!(report.stats.get(BREAKER_TRIPPED).map(|s| s.call_count()), Some(0));
    assert!(report.stats.get(BREAKER_TRIPPED_MEMORY).is_none());
}

#[test]
fn continued_pressure_holds_the_breaker_through_harvest() {
    let sampler = pressured();
    let (breaker, log) = breaker_with(sampler.clone());
    let mut cycle = HarvestCycle::new("Orders", breaker.clone(), Arc::new(MetricAggregator::new()));

    let mut worker = breaker.worker();
    breaker.check_and_trip(&mut worker);
    assert!(breaker.check_and_trip(&mut worker));

    // The harvest rebases on the first reading and still sees 50% GC time
    // in the second.
    sampler.push(500, 100, 2_000);
    sampler.push(1_000, 100, 3_000);
    let report = cycle.run();
    assert!(report.incomplete);
    assert_eq!(report.breaker_state, BreakerState::Tripped);
    assert_eq!(log.healthy.load(Ordering::SeqCst), 0);
    assert_eq!(log.unhealthy.lock().unwrap().len(), 2);
    assert!(breaker.is_missing_data("Orders"));
}

#[test]
fn dropping_a_cycle_forgets_its_application() {
    let (breaker, _) = breaker_with(pressured());
    let cycle = HarvestCycle::new("Orders", breaker.clone(), Arc::new(MetricAggregator::new()));
    let mut worker = breaker.worker();
    breaker.check_and_trip(&mut worker);
    breaker.check_and_trip(&mut worker);
    assert!(breaker.is_missing_data("Orders"));

    drop(cycle);
    assert!(!breaker.is_missing_data("Orders"));
}

#[test]
fn missing_readings_never_trip() {
    let (breaker, log) = breaker_with(Arc::new(NoHeapSampler));
    let mut worker = breaker.worker();
    for _ in 0..5 {
        assert!(!breaker.check_and_trip(&mut worker));
    }
    assert_eq!(breaker.state(), BreakerState::Ok);
    assert!(log.unhealthy.lock().unwrap().is_empty());
}

#[test]
fn unavailable_sampler_turns_the_breaker_off() {
    let (breaker, _) = breaker_with(Arc::new(MissingHeapSampler));
    assert_eq!(breaker.state(), BreakerState::Off);
    assert!(!breaker.config().enabled);

    let mut worker = breaker.worker();
    for _ in 0..5_000 {
        assert!(!breaker.is_tripped(&mut worker));
    }
}

#[test]
fn config_changes_keep_the_sampling_rate() {
    let (breaker, _) = breaker_with(Arc::new(NoHeapSampler));
    breaker.config_changed(CircuitBreakerConfig {
        enabled: true,
        memory_threshold: 30,
        gc_cpu_threshold: 5,
        sampling_rate: 1,
    });
    let config = breaker.config();
    assert_eq!((config.memory_threshold, config.gc_cpu_threshold), (30, 5));
    assert_eq!(config.sampling_rate, CircuitBreakerConfig::default().sampling_rate);

    // Out of range thresholds are ignored.
    breaker.config_changed(CircuitBreakerConfig { memory_threshold: 0, ..config });
    assert_eq!(breaker.config().memory_threshold, 30);

    breaker.config_changed(CircuitBreakerConfig { enabled: false, ..config });
    assert_eq!(breaker.state(), BreakerState::Off);
}

/// Every reading shows 50% GC time and 10% free heap since the previous one.
#[derive(Default)]
struct SteadyPressure(AtomicU64);

impl HeapSampler for SteadyPressure {
    fn sample(&self) -> Option<HeapSample> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Some(HeapSample {
            gc_time_nanos: n * 500,
            free_bytes: 100,
            total_bytes: 1000,
            max_bytes: 1000,
            timestamp_nanos: n * 1_000,
        })
    }
}

#[test]
fn concurrent_checks_trip_exactly_once() {
    let (breaker, log) = breaker_with(Arc::new(SteadyPressure::default()));
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let breaker = Arc::clone(&breaker);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut worker = breaker.worker();
                barrier.wait();
                let mut trips = 0;
                for _ in 0..10_000 {
                    if breaker.check_and_trip(&mut worker) {
                        trips += 1;
                    }
                    if breaker.state() == BreakerState::Tripped {
                        break;
                    }
                }
                trips
            })
        })
        .collect();

    let trips: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(trips, 1);
    assert_eq!(breaker.state(), BreakerState::Tripped);
    assert_eq!(log.unhealthy.lock().unwrap().len(), 1);
}
