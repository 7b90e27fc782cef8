//! Periodic harvest of probe metrics.
//!
//! A [`HarvestCycle`] is one application's harvest: take the metrics
//! recorded since the last cycle, let the circuit breaker mark the window,
//! hand the result to listeners and give the breaker its chance to reset.
//! [`Harvester`] runs cycles on a named background thread.

use crate::circuit_breaker::{BreakerState, BreakerWorker, CircuitBreakerService};
use crate::runtime::MetricAggregator;
use crate::stats::StatsEngine;
use parking_lot::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const HARVEST_THREAD_NAME: &str = "jvmti-probes-harvest";

#[derive(Debug, Clone)]
pub struct HarvestReport {
    pub app_name: String,
    pub stats: StatsEngine,
    /// The breaker was tripped at some point during the window.
    pub incomplete: bool,
    /// Breaker state once the cycle finished.
    pub breaker_state: BreakerState,
}

pub trait HarvestListener: Send + Sync {
    fn on_harvest(&self, report: &HarvestReport);
}

pub struct HarvestCycle {
    app_name: String,
    breaker: Arc<CircuitBreakerService>,
    aggregator: Arc<MetricAggregator>,
    worker: BreakerWorker,
    listeners: Vec<Arc<dyn HarvestListener>>,
}

impl HarvestCycle {
    pub fn new(
        app_name: impl Into<String>,
        breaker: Arc<CircuitBreakerService>,
        aggregator: Arc<MetricAggregator>,
    ) -> Self {
        let app_name = app_name.into();
        let mut worker = breaker.worker();
        breaker.add_application(&mut worker, &app_name);
        Self { app_name, breaker, aggregator, worker, listeners: Vec::new() }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn HarvestListener>) {
        self.listeners.push(listener);
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn run(&mut self) -> HarvestReport {
        let started = Instant::now();
        let mut stats = self.aggregator.harvest();
        self.breaker.before_harvest(&mut self.worker, &self.app_name, &mut stats);
        let incomplete = self.breaker.is_missing_data(&self.app_name);

        self.breaker.after_harvest(&mut self.worker, &self.app_name);
        let report =
            HarvestReport { app_name: self.app_name.clone(), stats, incomplete, breaker_state: self.breaker.state() };
        for listener in &self.listeners {
            listener.on_harvest(&report);
        }

        info!(
            app = %report.app_name,
            metrics = report.stats.len(),
            calls = report.stats.total_calls(),
            incomplete = report.incomplete,
            breaker = %report.breaker_state,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Harvest complete"
        );
        report
    }
}

impl Drop for HarvestCycle {
    fn drop(&mut self) {
        self.breaker.remove_application(&self.app_name);
    }
}

enum HarvestCommand {
    Now(SyncSender<HarvestReport>),
    Shutdown,
}

/// Runs a [`HarvestCycle`] every period until shut down. Shutting down runs
/// one last cycle so the final window is not lost.
pub struct Harvester {
    sender: Mutex<SyncSender<HarvestCommand>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Harvester {
    pub fn start(cycle: HarvestCycle, period: Duration) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(4);
        let handle = std::thread::Builder::new()
            .name(HARVEST_THREAD_NAME.into())
            .spawn(move || harvest_loop(cycle, period, receiver))?;
        debug!(period_secs = period.as_secs(), "Harvest thread started");
        Ok(Self { sender: Mutex::new(sender), handle: Mutex::new(Some(handle)) })
    }

    /// Runs a cycle immediately and waits for its report.
    pub fn harvest_now(&self) -> Option<HarvestReport> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender.lock().send(HarvestCommand::Now(tx)).ok()?;
        rx.recv().ok()
    }

    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.sender.lock().send(HarvestCommand::Shutdown);
        if handle.join().is_err() {
            warn!("Harvest thread panicked");
        }
    }
}

impl Drop for Harvester {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn harvest_loop(mut cycle: HarvestCycle, period: Duration, receiver: mpsc::Receiver<HarvestCommand>) {
    let mut next = Instant::now() + period;
    loop {
        let wait = next.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {
                cycle.run();
                next = Instant::now() + period;
            }
            Ok(HarvestCommand::Now(reply)) => {
                let _ = reply.send(cycle.run());
            }
            Ok(HarvestCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                cycle.run();
                debug!(app = cycle.app_name(), "Harvest thread stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::NoHeapSampler;
    use crate::config::CircuitBreakerConfig;

    #[derive(Default)]
    struct Collect(Mutex<Vec<HarvestReport>>);

    impl HarvestListener for Collect {
        fn on_harvest(&self, report: &HarvestReport) {
            self.0.lock().push(report.clone());
        }
    }

    fn cycle() -> (HarvestCycle, Arc<Collect>) {
        let breaker = Arc::new(CircuitBreakerService::new(CircuitBreakerConfig::default(), Arc::new(NoHeapSampler)));
        let mut cycle = HarvestCycle::new("app", breaker, Arc::new(MetricAggregator::new()));
        let collect = Arc::new(Collect::default());
        cycle.add_listener(collect.clone());
        (cycle, collect)
    }

    #[test]
    fn cycle_records_breaker_off_metric() {
        let (mut cycle, collect) = cycle();
        let report = cycle.run();
        assert!(!report.incomplete);
        assert_eq!(report.breaker_state, BreakerState::Ok);
        let tripped = report.stats.get(crate::circuit_breaker::BREAKER_TRIPPED).unwrap();
        assert_eq!(tripped.call_count(), 0);
        assert_eq!(collect.0.lock().len(), 1);
    }

    #[test]
    fn harvester_runs_on_demand_and_at_shutdown() {
        let (cycle, collect) = cycle();
        let harvester = Harvester::start(cycle, Duration::from_secs(3600)).unwrap();
        let report = harvester.harvest_now().unwrap();
        assert_eq!(report.app_name, "app");
        harvester.shutdown();
        harvester.shutdown();
        assert_eq!(collect.0.lock().len(), 2);
        assert!(harvester.harvest_now().is_none());
    }
}
