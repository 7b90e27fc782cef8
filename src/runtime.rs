//! The Rust side of the hook natives.
//!
//! Injected code identifies its probe by the id handed out by [`ProbeTable`]
//! when the class was rewritten. [`ProbeRuntime`] turns `enter`/`exit` pairs
//! into [`Segment`]s grouped under a [`Transaction`], and hands finished
//! transactions to a [`TransactionSink`].
//!
//! All per-thread state lives in a [`WorkerState`] the caller owns and
//! passes in. The runtime itself only holds shared, thread-safe state.

use crate::circuit_breaker::{BreakerWorker, CircuitBreakerService};
use crate::rewrite::ProbeRegistry;
use crate::stats::StatsEngine;
use crate::trace::{TraceDetails, TransactionNamePriority};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Opcode passed to `exit` by the catch-all handler.
pub const ATHROW: u8 = 0xbf;

const DEFAULT_NAME_CATEGORY: &str = "Custom";

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn next_handle() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// Nanoseconds since the first call; never zero.
fn now_nanos() -> i64 {
    i64::try_from(EPOCH.elapsed().as_nanos()).unwrap_or(i64::MAX).max(1)
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// One registered probe site.
#[derive(Debug, Clone)]
pub struct ProbeDefinition {
    pub id: u32,
    pub class_name: String,
    pub method_name: String,
    pub descriptor: String,
    pub metric_name: String,
    pub details: Arc<TraceDetails>,
}

#[derive(Default)]
struct ProbeTableInner {
    probes: Vec<Arc<ProbeDefinition>>,
    ids: HashMap<(String, String, String), u32>,
}

/// Probe ids, starting at 1. A method keeps its id across retransforms;
/// registering it again replaces its details.
#[derive(Default)]
pub struct ProbeTable {
    inner: RwLock<ProbeTableInner>,
}

impl ProbeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u32) -> Option<Arc<ProbeDefinition>> {
        let index = usize::try_from(id.checked_sub(1)?).ok()?;
        self.inner.read().probes.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProbeRegistry for ProbeTable {
    fn register(&self, class_name: &str, method_name: &str, descriptor: &str, details: Arc<TraceDetails>) -> u32 {
        let metric_name = details.resolve_metric_name(class_name, method_name);
        let key = (class_name.to_string(), method_name.to_string(), descriptor.to_string());
        let mut inner = self.inner.write();
        let id = match inner.ids.get(&key) {
            Some(&id) => id,
            None => {
                let id = u32::try_from(inner.probes.len() + 1).unwrap_or(u32::MAX);
                inner.ids.insert(key, id);
                id
            }
        };
        let probe = Arc::new(ProbeDefinition {
            id,
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            descriptor: descriptor.to_string(),
            metric_name,
            details,
        });
        match usize::try_from(id - 1).ok().and_then(|i| inner.probes.get_mut(i)) {
            Some(slot) => *slot = probe,
            None => inner.probes.push(probe),
        }
        id
    }
}

impl fmt::Debug for ProbeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeTable").field("len", &self.len()).finish()
    }
}

/// One closed probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub probe_id: u32,
    pub metric_name: String,
    pub rollup_metric_names: Vec<String>,
    pub duration: Duration,
    /// The return or `athrow` opcode that ended the call, when known.
    pub exit_opcode: Option<u8>,
    pub exclude_from_transaction_trace: bool,
}

impl Segment {
    fn closed(probe: &ProbeDefinition, duration: Duration, exit_opcode: Option<u8>) -> Self {
        Self {
            probe_id: probe.id,
            metric_name: probe.metric_name.clone(),
            rollup_metric_names: probe.details.rollup_metric_names().to_vec(),
            duration,
            exit_opcode,
            exclude_from_transaction_trace: probe.details.exclude_from_transaction_trace(),
        }
    }

    pub fn threw(&self) -> bool {
        self.exit_opcode == Some(ATHROW)
    }
}

/// A unit of work started by a dispatcher probe.
#[derive(Debug, Clone)]
pub struct Transaction {
    root_handle: u64,
    root_metric: String,
    name: Option<(TransactionNamePriority, String)>,
    web: bool,
    ignored: bool,
    started: Instant,
    duration: Duration,
    segments: Vec<Segment>,
    attributes: Vec<(String, String)>,
}

impl Transaction {
    fn start(root_handle: u64, root: &ProbeDefinition) -> Self {
        Self {
            root_handle,
            root_metric: root.metric_name.clone(),
            name: None,
            web: false,
            ignored: false,
            started: Instant::now(),
            duration: Duration::ZERO,
            segments: Vec::new(),
            attributes: Vec::new(),
        }
    }

    fn apply(&mut self, probe: &ProbeDefinition) {
        let details = &probe.details;
        self.web |= details.is_web_transaction();
        self.ignored |= details.ignore_transaction();
        let Some(name) = details.transaction_name() else {
            return;
        };
        let replaces = match &self.name {
            None => true,
            Some((current, _)) => name.priority > *current || (name.priority == *current && name.override_existing),
        };
        if replaces {
            let category = name.category.as_deref().unwrap_or(DEFAULT_NAME_CATEGORY);
            let path = match &name.path {
                Some(path) => path.clone(),
                None => format!("{}/{}", probe.class_name.replace('/', "."), probe.method_name),
            };
            self.name = Some((name.priority, format!("{category}/{path}")));
        }
    }

    pub fn name(&self) -> &str {
        match &self.name {
            Some((_, name)) => name,
            None => &self.root_metric,
        }
    }

    pub fn metric_name(&self) -> String {
        format!("{}/{}", self.kind(), self.name())
    }

    fn kind(&self) -> &'static str {
        if self.web {
            "WebTransaction"
        } else {
            "OtherTransaction"
        }
    }

    pub fn root_handle(&self) -> u64 {
        self.root_handle
    }

    pub fn is_web(&self) -> bool {
        self.web
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Closed segments in completion order; the root segment is last.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segments that belong in a transaction trace.
    pub fn trace_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| !s.exclude_from_transaction_trace)
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }
}

/// Custom probe logic selected by `TraceDetails::tracer_factory_name`.
pub trait Tracer: Send {
    fn attribute(&mut self, _name: &str, _value: &str) {}
    fn finish(self: Box<Self>, segment: &Segment);
}

pub trait TracerFactory: Send + Sync {
    /// `None` skips the call entirely.
    fn create(&self, probe: &ProbeDefinition) -> Option<Box<dyn Tracer>>;
}

/// Receives finished work.
pub trait TransactionSink: Send + Sync {
    fn transaction_finished(&self, transaction: &Transaction);

    fn async_finished(&self, _segment: &Segment, _attributes: &[(String, String)]) {}
}

/// Default sink: call counts and timings per metric for the current
/// harvest window.
#[derive(Debug, Default)]
pub struct MetricAggregator {
    engine: Mutex<StatsEngine>,
}

impl MetricAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes everything recorded since the previous harvest.
    pub fn harvest(&self) -> StatsEngine {
        std::mem::take(&mut *self.engine.lock())
    }

    fn record_segment(engine: &mut StatsEngine, segment: &Segment) {
        let nanos = duration_nanos(segment.duration);
        engine.get_stats(&segment.metric_name).record_nanos(nanos);
        for rollup in &segment.rollup_metric_names {
            engine.get_stats(rollup).record_nanos(nanos);
        }
    }
}

impl TransactionSink for MetricAggregator {
    fn transaction_finished(&self, transaction: &Transaction) {
        let nanos = duration_nanos(transaction.duration());
        let mut engine = self.engine.lock();
        engine.get_stats(&format!("{}/all", transaction.kind())).record_nanos(nanos);
        engine.get_stats(&transaction.metric_name()).record_nanos(nanos);
        for segment in transaction.segments() {
            Self::record_segment(&mut engine, segment);
        }
    }

    fn async_finished(&self, segment: &Segment, _attributes: &[(String, String)]) {
        Self::record_segment(&mut self.engine.lock(), segment);
    }
}

struct OpenFrame {
    handle: u64,
    probe: Arc<ProbeDefinition>,
    started: Instant,
    tracer: Option<Box<dyn Tracer>>,
}

struct AsyncFrame {
    probe: Arc<ProbeDefinition>,
    started: Instant,
    attributes: Vec<(String, String)>,
}

/// Probe state of one application thread.
pub struct WorkerState {
    breaker: BreakerWorker,
    transaction: Option<Transaction>,
    stack: Vec<OpenFrame>,
    log_unwind: bool,
}

impl WorkerState {
    pub fn new(breaker: &CircuitBreakerService) -> Self {
        Self { breaker: breaker.worker(), transaction: None, stack: Vec::new(), log_unwind: true }
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Handles opened on this thread and not yet closed, innermost last.
    pub fn open_handles(&self) -> Vec<u64> {
        self.stack.iter().map(|f| f.handle).collect()
    }

    fn in_leaf(&self) -> bool {
        self.stack.last().is_some_and(|f| f.probe.details.is_leaf())
    }
}

impl fmt::Debug for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerState")
            .field("in_transaction", &self.in_transaction())
            .field("open_handles", &self.open_handles())
            .finish()
    }
}

#[derive(Debug, Default)]
struct RuntimeCounters {
    transactions_finished: AtomicU64,
    transactions_ignored: AtomicU64,
    suppressed_by_breaker: AtomicU64,
    mismatched_exits: AtomicU64,
    unwound_frames: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStatsSnapshot {
    pub transactions_finished: u64,
    pub transactions_ignored: u64,
    pub suppressed_by_breaker: u64,
    pub mismatched_exits: u64,
    /// Frames closed on behalf of an outer exit because their own exit never ran.
    pub unwound_frames: u64,
}

pub struct ProbeRuntime {
    probes: Arc<ProbeTable>,
    breaker: Arc<CircuitBreakerService>,
    sink: Arc<dyn TransactionSink>,
    factories: RwLock<HashMap<String, Arc<dyn TracerFactory>>>,
    async_frames: Mutex<HashMap<u64, AsyncFrame>>,
    counters: RuntimeCounters,
}

impl ProbeRuntime {
    pub fn new(probes: Arc<ProbeTable>, breaker: Arc<CircuitBreakerService>, sink: Arc<dyn TransactionSink>) -> Self {
        Self {
            probes,
            breaker,
            sink,
            factories: RwLock::new(HashMap::new()),
            async_frames: Mutex::new(HashMap::new()),
            counters: RuntimeCounters::default(),
        }
    }

    pub fn probes(&self) -> &Arc<ProbeTable> {
        &self.probes
    }

    pub fn breaker(&self) -> &Arc<CircuitBreakerService> {
        &self.breaker
    }

    pub fn worker(&self) -> WorkerState {
        WorkerState::new(&self.breaker)
    }

    pub fn register_tracer_factory(&self, name: impl Into<String>, factory: Arc<dyn TracerFactory>) {
        self.factories.write().insert(name.into(), factory);
    }

    pub fn stats(&self) -> RuntimeStatsSnapshot {
        RuntimeStatsSnapshot {
            transactions_finished: self.counters.transactions_finished.load(Ordering::Relaxed),
            transactions_ignored: self.counters.transactions_ignored.load(Ordering::Relaxed),
            suppressed_by_breaker: self.counters.suppressed_by_breaker.load(Ordering::Relaxed),
            mismatched_exits: self.counters.mismatched_exits.load(Ordering::Relaxed),
            unwound_frames: self.counters.unwound_frames.load(Ordering::Relaxed),
        }
    }

    pub fn pending_async(&self) -> usize {
        self.async_frames.lock().len()
    }

    /// Common gate for every probe kind. `None` means the call is not traced.
    fn admit(&self, worker: &mut WorkerState, probe_id: u32) -> Option<Arc<ProbeDefinition>> {
        let Some(probe) = self.probes.get(probe_id) else {
            trace!(probe_id, "Unknown probe id");
            return None;
        };
        if self.breaker.is_tripped(&mut worker.breaker) {
            self.counters.suppressed_by_breaker.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if worker.in_leaf() {
            return None;
        }
        Some(probe)
    }

    /// Opens a probe and returns its handle, or 0 when nothing is traced.
    pub fn enter(&self, worker: &mut WorkerState, probe_id: u32) -> u64 {
        let Some(probe) = self.admit(worker, probe_id) else {
            return 0;
        };
        let details = probe.details.clone();
        if details.is_async() {
            return self.enter_async(probe);
        }
        if worker.transaction.is_none() && !details.dispatcher() {
            return 0;
        }

        let tracer = match details.tracer_factory_name() {
            None => None,
            Some(name) => {
                let factory = self.factories.read().get(name).cloned();
                match factory {
                    Some(factory) => match factory.create(&probe) {
                        Some(tracer) => Some(tracer),
                        None => return 0,
                    },
                    None => {
                        debug!(factory = name, metric = %probe.metric_name, "No tracer factory registered, timing only");
                        None
                    }
                }
            }
        };

        let handle = next_handle();
        let transaction = worker.transaction.get_or_insert_with(|| Transaction::start(handle, &probe));
        transaction.apply(&probe);
        worker.stack.push(OpenFrame { handle, probe, started: Instant::now(), tracer });
        handle
    }

    /// Closes `handle`. Frames opened above it whose exits never ran, such as
    /// a constructor that threw, are closed first as `athrow` exits. A handle
    /// that is not open on this thread is ignored.
    pub fn exit(&self, worker: &mut WorkerState, handle: u64, opcode: i32) {
        if handle == 0 {
            return;
        }
        let Some(depth) = worker.stack.iter().rposition(|f| f.handle == handle) else {
            self.counters.mismatched_exits.fetch_add(1, Ordering::Relaxed);
            debug!(handle, open = ?worker.open_handles(), "Ignoring exit for a handle that is not open");
            return;
        };

        let abandoned = worker.stack.len() - depth - 1;
        if abandoned > 0 {
            self.counters.unwound_frames.fetch_add(abandoned as u64, Ordering::Relaxed);
            if worker.log_unwind {
                worker.log_unwind = false;
                warn!(handle, abandoned, "Closing probes whose exit never ran; further occurrences on this thread are logged at debug");
            } else {
                debug!(handle, abandoned, "Closing probes whose exit never ran");
            }
            for _ in 0..abandoned {
                Self::close_innermost(worker, Some(ATHROW));
            }
        }

        Self::close_innermost(worker, u8::try_from(opcode).ok());
        if worker.stack.is_empty() {
            if let Some(transaction) = worker.transaction.take() {
                self.finish_transaction(transaction);
            }
        }
    }

    fn close_innermost(worker: &mut WorkerState, exit_opcode: Option<u8>) {
        let Some(frame) = worker.stack.pop() else {
            return;
        };
        let segment = Segment::closed(&frame.probe, frame.started.elapsed(), exit_opcode);
        if let Some(tracer) = frame.tracer {
            tracer.finish(&segment);
        }
        if let Some(transaction) = worker.transaction.as_mut() {
            transaction.segments.push(segment);
        }
    }

    fn finish_transaction(&self, mut transaction: Transaction) {
        transaction.duration = transaction.started.elapsed();
        if transaction.ignored {
            self.counters.transactions_ignored.fetch_add(1, Ordering::Relaxed);
            debug!(name = transaction.name(), "Transaction ignored");
            return;
        }
        self.counters.transactions_finished.fetch_add(1, Ordering::Relaxed);
        trace!(
            name = transaction.name(),
            segments = transaction.segments.len(),
            duration_ns = duration_nanos(transaction.duration),
            "Transaction finished"
        );
        self.sink.transaction_finished(&transaction);
    }

    /// Excludes the current transaction, if any, from reporting.
    pub fn ignore_transaction(&self, worker: &mut WorkerState) {
        if let Some(transaction) = worker.transaction.as_mut() {
            transaction.ignored = true;
        }
    }

    pub fn attribute(&self, worker: &mut WorkerState, handle: u64, name: &str, value: &str) {
        if handle == 0 {
            return;
        }
        if let Some(frame) = worker.stack.iter_mut().rev().find(|f| f.handle == handle) {
            if let Some(tracer) = frame.tracer.as_mut() {
                tracer.attribute(name, value);
            }
            if let Some(transaction) = worker.transaction.as_mut() {
                transaction.attributes.push((name.to_string(), value.to_string()));
            }
            return;
        }
        if let Some(frame) = self.async_frames.lock().get_mut(&handle) {
            frame.attributes.push((name.to_string(), value.to_string()));
        }
    }

    /// Start of a timing-only probe. Returns a start timestamp, or 0 when
    /// nothing is timed.
    pub fn enter_flyweight(&self, worker: &mut WorkerState, probe_id: u32) -> i64 {
        if self.admit(worker, probe_id).is_none() || worker.transaction.is_none() {
            return 0;
        }
        now_nanos()
    }

    pub fn exit_flyweight(&self, worker: &mut WorkerState, probe_id: u32, start: i64) {
        if start == 0 {
            return;
        }
        let (Some(probe), Some(transaction)) = (self.probes.get(probe_id), worker.transaction.as_mut()) else {
            return;
        };
        let elapsed = Duration::from_nanos(u64::try_from(now_nanos() - start).unwrap_or(0));
        transaction.segments.push(Segment::closed(&probe, elapsed, None));
    }

    fn enter_async(&self, probe: Arc<ProbeDefinition>) -> u64 {
        let handle = next_handle();
        self.async_frames.lock().insert(handle, AsyncFrame { probe, started: Instant::now(), attributes: Vec::new() });
        handle
    }

    /// Completes async work opened by an async probe. Unknown handles are
    /// ignored, so a handle closes at most once.
    pub fn close_async(&self, handle: u64) -> bool {
        let Some(frame) = self.async_frames.lock().remove(&handle) else {
            return false;
        };
        let segment = Segment::closed(&frame.probe, frame.started.elapsed(), None);
        self.sink.async_finished(&segment, &frame.attributes);
        true
    }
}

impl fmt::Debug for ProbeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeRuntime")
            .field("probes", &self.probes)
            .field("breaker", &self.breaker)
            .field("pending_async", &self.pending_async())
            .finish_non_exhaustive()
    }
}
