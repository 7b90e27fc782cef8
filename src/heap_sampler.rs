//! Heap and GC readings for the circuit breaker.
//!
//! [`JvmHeapSampler`] reads `java.lang.Runtime` memory figures and the
//! collection time of the old-generation collector bean over JNI. The old
//! generation collector is the bean with the fewest collections; when no
//! single bean qualifies, pause time measured from JVMTI garbage collection
//! events ([`GcEventClock`]) is used instead.

use crate::circuit_breaker::{monotonic_nanos, HeapSample, HeapSampler};
use crate::env::{GlobalRef, JavaVmRef, JniEnv, LocalRef, MethodId};
use crate::sys::jni;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

static GC_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn gc_clock_nanos() -> u64 {
    u64::try_from(GC_EPOCH.elapsed().as_nanos()).unwrap_or(u64::MAX).max(1)
}

/// Total GC pause time, fed by the JVMTI `GarbageCollectionStart` and
/// `GarbageCollectionFinish` events. No JNI is involved, so it is safe to
/// call from inside those callbacks.
#[derive(Debug, Default)]
pub struct GcEventClock {
    started_at: AtomicU64,
    total_nanos: AtomicU64,
    collections: AtomicU64,
}

impl GcEventClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gc_started(&self) {
        self.started_at.store(gc_clock_nanos(), Ordering::Release);
    }

    pub fn gc_finished(&self) {
        let started = self.started_at.swap(0, Ordering::AcqRel);
        if started == 0 {
            return;
        }
        self.total_nanos.fetch_add(gc_clock_nanos().saturating_sub(started), Ordering::Relaxed);
        self.collections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_gc_nanos(&self) -> u64 {
        self.total_nanos.load(Ordering::Relaxed)
    }

    pub fn collections(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct OldGenBean {
    bean: GlobalRef,
    collection_time: MethodId,
}

#[derive(Debug)]
pub struct JvmHeapSampler {
    vm: JavaVmRef,
    runtime: GlobalRef,
    free_memory: MethodId,
    total_memory: MethodId,
    max_memory: MethodId,
    old_gen: Option<OldGenBean>,
    gc_events: Arc<GcEventClock>,
}

impl JvmHeapSampler {
    /// Looks up everything the sampler needs. Must run on a thread attached
    /// to the VM once the VM is initialized. `None` when `java.lang.Runtime`
    /// cannot be reached.
    pub fn new(env: &JniEnv, gc_events: Arc<GcEventClock>) -> Option<Self> {
        let vm = env.get_java_vm()?;
        let runtime_class = LocalRef::new(env, env.find_class("java/lang/Runtime")?);
        let get_runtime = env.get_static_method_id(runtime_class.get(), "getRuntime", "()Ljava/lang/Runtime;")?;
        let runtime = LocalRef::new(env, env.call_static_object_method(runtime_class.get(), get_runtime, &[]));
        if env.take_exception() {
            return None;
        }
        let runtime = GlobalRef::pin(env, runtime.get())?;
        let free_memory = MethodId::new(env.get_method_id(runtime_class.get(), "freeMemory", "()J")?);
        let total_memory = MethodId::new(env.get_method_id(runtime_class.get(), "totalMemory", "()J")?);
        let max_memory = MethodId::new(env.get_method_id(runtime_class.get(), "maxMemory", "()J")?);

        let old_gen = find_old_gen_bean(env);
        if env.take_exception() {
            debug!("Circuit breaker: exception while looking for the old gen GC bean");
        }
        if old_gen.is_none() {
            warn!("Circuit breaker: no old gen GC bean found, using GC event timing");
        }

        Some(Self {
            vm: JavaVmRef::new(vm),
            runtime,
            free_memory,
            total_memory,
            max_memory,
            old_gen,
            gc_events,
        })
    }

    fn call_long(&self, env: &JniEnv, obj: &GlobalRef, method: MethodId) -> Option<u64> {
        let value = env.call_long_method(obj.get(), method.get(), &[]);
        if env.take_exception() {
            return None;
        }
        u64::try_from(value).ok()
    }
}

impl HeapSampler for JvmHeapSampler {
    fn sample(&self) -> Option<HeapSample> {
        let env = self.vm.attach()?;
        let gc_time_nanos = match &self.old_gen {
            Some(old_gen) => self.call_long(&env, &old_gen.bean, old_gen.collection_time)?.saturating_mul(1_000_000),
            None => self.gc_events.total_gc_nanos(),
        };
        let sample = HeapSample {
            gc_time_nanos,
            free_bytes: self.call_long(&env, &self.runtime, self.free_memory)?,
            total_bytes: self.call_long(&env, &self.runtime, self.total_memory)?,
            max_bytes: self.call_long(&env, &self.runtime, self.max_memory)?,
            timestamp_nanos: monotonic_nanos(),
        };
        trace!(?sample, "Heap sample");
        Some(sample)
    }
}

/// The collector bean with strictly the fewest collections, provided no
/// collection happened while looking.
fn find_old_gen_bean(env: &JniEnv) -> Option<OldGenBean> {
    let factory = LocalRef::new(env, env.find_class("java/lang/management/ManagementFactory")?);
    let get_beans = env.get_static_method_id(factory.get(), "getGarbageCollectorMXBeans", "()Ljava/util/List;")?;
    let list_class = LocalRef::new(env, env.find_class("java/util/List")?);
    let size = env.get_method_id(list_class.get(), "size", "()I")?;
    let get = env.get_method_id(list_class.get(), "get", "(I)Ljava/lang/Object;")?;
    let bean_class = LocalRef::new(env, env.find_class("java/lang/management/GarbageCollectorMXBean")?);
    let collection_count = env.get_method_id(bean_class.get(), "getCollectionCount", "()J")?;
    let collection_time = env.get_method_id(bean_class.get(), "getCollectionTime", "()J")?;

    let beans = LocalRef::new(env, env.call_static_object_method(factory.get(), get_beans, &[]));
    if env.take_exception() || beans.get().is_null() {
        return None;
    }
    let count = env.call_int_method(beans.get(), size, &[]);
    if env.take_exception() {
        return None;
    }

    let mut counts = Vec::new();
    for i in 0..count {
        let bean = LocalRef::new(env, env.call_object_method(beans.get(), get, &[jni::jvalue { i }]));
        if env.take_exception() || bean.get().is_null() {
            return None;
        }
        let collections = env.call_long_method(bean.get(), collection_count, &[]);
        if env.take_exception() {
            return None;
        }
        counts.push((collections, bean));
    }
    let total: i64 = counts.iter().map(|(c, _)| (*c).max(0)).sum();

    let lowest = counts.iter().map(|(c, _)| *c).min()?;
    let mut candidates = counts.into_iter().filter(|(c, _)| *c == lowest);
    let (_, bean) = candidates.next()?;
    if candidates.next().is_some() {
        debug!(collections = lowest, "Circuit breaker: several GC beans tie for old gen");
        return None;
    }

    // A collection in between would make the counts incomparable.
    let recount: i64 = (0..count)
        .filter_map(|i| {
            let bean = LocalRef::new(env, env.call_object_method(beans.get(), get, &[jni::jvalue { i }]));
            let collections = env.call_long_method(bean.get(), collection_count, &[]);
            (!env.take_exception()).then_some(collections.max(0))
        })
        .sum();
    if recount != total {
        debug!("Circuit breaker: GC ran while looking for the old gen bean");
        return None;
    }

    Some(OldGenBean { bean: GlobalRef::pin(env, bean.get())?, collection_time: MethodId::new(collection_time) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_clock_accumulates_pauses() {
        let clock = GcEventClock::new();
        clock.gc_finished();
        assert_eq!(clock.collections(), 0);

        clock.gc_started();
        std::thread::sleep(std::time::Duration::from_millis(2));
        clock.gc_finished();
        assert_eq!(clock.collections(), 1);
        assert!(clock.total_gc_nanos() >= 2_000_000);

        let before = clock.total_gc_nanos();
        clock.gc_finished();
        assert_eq!(clock.total_gc_nanos(), before);
    }
}
