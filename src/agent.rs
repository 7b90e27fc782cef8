//! The probe agent: JVMTI lifecycle, the load hook and the hook natives.
//!
//! Loading goes in three steps. `on_load` parses the options, requests
//! capabilities and builds the transformer and probe runtime. `vm_init`
//! defines the hook class in the bootstrap loader, binds its natives, starts
//! the heap sampler and the harvest thread, then retransforms any loaded
//! class the active rules could match. From then on every class load goes
//! through [`CustomClassTransformer::transform_or_skip`].
//!
//! Each thread's probe state lives in a thread local. A hook that fires
//! while that state is already borrowed on the same thread does nothing.

use crate::circuit_breaker::{CircuitBreakerService, HeapSampler, MissingHeapSampler, NoHeapSampler};
use crate::config::{AgentConfig, ConfigError};
use crate::env::{GlobalRef, JavaVmRef, JniEnv, Jvmti, LocalRef, MethodId};
use crate::get_default_callbacks;
use crate::harvest::{HarvestCycle, HarvestListener, HarvestReport, Harvester};
use crate::heap_sampler::{GcEventClock, JvmHeapSampler};
use crate::matcher::ClassIndex;
use crate::registry::{ClassRetransformer, RetransformListener, RuleSet};
use crate::rewrite::hooks::{self, HookMethod, HOOK_CLASS};
use crate::runtime::{MetricAggregator, ProbeRuntime, ProbeTable, WorkerState};
use crate::sys::{jni, jvmti};
use crate::transformer::{ClassFilter, CustomClassTransformer, LoaderKind};
use crate::Agent;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_uchar};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const EVENTS: [u32; 5] = [
    jvmti::JVMTI_EVENT_VM_INIT,
    jvmti::JVMTI_EVENT_VM_DEATH,
    jvmti::JVMTI_EVENT_CLASS_FILE_LOAD_HOOK,
    jvmti::JVMTI_EVENT_GARBAGE_COLLECTION_START,
    jvmti::JVMTI_EVENT_GARBAGE_COLLECTION_FINISH,
];

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("JVMTI environment unavailable (GetEnv returned {0})")]
    Environment(jni::jint),
    #[error("JVMTI {call} failed: {name}")]
    Jvmti { call: &'static str, name: String },
    #[error("hook class: {0}")]
    HookClass(String),
    #[error("agent already loaded")]
    AlreadyLoaded,
}

static RUNTIME: OnceCell<Arc<ProbeRuntime>> = OnceCell::new();
static STRING_VALUE_OF: OnceCell<StringValueOf> = OnceCell::new();

thread_local! {
    static WORKER: RefCell<Option<WorkerState>> = const { RefCell::new(None) };
}

/// Everything built by `on_load`.
struct AgentState {
    config: AgentConfig,
    jvmti: Arc<Jvmti>,
    transformer: Arc<CustomClassTransformer>,
    runtime: Arc<ProbeRuntime>,
    hooks_ready: Arc<AtomicBool>,
    harvester: Mutex<Option<Harvester>>,
}

/// A JVMTI agent that weaves probes into classes matched by its rules.
///
/// Rules may be installed before the VM starts, through
/// [`ProbeAgent::local_registry`] and [`ProbeAgent::remote_registry`], or at
/// any later point; loaded classes are retransformed when the rules change.
pub struct ProbeAgent {
    local: Arc<ClassRetransformer>,
    remote: Arc<ClassRetransformer>,
    probes: Arc<ProbeTable>,
    aggregator: Arc<MetricAggregator>,
    gc_events: Arc<GcEventClock>,
    harvest_listeners: Mutex<Vec<Arc<dyn HarvestListener>>>,
    state: OnceCell<AgentState>,
}

impl Default for ProbeAgent {
    fn default() -> Self {
        Self {
            local: Arc::new(ClassRetransformer::new("local")),
            remote: Arc::new(ClassRetransformer::new("remote")),
            probes: Arc::new(ProbeTable::new()),
            aggregator: Arc::new(MetricAggregator::new()),
            gc_events: Arc::new(GcEventClock::new()),
            harvest_listeners: Mutex::new(Vec::new()),
            state: OnceCell::new(),
        }
    }
}

impl ProbeAgent {
    /// Rules from startup configuration.
    pub fn local_registry(&self) -> &Arc<ClassRetransformer> {
        &self.local
    }

    /// Rules pushed at runtime.
    pub fn remote_registry(&self) -> &Arc<ClassRetransformer> {
        &self.remote
    }

    pub fn probes(&self) -> &Arc<ProbeTable> {
        &self.probes
    }

    /// Listeners added after VM init only see reports from the next start.
    pub fn add_harvest_listener(&self, listener: Arc<dyn HarvestListener>) {
        self.harvest_listeners.lock().push(listener);
    }

    pub fn config(&self) -> Option<&AgentConfig> {
        self.state.get().map(|s| &s.config)
    }

    pub fn runtime(&self) -> Option<&Arc<ProbeRuntime>> {
        self.state.get().map(|s| &s.runtime)
    }

    pub fn transformer(&self) -> Option<&Arc<CustomClassTransformer>> {
        self.state.get().map(|s| &s.transformer)
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreakerService>> {
        self.runtime().map(|r| r.breaker())
    }

    /// Runs a harvest immediately, if the harvest thread is running.
    pub fn harvest_now(&self) -> Option<HarvestReport> {
        self.state.get()?.harvester.lock().as_ref()?.harvest_now()
    }

    fn load(&self, vm: *mut jni::JavaVM, options: &str) -> Result<(), AgentError> {
        let config = AgentConfig::from_options(options)?;
        init_logging(&config.log_level);

        let jvmti = Jvmti::new(vm).map_err(AgentError::Environment)?;
        jvmti
            .add_capabilities_with(|caps| {
                caps.set_can_generate_all_class_hook_events(true);
                caps.set_can_retransform_classes(true);
                caps.set_can_generate_garbage_collection_events(true);
            })
            .map_err(|e| jvmti_error(&jvmti, "AddCapabilities", e))?;
        jvmti
            .set_event_callbacks(get_default_callbacks())
            .map_err(|e| jvmti_error(&jvmti, "SetEventCallbacks", e))?;
        jvmti.enable_events_global(&EVENTS).map_err(|e| jvmti_error(&jvmti, "SetEventNotificationMode", e))?;
        let jvmti = Arc::new(jvmti);

        let breaker = Arc::new(CircuitBreakerService::new(config.circuit_breaker, Arc::new(NoHeapSampler)));
        let runtime = Arc::new(ProbeRuntime::new(self.probes.clone(), breaker, self.aggregator.clone()));
        let transformer = Arc::new(CustomClassTransformer::new(
            self.local.clone(),
            self.remote.clone(),
            Arc::new(ClassIndex::new()),
            self.probes.clone(),
            ClassFilter::new(&config.include, &config.exclude),
        ));
        let hooks_ready = Arc::new(AtomicBool::new(false));

        if config.retransform {
            let listener = Arc::new(LoadedClassRetransformer {
                jvmti: jvmti.clone(),
                vm: JavaVmRef::new(vm),
                transformer: transformer.clone(),
                hooks_ready: hooks_ready.clone(),
            });
            self.local.add_listener(listener.clone());
            self.remote.add_listener(listener);
        }

        RUNTIME.set(runtime.clone()).map_err(|_| AgentError::AlreadyLoaded)?;
        info!(
            app = %config.app_name,
            breaker = config.circuit_breaker.enabled,
            retransform = config.retransform,
            "Probe agent loaded"
        );
        self.state
            .set(AgentState { config, jvmti, transformer, runtime, hooks_ready, harvester: Mutex::new(None) })
            .map_err(|_| AgentError::AlreadyLoaded)
    }

    fn start(&self, state: &AgentState, env: &JniEnv) -> Result<(), AgentError> {
        install_hook_class(env)?;
        match StringValueOf::resolve(env) {
            Some(value_of) => {
                let _ = STRING_VALUE_OF.set(value_of);
            }
            None => warn!("String.valueOf unavailable, parameter capture disabled"),
        }

        let sampler: Arc<dyn HeapSampler> = match JvmHeapSampler::new(env, self.gc_events.clone()) {
            Some(sampler) => Arc::new(sampler),
            None => Arc::new(MissingHeapSampler),
        };
        env.take_exception();
        let breaker = state.runtime.breaker().clone();
        breaker.set_sampler(sampler);

        let mut cycle = HarvestCycle::new(state.config.app_name.clone(), breaker, self.aggregator.clone());
        for listener in self.harvest_listeners.lock().iter() {
            cycle.add_listener(listener.clone());
        }
        match Harvester::start(cycle, state.config.harvest_period()) {
            Ok(harvester) => *state.harvester.lock() = Some(harvester),
            Err(e) => warn!(error = %e, "Could not start the harvest thread"),
        }

        state.hooks_ready.store(true, Ordering::Release);
        if state.config.retransform {
            let local = self.local.snapshot();
            let remote = self.remote.snapshot();
            retransform_loaded(&state.jvmti, env, &state.transformer, |name| {
                local.could_match_name(name) || remote.could_match_name(name)
            });
        }
        Ok(())
    }
}

impl Agent for ProbeAgent {
    fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint {
        match self.load(vm, options) {
            Ok(()) => jni::JNI_OK,
            Err(e) => {
                init_logging("info");
                error!(error = %e, "Probe agent failed to load");
                jni::JNI_ERR
            }
        }
    }

    fn vm_init(&self, jni: *mut jni::JNIEnv, _thread: jni::jthread) {
        let Some(state) = self.state.get() else {
            return;
        };
        let env = unsafe { JniEnv::from_raw(jni) };
        match self.start(state, &env) {
            Ok(()) => info!(probes = self.probes.len(), "Probe agent started"),
            Err(e) => {
                error!(error = %e, "Probe agent could not start, instrumentation disabled");
                state.transformer.shutdown();
            }
        }
    }

    fn vm_death(&self, _jni: *mut jni::JNIEnv) {
        let Some(state) = self.state.get() else {
            return;
        };
        state.hooks_ready.store(false, Ordering::Release);
        state.transformer.shutdown();
        if let Some(harvester) = state.harvester.lock().take() {
            harvester.shutdown();
        }
        info!(runtime = ?state.runtime.stats(), "Probe agent stopped");
    }

    fn class_file_load_hook(
        &self,
        _jni: *mut jni::JNIEnv,
        class_being_redefined: jni::jclass,
        loader: jni::jobject,
        name: *const c_char,
        _protection_domain: jni::jobject,
        class_data_len: jni::jint,
        class_data: *const c_uchar,
        new_class_data_len: *mut jni::jint,
        new_class_data: *mut *mut c_uchar,
    ) {
        let Some(state) = self.state.get() else {
            return;
        };
        if !state.hooks_ready.load(Ordering::Acquire) || class_data.is_null() || class_data_len <= 0 {
            return;
        }
        let bytes = unsafe { std::slice::from_raw_parts(class_data, class_data_len as usize) };
        let class_name = if name.is_null() { None } else { unsafe { CStr::from_ptr(name) }.to_str().ok() };
        let loader_kind = if loader.is_null() { LoaderKind::Bootstrap } else { LoaderKind::Application };

        let Some(rewritten) =
            state.transformer.transform_or_skip(loader_kind, class_name, !class_being_redefined.is_null(), bytes)
        else {
            return;
        };
        let Ok(len) = jni::jint::try_from(rewritten.len()) else {
            return;
        };
        match state.jvmti.allocate_copy(&rewritten) {
            Ok(mem) => unsafe {
                *new_class_data_len = len;
                *new_class_data = mem;
            },
            Err(e) => warn!(
                class = class_name.unwrap_or("<unnamed>"),
                error = %state.jvmti.error_name(e),
                "Could not hand rewritten class to the VM"
            ),
        }
    }

    fn garbage_collection_start(&self) {
        self.gc_events.gc_started();
    }

    fn garbage_collection_finish(&self) {
        self.gc_events.gc_finished();
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn jvmti_error(jvmti: &Jvmti, call: &'static str, error: jvmti::jvmtiError) -> AgentError {
    AgentError::Jvmti { call, name: jvmti.error_name(error) }
}

/// Retransforms loaded classes when a registry swaps in new rules. Classes
/// either snapshot could match are retransformed so they pick up or drop
/// their probes.
struct LoadedClassRetransformer {
    jvmti: Arc<Jvmti>,
    vm: JavaVmRef,
    transformer: Arc<CustomClassTransformer>,
    hooks_ready: Arc<AtomicBool>,
}

impl RetransformListener for LoadedClassRetransformer {
    fn rules_changed(&self, previous: &RuleSet, current: &RuleSet) {
        if !self.hooks_ready.load(Ordering::Acquire) {
            return;
        }
        let Some(env) = self.vm.attach() else {
            warn!("Cannot attach to the VM, loaded classes keep their old probes");
            return;
        };
        retransform_loaded(&self.jvmti, &env, &self.transformer, |name| {
            previous.could_match_name(name) || current.could_match_name(name)
        });
    }
}

fn retransform_loaded(
    jvmti: &Jvmti,
    env: &JniEnv,
    transformer: &CustomClassTransformer,
    wanted: impl Fn(&str) -> bool,
) -> usize {
    let classes = match jvmti.get_loaded_classes() {
        Ok(classes) => classes,
        Err(e) => {
            warn!(error = %jvmti.error_name(e), "Could not list loaded classes");
            return 0;
        }
    };

    let batch: Vec<jni::jclass> = classes
        .iter()
        .copied()
        .filter(|&klass| {
            let candidate = jvmti
                .get_class_signature(klass)
                .ok()
                .and_then(|sig| internal_name_from_signature(&sig).map(str::to_string))
                .is_some_and(|name| transformer.should_inspect(LoaderKind::Application, &name) && wanted(&name));
            candidate && jvmti.is_modifiable_class(klass).unwrap_or(false)
        })
        .collect();

    let mut retransformed = 0;
    if !batch.is_empty() {
        match jvmti.retransform_classes(&batch) {
            Ok(()) => retransformed = batch.len(),
            Err(e) => {
                debug!(error = %jvmti.error_name(e), "Batch retransform failed, retrying one class at a time");
                for klass in &batch {
                    match jvmti.retransform_classes(std::slice::from_ref(klass)) {
                        Ok(()) => retransformed += 1,
                        Err(e) => debug!(error = %jvmti.error_name(e), "Class not retransformed"),
                    }
                }
            }
        }
        info!(candidates = batch.len(), retransformed, "Retransformed loaded classes");
    }

    for klass in classes {
        env.delete_local_ref(klass);
    }
    retransformed
}

/// `Lcom/acme/Foo;` to `com/acme/Foo`. Arrays and primitives have no class
/// file and yield `None`.
fn internal_name_from_signature(signature: &str) -> Option<&str> {
    signature.strip_prefix('L')?.strip_suffix(';')
}

fn install_hook_class(env: &JniEnv) -> Result<(), AgentError> {
    let bytes = hooks::hook_class_bytes().map_err(|e| AgentError::HookClass(e.to_string()))?;
    let class = env.define_class(HOOK_CLASS, ptr::null_mut(), &bytes).ok_or_else(|| {
        env.take_exception();
        AgentError::HookClass(format!("could not define {HOOK_CLASS}"))
    })?;
    let class = LocalRef::new(env, class);

    let mut names = Vec::with_capacity(hooks::ALL_HOOKS.len());
    let mut natives = Vec::with_capacity(hooks::ALL_HOOKS.len());
    for hook in hooks::ALL_HOOKS {
        let entry_point =
            native_entry_point(&hook).ok_or_else(|| AgentError::HookClass(format!("no native for {}", hook.name)))?;
        let name = CString::new(hook.name).map_err(|e| AgentError::HookClass(e.to_string()))?;
        let signature = CString::new(hook.descriptor).map_err(|e| AgentError::HookClass(e.to_string()))?;
        natives.push(jni::JNINativeMethod { name: name.as_ptr(), signature: signature.as_ptr(), fnPtr: entry_point });
        names.push((name, signature));
    }
    env.register_natives(class.get(), &natives).map_err(|code| {
        env.take_exception();
        AgentError::HookClass(format!("RegisterNatives returned {code}"))
    })?;
    debug!(class = HOOK_CLASS, natives = natives.len(), "Hook class bound");
    Ok(())
}

fn native_entry_point(hook: &HookMethod) -> Option<*mut c_void> {
    let entry_point = match *hook {
        hooks::ENTER => native_enter as *mut c_void,
        hooks::EXIT => native_exit as *mut c_void,
        hooks::IGNORE_TRANSACTION => native_ignore_transaction as *mut c_void,
        hooks::ATTRIBUTE => native_attribute as *mut c_void,
        hooks::ENTER_FLYWEIGHT => native_enter_flyweight as *mut c_void,
        hooks::EXIT_FLYWEIGHT => native_exit_flyweight as *mut c_void,
        hooks::CLOSE_ASYNC => native_close_async as *mut c_void,
        _ => return None,
    };
    Some(entry_point)
}

/// Cached `String.valueOf(Object)` for rendering captured parameters.
struct StringValueOf {
    class: GlobalRef,
    method: MethodId,
}

impl StringValueOf {
    fn resolve(env: &JniEnv) -> Option<Self> {
        let class = LocalRef::new(env, env.find_class("java/lang/String")?);
        let method = env.get_static_method_id(class.get(), "valueOf", "(Ljava/lang/Object;)Ljava/lang/String;")?;
        Some(Self { class: GlobalRef::pin(env, class.get())?, method: MethodId::new(method) })
    }

    fn render(&self, env: &JniEnv, value: jni::jobject) -> Option<String> {
        if value.is_null() {
            return Some("null".to_string());
        }
        let text = env.call_static_object_method(self.class.get(), self.method.get(), &[jni::jvalue { l: value }]);
        if env.take_exception() {
            return None;
        }
        let text = LocalRef::new(env, text);
        env.get_string_utf(text.get())
    }
}

/// Runs `f` with this thread's probe state. Falls back to the default when
/// the agent is not running, the state is already in use on this thread, or
/// `f` panics.
fn with_worker<R: Default>(f: impl FnOnce(&ProbeRuntime, &mut WorkerState) -> R) -> R {
    let Some(runtime) = RUNTIME.get() else {
        return R::default();
    };
    panic::catch_unwind(AssertUnwindSafe(|| {
        WORKER
            .try_with(|cell| {
                let Ok(mut slot) = cell.try_borrow_mut() else {
                    return R::default();
                };
                let worker = slot.get_or_insert_with(|| runtime.worker());
                f(runtime, worker)
            })
            .unwrap_or_default()
    }))
    .unwrap_or_default()
}

unsafe extern "system" fn native_enter(_env: *mut jni::JNIEnv, _class: jni::jclass, probe_id: jni::jint) -> jni::jlong {
    let Ok(probe_id) = u32::try_from(probe_id) else {
        return 0;
    };
    with_worker(|runtime, worker| runtime.enter(worker, probe_id) as jni::jlong)
}

unsafe extern "system" fn native_exit(_env: *mut jni::JNIEnv, _class: jni::jclass, handle: jni::jlong, opcode: jni::jint) {
    if handle == 0 {
        return;
    }
    with_worker(|runtime, worker| runtime.exit(worker, handle as u64, opcode));
}

unsafe extern "system" fn native_ignore_transaction(_env: *mut jni::JNIEnv, _class: jni::jclass) {
    with_worker(|runtime, worker| runtime.ignore_transaction(worker));
}

unsafe extern "system" fn native_attribute(
    env: *mut jni::JNIEnv,
    _class: jni::jclass,
    handle: jni::jlong,
    name: jni::jstring,
    value: jni::jobject,
) {
    if handle == 0 {
        return;
    }
    let Some(value_of) = STRING_VALUE_OF.get() else {
        return;
    };
    // Rendering calls back into Java, so it happens before the worker is borrowed.
    let env = JniEnv::from_raw(env);
    let rendered = panic::catch_unwind(AssertUnwindSafe(|| Some((env.get_string_utf(name)?, value_of.render(&env, value)?))));
    let Ok(Some((name, value))) = rendered else {
        return;
    };
    with_worker(|runtime, worker| runtime.attribute(worker, handle as u64, &name, &value));
}

unsafe extern "system" fn native_enter_flyweight(
    _env: *mut jni::JNIEnv,
    _class: jni::jclass,
    probe_id: jni::jint,
) -> jni::jlong {
    let Ok(probe_id) = u32::try_from(probe_id) else {
        return 0;
    };
    with_worker(|runtime, worker| runtime.enter_flyweight(worker, probe_id))
}

unsafe extern "system" fn native_exit_flyweight(
    _env: *mut jni::JNIEnv,
    _class: jni::jclass,
    probe_id: jni::jint,
    start: jni::jlong,
) {
    let Ok(probe_id) = u32::try_from(probe_id) else {
        return;
    };
    with_worker(|runtime, worker| runtime.exit_flyweight(worker, probe_id, start));
}

unsafe extern "system" fn native_close_async(_env: *mut jni::JNIEnv, _class: jni::jclass, handle: jni::jlong) {
    if handle == 0 {
        return;
    }
    if let Some(runtime) = RUNTIME.get() {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| runtime.close_async(handle as u64)));
    }
}
