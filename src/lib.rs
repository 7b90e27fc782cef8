//! # jvmti-probes
//!
//! Rule-driven probe weaving for JVMTI agents written in Rust.
//!
//! A [`ProbeAgent`](agent::ProbeAgent) hooks class loading, matches each
//! class against the active rules and rewrites matched methods so that every
//! call opens a probe on entry and closes it on every way out, including
//! exceptions. Probe creation is guarded by a GC/heap circuit breaker, and
//! recorded timings are harvested into metrics on a background thread.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use jvmti_probes::prelude::*;
//!
//! #[derive(Default)]
//! struct OrdersAgent(ProbeAgent);
//!
//! impl Agent for OrdersAgent {
//!     fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint {
//!         let rule = Rule::new(
//!             ClassMatcher::exact("com/acme/OrderService"),
//!             MethodMatcher::name("placeOrder"),
//!             TraceDetails::builder().dispatcher(true).build(),
//!         );
//!         if self.0.local_registry().set_rules(vec![rule]).is_err() {
//!             return jni::JNI_ERR;
//!         }
//!         self.0.on_load(vm, options)
//!     }
//!     // forward the remaining events to self.0
//! }
//!
//! export_agent!(OrdersAgent);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  agent          lifecycle, load hook, hook natives       │
//! ├─────────────────────────────────────────────────────────┤
//! │  transformer    filters, per-load rewrite decision       │
//! │  registry       rule snapshots, retransform listeners    │
//! │  rewrite        probe injection into method bytecode     │
//! ├─────────────────────────────────────────────────────────┤
//! │  runtime        probes, transactions, metric recording   │
//! │  circuit_breaker, heap_sampler, harvest                  │
//! ├─────────────────────────────────────────────────────────┤
//! │  classfile, bytecode    class file model and codec       │
//! │  env, sys               JNI and JVMTI bindings           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the events the probe agent needs are wired: `VMInit`, `VMDeath`,
//! `ClassFileLoadHook` and the two garbage collection events.

pub mod sys;
pub mod env;

// Implementation modules (use `env` module for the public API)
#[doc(hidden)]
pub mod jvmti_wrapper;
#[doc(hidden)]
pub mod jni_wrapper;

pub mod bytecode;
pub mod classfile;
pub mod context;
pub mod matcher;
pub mod registry;
pub mod rewrite;
pub mod rule;
pub mod trace;
pub mod transformer;

pub mod circuit_breaker;
pub mod config;
pub mod harvest;
pub mod heap_sampler;
pub mod runtime;
pub mod stats;

pub mod agent;
pub mod prelude;

use std::os::raw::{c_char, c_uchar};
use std::sync::OnceLock;
pub use crate::sys::jni as jni;
use crate::sys::jvmti as jvmti;

/// The events a JVMTI agent built on this crate can receive.
///
/// Implement this trait and use [`export_agent!`] to create a loadable agent
/// library. Every event method except `on_load` has a no-op default.
///
/// Events fire from any JVM thread, so implementations must be `Sync + Send`.
pub trait Agent: Sync + Send {
    /// Called when the agent is loaded into the JVM, before any class is
    /// loaded. Request capabilities, set callbacks and enable events here.
    ///
    /// Return `JNI_OK` (0) on success, or `JNI_ERR` (-1) to abort startup.
    fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint;

    /// Called when the agent library is unloaded.
    fn on_unload(&self) {}

    /// The VM finished initializing; JNI calls into Java are now allowed.
    fn vm_init(&self, _jni: *mut jni::JNIEnv, _thread: jni::jthread) {}

    fn vm_death(&self, _jni: *mut jni::JNIEnv) {}

    /// A class is being loaded or retransformed. To replace its bytes,
    /// allocate the new class file with JVMTI `Allocate` and store it through
    /// `new_class_data`/`new_class_data_len`.
    #[allow(clippy::too_many_arguments)]
    fn class_file_load_hook(
        &self,
        _jni: *mut jni::JNIEnv,
        _class_being_redefined: jni::jclass,
        _loader: jni::jobject,
        _name: *const c_char,
        _protection_domain: jni::jobject,
        _class_data_len: jni::jint,
        _class_data: *const c_uchar,
        _new_class_data_len: *mut jni::jint,
        _new_class_data: *mut *mut c_uchar,
    ) {
    }

    /// A stop-the-world collection began. Neither JNI nor most JVMTI calls
    /// are allowed from this callback.
    fn garbage_collection_start(&self) {}

    fn garbage_collection_finish(&self) {}
}

// This holds the Agent instance so static C functions can find it.
pub static GLOBAL_AGENT: OnceLock<Box<dyn Agent>> = OnceLock::new();

/// Helper to initialize the global agent (called by the macro)
pub fn set_global_agent(agent: Box<dyn Agent>) -> Result<(), ()> {
    GLOBAL_AGENT.set(agent).map_err(|_| ())
}

unsafe extern "system" fn trampoline_vm_init(_env: *mut jvmti::jvmtiEnv, jni: *mut jni::JNIEnv, thread: jni::jthread) {
    if let Some(agent) = GLOBAL_AGENT.get() { agent.vm_init(jni, thread); }
}
unsafe extern "system" fn trampoline_vm_death(_env: *mut jvmti::jvmtiEnv, jni: *mut jni::JNIEnv) {
    if let Some(agent) = GLOBAL_AGENT.get() { agent.vm_death(jni); }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn trampoline_class_file_load_hook(
    _env: *mut jvmti::jvmtiEnv, jni: *mut jni::JNIEnv,
    class_being_redefined: jni::jclass, loader: jni::jobject, name: *const c_char,
    protection_domain: jni::jobject, class_data_len: jni::jint, class_data: *const c_uchar,
    new_class_data_len: *mut jni::jint, new_class_data: *mut *mut c_uchar
) {
    if let Some(agent) = GLOBAL_AGENT.get() {
        agent.class_file_load_hook(jni, class_being_redefined, loader, name, protection_domain, class_data_len, class_data, new_class_data_len, new_class_data);
    }
}

unsafe extern "system" fn trampoline_garbage_collection_start(_env: *mut jvmti::jvmtiEnv) {
    if let Some(agent) = GLOBAL_AGENT.get() { agent.garbage_collection_start(); }
}
unsafe extern "system" fn trampoline_garbage_collection_finish(_env: *mut jvmti::jvmtiEnv) {
    if let Some(agent) = GLOBAL_AGENT.get() { agent.garbage_collection_finish(); }
}

/// Returns a `jvmtiEventCallbacks` struct routing every supported event to
/// the global [`Agent`]. Pass it to [`env::Jvmti::set_event_callbacks`], then
/// enable the events you want with [`env::Jvmti::enable_events_global`].
pub fn get_default_callbacks() -> jvmti::jvmtiEventCallbacks {
    let mut callbacks = jvmti::jvmtiEventCallbacks::default();

    callbacks.VMInit = Some(trampoline_vm_init);
    callbacks.VMDeath = Some(trampoline_vm_death);
    callbacks.ClassFileLoadHook = Some(trampoline_class_file_load_hook);
    callbacks.GarbageCollectionStart = Some(trampoline_garbage_collection_start);
    callbacks.GarbageCollectionFinish = Some(trampoline_garbage_collection_finish);

    callbacks
}

/// Exports your agent type as a loadable JVMTI agent library.
///
/// Generates the `Agent_OnLoad` and `Agent_OnUnload` entry points the JVM
/// looks for when loading an agent via `-agentpath`. The agent type must
/// implement [`Agent`] and [`Default`]; one instance is created per JVM and
/// stored in [`GLOBAL_AGENT`].
///
/// The crate using this macro must be built as a `cdylib`:
///
/// ```bash
/// java -agentpath:./target/release/libmyagent.so=log_level=debug,app_name=Orders MyApp
/// ```
#[macro_export]
macro_rules! export_agent {
    ($agent_type:ty) => {
        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnLoad(
            vm: *mut $crate::sys::jni::JavaVM,
            options: *mut std::ffi::c_char,
            _reserved: *mut std::ffi::c_void,
        ) -> $crate::sys::jni::jint {
            let agent = Box::new(<$agent_type>::default());
            if $crate::set_global_agent(agent).is_err() {
                return $crate::sys::jni::JNI_ERR;
            }

            let options_str = if options.is_null() {
                ""
            } else {
                std::ffi::CStr::from_ptr(options).to_str().unwrap_or("")
            };

            if let Some(global_agent) = $crate::GLOBAL_AGENT.get() {
                return global_agent.on_load(vm, options_str);
            }

            $crate::sys::jni::JNI_ERR
        }

        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnUnload(_vm: *mut $crate::sys::jni::JavaVM) {
            if let Some(agent) = $crate::GLOBAL_AGENT.get() {
                agent.on_unload();
            }
        }
    };
}
