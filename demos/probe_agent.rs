//! Probe agent that times servlet-style request handling.
//!
//! Build:
//!   cargo build --release --example probe_agent
//! Run:
//!   java -agentpath:./target/release/examples/libprobe_agent.so=log_level=debug,app_name=Orders MyApp
//!
//! Every `service` method of a `javax/servlet/http/HttpServlet` subclass
//! starts a web transaction; every method of `com/acme/orders/OrderService`
//! is timed inside it. The metrics of each harvest are printed to stderr.

use jvmti_probes::prelude::*;
use std::os::raw::{c_char, c_uchar};
use std::sync::Arc;

struct PrintHarvest;

impl HarvestListener for PrintHarvest {
    fn on_harvest(&self, report: &HarvestReport) {
        eprintln!(
            "[probe_agent] {} harvest: {} metrics, incomplete={}, breaker={}",
            report.app_name,
            report.stats.len(),
            report.incomplete,
            report.breaker_state
        );
        for (name, stats) in report.stats.iter() {
            if stats.call_count() > 0 {
                eprintln!("  {name}: {} calls, {} ns", stats.call_count(), stats.total_nanos());
            }
        }
    }
}

#[derive(Default)]
struct OrdersAgent {
    probes: ProbeAgent,
}

fn rules() -> Vec<Rule> {
    vec![
        Rule::new(
            ClassMatcher::base_class("javax/servlet/http/HttpServlet"),
            MethodMatcher::exact(
                "service",
                "(Ljavax/servlet/http/HttpServletRequest;Ljavax/servlet/http/HttpServletResponse;)V",
            ),
            TraceDetails::builder().dispatcher(true).web_transaction(true).build(),
        ),
        Rule::new(
            ClassMatcher::exact("com/acme/orders/OrderService"),
            MethodMatcher::name("placeOrder"),
            TraceDetails::builder().metric_prefix("Orders").parameter_attribute(0, "order.id").build(),
        ),
    ]
}

impl Agent for OrdersAgent {
    fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint {
        if let Err(e) = self.probes.local_registry().set_rules(rules()) {
            eprintln!("[probe_agent] Rejected rules: {e}");
            return jni::JNI_ERR;
        }
        self.probes.add_harvest_listener(Arc::new(PrintHarvest));
        self.probes.on_load(vm, options)
    }

    fn vm_init(&self, jni: *mut jni::JNIEnv, thread: jni::jthread) {
        self.probes.vm_init(jni, thread);
    }

    fn vm_death(&self, jni: *mut jni::JNIEnv) {
        self.probes.vm_death(jni);
    }

    fn class_file_load_hook(
        &self,
        jni: *mut jni::JNIEnv,
        class_being_redefined: jni::jclass,
        loader: jni::jobject,
        name: *const c_char,
        protection_domain: jni::jobject,
        class_data_len: jni::jint,
        class_data: *const c_uchar,
        new_class_data_len: *mut jni::jint,
        new_class_data: *mut *mut c_uchar,
    ) {
        self.probes.class_file_load_hook(
            jni,
            class_being_redefined,
            loader,
            name,
            protection_domain,
            class_data_len,
            class_data,
            new_class_data_len,
            new_class_data,
        );
    }

    fn garbage_collection_start(&self) {
        self.probes.garbage_collection_start();
    }

    fn garbage_collection_finish(&self) {
        self.probes.garbage_collection_finish();
    }
}

export_agent!(OrdersAgent);
