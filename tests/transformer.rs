mod common;

use common::*;
use jvmti_probes::bytecode::opcodes::*;
use jvmti_probes::circuit_breaker::{CircuitBreakerService, NoHeapSampler};
use jvmti_probes::classfile::ClassFile;
use jvmti_probes::config::CircuitBreakerConfig;
use jvmti_probes::matcher::{ClassIndex, ClassMatcher, MethodMatcher};
use jvmti_probes::registry::ClassRetransformer;
use jvmti_probes::rule::Rule;
use jvmti_probes::runtime::{MetricAggregator, ProbeRuntime, ProbeTable};
use jvmti_probes::trace::TraceDetails;
use jvmti_probes::transformer::{ClassFilter, CustomClassTransformer, LoaderKind};
use std::sync::Arc;

struct Fixture {
    local: Arc<ClassRetransformer>,
    probes: Arc<ProbeTable>,
    transformer: CustomClassTransformer,
}

impl Fixture {
    fn new(filter: ClassFilter) -> Self {
        let local = Arc::new(ClassRetransformer::new("local"));
        let probes = Arc::new(ProbeTable::new());
        let transformer = CustomClassTransformer::new(
            local.clone(),
            Arc::new(ClassRetransformer::new("remote")),
            Arc::new(ClassIndex::new()),
            probes.clone(),
            filter,
        );
        Self { local, probes, transformer }
    }

    fn with_rules(rules: Vec<Rule>) -> Self {
        let fixture = Self::new(ClassFilter::default());
        fixture.local.set_rules(rules).unwrap();
        fixture
    }

    fn load(&self, name: &str, bytes: &[u8]) -> Option<ClassFile> {
        self.transformer
            .transform(LoaderKind::Application, Some(name), false, bytes)
            .unwrap()
            .map(|out| ClassFile::parse(&out).unwrap())
    }

    fn probe_id(&self, method: &str, descriptor: &str) -> Option<u32> {
        (1..=self.probes.len() as u32).find(|&id| {
            let probe = self.probes.get(id).unwrap();
            probe.method_name == method && probe.descriptor == descriptor
        })
    }
}

fn void_method(b: &mut ClassBuilder, access: u16, name: &str, descriptor: &str, max_locals: u16) {
    b.method(access, name, descriptor, Body::new(0, max_locals, vec![RETURN]));
}

fn orders_class() -> Vec<u8> {
    let mut b = ClassBuilder::new("com/acme/Orders", "java/lang/Object");
    default_constructor(&mut b, "java/lang/Object");
    void_method(&mut b, ACC_PUBLIC, "handle", "()V", 1);
    void_method(&mut b, ACC_PUBLIC, "load", "()V", 1);
    void_method(&mut b, ACC_PUBLIC, "load", "(I)V", 2);
    void_method(&mut b, ACC_PUBLIC, "toString", "()Ljava/lang/String;", 1);
    b.build()
}

fn on_orders(method: MethodMatcher, details: TraceDetails) -> Rule {
    Rule::new(ClassMatcher::exact("com.acme.Orders"), method, details)
}

#[test]
fn unmatched_methods_leave_the_class_alone() {
    let fixture = Fixture::with_rules(vec![on_orders(MethodMatcher::name("missing"), TraceDetails::default_trace())]);
    assert!(fixture.load("com/acme/Orders", &orders_class()).is_none());

    let stats = fixture.transformer.stats();
    assert_eq!((stats.inspected, stats.matched, stats.rewritten), (1, 0, 0));
    assert!(fixture.probes.is_empty());
}

#[test]
fn classes_no_rule_names_are_not_parsed() {
    let fixture = Fixture::with_rules(vec![on_orders(MethodMatcher::Any, TraceDetails::default_trace())]);
    let out = fixture.transformer.transform(LoaderKind::Application, Some("com/acme/Other"), false, b"not a class");
    assert!(out.unwrap().is_none());
    assert_eq!(fixture.transformer.stats().inspected, 0);
}

#[test]
fn overloads_get_their_own_probes() {
    let fixture = Fixture::with_rules(vec![on_orders(MethodMatcher::name("load"), TraceDetails::default_trace())]);
    let class = fixture.load("com/acme/Orders", &orders_class()).unwrap();

    let plain = fixture.probe_id("load", "()V").unwrap();
    let with_arg = fixture.probe_id("load", "(I)V").unwrap();
    assert_ne!(plain, with_arg);
    assert_eq!(fixture.probes.len(), 2);
    assert_eq!(hook_calls(&class, &method_code(&class, "handle", "()V")), Vec::<String>::new());
    assert_eq!(hook_calls(&class, &method_code(&class, "load", "(I)V")), vec!["enter", "exit", "exit"]);

    // Reloading the same class keeps the ids.
    fixture.load("com/acme/Orders", &orders_class()).unwrap();
    assert_eq!(fixture.probe_id("load", "()V"), Some(plain));
    assert_eq!(fixture.probes.len(), 2);
}

#[test]
fn exact_descriptor_rule_rewrites_one_overload() {
    let fixture = Fixture::with_rules(vec![on_orders(
        MethodMatcher::exact("load", "(I)V"),
        TraceDetails::builder().dispatcher(true).metric_name("Custom/load").build(),
    )]);
    let original = ClassFile::parse(&orders_class()).unwrap();
    let class = fixture.load("com/acme/Orders", &orders_class()).unwrap();

    assert_eq!(hook_calls(&class, &method_code(&class, "load", "(I)V")), vec!["enter", "exit", "exit"]);
    let untouched = method_code(&class, "load", "()V");
    assert!(hook_calls(&class, &untouched).is_empty());
    assert_eq!(untouched, method_code(&original, "load", "()V"));
    assert_eq!(fixture.probes.len(), 1);
    assert!(fixture.probe_id("load", "()V").is_none());

    let load = fixture.probe_id("load", "(I)V").unwrap();
    let breaker = Arc::new(CircuitBreakerService::new(CircuitBreakerConfig::default(), Arc::new(NoHeapSampler)));
    let aggregator = Arc::new(MetricAggregator::new());
    let runtime = ProbeRuntime::new(fixture.probes.clone(), breaker, aggregator.clone());
    let mut worker = runtime.worker();

    // Two calls to load(int); each opens and closes its own transaction.
    for _ in 0..2 {
        let handle = runtime.enter(&mut worker, load);
        assert_ne!(handle, 0);
        runtime.exit(&mut worker, handle, RETURN as i32);
        assert!(!worker.in_transaction());
    }

    assert_eq!(runtime.stats().transactions_finished, 2);
    let stats = aggregator.harvest();
    assert_eq!(stats.get("Custom/load").map(|s| s.call_count()), Some(2));
    assert_eq!(stats.get("OtherTransaction/Custom/load").map(|s| s.call_count()), Some(2));
}

#[test]
fn object_methods_are_never_traced() {
    let fixture = Fixture::with_rules(vec![on_orders(MethodMatcher::Any, TraceDetails::default_trace())]);
    let class = fixture.load("com/acme/Orders", &orders_class()).unwrap();
    assert!(hook_calls(&class, &method_code(&class, "toString", "()Ljava/lang/String;")).is_empty());
    assert!(fixture.probe_id("toString", "()Ljava/lang/String;").is_none());
    assert!(fixture.probe_id("handle", "()V").is_some());
}

#[test]
fn bridges_trace_their_typed_target() {
    let mut b = ClassBuilder::new("com/acme/NameSupplier", "java/lang/Object");
    b.interface("java/util/function/Supplier");
    default_constructor(&mut b, "java/lang/Object");
    let name = b.cp.add_string("orders").unwrap();
    let [hi, lo] = name.to_be_bytes();
    b.method(ACC_PUBLIC, "get", "()Ljava/lang/String;", Body::new(1, 1, vec![LDC_W, hi, lo, ARETURN]));
    let typed = b.methodref("com/acme/NameSupplier", "get", "()Ljava/lang/String;");
    let [hi, lo] = typed.to_be_bytes();
    b.method(
        ACC_PUBLIC | ACC_BRIDGE | ACC_SYNTHETIC,
        "get",
        "()Ljava/lang/Object;",
        Body::new(1, 1, vec![ALOAD_0, INVOKEVIRTUAL, hi, lo, ARETURN]),
    );

    let fixture = Fixture::with_rules(vec![Rule::new(
        ClassMatcher::interface("java/util/function/Supplier"),
        MethodMatcher::exact("get", "()Ljava/lang/Object;"),
        TraceDetails::default_trace(),
    )]);
    let class = fixture.load("com/acme/NameSupplier", &b.build()).unwrap();

    assert!(hook_calls(&class, &method_code(&class, "get", "()Ljava/lang/Object;")).is_empty());
    assert_eq!(hook_calls(&class, &method_code(&class, "get", "()Ljava/lang/String;")), vec!["enter", "exit", "exit"]);
    assert!(fixture.probe_id("get", "()Ljava/lang/String;").is_some());
    assert!(fixture.probe_id("get", "()Ljava/lang/Object;").is_none());
}

#[test]
fn subclasses_match_through_recorded_ancestry() {
    let fixture = Fixture::with_rules(vec![Rule::new(
        ClassMatcher::base_class("com/acme/Handler"),
        MethodMatcher::name("handle"),
        TraceDetails::default_trace(),
    )]);

    let class = |name: &str, super_name: &str| {
        let mut b = ClassBuilder::new(name, super_name);
        void_method(&mut b, ACC_PUBLIC, "handle", "()V", 1);
        b.build()
    };

    // The base class itself is not a subclass of itself.
    assert!(fixture.load("com/acme/Handler", &class("com/acme/Handler", "java/lang/Object")).is_none());
    assert!(fixture.load("com/acme/JsonHandler", &class("com/acme/JsonHandler", "com/acme/Handler")).is_some());
    assert!(fixture
        .load("com/acme/PrettyJsonHandler", &class("com/acme/PrettyJsonHandler", "com/acme/JsonHandler"))
        .is_some());
    assert!(fixture.load("com/acme/Unrelated", &class("com/acme/Unrelated", "java/lang/Object")).is_none());
    assert_eq!(fixture.transformer.stats().rewritten, 2);
}

#[test]
fn listed_final_fields_are_unlocked() {
    let mut b = ClassBuilder::new("com/acme/Counter", "java/lang/Object");
    b.field(ACC_FINAL, "count", "I").field(ACC_PUBLIC | ACC_STATIC | ACC_FINAL, "LIMIT", "I");
    default_constructor(&mut b, "java/lang/Object");

    let fixture = Fixture::new(ClassFilter::default());
    fixture.transformer.unlock_final_fields("com.acme.Counter", &["count", "missing"]);
    let class = fixture.load("com/acme/Counter", &b.build()).unwrap();

    let flags: Vec<(String, u16)> = class
        .fields
        .iter()
        .map(|f| (f.name(&class.constant_pool).unwrap().to_string(), f.access_flags))
        .collect();
    assert_eq!(flags, vec![("count".to_string(), 0), ("LIMIT".to_string(), ACC_PUBLIC | ACC_STATIC | ACC_FINAL)]);
    assert!(hook_calls(&class, &method_code(&class, "<init>", "()V")).is_empty());
    assert!(fixture.load("com/acme/Other", &orders_class()).is_none());
}

#[test]
fn generated_classes_are_never_rewritten() {
    let fixture = Fixture::with_rules(vec![Rule::new(
        ClassMatcher::Any,
        MethodMatcher::name("handle"),
        TraceDetails::default_trace(),
    )]);
    for name in ["com/acme/Orders$$Lambda$14/0x0000000800c02a00", "com/sun/proxy/$Proxy12", "java/util/Orders"] {
        let mut b = ClassBuilder::new(name, "java/lang/Object");
        void_method(&mut b, ACC_PUBLIC, "handle", "()V", 1);
        assert!(fixture.load(name, &b.build()).is_none(), "{name}");
    }
    assert_eq!(fixture.transformer.stats().inspected, 0);
}

#[test]
fn bootstrap_classes_need_an_include() {
    let rules = || vec![on_orders(MethodMatcher::name("handle"), TraceDetails::default_trace())];

    let fixture = Fixture::with_rules(rules());
    let out = fixture.transformer.transform(LoaderKind::Bootstrap, Some("com/acme/Orders"), false, &orders_class());
    assert!(out.unwrap().is_none());

    let included = Fixture::new(ClassFilter::new(["com.acme"], Vec::<String>::new()));
    included.local.set_rules(rules()).unwrap();
    let out = included.transformer.transform(LoaderKind::Bootstrap, Some("com/acme/Orders"), false, &orders_class());
    assert!(out.unwrap().is_some());

    let excluded = Fixture::new(ClassFilter::new(Vec::<String>::new(), ["com.acme"]));
    excluded.local.set_rules(rules()).unwrap();
    assert!(excluded.load("com/acme/Orders", &orders_class()).is_none());
}

#[test]
fn malformed_classes_are_skipped_and_counted() {
    let fixture = Fixture::with_rules(vec![on_orders(MethodMatcher::Any, TraceDetails::default_trace())]);
    let mut truncated = orders_class();
    truncated.truncate(40);

    assert!(fixture.transformer.transform(LoaderKind::Application, Some("com/acme/Orders"), false, &truncated).is_err());
    assert!(fixture.transformer.transform_or_skip(LoaderKind::Application, Some("com/acme/Orders"), false, &truncated).is_none());
    assert_eq!(fixture.transformer.stats().failed, 1);
}

#[test]
fn unnamed_classes_are_named_from_their_bytes() {
    let fixture = Fixture::with_rules(vec![on_orders(MethodMatcher::name("handle"), TraceDetails::default_trace())]);
    let out = fixture.transformer.transform(LoaderKind::Application, None, false, &orders_class()).unwrap();
    assert!(out.is_some());
    assert_eq!(fixture.probes.get(1).unwrap().class_name, "com/acme/Orders");
}

#[test]
fn rule_changes_apply_to_the_next_load() {
    let fixture = Fixture::with_rules(vec![on_orders(MethodMatcher::name("handle"), TraceDetails::default_trace())]);
    let first = fixture.load("com/acme/Orders", &orders_class()).unwrap();
    assert!(!hook_calls(&first, &method_code(&first, "handle", "()V")).is_empty());

    fixture.local.set_rules(vec![on_orders(MethodMatcher::exact("load", "()V"), TraceDetails::default_trace())]).unwrap();
    let second = fixture.load("com/acme/Orders", &orders_class()).unwrap();
    assert!(hook_calls(&second, &method_code(&second, "handle", "()V")).is_empty());
    assert!(!hook_calls(&second, &method_code(&second, "load", "()V")).is_empty());
}

#[test]
fn shut_down_transformer_returns_classes_unchanged() {
    let fixture = Fixture::with_rules(vec![on_orders(MethodMatcher::name("handle"), TraceDetails::default_trace())]);
    assert!(fixture.load("com/acme/Orders", &orders_class()).is_some());
    fixture.transformer.shutdown();
    assert!(fixture.load("com/acme/Orders", &orders_class()).is_none());
    assert_eq!(fixture.transformer.stats().rewritten, 1);
}

#[test]
fn injected_probe_ids_drive_the_runtime() {
    let fixture = Fixture::with_rules(vec![
        on_orders(MethodMatcher::name("handle"), TraceDetails::builder().dispatcher(true).build()),
        on_orders(MethodMatcher::exact("load", "()V"), TraceDetails::builder().metric_prefix("Orders").build()),
    ]);
    fixture.load("com/acme/Orders", &orders_class()).unwrap();
    let handle = fixture.probe_id("handle", "()V").unwrap();
    let load = fixture.probe_id("load", "()V").unwrap();

    let breaker = Arc::new(CircuitBreakerService::new(CircuitBreakerConfig::default(), Arc::new(NoHeapSampler)));
    let aggregator = Arc::new(MetricAggregator::new());
    let runtime = ProbeRuntime::new(fixture.probes.clone(), breaker, aggregator.clone());
    let mut worker = runtime.worker();

    // What the injected code does for handle() calling load() twice.
    let root = runtime.enter(&mut worker, handle);
    assert_ne!(root, 0);
    for _ in 0..2 {
        let inner = runtime.enter(&mut worker, load);
        runtime.exit(&mut worker, inner, RETURN as i32);
    }
    runtime.exit(&mut worker, root, RETURN as i32);

    // Outside a transaction a plain probe records nothing.
    let stray = runtime.enter(&mut worker, load);
    assert_eq!(stray, 0);
    runtime.exit(&mut worker, stray, RETURN as i32);

    assert_eq!(runtime.stats().transactions_finished, 1);
    let stats = aggregator.harvest();
    assert_eq!(stats.get("OtherTransaction/all").map(|s| s.call_count()), Some(1));
    assert_eq!(stats.get("OtherTransaction/Java/com.acme.Orders/handle").map(|s| s.call_count()), Some(1));
    assert_eq!(stats.get("Orders/com.acme.Orders/load").map(|s| s.call_count()), Some(2));
}
