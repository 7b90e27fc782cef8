mod common;

use common::*;
use jvmti_probes::bytecode::{self, opcodes::*};
use jvmti_probes::classfile::attributes::{parse_stack_map_table, CodeAttribute, StackMapFrame, VerificationType};
use jvmti_probes::classfile::{ClassFile, Constant};
use jvmti_probes::matcher::{ClassIndex, ClassMatcher, MethodMatcher};
use jvmti_probes::registry::ClassRetransformer;
use jvmti_probes::rule::Rule;
use jvmti_probes::runtime::ProbeTable;
use jvmti_probes::trace::TraceDetails;
use jvmti_probes::transformer::{ClassFilter, CustomClassTransformer, LoaderKind};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const CLASS: &str = "com/acme/Paths";

fn paths_class() -> Vec<u8> {
    let mut b = ClassBuilder::new(CLASS, "java/lang/Object");
    default_constructor(&mut b, "java/lang/Object");

    // static int pick(int x) { return x != 0 ? 1 : 0; }
    b.method(
        ACC_PUBLIC | ACC_STATIC,
        "pick",
        "(I)I",
        Body::new(1, 1, vec![ILOAD_0, IFEQ, 0x00, 0x05, 0x04, IRETURN, ICONST_0, IRETURN])
            .frame(StackMapFrame::Same { offset_delta: 6 }),
    );

    // static void fail(int x) { if (x == 0) return; throw null; }
    b.method(
        ACC_PUBLIC | ACC_STATIC,
        "fail",
        "(I)V",
        Body::new(1, 1, vec![ILOAD_0, IFNE, 0x00, 0x04, RETURN, 0x01, ATHROW])
            .frame(StackMapFrame::Same { offset_delta: 5 }),
    );

    // static void guarded(int x) { try { if (x != 0) throw null; } catch (RuntimeException e) {} }
    let runtime_exception = b.class_index("java/lang/RuntimeException");
    b.method(
        ACC_PUBLIC | ACC_STATIC,
        "guarded",
        "(I)V",
        Body::new(1, 2, vec![ILOAD_0, IFEQ, 0x00, 0x06, 0x01, ATHROW, 0x4c, RETURN])
            .handler(0, 6, 6, runtime_exception)
            .frame(StackMapFrame::Full {
                offset_delta: 6,
                locals: vec![VerificationType::Integer],
                stack: vec![VerificationType::Object(runtime_exception)],
            })
            .frame(StackMapFrame::Same { offset_delta: 0 }),
    );

    // static int sw(int x) { switch (x) { case 0: return 0; case 1: return 1; default: return -1; } }
    let mut sw = vec![ILOAD_0, TABLESWITCH, 0, 0];
    for value in [27i32, 0, 1, 23, 25] {
        sw.extend_from_slice(&value.to_be_bytes());
    }
    sw.extend_from_slice(&[ICONST_0, IRETURN, 0x04, IRETURN, 0x02, IRETURN]);
    b.method(
        ACC_PUBLIC | ACC_STATIC,
        "sw",
        "(I)I",
        Body::new(1, 1, sw)
            .frame(StackMapFrame::Same { offset_delta: 24 })
            .frame(StackMapFrame::Same { offset_delta: 1 })
            .frame(StackMapFrame::Same { offset_delta: 1 }),
    );

    // void store(long id, String name) {}
    b.method(ACC_PUBLIC, "store", "(JLjava/lang/String;)V", Body::new(0, 4, vec![RETURN]));
    b.build()
}

fn rewrite(rules: Vec<Rule>) -> (ClassFile, Arc<ProbeTable>) {
    let probes = Arc::new(ProbeTable::new());
    let local = Arc::new(ClassRetransformer::new("local"));
    local.set_rules(rules).unwrap();
    let transformer = CustomClassTransformer::new(
        local,
        Arc::new(ClassRetransformer::new("remote")),
        Arc::new(ClassIndex::new()),
        probes.clone(),
        ClassFilter::default(),
    );
    let out = transformer
        .transform(LoaderKind::Application, Some(CLASS), false, &paths_class())
        .unwrap()
        .expect("class rewritten");
    (ClassFile::parse(&out).unwrap(), probes)
}

fn rule(method: MethodMatcher, details: TraceDetails) -> Rule {
    Rule::new(ClassMatcher::exact(CLASS), method, details)
}

fn traced(name: &str) -> Rule {
    rule(MethodMatcher::name(name), TraceDetails::default_trace())
}

/// Walks every control path through `code`, exception edges included, and
/// checks each way out of the method saw one entry and `expected_closes`
/// closes. Returns the number of distinct exits reached.
fn check_paths(class: &ClassFile, code: &CodeAttribute, expected_closes: u8) -> usize {
    let insns = bytecode::decode(&code.code).unwrap();
    let at: HashMap<u32, usize> = insns.iter().enumerate().map(|(i, l)| (l.pc, i)).collect();
    let mut seen = HashSet::new();
    let mut exits = HashSet::new();
    let mut work = vec![(0u32, 0u8, 0u8)];

    while let Some(state) = work.pop() {
        if !seen.insert(state) {
            continue;
        }
        let (pc, mut enters, mut closes) = state;
        let located = &insns[at[&pc]];
        let covering: Vec<_> =
            code.exception_table.iter().filter(|e| (e.start_pc as u32..e.end_pc as u32).contains(&pc)).collect();
        for entry in &covering {
            work.push((entry.handler_pc as u32, enters, closes));
        }

        match hook_name(class, &located.insn).as_deref() {
            Some("enter") | Some("enterFlyweight") => enters += 1,
            Some("exit") | Some("exitFlyweight") => closes += 1,
            _ => {}
        }
        assert!(enters <= 1 && closes <= 1, "pc {pc}: {enters} entries, {closes} closes");

        let opcode = located.insn.opcode();
        let escapes = located.insn.is_return() || (opcode == ATHROW && !covering.iter().any(|e| e.catch_type == 0));
        if escapes {
            assert_eq!((enters, closes), (1, expected_closes), "leaving at pc {pc}");
            exits.insert(pc);
        }
        if !located.insn.ends_block() {
            work.push((insns[at[&pc] + 1].pc, enters, closes));
        }
        for target in located.insn.targets() {
            work.push((target, enters, closes));
        }
    }
    exits.len()
}

fn probe_id_operand(class: &ClassFile, code: &CodeAttribute) -> i32 {
    let first = &bytecode::decode(&code.code).unwrap()[0];
    assert_eq!(first.insn.opcode(), LDC_W);
    match class.constant_pool.get(first.insn.cp_index().unwrap()).unwrap() {
        Constant::Integer(id) => *id,
        other => panic!("probe id operand is {other:?}"),
    }
}

#[test]
fn every_return_closes_once() {
    let (class, probes) = rewrite(vec![traced("pick"), traced("sw")]);

    let pick = method_code(&class, "pick", "(I)I");
    assert_eq!(check_paths(&class, &pick, 1), 3);
    let sw = method_code(&class, "sw", "(I)I");
    assert_eq!(check_paths(&class, &sw, 1), 4);

    assert_eq!(probes.len(), 2);
    let id = probe_id_operand(&class, &pick) as u32;
    let probe = probes.get(id).unwrap();
    assert_eq!((probe.method_name.as_str(), probe.descriptor.as_str()), ("pick", "(I)I"));
}

#[test]
fn throws_close_through_the_catch_all() {
    let (class, _) = rewrite(vec![traced("fail")]);
    let code = method_code(&class, "fail", "(I)V");
    assert_eq!(check_paths(&class, &code, 1), 2);

    let catch_all: Vec<_> = code.exception_table.iter().filter(|e| e.catch_type == 0).collect();
    assert!(!catch_all.is_empty());
    let handler = catch_all[0].handler_pc;
    assert!(catch_all.iter().all(|e| e.handler_pc == handler && e.end_pc <= handler));
}

#[test]
fn original_handlers_keep_precedence() {
    let (class, _) = rewrite(vec![traced("guarded")]);
    let code = method_code(&class, "guarded", "(I)V");
    check_paths(&class, &code, 1);

    let first = code.exception_table[0];
    assert_ne!(first.catch_type, 0);
    assert!(code.exception_table[1..].iter().all(|e| e.catch_type == 0));
    let insns = bytecode::decode(&code.code).unwrap();
    let handler = insns.iter().find(|l| l.pc == first.handler_pc as u32).unwrap();
    assert_eq!(handler.insn.opcode(), 0x4c);
}

#[test]
fn frames_describe_the_handle_and_the_handler() {
    let (class, _) = rewrite(vec![traced("pick")]);
    let code = method_code(&class, "pick", "(I)I");
    assert_eq!(code.max_locals, 3);

    let (_, smt) = code
        .attributes
        .iter()
        .enumerate()
        .find(|(_, a)| a.name(&class.constant_pool).unwrap() == "StackMapTable")
        .unwrap();
    let frames = parse_stack_map_table(&smt.info).unwrap();
    assert_eq!(frames.len(), 2);

    let handler = code.exception_table.iter().find(|e| e.catch_type == 0).unwrap().handler_pc as u32;
    let mut offset = None;
    for frame in &frames {
        let StackMapFrame::Full { offset_delta, locals, stack } = frame else {
            panic!("expected full frames, got {frame:?}");
        };
        let here = match offset {
            None => *offset_delta as u32,
            Some(prev) => prev + *offset_delta as u32 + 1,
        };
        assert_eq!(locals.last(), Some(&VerificationType::Long));
        if here == handler {
            assert_eq!(stack.len(), 1);
            assert!(matches!(stack[0], VerificationType::Object(_)));
        }
        offset = Some(here);
    }
    assert_eq!(offset, Some(handler));
}

#[test]
fn constructors_get_no_catch_all() {
    let (class, _) = rewrite(vec![traced("<init>")]);
    let code = method_code(&class, "<init>", "()V");
    assert!(code.exception_table.is_empty());
    assert_eq!(hook_calls(&class, &code), vec!["enter", "exit"]);
}

#[test]
fn async_probes_only_open() {
    let (class, _) = rewrite(vec![rule(MethodMatcher::name("fail"), TraceDetails::builder().is_async(true).build())]);
    let code = method_code(&class, "fail", "(I)V");
    assert_eq!(hook_calls(&class, &code), vec!["enter"]);
    assert!(code.exception_table.is_empty());
    check_paths(&class, &code, 0);
}

#[test]
fn flyweight_probes_pass_the_id_back() {
    let details = TraceDetails::builder().leaf(true).exclude_from_transaction_trace(true).build();
    let (class, _) = rewrite(vec![rule(MethodMatcher::name("pick"), details)]);
    let code = method_code(&class, "pick", "(I)I");
    assert_eq!(hook_calls(&class, &code), vec!["enterFlyweight", "exitFlyweight", "exitFlyweight", "exitFlyweight"]);
    check_paths(&class, &code, 1);

    let id = probe_id_operand(&class, &code);
    let insns = bytecode::decode(&code.code).unwrap();
    for (i, located) in insns.iter().enumerate() {
        if hook_name(&class, &located.insn).as_deref() == Some("exitFlyweight") {
            let load_id = &insns[i - 2];
            assert_eq!(load_id.insn.opcode(), LDC_W);
            let operand = class.constant_pool.get(load_id.insn.cp_index().unwrap()).unwrap();
            assert_eq!(operand, &Constant::Integer(id));
        }
    }
}

#[test]
fn ignore_transaction_is_a_single_call() {
    let details = TraceDetails::builder().ignore_transaction(true).build();
    let (class, probes) = rewrite(vec![rule(MethodMatcher::name("pick"), details)]);
    let code = method_code(&class, "pick", "(I)I");
    assert_eq!(hook_calls(&class, &code), vec!["ignoreTransaction"]);
    assert!(code.exception_table.is_empty());
    assert_eq!(code.max_locals, 1);
    assert!(probes.is_empty());
}

#[test]
fn captured_parameters_are_covered_by_the_handler() {
    let details =
        TraceDetails::builder().parameter_attribute(0, "order.id").parameter_attribute(1, "order.name").build();
    let (class, _) = rewrite(vec![rule(MethodMatcher::exact("store", "(JLjava/lang/String;)V"), details)]);
    let code = method_code(&class, "store", "(JLjava/lang/String;)V");
    assert_eq!(hook_calls(&class, &code), vec!["enter", "attribute", "attribute", "exit", "exit"]);
    check_paths(&class, &code, 1);

    let insns = bytecode::decode(&code.code).unwrap();
    let boxing = insns
        .iter()
        .filter(|l| l.insn.opcode() == INVOKESTATIC)
        .filter_map(|l| class.constant_pool.member_ref(l.insn.cp_index()?).ok())
        .find(|m| m.name == "valueOf")
        .unwrap();
    assert_eq!(boxing.owner, "java/lang/Long");

    for located in insns.iter().filter(|l| hook_name(&class, &l.insn).as_deref() == Some("attribute")) {
        assert!(code
            .exception_table
            .iter()
            .any(|e| e.catch_type == 0 && (e.start_pc as u32..e.end_pc as u32).contains(&located.pc)));
    }
    // Handle after `this`, the long and the string.
    assert_eq!(code.max_locals, 6);
}

#[test]
fn untouched_methods_keep_their_bytes() {
    let original = ClassFile::parse(&paths_class()).unwrap();
    let (class, _) = rewrite(vec![traced("pick")]);
    for (name, descriptor) in [("fail", "(I)V"), ("guarded", "(I)V"), ("sw", "(I)I")] {
        assert_eq!(method_code(&class, name, descriptor), method_code(&original, name, descriptor));
    }
}
