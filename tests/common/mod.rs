#![allow(dead_code)]

use jvmti_probes::bytecode::{self, Instruction};
use jvmti_probes::classfile::attributes::{write_stack_map_table, CodeAttribute, ExceptionTableEntry, StackMapFrame};
use jvmti_probes::classfile::{ClassFile, ConstantPool, MemberInfo, RawAttribute};
use jvmti_probes::rewrite::hooks::HOOK_CLASS;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_BRIDGE: u16 = 0x0040;
pub const ACC_SYNTHETIC: u16 = 0x1000;

/// A method body for [`ClassBuilder::method`].
pub struct Body {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub frames: Vec<StackMapFrame>,
}

impl Body {
    pub fn new(max_stack: u16, max_locals: u16, code: Vec<u8>) -> Self {
        Self { max_stack, max_locals, code, exception_table: Vec::new(), frames: Vec::new() }
    }

    pub fn handler(mut self, start_pc: u16, end_pc: u16, handler_pc: u16, catch_type: u16) -> Self {
        self.exception_table.push(ExceptionTableEntry { start_pc, end_pc, handler_pc, catch_type });
        self
    }

    pub fn frame(mut self, frame: StackMapFrame) -> Self {
        self.frames.push(frame);
        self
    }
}

/// Builds class files through the crate's own constant pool, so code can
/// refer to entries added along the way.
pub struct ClassBuilder {
    pub cp: ConstantPool,
    major_version: u16,
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<MemberInfo>,
    methods: Vec<MemberInfo>,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: &str) -> Self {
        let mut cp = ConstantPool::new();
        let this_class = cp.add_class(name).unwrap();
        let super_class = cp.add_class(super_name).unwrap();
        Self {
            cp,
            major_version: 52,
            access_flags: ACC_PUBLIC | ACC_SUPER,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn major_version(&mut self, version: u16) -> &mut Self {
        self.major_version = version;
        self
    }

    pub fn interface(&mut self, name: &str) -> &mut Self {
        let index = self.cp.add_class(name).unwrap();
        self.interfaces.push(index);
        self
    }

    pub fn class_index(&mut self, name: &str) -> u16 {
        self.cp.add_class(name).unwrap()
    }

    pub fn methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.cp.add_methodref(owner, name, descriptor).unwrap()
    }

    pub fn field(&mut self, access_flags: u16, name: &str, descriptor: &str) -> &mut Self {
        let field = MemberInfo {
            access_flags,
            name_index: self.cp.add_utf8(name).unwrap(),
            descriptor_index: self.cp.add_utf8(descriptor).unwrap(),
            attributes: Vec::new(),
        };
        self.fields.push(field);
        self
    }

    pub fn method(&mut self, access_flags: u16, name: &str, descriptor: &str, body: Body) -> &mut Self {
        let mut code_attributes = Vec::new();
        if !body.frames.is_empty() {
            code_attributes.push(RawAttribute {
                name_index: self.cp.add_utf8("StackMapTable").unwrap(),
                info: write_stack_map_table(&body.frames),
            });
        }
        let code = CodeAttribute {
            max_stack: body.max_stack,
            max_locals: body.max_locals,
            code: body.code,
            exception_table: body.exception_table,
            attributes: code_attributes,
        };
        let method = MemberInfo {
            access_flags,
            name_index: self.cp.add_utf8(name).unwrap(),
            descriptor_index: self.cp.add_utf8(descriptor).unwrap(),
            attributes: vec![RawAttribute {
                name_index: self.cp.add_utf8("Code").unwrap(),
                info: code.to_bytes().unwrap(),
            }],
        };
        self.methods.push(method);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        ClassFile {
            minor_version: 0,
            major_version: self.major_version,
            constant_pool: self.cp.clone(),
            access_flags: self.access_flags,
            this_class: self.this_class,
            super_class: self.super_class,
            interfaces: self.interfaces.clone(),
            fields: self.fields.clone(),
            methods: self.methods.clone(),
            attributes: Vec::new(),
        }
        .to_bytes()
        .unwrap()
    }
}

/// `public <init>()V` calling `super()`.
pub fn default_constructor(builder: &mut ClassBuilder, super_name: &str) {
    let init = builder.methodref(super_name, "<init>", "()V");
    let [hi, lo] = init.to_be_bytes();
    builder.method(ACC_PUBLIC, "<init>", "()V", Body::new(1, 1, vec![0x2a, 0xb7, hi, lo, 0xb1]));
}

pub fn method_code(class: &ClassFile, name: &str, descriptor: &str) -> CodeAttribute {
    let index = class.find_method(name, descriptor).expect("method present");
    let method = &class.methods[index];
    let (_, attr) = method.find_attribute(&class.constant_pool, "Code").expect("code present");
    CodeAttribute::parse(&attr.info).expect("code parses")
}

/// Names of the hook methods a method body calls, in code order.
pub fn hook_calls(class: &ClassFile, code: &CodeAttribute) -> Vec<String> {
    bytecode::decode(&code.code)
        .unwrap()
        .into_iter()
        .filter_map(|located| hook_name(class, &located.insn))
        .collect()
}

pub fn hook_name(class: &ClassFile, insn: &Instruction) -> Option<String> {
    if insn.opcode() != bytecode::opcodes::INVOKESTATIC {
        return None;
    }
    let called = class.constant_pool.member_ref(insn.cp_index()?).ok()?;
    (called.owner == HOOK_CLASS).then(|| called.name.to_string())
}
