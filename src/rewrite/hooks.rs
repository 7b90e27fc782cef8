//! The class injected code calls into.
//!
//! `jvmti/probes/ProbeHooks` is generated here, defined in the bootstrap
//! loader at VM init so every class can see it, and its static natives are
//! bound to the probe runtime with `RegisterNatives`.

use crate::classfile::{ClassFile, ClassFileError, ConstantPool, MemberInfo, ACC_FINAL, ACC_NATIVE, ACC_PUBLIC, ACC_STATIC};

pub const HOOK_CLASS: &str = "jvmti/probes/ProbeHooks";

const ACC_SUPER: u16 = 0x0020;
const JAVA_8: u16 = 52;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookMethod {
    pub name: &'static str,
    pub descriptor: &'static str,
}

/// `enter(probeId) -> handle`
pub const ENTER: HookMethod = HookMethod { name: "enter", descriptor: "(I)J" };
/// `exit(handle, opcode)`; the opcode is the return or `athrow` that ended the call.
pub const EXIT: HookMethod = HookMethod { name: "exit", descriptor: "(JI)V" };
pub const IGNORE_TRANSACTION: HookMethod = HookMethod { name: "ignoreTransaction", descriptor: "()V" };
pub const ATTRIBUTE: HookMethod =
    HookMethod { name: "attribute", descriptor: "(JLjava/lang/String;Ljava/lang/Object;)V" };
pub const ENTER_FLYWEIGHT: HookMethod = HookMethod { name: "enterFlyweight", descriptor: "(I)J" };
pub const EXIT_FLYWEIGHT: HookMethod = HookMethod { name: "exitFlyweight", descriptor: "(IJ)V" };
pub const CLOSE_ASYNC: HookMethod = HookMethod { name: "closeAsync", descriptor: "(J)V" };

pub const ALL_HOOKS: [HookMethod; 7] =
    [ENTER, EXIT, IGNORE_TRANSACTION, ATTRIBUTE, ENTER_FLYWEIGHT, EXIT_FLYWEIGHT, CLOSE_ASYNC];

/// Class file bytes for the hook class: public static natives only.
pub fn hook_class_bytes() -> Result<Vec<u8>, ClassFileError> {
    let mut cp = ConstantPool::new();
    let this_class = cp.add_class(HOOK_CLASS)?;
    let super_class = cp.add_class("java/lang/Object")?;

    let mut methods = Vec::with_capacity(ALL_HOOKS.len());
    for hook in ALL_HOOKS {
        methods.push(MemberInfo {
            access_flags: ACC_PUBLIC | ACC_STATIC | ACC_NATIVE,
            name_index: cp.add_utf8(hook.name)?,
            descriptor_index: cp.add_utf8(hook.descriptor)?,
            attributes: Vec::new(),
        });
    }

    ClassFile {
        minor_version: 0,
        major_version: JAVA_8,
        constant_pool: cp,
        access_flags: ACC_PUBLIC | ACC_FINAL | ACC_SUPER,
        this_class,
        super_class,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods,
        attributes: Vec::new(),
    }
    .to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_class_parses_back() {
        let bytes = hook_class_bytes().unwrap();
        let class = ClassFile::parse(&bytes).unwrap();
        assert_eq!(class.name().unwrap(), HOOK_CLASS);
        assert_eq!(class.super_name().unwrap(), Some("java/lang/Object"));
        assert_eq!(class.methods.len(), ALL_HOOKS.len());
        for hook in ALL_HOOKS {
            let index = class.find_method(hook.name, hook.descriptor).unwrap();
            let flags = class.methods[index].access_flags;
            assert_eq!(flags & (ACC_NATIVE | ACC_STATIC), ACC_NATIVE | ACC_STATIC);
        }
    }
}
