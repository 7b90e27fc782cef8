//! Raw FFI bindings to the JNI and JVMTI function tables.

pub mod jni;
pub mod jvmti;
