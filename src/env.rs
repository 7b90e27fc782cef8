//! High-level environment wrappers for JVMTI and JNI.
//!
//! [`Jvmti`] covers what the probe agent asks of the tool interface:
//! capabilities, event wiring, loaded-class enumeration and retransformation.
//! [`JniEnv`] covers defining and binding the hook class and the few method
//! calls the heap sampler makes. [`LocalRef`] deletes a local reference when
//! dropped; [`GlobalRef`] pins an object for the VM's lifetime.

pub use crate::jni_wrapper::{GlobalRef, JavaVmRef, JniEnv, LocalRef, MethodId};
pub use crate::jvmti_wrapper::Jvmti;
