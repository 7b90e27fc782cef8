//! Safe wrapper around the JNI environment.
//!
//! Covers the JNI calls the probe agent needs: defining the hook class,
//! binding its natives, and the handful of method calls the heap sampler
//! makes against `java.lang.Runtime` and the GC management beans.
//!
//! ```rust,ignore
//! use jvmti_probes::env::JniEnv;
//!
//! fn vm_init(jni: *mut jni::JNIEnv, thread: jni::jthread) {
//!     let env = unsafe { JniEnv::from_raw(jni) };
//!     let runtime = env.find_class("java/lang/Runtime");
//!     if env.take_exception() {
//!         // lookup failed, nothing pending any more
//!     }
//! }
//! ```

use crate::sys::jni;
use std::ffi::{CStr, CString};
use std::ptr;

/// Safe wrapper around a JNI environment pointer.
///
/// # Thread Safety
///
/// A `JniEnv` is tied to a specific thread and cannot be sent across threads.
/// Each JVM thread has its own JNI environment.
pub struct JniEnv {
    env: *mut jni::JNIEnv,
}

impl JniEnv {
    /// Creates a JniEnv wrapper from a raw pointer.
    ///
    /// # Safety
    ///
    /// The caller must ensure the pointer is valid and comes from the current thread.
    pub unsafe fn from_raw(env: *mut jni::JNIEnv) -> Self {
        JniEnv { env }
    }

    /// Looks up the JNI environment of the calling thread.
    ///
    /// Returns `None` when the thread is not attached to the VM.
    ///
    /// # Safety
    ///
    /// `vm` must be the live JavaVM pointer.
    pub unsafe fn for_current_thread(vm: *mut jni::JavaVM) -> Option<Self> {
        let mut env_ptr: *mut std::ffi::c_void = ptr::null_mut();
        let res = crate::jvm_call!(vm, GetEnv, &mut env_ptr, jni::JNI_VERSION_1_6);
        if res != jni::JNI_OK || env_ptr.is_null() {
            return None;
        }
        Some(JniEnv { env: env_ptr as *mut jni::JNIEnv })
    }

    /// Returns the calling thread's JNI environment, attaching the thread
    /// to the VM as a daemon if it is not attached yet.
    ///
    /// # Safety
    ///
    /// `vm` must be the live JavaVM pointer.
    pub unsafe fn attach_current_thread_as_daemon(vm: *mut jni::JavaVM) -> Option<Self> {
        if let Some(env) = Self::for_current_thread(vm) {
            return Some(env);
        }
        let mut env_ptr: *mut std::ffi::c_void = ptr::null_mut();
        let res = crate::jvm_call!(vm, AttachCurrentThreadAsDaemon, &mut env_ptr, ptr::null_mut());
        if res != jni::JNI_OK || env_ptr.is_null() {
            return None;
        }
        Some(JniEnv { env: env_ptr as *mut jni::JNIEnv })
    }

    /// Returns the raw JNI environment pointer.
    pub fn raw(&self) -> *mut jni::JNIEnv {
        self.env
    }

    /// Returns the JavaVM this environment belongs to.
    pub fn get_java_vm(&self) -> Option<*mut jni::JavaVM> {
        let mut vm: *mut jni::JavaVM = ptr::null_mut();
        unsafe {
            let vtable = *self.env;
            let res = ((*vtable).GetJavaVM)(self.env, &mut vm);
            if res == jni::JNI_OK && !vm.is_null() { Some(vm) } else { None }
        }
    }

    // =========================================================================
    // Class Operations
    // =========================================================================

    /// Finds a class by its internal name (e.g., "java/lang/String").
    pub fn find_class(&self, name: &str) -> Option<jni::jclass> {
        let c_name = CString::new(name).ok()?;
        unsafe {
            let vtable = *self.env;
            let cls = ((*vtable).FindClass)(self.env, c_name.as_ptr());
            if cls.is_null() { None } else { Some(cls) }
        }
    }

    /// Defines a class from raw class file bytes.
    ///
    /// A null `loader` defines the class in the bootstrap loader.
    pub fn define_class(&self, name: &str, loader: jni::jobject, bytes: &[u8]) -> Option<jni::jclass> {
        let c_name = CString::new(name).ok()?;
        unsafe {
            let vtable = *self.env;
            let cls = ((*vtable).DefineClass)(
                self.env,
                c_name.as_ptr(),
                loader,
                bytes.as_ptr() as *const jni::jbyte,
                bytes.len() as jni::jsize,
            );
            if cls.is_null() { None } else { Some(cls) }
        }
    }

    // =========================================================================
    // Exception Handling
    // =========================================================================

    /// Checks if an exception is pending.
    pub fn exception_check(&self) -> bool {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionCheck)(self.env) != 0
        }
    }

    /// Clears any pending exception.
    pub fn exception_clear(&self) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionClear)(self.env);
        }
    }

    /// Clears a pending exception, returning whether there was one.
    pub fn take_exception(&self) -> bool {
        if self.exception_check() {
            self.exception_clear();
            true
        } else {
            false
        }
    }

    // =========================================================================
    // Strings
    // =========================================================================

    /// Gets a Rust string from a Java string.
    ///
    /// Returns `None` if the string is null. Modified UTF-8 that is not valid
    /// UTF-8 is replaced lossily.
    pub fn get_string_utf(&self, s: jni::jstring) -> Option<String> {
        if s.is_null() {
            return None;
        }
        unsafe {
            let vtable = *self.env;
            let chars = ((*vtable).GetStringUTFChars)(self.env, s, ptr::null_mut());
            if chars.is_null() {
                return None;
            }
            let result = CStr::from_ptr(chars).to_string_lossy().into_owned();
            ((*vtable).ReleaseStringUTFChars)(self.env, s, chars);
            Some(result)
        }
    }

    // =========================================================================
    // Method IDs and Calls
    // =========================================================================

    /// Gets the method ID for an instance method.
    pub fn get_method_id(&self, cls: jni::jclass, name: &str, sig: &str) -> Option<jni::jmethodID> {
        let c_name = CString::new(name).ok()?;
        let c_sig = CString::new(sig).ok()?;
        unsafe {
            let vtable = *self.env;
            let mid = ((*vtable).GetMethodID)(self.env, cls, c_name.as_ptr(), c_sig.as_ptr());
            if mid.is_null() { None } else { Some(mid) }
        }
    }

    /// Gets the method ID for a static method.
    pub fn get_static_method_id(&self, cls: jni::jclass, name: &str, sig: &str) -> Option<jni::jmethodID> {
        let c_name = CString::new(name).ok()?;
        let c_sig = CString::new(sig).ok()?;
        unsafe {
            let vtable = *self.env;
            let mid = ((*vtable).GetStaticMethodID)(self.env, cls, c_name.as_ptr(), c_sig.as_ptr());
            if mid.is_null() { None } else { Some(mid) }
        }
    }

    /// Calls an object instance method.
    pub fn call_object_method(&self, obj: jni::jobject, method_id: jni::jmethodID, args: &[jni::jvalue]) -> jni::jobject {
        unsafe {
            let vtable = *self.env;
            ((*vtable).CallObjectMethodA)(self.env, obj, method_id, args.as_ptr())
        }
    }

    /// Calls an int instance method.
    pub fn call_int_method(&self, obj: jni::jobject, method_id: jni::jmethodID, args: &[jni::jvalue]) -> jni::jint {
        unsafe {
            let vtable = *self.env;
            ((*vtable).CallIntMethodA)(self.env, obj, method_id, args.as_ptr())
        }
    }

    /// Calls a long instance method.
    pub fn call_long_method(&self, obj: jni::jobject, method_id: jni::jmethodID, args: &[jni::jvalue]) -> jni::jlong {
        unsafe {
            let vtable = *self.env;
            ((*vtable).CallLongMethodA)(self.env, obj, method_id, args.as_ptr())
        }
    }

    /// Calls a static method returning an object.
    pub fn call_static_object_method(&self, cls: jni::jclass, method_id: jni::jmethodID, args: &[jni::jvalue]) -> jni::jobject {
        unsafe {
            let vtable = *self.env;
            ((*vtable).CallStaticObjectMethodA)(self.env, cls, method_id, args.as_ptr())
        }
    }

    // =========================================================================
    // References
    // =========================================================================

    /// Creates a new global reference to an object.
    pub fn new_global_ref(&self, obj: jni::jobject) -> jni::jobject {
        unsafe {
            let vtable = *self.env;
            ((*vtable).NewGlobalRef)(self.env, obj)
        }
    }

    /// Deletes a local reference.
    pub fn delete_local_ref(&self, obj: jni::jobject) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).DeleteLocalRef)(self.env, obj);
        }
    }

    // =========================================================================
    // Native Methods
    // =========================================================================

    /// Registers native methods for a class.
    pub fn register_natives(&self, cls: jni::jclass, methods: &[jni::JNINativeMethod]) -> Result<(), jni::jint> {
        unsafe {
            let vtable = *self.env;
            let result = ((*vtable).RegisterNatives)(self.env, cls, methods.as_ptr(), methods.len() as jni::jint);
            if result == 0 { Ok(()) } else { Err(result) }
        }
    }
}

// =========================================================================
// Reference Guards
// =========================================================================

/// A guard that automatically deletes a local reference when dropped.
pub struct LocalRef<'a> {
    env: &'a JniEnv,
    obj: jni::jobject,
}

impl<'a> LocalRef<'a> {
    /// Creates a new LocalRef guard.
    pub fn new(env: &'a JniEnv, obj: jni::jobject) -> Self {
        LocalRef { env, obj }
    }

    /// Returns the underlying jobject.
    pub fn get(&self) -> jni::jobject {
        self.obj
    }
}

impl<'a> Drop for LocalRef<'a> {
    fn drop(&mut self) {
        if !self.obj.is_null() {
            self.env.delete_local_ref(self.obj);
        }
    }
}

/// A global reference held for the rest of the VM's life.
///
/// Global references are valid on every thread, so unlike [`JniEnv`] this
/// can be shared. It is never deleted: the objects pinned this way
/// (`Runtime`, the old-generation collector bean) live as long as the VM.
#[derive(Debug, Clone, Copy)]
pub struct GlobalRef {
    obj: jni::jobject,
}

unsafe impl Send for GlobalRef {}
unsafe impl Sync for GlobalRef {}

impl GlobalRef {
    /// Promotes a local reference to a pinned global one.
    pub fn pin(env: &JniEnv, local_obj: jni::jobject) -> Option<Self> {
        if local_obj.is_null() {
            return None;
        }
        let obj = env.new_global_ref(local_obj);
        if obj.is_null() { None } else { Some(GlobalRef { obj }) }
    }

    /// Returns the underlying global reference.
    pub fn get(&self) -> jni::jobject {
        self.obj
    }
}

/// A method id shareable across threads; ids stay valid on every thread for
/// as long as their class is loaded.
#[derive(Debug, Clone, Copy)]
pub struct MethodId(jni::jmethodID);

unsafe impl Send for MethodId {}
unsafe impl Sync for MethodId {}

impl MethodId {
    pub fn new(id: jni::jmethodID) -> Self {
        MethodId(id)
    }

    pub fn get(&self) -> jni::jmethodID {
        self.0
    }
}

/// The process-wide JavaVM pointer, usable from any thread.
#[derive(Debug, Clone, Copy)]
pub struct JavaVmRef(*mut jni::JavaVM);

unsafe impl Send for JavaVmRef {}
unsafe impl Sync for JavaVmRef {}

impl JavaVmRef {
    pub fn new(vm: *mut jni::JavaVM) -> Self {
        JavaVmRef(vm)
    }

    pub fn get(&self) -> *mut jni::JavaVM {
        self.0
    }

    /// JNI environment of the calling thread, attaching it as a daemon
    /// thread when needed.
    pub fn attach(&self) -> Option<JniEnv> {
        unsafe { JniEnv::attach_current_thread_as_daemon(self.0) }
    }
}
