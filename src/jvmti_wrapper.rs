// jvmti-probes/src/jvmti_wrapper.rs
use crate::sys::jni;
use crate::sys::jvmti;
use std::ffi::CStr;
use std::ptr;

/// A safe wrapper around the raw JVMTI Environment pointer.
#[derive(Debug)]
pub struct Jvmti {
    env: *mut jvmti::jvmtiEnv,
}

// A jvmtiEnv is not bound to the thread that obtained it.
unsafe impl Send for Jvmti {}
unsafe impl Sync for Jvmti {}

impl Jvmti {
    /// Connects to the JVM and retrieves the JVMTI environment.
    pub fn new(vm: *mut jni::JavaVM) -> Result<Self, jni::jint> {
        let mut env_ptr: *mut std::ffi::c_void = ptr::null_mut();

        unsafe {
            let get_env_fn = (**vm).GetEnv;
            let res = get_env_fn(vm, &mut env_ptr, jvmti::JVMTI_VERSION_1_2);
            if res != jni::JNI_OK {
                return Err(res);
            }
        }

        Ok(Jvmti {
            env: env_ptr as *mut jvmti::jvmtiEnv,
        })
    }

    /// Create a Jvmti wrapper from a raw jvmtiEnv pointer
    ///
    /// # Safety
    /// The caller must ensure the pointer is valid for the duration of use.
    pub unsafe fn from_raw(env: *mut jvmti::jvmtiEnv) -> Self {
        Jvmti { env }
    }

    /// Get the raw jvmtiEnv pointer
    pub fn raw(&self) -> *mut jvmti::jvmtiEnv {
        self.env
    }

    fn functions(&self) -> &jvmti::jvmtiInterface_1_ {
        unsafe { &*(*self.env).functions }
    }

    pub fn add_capabilities(&self, new_caps: &jvmti::jvmtiCapabilities) -> Result<(), jvmti::jvmtiError> {
        let add_caps_fn = self.functions().AddCapabilities.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        let err = unsafe { add_caps_fn(self.env, new_caps) };
        if err != jvmti::jvmtiError::NONE {
            return Err(err);
        }
        Ok(())
    }

    /// Requests the capabilities set by `configure`.
    pub fn add_capabilities_with<F>(&self, configure: F) -> Result<(), jvmti::jvmtiError>
    where
        F: FnOnce(&mut jvmti::jvmtiCapabilities),
    {
        let mut caps = jvmti::jvmtiCapabilities::default();
        configure(&mut caps);
        self.add_capabilities(&caps)
    }

    pub fn set_event_callbacks(&self, callbacks: jvmti::jvmtiEventCallbacks) -> Result<(), jvmti::jvmtiError> {
        let set_callbacks_fn = self.functions().SetEventCallbacks.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        let size = std::mem::size_of::<jvmti::jvmtiEventCallbacks>() as i32;
        let err = unsafe { set_callbacks_fn(self.env, &callbacks, size) };
        if err != jvmti::jvmtiError::NONE {
            return Err(err);
        }
        Ok(())
    }

    pub fn set_event_notification_mode(&self, enable: bool, event_type: u32, thread: jni::jthread) -> Result<(), jvmti::jvmtiError> {
        let set_mode_fn = self.functions().SetEventNotificationMode.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        let mode = if enable { jvmti::JVMTI_ENABLE } else { jvmti::JVMTI_DISABLE };

        // thread can be null (all threads)
        let err = unsafe { set_mode_fn(self.env, mode, event_type, thread) };
        if err != jvmti::jvmtiError::NONE {
            return Err(err);
        }
        Ok(())
    }

    /// Enables each event for all threads.
    pub fn enable_events_global(&self, events: &[u32]) -> Result<(), jvmti::jvmtiError> {
        for &event in events {
            self.set_event_notification_mode(true, event, ptr::null_mut())?;
        }
        Ok(())
    }

    pub fn allocate(&self, size: jni::jlong) -> Result<*mut u8, jvmti::jvmtiError> {
        let mut mem_ptr: *mut u8 = ptr::null_mut();
        let allocate_fn = self.functions().Allocate.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        let err = unsafe { allocate_fn(self.env, size, &mut mem_ptr) };
        if err != jvmti::jvmtiError::NONE {
            return Err(err);
        }
        Ok(mem_ptr)
    }

    /// Copies `bytes` into JVMTI-managed memory, as the class file load hook
    /// requires for replacement class data.
    pub fn allocate_copy(&self, bytes: &[u8]) -> Result<*mut u8, jvmti::jvmtiError> {
        let mem = self.allocate(bytes.len() as jni::jlong)?;
        if mem.is_null() {
            return Err(jvmti::jvmtiError::OUT_OF_MEMORY);
        }
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), mem, bytes.len()) };
        Ok(mem)
    }

    pub fn deallocate(&self, mem: *mut u8) -> Result<(), jvmti::jvmtiError> {
        if mem.is_null() {
            return Ok(());
        }
        let deallocate_fn = self.functions().Deallocate.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        let err = unsafe { deallocate_fn(self.env, mem) };
        if err != jvmti::jvmtiError::NONE {
            return Err(err);
        }
        Ok(())
    }

    /// Returns the JVM type signature of a class, e.g. `Ljava/lang/String;`.
    pub fn get_class_signature(&self, klass: jni::jclass) -> Result<String, jvmti::jvmtiError> {
        let mut sig_ptr: *mut std::os::raw::c_char = ptr::null_mut();
        let get_sig_fn = self.functions().GetClassSignature.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;

        unsafe {
            let err = get_sig_fn(self.env, klass, &mut sig_ptr, ptr::null_mut());
            if err != jvmti::jvmtiError::NONE {
                return Err(err);
            }
            if sig_ptr.is_null() {
                return Err(jvmti::jvmtiError::NULL_POINTER);
            }
            let signature = CStr::from_ptr(sig_ptr).to_string_lossy().into_owned();
            self.deallocate(sig_ptr as *mut u8)?;
            Ok(signature)
        }
    }

    pub fn get_loaded_classes(&self) -> Result<Vec<jni::jclass>, jvmti::jvmtiError> {
        let mut count: jni::jint = 0;
        let mut classes_ptr: *mut jni::jclass = ptr::null_mut();
        let get_classes_fn = self.functions().GetLoadedClasses.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;

        unsafe {
            let err = get_classes_fn(self.env, &mut count, &mut classes_ptr);
            if err != jvmti::jvmtiError::NONE {
                return Err(err);
            }
            if classes_ptr.is_null() {
                return Ok(Vec::new());
            }
            let classes = std::slice::from_raw_parts(classes_ptr, count as usize).to_vec();
            self.deallocate(classes_ptr as *mut u8)?;
            Ok(classes)
        }
    }

    pub fn is_modifiable_class(&self, klass: jni::jclass) -> Result<bool, jvmti::jvmtiError> {
        let mut modifiable: jni::jboolean = jni::JNI_FALSE;
        let is_modifiable_fn = self.functions().IsModifiableClass.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        let err = unsafe { is_modifiable_fn(self.env, klass, &mut modifiable) };
        if err != jvmti::jvmtiError::NONE {
            return Err(err);
        }
        Ok(modifiable != jni::JNI_FALSE)
    }

    pub fn retransform_classes(&self, classes: &[jni::jclass]) -> Result<(), jvmti::jvmtiError> {
        if classes.is_empty() {
            return Ok(());
        }
        let retransform_fn = self.functions().RetransformClasses.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        let err = unsafe { retransform_fn(self.env, classes.len() as jni::jint, classes.as_ptr()) };
        if err != jvmti::jvmtiError::NONE {
            return Err(err);
        }
        Ok(())
    }

    /// Symbolic name of an error code, falling back to the number.
    pub fn error_name(&self, error: jvmti::jvmtiError) -> String {
        let Some(get_name_fn) = self.functions().GetErrorName else {
            return error.to_string();
        };
        let mut name_ptr: *mut std::os::raw::c_char = ptr::null_mut();
        unsafe {
            if get_name_fn(self.env, error, &mut name_ptr) != jvmti::jvmtiError::NONE || name_ptr.is_null() {
                return error.to_string();
            }
            let name = CStr::from_ptr(name_ptr).to_string_lossy().into_owned();
            let _ = self.deallocate(name_ptr as *mut u8);
            name
        }
    }
}
