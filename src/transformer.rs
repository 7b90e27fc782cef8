//! The load hook's view of the engine.
//!
//! [`CustomClassTransformer::transform`] runs once per class-definition event,
//! on whatever thread is loading the class. Most classes leave through the
//! name checks without being parsed; only classes some rule could match are
//! parsed, matched and rewritten.

use crate::bytecode::{self, opcodes};
use crate::classfile::{ClassFile, ClassFileError, ClassHeader, ACC_BRIDGE};
use crate::context::InstrumentationContext;
use crate::matcher::{internal_name, is_never_instrumented, ClassIndex, ClassMetadata};
use crate::registry::{ClassMatch, ClassRetransformer};
use crate::rewrite::hooks::HOOK_CLASS;
use crate::rewrite::{rewrite_class, ProbeRegistry, RewriteError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Name fragments of classes generated at runtime for internal dispatch.
pub const GENERATED_CLASS_MARKERS: &[&str] = &[
    "$$Lambda",
    "$Proxy",
    "$$EnhancerByCGLIB$$",
    "$$FastClassByCGLIB$$",
    "$$_javassist",
    "$ByteBuddy$",
    "$HibernateProxy$",
];

pub const GENERATED_CLASS_PREFIXES: &[&str] =
    &["sun/reflect/Generated", "jdk/internal/reflect/Generated", "com/sun/proxy/"];

const JDK_PREFIXES: &[&str] = &["java/", "jdk/internal/", "sun/"];

pub fn is_generated_class(name: &str) -> bool {
    GENERATED_CLASS_PREFIXES.iter().any(|p| name.starts_with(p))
        || GENERATED_CLASS_MARKERS.iter().any(|m| name.contains(m))
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("malformed class: {0}")]
    ClassFile(#[from] ClassFileError),
    #[error("rewrite failed: {0}")]
    Rewrite(#[from] RewriteError),
    #[error("transform panicked: {0}")]
    Panicked(String),
}

/// Which loader is defining the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    Bootstrap,
    Application,
}

/// Operator include/exclude lists, as internal-name prefixes. An include
/// overrides an exclude and lets bootstrap classes through.
#[derive(Debug, Clone, Default)]
pub struct ClassFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl ClassFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        let prefixes = |items: Vec<String>| -> Vec<String> { items.into_iter().filter(|s| !s.is_empty()).collect() };
        Self {
            include: prefixes(include.into_iter().map(|s| internal_name(s.as_ref().trim())).collect()),
            exclude: prefixes(exclude.into_iter().map(|s| internal_name(s.as_ref().trim())).collect()),
        }
    }

    pub fn is_included(&self, class_name: &str) -> bool {
        self.include.iter().any(|p| class_name.starts_with(p.as_str()))
    }

    pub fn is_excluded(&self, class_name: &str) -> bool {
        self.exclude.iter().any(|p| class_name.starts_with(p.as_str()))
    }
}

#[derive(Debug, Default)]
pub struct TransformStats {
    inspected: AtomicU64,
    matched: AtomicU64,
    rewritten: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformStatsSnapshot {
    pub inspected: u64,
    pub matched: u64,
    pub rewritten: u64,
    pub failed: u64,
}

impl TransformStats {
    pub fn snapshot(&self) -> TransformStatsSnapshot {
        TransformStatsSnapshot {
            inspected: self.inspected.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            rewritten: self.rewritten.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct CustomClassTransformer {
    local: Arc<ClassRetransformer>,
    remote: Arc<ClassRetransformer>,
    index: Arc<ClassIndex>,
    probes: Arc<dyn ProbeRegistry>,
    filter: ClassFilter,
    /// Class name to fields that must lose `ACC_FINAL`.
    unfinal_fields: RwLock<HashMap<String, Vec<String>>>,
    shut_down: AtomicBool,
    stats: TransformStats,
}

impl CustomClassTransformer {
    pub fn new(
        local: Arc<ClassRetransformer>,
        remote: Arc<ClassRetransformer>,
        index: Arc<ClassIndex>,
        probes: Arc<dyn ProbeRegistry>,
        filter: ClassFilter,
    ) -> Self {
        Self {
            local,
            remote,
            index,
            probes,
            filter,
            unfinal_fields: RwLock::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
            stats: TransformStats::default(),
        }
    }

    pub fn local_registry(&self) -> &Arc<ClassRetransformer> {
        &self.local
    }

    pub fn remote_registry(&self) -> &Arc<ClassRetransformer> {
        &self.remote
    }

    pub fn class_index(&self) -> &Arc<ClassIndex> {
        &self.index
    }

    pub fn stats(&self) -> TransformStatsSnapshot {
        self.stats.snapshot()
    }

    /// Strips `ACC_FINAL` from the named fields whenever `class_name` is
    /// defined, so injected code may assign them after construction.
    pub fn unlock_final_fields(&self, class_name: &str, fields: &[&str]) {
        let mut unfinal = self.unfinal_fields.write();
        let entry = unfinal.entry(internal_name(class_name)).or_default();
        for field in fields {
            if !entry.iter().any(|f| f == field) {
                entry.push(field.to_string());
            }
        }
    }

    /// Stops all further transformation.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            info!(stats = ?self.stats(), "Class transformer shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Whether a class with this name is looked at at all.
    pub fn should_inspect(&self, loader: LoaderKind, class_name: &str) -> bool {
        if class_name == HOOK_CLASS
            || class_name.starts_with('[')
            || class_name == "module-info"
            || class_name.ends_with("/module-info")
            || class_name.ends_with("/package-info")
        {
            return false;
        }
        if JDK_PREFIXES.iter().any(|p| class_name.starts_with(p)) || is_generated_class(class_name) {
            return false;
        }
        if self.filter.is_included(class_name) {
            return true;
        }
        !self.filter.is_excluded(class_name) && loader != LoaderKind::Bootstrap
    }

    /// Entry point for the load hook: never fails, never panics. Any problem
    /// leaves the class as it was.
    pub fn transform_or_skip(
        &self,
        loader: LoaderKind,
        class_name: Option<&str>,
        redefining: bool,
        bytes: &[u8],
    ) -> Option<Vec<u8>> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.transform(loader, class_name, redefining, bytes)))
            .unwrap_or_else(|payload| Err(TransformError::Panicked(panic_message(payload.as_ref()))));
        match result {
            Ok(out) => out,
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(class = class_name.unwrap_or("<unnamed>"), error = %e, "Leaving class unmodified");
                None
            }
        }
    }

    /// Returns the rewritten bytes, or `None` when the class is left alone.
    pub fn transform(
        &self,
        loader: LoaderKind,
        class_name: Option<&str>,
        redefining: bool,
        bytes: &[u8],
    ) -> Result<Option<Vec<u8>>, TransformError> {
        if self.is_shut_down() {
            return Ok(None);
        }

        let local = self.local.snapshot();
        let remote = self.remote.snapshot();
        let unlocks = {
            let unfinal = self.unfinal_fields.read();
            if unfinal.is_empty() && local.is_empty() && remote.is_empty() {
                return Ok(None);
            }
            class_name.and_then(|name| unfinal.get(name).cloned())
        };

        let mut header = None;
        if local.needs_hierarchy() || remote.needs_hierarchy() {
            let scanned = ClassHeader::scan(bytes)?;
            self.index.record(&scanned.name, scanned.super_name.as_deref(), &scanned.interfaces);
            header = Some(scanned);
        }
        let name = match (class_name, &header) {
            (Some(name), _) => name.to_string(),
            (None, Some(header)) => header.name.clone(),
            (None, None) => ClassHeader::scan(bytes)?.name,
        };

        if !self.should_inspect(loader, &name) {
            return Ok(None);
        }
        if !local.could_match_name(&name) && !remote.could_match_name(&name) && unlocks.is_none() {
            return Ok(None);
        }
        self.stats.inspected.fetch_add(1, Ordering::Relaxed);

        let mut class = ClassFile::parse(bytes)?;
        let metadata = ClassMetadata::from_class(&class)?;
        let hierarchy: &ClassIndex = &self.index;
        let matched = match (
            local.match_class(&class, &metadata, hierarchy)?,
            remote.match_class(&class, &metadata, hierarchy)?,
        ) {
            (Some(mut from_local), Some(from_remote)) => {
                from_local.extend(from_remote);
                Some(from_local)
            }
            (from_local, None) => from_local,
            (None, from_remote) => from_remote,
        };

        let mut ctx = InstrumentationContext::new(metadata.name.clone(), redefining);
        if let Some(matched) = matched {
            if !matched.is_empty() {
                self.stats.matched.fetch_add(1, Ordering::Relaxed);
            }
            populate_context(&class, matched, &mut ctx)?;
        }
        for field in unlocks.unwrap_or_default() {
            let found = class
                .fields
                .iter()
                .position(|f| f.name(&class.constant_pool).map(|n| n == field).unwrap_or(false));
            match found {
                Some(index) => ctx.strip_final(index),
                None => debug!(class = %name, %field, "Field to unlock not declared"),
            }
        }

        if !ctx.is_modified() {
            trace!(class = %name, "No method matched");
            return Ok(None);
        }

        let rewritten = rewrite_class(&mut class, &mut ctx, self.probes.as_ref())?;
        self.stats.rewritten.fetch_add(1, Ordering::Relaxed);
        info!(
            class = %name,
            redefining,
            probes = ctx.probe_ids().len(),
            size = rewritten.len(),
            "Instrumented class"
        );
        Ok(Some(rewritten))
    }
}

impl std::fmt::Debug for CustomClassTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomClassTransformer")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("filter", &self.filter)
            .field("shut_down", &self.is_shut_down())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Fills `ctx` from the matched methods: details merged per method, bridges
/// routed to their typed target, ignore-transaction split from tracing.
fn populate_context(class: &ClassFile, matched: ClassMatch, ctx: &mut InstrumentationContext) -> Result<(), TransformError> {
    let mut methods = matched.methods;
    // Direct matches first so a bridge never overrides its target's own details.
    methods.sort_by_key(|m| (m.access_flags & ACC_BRIDGE != 0, m.method_index));

    for method in methods {
        let Some(details) = method.merged_details() else { continue };
        let target = if method.access_flags & ACC_BRIDGE != 0 {
            match bridge_target(class, method.method_index)? {
                Some(target) => {
                    ctx.add_bridge(method.method_index, target);
                    target
                }
                None => {
                    debug!(class = ctx.class_name(), method = %method.name, "Bridge target not found, skipping");
                    continue;
                }
            }
        } else {
            method.method_index
        };

        if details.ignore_transaction() {
            ctx.add_ignore_transaction_method(target);
        } else {
            ctx.add_trace(target, Arc::new(details));
        }
    }
    Ok(())
}

/// The same-named method of this class a bridge forwards to.
fn bridge_target(class: &ClassFile, bridge: usize) -> Result<Option<usize>, ClassFileError> {
    let cp = &class.constant_pool;
    let method = &class.methods[bridge];
    let this_class = class.name()?;
    let name = method.name(cp)?;
    let descriptor = method.descriptor(cp)?;
    let Some((_, code)) = method.find_attribute(cp, "Code") else { return Ok(None) };
    let code = crate::classfile::attributes::CodeAttribute::parse(&code.info)?;

    for located in bytecode::decode(&code.code)? {
        let opcode = located.insn.opcode();
        if !matches!(opcode, opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKEINTERFACE) {
            continue;
        }
        let Some(index) = located.insn.cp_index() else { continue };
        let called = cp.member_ref(index)?;
        if called.owner != this_class || called.name != name || called.descriptor == descriptor {
            continue;
        }
        let Some(target) = class.find_method(called.name, called.descriptor) else { continue };
        let target_method = &class.methods[target];
        if target_method.has_flag(ACC_BRIDGE)
            || is_never_instrumented(target_method.access_flags, called.name, called.descriptor)
        {
            continue;
        }
        return Ok(Some(target));
    }
    Ok(None)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transformer(filter: ClassFilter) -> CustomClassTransformer {
        struct Ids;
        impl ProbeRegistry for Ids {
            fn register(&self, _: &str, _: &str, _: &str, _: Arc<crate::trace::TraceDetails>) -> u32 {
                1
            }
        }
        CustomClassTransformer::new(
            Arc::new(ClassRetransformer::new("local")),
            Arc::new(ClassRetransformer::new("remote")),
            Arc::new(ClassIndex::new()),
            Arc::new(Ids),
            filter,
        )
    }

    #[test]
    fn generated_classes_are_recognized() {
        assert!(is_generated_class("com/acme/Foo$$Lambda$14/0x0000000800c02a00"));
        assert!(is_generated_class("com/sun/proxy/$Proxy12"));
        assert!(is_generated_class("com/acme/Repo$$EnhancerByCGLIB$$1a2b"));
        assert!(is_generated_class("jdk/internal/reflect/GeneratedMethodAccessor3"));
        assert!(!is_generated_class("com/acme/Foo$Inner"));
    }

    #[test]
    fn name_checks() {
        let t = transformer(ClassFilter::new(["com.acme.keep"], ["com.acme"]));
        assert!(!t.should_inspect(LoaderKind::Application, HOOK_CLASS));
        assert!(!t.should_inspect(LoaderKind::Application, "java/lang/String"));
        assert!(!t.should_inspect(LoaderKind::Application, "[Ljava/lang/String;"));
        assert!(!t.should_inspect(LoaderKind::Application, "module-info"));
        assert!(!t.should_inspect(LoaderKind::Application, "com/acme/Foo"));
        assert!(t.should_inspect(LoaderKind::Application, "com/acme/keep/Foo"));
        assert!(t.should_inspect(LoaderKind::Bootstrap, "com/acme/keep/Foo"));
        assert!(!t.should_inspect(LoaderKind::Bootstrap, "org/other/Foo"));
        assert!(t.should_inspect(LoaderKind::Application, "org/other/Foo"));
    }

    #[test]
    fn nothing_registered_is_a_no_op() {
        let t = transformer(ClassFilter::default());
        // Not even a class file; never looked at.
        assert!(t.transform(LoaderKind::Application, Some("a/B"), false, b"junk").unwrap().is_none());
        assert_eq!(t.stats().inspected, 0);
    }

    #[test]
    fn shut_down_transformer_ignores_everything() {
        let t = transformer(ClassFilter::default());
        t.shutdown();
        assert!(t.is_shut_down());
        assert!(t.transform_or_skip(LoaderKind::Application, Some("a/B"), false, b"junk").is_none());
        assert_eq!(t.stats().failed, 0);
    }

    #[test]
    fn panics_become_failures() {
        let message = panic::catch_unwind(|| panic!("boom")).map_err(|p| panic_message(p.as_ref()));
        assert_eq!(message, Err("boom".to_string()));
    }
}
