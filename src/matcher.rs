//! Class and method matchers.
//!
//! Matchers are plain values: closed enums that can be compared, hashed and
//! shared freely, so a `(ClassMatcher, MethodMatcher)` pair can key a rule.
//! Class names are always held in internal form (`com/acme/Foo`); the
//! constructors accept dotted names too.

use crate::classfile::{ClassFile, ClassFileError, ACC_ABSTRACT, ACC_NATIVE};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Longest superclass chain followed before giving up.
const MAX_HIERARCHY_DEPTH: usize = 64;

/// Entries a [`ClassIndex`] holds before it stops recording new names.
pub const DEFAULT_MAX_INDEXED_CLASSES: usize = 1 << 18;

pub fn internal_name(name: &str) -> String {
    name.replace('.', "/")
}

/// What the matchers get to see of a class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassMetadata {
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    /// Annotation type descriptors, e.g. `Lcom/acme/Traced;`.
    pub annotations: Vec<String>,
    pub access_flags: u16,
}

impl ClassMetadata {
    pub fn from_class(class: &ClassFile) -> Result<Self, ClassFileError> {
        Ok(Self {
            name: class.name()?.to_string(),
            super_name: class.super_name()?.map(str::to_string),
            interfaces: class.interface_names()?.into_iter().map(str::to_string).collect(),
            annotations: class.annotations()?,
            access_flags: class.access_flags,
        })
    }
}

/// Answers ancestry questions about classes other than the one being matched.
pub trait ClassHierarchy: Send + Sync {
    fn super_name(&self, class: &str) -> Option<String>;
    fn interfaces(&self, class: &str) -> Vec<String>;
}

/// A hierarchy that knows nothing; only direct ancestry can match.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHierarchy;

impl ClassHierarchy for NoHierarchy {
    fn super_name(&self, _class: &str) -> Option<String> {
        None
    }

    fn interfaces(&self, _class: &str) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    super_name: Option<String>,
    interfaces: Vec<String>,
}

/// Ancestry of every class the transformer has looked at.
///
/// Keyed by name alone; two loaders defining the same name share an entry and
/// the most recent definition wins. Entries are never evicted. Once `limit`
/// names are held, new names are not recorded and their subclasses stop
/// matching hierarchy rules.
#[derive(Debug)]
pub struct ClassIndex {
    classes: RwLock<HashMap<String, IndexEntry>>,
    limit: usize,
    dropped: AtomicU64,
}

impl Default for ClassIndex {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_INDEXED_CLASSES)
    }
}

impl ClassIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self { classes: RwLock::new(HashMap::new()), limit, dropped: AtomicU64::new(0) }
    }

    /// Returns false when the index is full and `name` was not recorded.
    pub fn record(&self, name: &str, super_name: Option<&str>, interfaces: &[String]) -> bool {
        let entry = IndexEntry {
            super_name: super_name.map(str::to_string),
            interfaces: interfaces.to_vec(),
        };
        let mut classes = self.classes.write();
        if classes.len() >= self.limit && !classes.contains_key(name) {
            drop(classes);
            if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                warn!(limit = self.limit, class = name, "Class index is full, new classes are no longer recorded");
            } else {
                debug!(class = name, "Class index is full");
            }
            return false;
        }
        classes.insert(name.to_string(), entry);
        true
    }

    /// Names that were not recorded because the index was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }

    /// Classes recorded so far, for matching already loaded classes.
    pub fn names(&self) -> Vec<String> {
        self.classes.read().keys().cloned().collect()
    }

    /// Rebuilds the metadata the matchers need from what was recorded.
    /// Annotations are not recorded, so they come back empty.
    pub fn metadata(&self, name: &str) -> Option<ClassMetadata> {
        let classes = self.classes.read();
        let entry = classes.get(name)?;
        Some(ClassMetadata {
            name: name.to_string(),
            super_name: entry.super_name.clone(),
            interfaces: entry.interfaces.clone(),
            annotations: Vec::new(),
            access_flags: 0,
        })
    }
}

impl ClassHierarchy for ClassIndex {
    fn super_name(&self, class: &str) -> Option<String> {
        self.classes.read().get(class).and_then(|e| e.super_name.clone())
    }

    fn interfaces(&self, class: &str) -> Vec<String> {
        self.classes
            .read()
            .get(class)
            .map(|e| e.interfaces.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClassMatcher {
    Any,
    ExactName(String),
    /// Strict subclasses of the named class.
    BaseClass(String),
    /// Classes implementing the named interface, directly or through a
    /// superclass or superinterface.
    Interface(String),
    /// Classes carrying the named annotation type.
    Annotation(String),
    And(Vec<ClassMatcher>),
    Or(Vec<ClassMatcher>),
    Not(Box<ClassMatcher>),
}

impl ClassMatcher {
    pub fn exact(name: &str) -> Self {
        ClassMatcher::ExactName(internal_name(name))
    }

    pub fn base_class(name: &str) -> Self {
        ClassMatcher::BaseClass(internal_name(name))
    }

    pub fn interface(name: &str) -> Self {
        ClassMatcher::Interface(internal_name(name))
    }

    pub fn annotation(name: &str) -> Self {
        ClassMatcher::Annotation(internal_name(name))
    }

    pub fn matches(&self, class: &ClassMetadata, hierarchy: &dyn ClassHierarchy) -> bool {
        match self {
            ClassMatcher::Any => true,
            ClassMatcher::ExactName(name) => class.name == *name,
            ClassMatcher::BaseClass(name) => {
                let mut current = class.super_name.clone();
                for _ in 0..MAX_HIERARCHY_DEPTH {
                    let Some(ancestor) = current else { return false };
                    if ancestor == *name {
                        return true;
                    }
                    current = hierarchy.super_name(&ancestor);
                }
                false
            }
            ClassMatcher::Interface(name) => implements(class, name, hierarchy),
            ClassMatcher::Annotation(name) => has_annotation(&class.annotations, name),
            ClassMatcher::And(all) => all.iter().all(|m| m.matches(class, hierarchy)),
            ClassMatcher::Or(any) => any.iter().any(|m| m.matches(class, hierarchy)),
            ClassMatcher::Not(inner) => !inner.matches(class, hierarchy),
        }
    }

    /// The complete set of class names this matcher can accept, when it is
    /// bounded by exact names.
    pub fn exact_names(&self) -> Option<Vec<&str>> {
        match self {
            ClassMatcher::ExactName(name) => Some(vec![name.as_str()]),
            ClassMatcher::Or(any) => {
                let mut names = Vec::new();
                for m in any {
                    names.extend(m.exact_names()?);
                }
                Some(names)
            }
            ClassMatcher::And(all) => all.iter().find_map(|m| m.exact_names()),
            _ => None,
        }
    }

    /// Whether matching consults ancestors beyond the class itself.
    pub fn needs_hierarchy(&self) -> bool {
        match self {
            ClassMatcher::BaseClass(_) | ClassMatcher::Interface(_) => true,
            ClassMatcher::And(ms) | ClassMatcher::Or(ms) => ms.iter().any(ClassMatcher::needs_hierarchy),
            ClassMatcher::Not(inner) => inner.needs_hierarchy(),
            _ => false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ClassMatcher::Any => Ok(()),
            ClassMatcher::ExactName(name)
            | ClassMatcher::BaseClass(name)
            | ClassMatcher::Interface(name)
            | ClassMatcher::Annotation(name) => validate_class_name(name),
            ClassMatcher::And(ms) | ClassMatcher::Or(ms) => {
                if ms.is_empty() {
                    return Err("empty class matcher combination".to_string());
                }
                ms.iter().try_for_each(ClassMatcher::validate)
            }
            ClassMatcher::Not(inner) => inner.validate(),
        }
    }
}

fn validate_class_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.contains(['.', ';', '[']) || name.starts_with('/') || name.ends_with('/') {
        return Err(format!("invalid class name `{name}`"));
    }
    Ok(())
}

fn implements(class: &ClassMetadata, interface: &str, hierarchy: &dyn ClassHierarchy) -> bool {
    let mut pending: Vec<String> = class.interfaces.clone();
    let mut current = class.super_name.clone();
    for _ in 0..MAX_HIERARCHY_DEPTH {
        let Some(name) = current else { break };
        pending.extend(hierarchy.interfaces(&name));
        current = hierarchy.super_name(&name);
    }

    let mut seen = HashSet::new();
    while let Some(candidate) = pending.pop() {
        if candidate == interface {
            return true;
        }
        if seen.insert(candidate.clone()) {
            pending.extend(hierarchy.interfaces(&candidate));
        }
    }
    false
}

fn has_annotation(descriptors: &[String], name: &str) -> bool {
    descriptors.iter().any(|d| {
        d.strip_prefix('L')
            .and_then(|d| d.strip_suffix(';'))
            .map(|d| d == name)
            .unwrap_or(false)
    })
}

/// What the method matchers get to see of a method.
#[derive(Debug, Clone, Copy)]
pub struct MethodInfoView<'a> {
    pub access_flags: u16,
    pub name: &'a str,
    pub descriptor: &'a str,
    /// Annotation type descriptors.
    pub annotations: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodMatcher {
    Any,
    Exact { name: String, descriptor: String },
    /// Every overload with this name.
    Name(String),
    Annotation(String),
    /// All of these access flags are set.
    AccessFlags(u16),
    And(Vec<MethodMatcher>),
    Or(Vec<MethodMatcher>),
    Not(Box<MethodMatcher>),
}

impl MethodMatcher {
    pub fn exact(name: &str, descriptor: &str) -> Self {
        MethodMatcher::Exact { name: name.to_string(), descriptor: descriptor.to_string() }
    }

    pub fn name(name: &str) -> Self {
        MethodMatcher::Name(name.to_string())
    }

    pub fn annotation(name: &str) -> Self {
        MethodMatcher::Annotation(internal_name(name))
    }

    pub fn matches(&self, method: &MethodInfoView<'_>) -> bool {
        match self {
            MethodMatcher::Any => true,
            MethodMatcher::Exact { name, descriptor } => method.name == name && method.descriptor == descriptor,
            MethodMatcher::Name(name) => method.name == name,
            MethodMatcher::Annotation(name) => has_annotation(method.annotations, name),
            MethodMatcher::AccessFlags(flags) => method.access_flags & flags == *flags,
            MethodMatcher::And(all) => all.iter().all(|m| m.matches(method)),
            MethodMatcher::Or(any) => any.iter().any(|m| m.matches(method)),
            MethodMatcher::Not(inner) => !inner.matches(method),
        }
    }

    /// Whether matching looks at annotations, which cost a decode per method.
    pub fn needs_annotations(&self) -> bool {
        match self {
            MethodMatcher::Annotation(_) => true,
            MethodMatcher::And(ms) | MethodMatcher::Or(ms) => ms.iter().any(MethodMatcher::needs_annotations),
            MethodMatcher::Not(inner) => inner.needs_annotations(),
            _ => false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            MethodMatcher::Any | MethodMatcher::AccessFlags(_) => Ok(()),
            MethodMatcher::Exact { name, descriptor } => {
                if name.is_empty() {
                    return Err("empty method name".to_string());
                }
                crate::classfile::descriptor::MethodDescriptor::parse(descriptor)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            MethodMatcher::Name(name) if name.is_empty() => Err("empty method name".to_string()),
            MethodMatcher::Name(_) => Ok(()),
            MethodMatcher::Annotation(name) => validate_class_name(name),
            MethodMatcher::And(ms) | MethodMatcher::Or(ms) => {
                if ms.is_empty() {
                    return Err("empty method matcher combination".to_string());
                }
                ms.iter().try_for_each(MethodMatcher::validate)
            }
            MethodMatcher::Not(inner) => inner.validate(),
        }
    }
}

/// Methods left alone whatever the rules say.
pub fn is_never_instrumented(access_flags: u16, name: &str, descriptor: &str) -> bool {
    if access_flags & (ACC_ABSTRACT | ACC_NATIVE) != 0 {
        return true;
    }
    matches!(
        (name, descriptor),
        ("equals", "(Ljava/lang/Object;)Z")
            | ("toString", "()Ljava/lang/String;")
            | ("finalize", "()V")
            | ("hashCode", "()I")
            | ("<clinit>", _)
    )
}
