//! The active rule set.
//!
//! Readers load an immutable [`RuleSet`] snapshot without locking; writers
//! build a complete new snapshot and publish it with one pointer swap. A
//! transform that started before a swap keeps matching against the snapshot
//! it loaded.

use crate::classfile::{ClassFile, ClassFileError};
use crate::matcher::{is_never_instrumented, ClassHierarchy, ClassMetadata, MethodInfoView};
use crate::rule::Rule;
use crate::trace::TraceDetails;
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("rule {index} has an invalid class matcher: {reason}")]
    InvalidClassMatcher { index: usize, reason: String },
    #[error("rule {index} has an invalid method matcher: {reason}")]
    InvalidMethodMatcher { index: usize, reason: String },
}

/// A compiled, immutable set of rules.
///
/// Rules whose class matcher is bounded by exact names are indexed by those
/// names, so a class load only evaluates the rules that could apply to it.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    by_name: HashMap<String, Vec<usize>>,
    general: Vec<usize>,
    needs_hierarchy: bool,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build(rules: Vec<Rule>) -> Result<Self, RegistryError> {
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        let mut general = Vec::new();
        let mut needs_hierarchy = false;

        for (index, rule) in rules.iter().enumerate() {
            rule.class_matcher
                .validate()
                .map_err(|reason| RegistryError::InvalidClassMatcher { index, reason })?;
            rule.method_matcher
                .validate()
                .map_err(|reason| RegistryError::InvalidMethodMatcher { index, reason })?;

            needs_hierarchy |= rule.class_matcher.needs_hierarchy();
            match rule.class_matcher.exact_names() {
                Some(names) => {
                    for name in names {
                        let slot = by_name.entry(name.to_string()).or_default();
                        if !slot.contains(&index) {
                            slot.push(index);
                        }
                    }
                }
                None => general.push(index),
            }
        }

        Ok(Self { rules, by_name, general, needs_hierarchy })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any rule walks class ancestry.
    pub fn needs_hierarchy(&self) -> bool {
        self.needs_hierarchy
    }

    /// Cheap pre-check on the class name alone.
    pub fn could_match_name(&self, class_name: &str) -> bool {
        !self.general.is_empty() || self.by_name.contains_key(class_name)
    }

    /// Rules whose class matcher accepts `class`, in registration order.
    pub fn class_rules(&self, class: &ClassMetadata, hierarchy: &dyn ClassHierarchy) -> Vec<&Rule> {
        let mut candidates: Vec<usize> = self.by_name.get(&class.name).cloned().unwrap_or_default();
        candidates.extend(self.general.iter().copied());
        candidates.sort_unstable();
        candidates.dedup();
        candidates
            .into_iter()
            .map(|i| &self.rules[i])
            .filter(|rule| rule.class_matcher.matches(class, hierarchy))
            .collect()
    }

    pub fn class_matches(&self, class: &ClassMetadata, hierarchy: &dyn ClassHierarchy) -> bool {
        !self.class_rules(class, hierarchy).is_empty()
    }

    /// Matches every declared method of `class` against the accepted rules.
    /// Returns `None` when no rule accepts the class.
    pub fn match_class(
        &self,
        class: &ClassFile,
        metadata: &ClassMetadata,
        hierarchy: &dyn ClassHierarchy,
    ) -> Result<Option<ClassMatch>, ClassFileError> {
        let accepted = self.class_rules(metadata, hierarchy);
        if accepted.is_empty() {
            return Ok(None);
        }
        let decode_annotations = accepted.iter().any(|r| r.method_matcher.needs_annotations());

        let cp = &class.constant_pool;
        let mut methods = Vec::new();
        for (method_index, method) in class.methods.iter().enumerate() {
            let name = method.name(cp)?;
            let descriptor = method.descriptor(cp)?;
            if is_never_instrumented(method.access_flags, name, descriptor) {
                continue;
            }
            let annotations = if decode_annotations { method.annotations(cp)? } else { Vec::new() };
            let view = MethodInfoView { access_flags: method.access_flags, name, descriptor, annotations: &annotations };

            let details: Vec<Arc<TraceDetails>> = accepted
                .iter()
                .filter(|rule| rule.method_matcher.matches(&view))
                .map(|rule| rule.details.clone())
                .collect();
            if !details.is_empty() {
                methods.push(MatchedMethod {
                    method_index,
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                    access_flags: method.access_flags,
                    details,
                });
            }
        }

        Ok(Some(ClassMatch { class_name: metadata.name.clone(), methods }))
    }
}

/// Methods of one class accepted by at least one rule.
#[derive(Debug, Clone)]
pub struct ClassMatch {
    pub class_name: String,
    pub methods: Vec<MatchedMethod>,
}

impl ClassMatch {
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Adds the matches of another registry, keeping one entry per method.
    pub fn extend(&mut self, other: ClassMatch) {
        for method in other.methods {
            match self.methods.iter_mut().find(|m| m.method_index == method.method_index) {
                Some(existing) => existing.details.extend(method.details),
                None => self.methods.push(method),
            }
        }
        self.methods.sort_by_key(|m| m.method_index);
    }
}

#[derive(Debug, Clone)]
pub struct MatchedMethod {
    pub method_index: usize,
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    /// Details of every rule that accepted the method, in rule order.
    pub details: Vec<Arc<TraceDetails>>,
}

impl MatchedMethod {
    /// All matched details folded into one.
    pub fn merged_details(&self) -> Option<TraceDetails> {
        let mut iter = self.details.iter();
        let first = (**iter.next()?).clone();
        Some(iter.fold(first, |acc, next| TraceDetails::merge(&acc, next)))
    }
}

/// Notified after every swap, with the snapshot that was replaced and the
/// one now active. The previous snapshot is released once all listeners return.
pub trait RetransformListener: Send + Sync {
    fn rules_changed(&self, previous: &RuleSet, current: &RuleSet);
}

/// Holds one source of rules: startup configuration or a live feed.
pub struct ClassRetransformer {
    name: &'static str,
    current: ArcSwap<RuleSet>,
    write_lock: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn RetransformListener>>>,
}

impl ClassRetransformer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            current: ArcSwap::from_pointee(RuleSet::empty()),
            write_lock: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The active rule set. Holding the returned `Arc` pins that snapshot.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    pub fn add_listener(&self, listener: Arc<dyn RetransformListener>) {
        self.listeners.write().push(listener);
    }

    /// Replaces the whole rule set. On error the previous set stays active.
    pub fn set_rules(&self, rules: Vec<Rule>) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock();
        self.install(rules)
    }

    /// Adds rules to the active set. A rule with the same matcher pair as an
    /// active one replaces it.
    pub fn append_rules(&self, rules: Vec<Rule>) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock();
        let mut combined: Vec<Rule> = self.current.load().rules().to_vec();
        for rule in rules {
            match combined.iter_mut().find(|existing| **existing == rule) {
                Some(existing) => *existing = rule,
                None => combined.push(rule),
            }
        }
        self.install(combined)
    }

    fn install(&self, rules: Vec<Rule>) -> Result<(), RegistryError> {
        let count = rules.len();
        let next = match RuleSet::build(rules) {
            Ok(set) => Arc::new(set),
            Err(e) => {
                warn!(registry = self.name, error = %e, "Rejected rule set, keeping the active one");
                return Err(e);
            }
        };
        let previous = self.current.swap(next.clone());
        info!(registry = self.name, rules = count, "Installed rule set");

        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.rules_changed(&previous, &next);
        }
        debug!(registry = self.name, previous = previous.len(), "Released previous rule set");
        Ok(())
    }
}

impl std::fmt::Debug for ClassRetransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRetransformer")
            .field("name", &self.name)
            .field("rules", &self.current.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{ClassMatcher, MethodMatcher, NoHierarchy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rule(class: &str, method: &str, metric: &str) -> Rule {
        Rule::new(
            ClassMatcher::exact(class),
            MethodMatcher::name(method),
            TraceDetails::builder().metric_name(metric).build(),
        )
    }

    fn metadata(name: &str) -> ClassMetadata {
        ClassMetadata { name: name.into(), super_name: Some("java/lang/Object".into()), ..Default::default() }
    }

    #[test]
    fn exact_rules_are_indexed_by_name() {
        let set = RuleSet::build(vec![rule("Foo", "bar", "A"), rule("Baz", "qux", "B")]).unwrap();
        assert!(set.could_match_name("Foo"));
        assert!(!set.could_match_name("Other"));
        assert_eq!(set.class_rules(&metadata("Baz"), &NoHierarchy).len(), 1);
        assert!(!set.needs_hierarchy());
    }

    #[test]
    fn general_rules_open_every_name() {
        let general = Rule::new(
            ClassMatcher::interface("java/lang/Runnable"),
            MethodMatcher::name("run"),
            TraceDetails::default_trace(),
        );
        let set = RuleSet::build(vec![general]).unwrap();
        assert!(set.could_match_name("Anything"));
        assert!(set.needs_hierarchy());
    }

    #[test]
    fn invalid_rule_keeps_previous_set() {
        let registry = ClassRetransformer::new("local");
        registry.set_rules(vec![rule("Foo", "bar", "A")]).unwrap();
        let bad = Rule::new(ClassMatcher::ExactName(String::new()), MethodMatcher::Any, TraceDetails::default_trace());
        let err = registry.set_rules(vec![bad]).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidClassMatcher { index: 0, .. }));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn append_replaces_same_matcher_pair() {
        let registry = ClassRetransformer::new("local");
        registry.set_rules(vec![rule("Foo", "bar", "First"), rule("Foo", "baz", "Other")]).unwrap();
        registry.append_rules(vec![rule("Foo", "bar", "Second")]).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.rules()[0].details.metric_name(), Some("Second"));
    }

    #[test]
    fn set_rules_supersedes_everything() {
        let registry = ClassRetransformer::new("local");
        registry.set_rules(vec![rule("Foo", "bar", "A")]).unwrap();
        registry.set_rules(vec![rule("Baz", "qux", "B")]).unwrap();
        let snapshot = registry.snapshot();
        assert!(!snapshot.could_match_name("Foo"));
        assert!(snapshot.could_match_name("Baz"));
    }

    struct Counting(AtomicUsize);

    impl RetransformListener for Counting {
        fn rules_changed(&self, previous: &RuleSet, current: &RuleSet) {
            assert_eq!(previous.len() + 1, current.len());
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn listeners_see_both_snapshots() {
        let registry = ClassRetransformer::new("remote");
        let listener = Arc::new(Counting(AtomicUsize::new(0)));
        registry.add_listener(listener.clone());
        registry.append_rules(vec![rule("A", "a", "A")]).unwrap();
        registry.append_rules(vec![rule("B", "b", "B")]).unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn merged_details_fold_in_rule_order() {
        let method = MatchedMethod {
            method_index: 0,
            name: "bar".into(),
            descriptor: "()V".into(),
            access_flags: 0,
            details: vec![
                Arc::new(TraceDetails::builder().leaf(true).build()),
                Arc::new(TraceDetails::builder().dispatcher(true).build()),
            ],
        };
        let merged = method.merged_details().unwrap();
        assert!(merged.is_leaf() && merged.dispatcher());
    }
}
