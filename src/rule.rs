use crate::matcher::{ClassMatcher, MethodMatcher};
use crate::trace::TraceDetails;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A class matcher and a method matcher bound to the probe they select.
///
/// Two rules are equal when their matchers are; the details do not take part,
/// so a rule can be looked up or replaced by its matcher pair.
#[derive(Debug, Clone)]
pub struct Rule {
    pub class_matcher: ClassMatcher,
    pub method_matcher: MethodMatcher,
    pub details: Arc<TraceDetails>,
}

impl Rule {
    pub fn new(class_matcher: ClassMatcher, method_matcher: MethodMatcher, details: TraceDetails) -> Self {
        Self { class_matcher, method_matcher, details: Arc::new(details) }
    }

    pub fn key(&self) -> (&ClassMatcher, &MethodMatcher) {
        (&self.class_matcher, &self.method_matcher)
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class_matcher.hash(state);
        self.method_matcher.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_ignores_details() {
        let a = Rule::new(
            ClassMatcher::exact("Foo"),
            MethodMatcher::name("bar"),
            TraceDetails::builder().metric_name("A").build(),
        );
        let b = Rule::new(
            ClassMatcher::exact("Foo"),
            MethodMatcher::name("bar"),
            TraceDetails::builder().metric_name("B").build(),
        );
        let c = Rule::new(ClassMatcher::exact("Foo"), MethodMatcher::name("baz"), TraceDetails::default_trace());
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Rule> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
