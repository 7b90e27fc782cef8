use crate::trace::TraceDetails;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Scratch state for one class-definition event.
///
/// Built by the transformer, consumed by the rewriter, then dropped. Methods
/// and fields are referred to by their index in the class's member tables.
#[derive(Debug, Default)]
pub struct InstrumentationContext {
    class_name: String,
    is_redefinition: bool,
    traced: BTreeMap<usize, Arc<TraceDetails>>,
    ignore_transaction: BTreeSet<usize>,
    bridges: HashMap<usize, usize>,
    unfinal_fields: BTreeSet<usize>,
    probe_ids: Vec<u32>,
    modified: bool,
    generated: bool,
}

impl InstrumentationContext {
    pub fn new(class_name: impl Into<String>, is_redefinition: bool) -> Self {
        Self { class_name: class_name.into(), is_redefinition, ..Default::default() }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn is_redefinition(&self) -> bool {
        self.is_redefinition
    }

    /// Marks `method` for tracing. A method already traced keeps its details.
    pub fn add_trace(&mut self, method: usize, details: Arc<TraceDetails>) -> bool {
        if self.traced.contains_key(&method) {
            return false;
        }
        self.ignore_transaction.remove(&method);
        self.traced.insert(method, details);
        self.modified = true;
        true
    }

    pub fn add_ignore_transaction_method(&mut self, method: usize) {
        if !self.traced.contains_key(&method) {
            self.ignore_transaction.insert(method);
            self.modified = true;
        }
    }

    pub fn add_bridge(&mut self, bridge: usize, target: usize) {
        self.bridges.insert(bridge, target);
    }

    pub fn bridge_target(&self, bridge: usize) -> Option<usize> {
        self.bridges.get(&bridge).copied()
    }

    pub fn strip_final(&mut self, field: usize) {
        if self.unfinal_fields.insert(field) {
            self.modified = true;
        }
    }

    pub fn traced_methods(&self) -> impl Iterator<Item = (usize, &Arc<TraceDetails>)> {
        self.traced.iter().map(|(&i, d)| (i, d))
    }

    pub fn trace_details(&self, method: usize) -> Option<&Arc<TraceDetails>> {
        self.traced.get(&method)
    }

    pub fn is_ignore_transaction(&self, method: usize) -> bool {
        self.ignore_transaction.contains(&method)
    }

    pub fn ignore_transaction_methods(&self) -> impl Iterator<Item = usize> + '_ {
        self.ignore_transaction.iter().copied()
    }

    pub fn unfinal_fields(&self) -> impl Iterator<Item = usize> + '_ {
        self.unfinal_fields.iter().copied()
    }

    pub fn record_probe(&mut self, id: u32) {
        self.probe_ids.push(id);
    }

    /// Probe ids allocated while rewriting this class.
    pub fn probe_ids(&self) -> &[u32] {
        &self.probe_ids
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn mark_generated(&mut self) {
        self.generated = true;
    }

    /// Whether the rewriter produced new bytes for the class.
    pub fn is_generated(&self) -> bool {
        self.generated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_takes_precedence_over_ignore() {
        let mut ctx = InstrumentationContext::new("Foo", false);
        assert!(!ctx.is_modified());
        ctx.add_ignore_transaction_method(1);
        assert!(ctx.is_ignore_transaction(1));
        assert!(ctx.add_trace(1, Arc::new(TraceDetails::default_trace())));
        assert!(!ctx.is_ignore_transaction(1));
        ctx.add_ignore_transaction_method(1);
        assert!(!ctx.is_ignore_transaction(1));
        assert!(ctx.is_modified());
    }

    #[test]
    fn first_trace_wins() {
        let mut ctx = InstrumentationContext::new("Foo", false);
        let first = Arc::new(TraceDetails::builder().metric_name("first").build());
        assert!(ctx.add_trace(0, first));
        assert!(!ctx.add_trace(0, Arc::new(TraceDetails::builder().metric_name("second").build())));
        assert_eq!(ctx.trace_details(0).and_then(|d| d.metric_name()), Some("first"));
    }
}
