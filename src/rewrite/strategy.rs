//! Picking the injection for a traced method.
//!
//! The flyweight probe only times a call. Every operation a tracked method can
//! need is listed in [`TrackedOperation`], and the flyweight path declares
//! which of them it handles and which it does not; details that need anything
//! outside the supported set take the full path.

use crate::trace::{ParameterAttribute, TraceDetails};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrackedOperation {
    Timing,
    Leaf,
    ExcludeFromTransactionTrace,
    RollupMetrics,
    Dispatcher,
    Async,
    ParameterAttributes,
    CustomTracerFactory,
    NameTransaction,
    IgnoreTransaction,
    WebTransaction,
}

impl TrackedOperation {
    pub const ALL: [TrackedOperation; 11] = [
        TrackedOperation::Timing,
        TrackedOperation::Leaf,
        TrackedOperation::ExcludeFromTransactionTrace,
        TrackedOperation::RollupMetrics,
        TrackedOperation::Dispatcher,
        TrackedOperation::Async,
        TrackedOperation::ParameterAttributes,
        TrackedOperation::CustomTracerFactory,
        TrackedOperation::NameTransaction,
        TrackedOperation::IgnoreTransaction,
        TrackedOperation::WebTransaction,
    ];
}

pub const FLYWEIGHT_SUPPORTED: &[TrackedOperation] = &[
    TrackedOperation::Timing,
    TrackedOperation::Leaf,
    TrackedOperation::ExcludeFromTransactionTrace,
    TrackedOperation::RollupMetrics,
];

pub const FLYWEIGHT_UNSUPPORTED: &[TrackedOperation] = &[
    TrackedOperation::Dispatcher,
    TrackedOperation::Async,
    TrackedOperation::ParameterAttributes,
    TrackedOperation::CustomTracerFactory,
    TrackedOperation::NameTransaction,
    TrackedOperation::IgnoreTransaction,
    TrackedOperation::WebTransaction,
];

/// Operations a probe built from `details` has to perform.
pub fn required_operations(details: &TraceDetails) -> BTreeSet<TrackedOperation> {
    let mut ops = BTreeSet::from([TrackedOperation::Timing]);
    let flags = [
        (details.is_leaf(), TrackedOperation::Leaf),
        (details.exclude_from_transaction_trace(), TrackedOperation::ExcludeFromTransactionTrace),
        (!details.rollup_metric_names().is_empty(), TrackedOperation::RollupMetrics),
        (details.dispatcher(), TrackedOperation::Dispatcher),
        (details.is_async(), TrackedOperation::Async),
        (!details.parameter_attributes().is_empty(), TrackedOperation::ParameterAttributes),
        (details.tracer_factory_name().is_some(), TrackedOperation::CustomTracerFactory),
        (details.transaction_name().is_some(), TrackedOperation::NameTransaction),
        (details.ignore_transaction(), TrackedOperation::IgnoreTransaction),
        (details.is_web_transaction(), TrackedOperation::WebTransaction),
    ];
    ops.extend(flags.into_iter().filter(|(on, _)| *on).map(|(_, op)| op));
    ops
}

/// Whether the flyweight probe can stand in for the full one.
pub fn flyweight_eligible(details: &TraceDetails) -> bool {
    if !(details.exclude_from_transaction_trace() && details.is_leaf()) {
        return false;
    }
    required_operations(details).iter().all(|op| FLYWEIGHT_SUPPORTED.contains(op))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Entry, an exit before every return and a catch-all exit.
    Traced,
    /// Entry only; the handle is closed later through `closeAsync`.
    Async,
    /// Timing only, with no handle on the open-tracer stack.
    Flyweight,
}

impl ProbeKind {
    pub fn for_details(details: &TraceDetails) -> Self {
        if details.is_async() {
            ProbeKind::Async
        } else if flyweight_eligible(details) {
            ProbeKind::Flyweight
        } else {
            ProbeKind::Traced
        }
    }
}

/// What gets injected into one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injection {
    IgnoreTransaction,
    Probe { probe_id: u32, kind: ProbeKind, parameters: Vec<ParameterAttribute> },
}
