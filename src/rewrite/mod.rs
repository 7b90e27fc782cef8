//! Class rewriting driven by an [`InstrumentationContext`].
//!
//! Traced methods get probes, ignore-transaction methods get a single call at
//! entry, listed fields lose `ACC_FINAL`. Every other byte of the class is
//! written back as it was read.

pub mod hooks;
mod method;
pub mod strategy;

pub use strategy::{flyweight_eligible, required_operations, Injection, ProbeKind, TrackedOperation};

use crate::classfile::{ClassFile, ClassFileError, ACC_FINAL};
use crate::context::InstrumentationContext;
use crate::trace::TraceDetails;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewriteError {
    #[error(transparent)]
    ClassFile(#[from] ClassFileError),
    #[error("method {0} has no Code attribute")]
    MissingCode(String),
    #[error("method {0} has no free local slot for the probe handle")]
    TooManyLocals(String),
    #[error("no method at index {0}")]
    NoSuchMethod(usize),
    #[error("no field at index {0}")]
    NoSuchField(usize),
}

/// Hands out the ids injected code passes to `enter`.
pub trait ProbeRegistry: Send + Sync {
    fn register(&self, class_name: &str, method_name: &str, descriptor: &str, details: Arc<TraceDetails>) -> u32;
}

/// Applies `ctx` to `class` and returns the new class bytes.
pub fn rewrite_class(
    class: &mut ClassFile,
    ctx: &mut InstrumentationContext,
    probes: &dyn ProbeRegistry,
) -> Result<Vec<u8>, RewriteError> {
    for field in ctx.unfinal_fields().collect::<Vec<_>>() {
        let field = class.fields.get_mut(field).ok_or(RewriteError::NoSuchField(field))?;
        field.access_flags &= !ACC_FINAL;
    }

    for method_index in ctx.ignore_transaction_methods().collect::<Vec<_>>() {
        method::rewrite_method(class, method_index, &Injection::IgnoreTransaction)?;
    }

    let traced: Vec<(usize, Arc<TraceDetails>)> = ctx.traced_methods().map(|(i, d)| (i, d.clone())).collect();
    for (method_index, details) in traced {
        let method = class.methods.get(method_index).ok_or(RewriteError::NoSuchMethod(method_index))?;
        let name = method.name(&class.constant_pool)?.to_string();
        let descriptor = method.descriptor(&class.constant_pool)?.to_string();

        let kind = ProbeKind::for_details(&details);
        let parameters = details.parameter_attributes().to_vec();
        let probe_id = probes.register(ctx.class_name(), &name, &descriptor, details);
        ctx.record_probe(probe_id);
        debug!(class = ctx.class_name(), method = %name, %descriptor, probe_id, ?kind, "Injecting probe");

        method::rewrite_method(class, method_index, &Injection::Probe { probe_id, kind, parameters })?;
    }

    let bytes = class.to_bytes()?;
    ctx.mark_generated();
    Ok(bytes)
}
