//! Common imports for building a probe agent.
//!
//! This prelude is intentionally small. It covers the types most agents use
//! while avoiding over-broad re-exports.

pub use crate::agent::ProbeAgent;
pub use crate::config::AgentConfig;
pub use crate::env::{GlobalRef, JniEnv, Jvmti, LocalRef};
pub use crate::export_agent;
pub use crate::get_default_callbacks;
pub use crate::harvest::{HarvestListener, HarvestReport};
pub use crate::matcher::{ClassMatcher, MethodMatcher};
pub use crate::rule::Rule;
pub use crate::runtime::{Tracer, TracerFactory};
pub use crate::sys::{jni, jvmti};
pub use crate::trace::{TraceDetails, TraceDetailsBuilder};
pub use crate::Agent;
