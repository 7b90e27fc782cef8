//! What a probe does for a matched method.
//!
//! [`TraceDetails`] is built once through [`TraceDetailsBuilder`] and shared
//! behind an `Arc` by every rule and probe that refers to it.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_METRIC_PREFIX: &str = "Java";
pub const CLASS_NAME_TEMPLATE: &str = "${className}";

/// Where a set of details came from, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentationType {
    CustomYaml,
    RemoteCustomXml,
    TraceAnnotation,
    BuiltIn,
    Unknown,
}

/// Ordering of competing transaction names; a higher priority replaces a lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransactionNamePriority {
    None,
    CustomLow,
    RequestUri,
    FrameworkLow,
    Framework,
    FrameworkHigh,
    CustomHigh,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionName {
    pub priority: TransactionNamePriority,
    /// Replace a name of equal priority.
    pub override_existing: bool,
    pub category: Option<String>,
    pub path: Option<String>,
}

impl TransactionName {
    pub fn custom_default() -> Self {
        Self { priority: TransactionNamePriority::CustomLow, override_existing: false, category: None, path: None }
    }

    pub fn built_in_default() -> Self {
        Self { priority: TransactionNamePriority::FrameworkLow, override_existing: false, category: None, path: None }
    }
}

/// Records formal parameter `index` (zero based, `this` excluded) as an
/// attribute named `attribute_name` on the active unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterAttribute {
    pub index: usize,
    pub attribute_name: String,
}

impl ParameterAttribute {
    pub fn new(index: usize, attribute_name: impl Into<String>) -> Self {
        Self { index, attribute_name: attribute_name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TraceDetails {
    metric_name: Option<String>,
    metric_prefix: Option<String>,
    tracer_factory_name: Option<String>,
    dispatcher: bool,
    async_: bool,
    leaf: bool,
    exclude_from_transaction_trace: bool,
    ignore_transaction: bool,
    custom: bool,
    web_transaction: bool,
    transaction_name: Option<TransactionName>,
    instrumentation_types: Vec<InstrumentationType>,
    instrumentation_source_names: Vec<String>,
    rollup_metric_names: Vec<String>,
    parameter_attributes: Vec<ParameterAttribute>,
}

impl TraceDetails {
    pub fn builder() -> TraceDetailsBuilder {
        TraceDetailsBuilder::default()
    }

    /// Details for a plain timed method with the default prefix.
    pub fn default_trace() -> Self {
        Self::builder().metric_prefix(DEFAULT_METRIC_PREFIX).build()
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.metric_name.as_deref()
    }

    pub fn metric_prefix(&self) -> Option<&str> {
        self.metric_prefix.as_deref()
    }

    pub fn tracer_factory_name(&self) -> Option<&str> {
        self.tracer_factory_name.as_deref()
    }

    pub fn dispatcher(&self) -> bool {
        self.dispatcher
    }

    pub fn is_async(&self) -> bool {
        self.async_
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn exclude_from_transaction_trace(&self) -> bool {
        self.exclude_from_transaction_trace
    }

    pub fn ignore_transaction(&self) -> bool {
        self.ignore_transaction
    }

    pub fn is_custom(&self) -> bool {
        self.custom
    }

    pub fn is_web_transaction(&self) -> bool {
        self.web_transaction
    }

    pub fn transaction_name(&self) -> Option<&TransactionName> {
        self.transaction_name.as_ref()
    }

    pub fn instrumentation_types(&self) -> &[InstrumentationType] {
        &self.instrumentation_types
    }

    pub fn instrumentation_source_names(&self) -> &[String] {
        &self.instrumentation_source_names
    }

    pub fn rollup_metric_names(&self) -> &[String] {
        &self.rollup_metric_names
    }

    pub fn parameter_attributes(&self) -> &[ParameterAttribute] {
        &self.parameter_attributes
    }

    /// The metric name template: the explicit name if there is one, otherwise
    /// `prefix/${className}/method`.
    pub fn full_metric_name(&self, method_name: &str) -> Option<String> {
        if let Some(name) = &self.metric_name {
            return Some(name.clone());
        }
        let prefix = self.metric_prefix.as_deref()?;
        Some(format!("{prefix}/{CLASS_NAME_TEMPLATE}/{method_name}"))
    }

    /// The metric a probe on `class_name.method_name` reports under. Class
    /// names are given in internal form and reported dotted.
    pub fn resolve_metric_name(&self, class_name: &str, method_name: &str) -> String {
        let template = self
            .full_metric_name(method_name)
            .unwrap_or_else(|| format!("{DEFAULT_METRIC_PREFIX}/{CLASS_NAME_TEMPLATE}/{method_name}"));
        template.replace(CLASS_NAME_TEMPLATE, &class_name.replace('/', "."))
    }

    /// Combines two sets of details found for the same method. Custom
    /// details take precedence; flags are or-ed and labels unioned.
    pub fn merge(existing: &TraceDetails, other: &TraceDetails) -> TraceDetails {
        if other.custom {
            TraceDetailsBuilder::from_details(other).merge(existing).build()
        } else {
            TraceDetailsBuilder::from_details(existing).merge(other).build()
        }
    }
}

impl fmt::Display for TraceDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TraceDetails[metric={:?}, dispatcher={}, custom={}, types={:?}, sources={:?}]",
            self.metric_name, self.dispatcher, self.custom, self.instrumentation_types, self.instrumentation_source_names
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraceDetailsBuilder {
    metric_name: Option<String>,
    metric_prefix: Option<String>,
    tracer_factory_name: Option<String>,
    dispatcher: bool,
    async_: bool,
    leaf: bool,
    exclude_from_transaction_trace: bool,
    ignore_transaction: bool,
    name_transaction: bool,
    custom: bool,
    web_transaction: bool,
    transaction_name: Option<TransactionName>,
    instrumentation_types: Vec<InstrumentationType>,
    instrumentation_source_names: Vec<String>,
    rollup_metric_names: Vec<String>,
    parameter_attributes: Vec<ParameterAttribute>,
}

impl TraceDetailsBuilder {
    pub fn from_details(details: &TraceDetails) -> Self {
        Self {
            metric_name: details.metric_name.clone(),
            metric_prefix: details.metric_prefix.clone(),
            tracer_factory_name: details.tracer_factory_name.clone(),
            dispatcher: details.dispatcher,
            async_: details.async_,
            leaf: details.leaf,
            exclude_from_transaction_trace: details.exclude_from_transaction_trace,
            ignore_transaction: details.ignore_transaction,
            name_transaction: false,
            custom: details.custom,
            web_transaction: details.web_transaction,
            transaction_name: details.transaction_name.clone(),
            instrumentation_types: details.instrumentation_types.clone(),
            instrumentation_source_names: details.instrumentation_source_names.clone(),
            rollup_metric_names: details.rollup_metric_names.clone(),
            parameter_attributes: details.parameter_attributes.clone(),
        }
    }

    pub fn metric_name(mut self, name: impl Into<String>) -> Self {
        self.metric_name = Some(name.into());
        self
    }

    pub fn metric_prefix(mut self, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if prefix.ends_with('/') {
            prefix.pop();
        }
        self.metric_prefix = Some(prefix);
        self
    }

    pub fn tracer_factory_name(mut self, name: impl Into<String>) -> Self {
        self.tracer_factory_name = Some(name.into());
        self
    }

    pub fn dispatcher(mut self, dispatcher: bool) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn is_async(mut self, async_: bool) -> Self {
        self.async_ = async_;
        self
    }

    pub fn leaf(mut self, leaf: bool) -> Self {
        self.leaf = leaf;
        self
    }

    pub fn exclude_from_transaction_trace(mut self, exclude: bool) -> Self {
        self.exclude_from_transaction_trace = exclude;
        self
    }

    pub fn ignore_transaction(mut self, ignore: bool) -> Self {
        self.ignore_transaction = ignore;
        self
    }

    /// Name the transaction after this probe, at the default priority for
    /// custom or built-in details.
    pub fn name_transaction(mut self, name: bool) -> Self {
        self.name_transaction = name;
        self
    }

    pub fn transaction_name(
        mut self,
        priority: TransactionNamePriority,
        override_existing: bool,
        category: Option<&str>,
        path: Option<&str>,
    ) -> Self {
        self.transaction_name = Some(TransactionName {
            priority,
            override_existing,
            category: category.map(str::to_string),
            path: path.map(str::to_string),
        });
        self
    }

    pub fn custom(mut self, custom: bool) -> Self {
        self.custom = custom;
        self
    }

    pub fn web_transaction(mut self, web: bool) -> Self {
        self.web_transaction = web;
        self
    }

    pub fn instrumentation_type(mut self, kind: InstrumentationType) -> Self {
        self.instrumentation_types = vec![kind];
        self
    }

    pub fn instrumentation_source_name(mut self, name: impl Into<String>) -> Self {
        self.instrumentation_source_names = vec![name.into()];
        self
    }

    pub fn rollup_metric_name(mut self, name: impl Into<String>) -> Self {
        self.rollup_metric_names.push(name.into());
        self
    }

    pub fn parameter_attributes(mut self, attributes: Vec<ParameterAttribute>) -> Self {
        self.parameter_attributes = attributes;
        self
    }

    pub fn parameter_attribute(mut self, index: usize, attribute_name: impl Into<String>) -> Self {
        self.parameter_attributes.push(ParameterAttribute::new(index, attribute_name));
        self
    }

    /// Fills what this builder leaves unset from `other`.
    pub fn merge(mut self, other: &TraceDetails) -> Self {
        if self.metric_prefix.is_none() {
            self.metric_prefix = other.metric_prefix.clone();
        }
        if self.metric_name.is_none() {
            self.metric_name = other.metric_name.clone();
        }
        if self.tracer_factory_name.is_none() {
            self.tracer_factory_name = other.tracer_factory_name.clone();
        }
        self.dispatcher |= other.dispatcher;
        self.async_ |= other.async_;
        self.exclude_from_transaction_trace |= other.exclude_from_transaction_trace;
        if !self.ignore_transaction && !self.custom {
            self.ignore_transaction = other.ignore_transaction;
        }
        if self.transaction_name.is_none() {
            self.transaction_name = other.transaction_name.clone();
        }
        // Custom details keep their own leaf setting.
        if !self.custom {
            self.custom = other.custom;
            self.leaf |= other.leaf;
        }
        self.web_transaction |= other.web_transaction;
        self.rollup_metric_names.extend(other.rollup_metric_names.iter().cloned());
        self.instrumentation_types.extend(other.instrumentation_types.iter().copied());
        self.instrumentation_source_names.extend(other.instrumentation_source_names.iter().cloned());
        self.parameter_attributes.extend(other.parameter_attributes.iter().cloned());
        self
    }

    pub fn build(self) -> TraceDetails {
        let transaction_name = if self.name_transaction {
            Some(if self.custom { TransactionName::custom_default() } else { TransactionName::built_in_default() })
        } else {
            self.transaction_name
        };
        let mut instrumentation_types = self.instrumentation_types;
        let mut instrumentation_source_names = self.instrumentation_source_names;
        if instrumentation_types.is_empty() {
            instrumentation_types.push(InstrumentationType::Unknown);
        }
        if instrumentation_source_names.is_empty() {
            instrumentation_source_names.push("Unknown".to_string());
        }
        TraceDetails {
            metric_name: self.metric_name,
            metric_prefix: self.metric_prefix,
            tracer_factory_name: self.tracer_factory_name,
            dispatcher: self.dispatcher,
            async_: self.async_,
            leaf: self.leaf,
            exclude_from_transaction_trace: self.exclude_from_transaction_trace,
            ignore_transaction: self.ignore_transaction,
            custom: self.custom,
            web_transaction: self.web_transaction,
            transaction_name,
            instrumentation_types,
            instrumentation_source_names,
            rollup_metric_names: self.rollup_metric_names,
            parameter_attributes: self.parameter_attributes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_loses_trailing_slash() {
        let details = TraceDetails::builder().metric_prefix("Custom/").build();
        assert_eq!(details.metric_prefix(), Some("Custom"));
        assert_eq!(details.full_metric_name("run").as_deref(), Some("Custom/${className}/run"));
        assert_eq!(details.resolve_metric_name("com/acme/Foo", "run"), "Custom/com.acme.Foo/run");
    }

    #[test]
    fn explicit_metric_name_wins() {
        let details = TraceDetails::builder().metric_prefix("Custom").metric_name("Custom/bar").build();
        assert_eq!(details.resolve_metric_name("Foo", "bar"), "Custom/bar");
    }

    #[test]
    fn no_prefix_falls_back_to_default() {
        let details = TraceDetails::builder().build();
        assert_eq!(details.full_metric_name("run"), None);
        assert_eq!(details.resolve_metric_name("a/B", "run"), "Java/a.B/run");
        assert_eq!(details.instrumentation_types(), &[InstrumentationType::Unknown]);
    }

    #[test]
    fn name_transaction_picks_default_priority() {
        let custom = TraceDetails::builder().custom(true).name_transaction(true).build();
        assert_eq!(custom.transaction_name().map(|t| t.priority), Some(TransactionNamePriority::CustomLow));
        let built_in = TraceDetails::builder().name_transaction(true).build();
        assert_eq!(built_in.transaction_name().map(|t| t.priority), Some(TransactionNamePriority::FrameworkLow));
    }

    #[test]
    fn merge_prefers_custom_details() {
        let built_in = TraceDetails::builder()
            .metric_name("BuiltIn/name")
            .leaf(true)
            .instrumentation_type(InstrumentationType::BuiltIn)
            .rollup_metric_name("Rollup/all")
            .build();
        let custom = TraceDetails::builder()
            .custom(true)
            .dispatcher(true)
            .metric_prefix("Custom")
            .instrumentation_type(InstrumentationType::CustomYaml)
            .parameter_attribute(0, "id")
            .build();

        let merged = TraceDetails::merge(&built_in, &custom);
        assert!(merged.is_custom());
        assert!(merged.dispatcher());
        // The custom side's leaf flag is kept as is.
        assert!(!merged.is_leaf());
        assert_eq!(merged.metric_name(), Some("BuiltIn/name"));
        assert_eq!(merged.metric_prefix(), Some("Custom"));
        assert_eq!(
            merged.instrumentation_types(),
            &[InstrumentationType::CustomYaml, InstrumentationType::BuiltIn]
        );
        assert_eq!(merged.rollup_metric_names(), &["Rollup/all".to_string()]);
        assert_eq!(merged.parameter_attributes().len(), 1);
    }

    #[test]
    fn merge_of_built_ins_ors_flags() {
        let a = TraceDetails::builder().leaf(true).build();
        let b = TraceDetails::builder().web_transaction(true).ignore_transaction(true).build();
        let merged = TraceDetails::merge(&a, &b);
        assert!(merged.is_leaf());
        assert!(merged.is_web_transaction());
        assert!(merged.ignore_transaction());
    }
}
