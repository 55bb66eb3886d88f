//! Reference resolution
//!
//! Turns the `ref`/`source`/`doc`/`metric` calls found in each node into
//! dependency edges. A failed lookup is attributed to the calling node and
//! accumulated; it never aborts the pass.

use crate::scan::{scan_expression, scan_template, ScanResult};
use crate::symbols::{LookupError, SymbolTable};
use std::fmt;
use strata_core::{DependsOn, Diagnostic, DiagnosticCode, DocCall, Node, RefCall, ResourceType, SourceCall};
use tracing::{debug, warn};

/// What a failed reference pointed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceTarget {
    Ref(RefCall),
    Source(SourceCall),
    Doc(DocCall),
    Metric(RefCall),
}

impl fmt::Display for ReferenceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ref(call) => write!(f, "{}", call),
            Self::Source(call) => write!(f, "{}", call),
            Self::Doc(call) => match &call.package {
                Some(package) => write!(f, "doc('{}', '{}')", package, call.name),
                None => write!(f, "doc('{}')", call.name),
            },
            Self::Metric(call) => match &call.package {
                Some(package) => write!(f, "metric('{}', '{}')", package, call.name),
                None => write!(f, "metric('{}')", call.name),
            },
        }
    }
}

/// A node-scoped resolution failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("{node_id} depends on {target} which was not found")]
    NotFound { node_id: String, target: ReferenceTarget },

    #[error("{node_id} has an ambiguous reference {target}, candidates: {}", .candidates.join(", "))]
    Ambiguous {
        node_id: String,
        target: ReferenceTarget,
        candidates: Vec<String>,
    },

    #[error("{node_id} depends on {target} which is disabled ({disabled_id})")]
    Disabled {
        node_id: String,
        target: ReferenceTarget,
        disabled_id: String,
    },

    #[error("{node_id} has invalid inline config: {message}")]
    InvalidConfig { node_id: String, message: String },
}

impl ResolutionError {
    fn from_lookup(node_id: &str, target: ReferenceTarget, err: LookupError) -> Self {
        let node_id = node_id.to_string();
        match err {
            LookupError::NotFound => Self::NotFound { node_id, target },
            LookupError::Ambiguous { candidates } => Self::Ambiguous {
                node_id,
                target,
                candidates,
            },
            LookupError::Disabled { unique_id } => Self::Disabled {
                node_id,
                target,
                disabled_id: unique_id,
            },
        }
    }

    /// Node the error is attributed to
    pub fn node_id(&self) -> &str {
        match self {
            Self::NotFound { node_id, .. }
            | Self::Ambiguous { node_id, .. }
            | Self::Disabled { node_id, .. }
            | Self::InvalidConfig { node_id, .. } => node_id,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let code = match self {
            Self::NotFound { target, .. } => match target {
                ReferenceTarget::Source(_) => DiagnosticCode::SourceNotFound,
                ReferenceTarget::Doc(_) => DiagnosticCode::DocNotFound,
                ReferenceTarget::Ref(_) | ReferenceTarget::Metric(_) => DiagnosticCode::RefNotFound,
            },
            Self::Ambiguous { .. } => DiagnosticCode::RefAmbiguous,
            Self::Disabled { .. } => DiagnosticCode::RefDisabled,
            Self::InvalidConfig { .. } => DiagnosticCode::InvalidInlineConfig,
        };

        Diagnostic::error(code, self.to_string()).for_node(self.node_id())
    }
}

/// Everything resolved for one node, applied after the read-only pass
#[derive(Default)]
struct Annotation {
    refs: Vec<RefCall>,
    sources: Vec<SourceCall>,
    docs: Vec<DocCall>,
    depends_on: DependsOn,
}

/// Resolves references for every node of a symbol table
#[derive(Debug, Clone, Copy, Default)]
pub struct Resolver;

impl Resolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve every node in declaration order
    ///
    /// Inline `config()` calls are applied first, so a node turned off inline
    /// is already disabled when others look it up. Returned errors are in
    /// declaration order of the nodes they are attributed to.
    pub fn resolve(&self, symbols: &mut SymbolTable) -> Vec<ResolutionError> {
        let mut errors = self.apply_inline_config(symbols);

        let annotations: Vec<Annotation> = symbols
            .nodes()
            .iter()
            .map(|node| self.annotate(symbols, node, &mut errors))
            .collect();

        for (node, annotation) in symbols.nodes_mut().iter_mut().zip(annotations) {
            node.refs = annotation.refs;
            node.sources = annotation.sources;
            node.doc_refs = annotation.docs;
            node.depends_on = annotation.depends_on;
        }

        errors.sort_by_key(|e| symbols.get(e.node_id()).map(|n| n.index).unwrap_or(usize::MAX));

        for error in &errors {
            warn!(node = error.node_id(), "{}", error);
        }

        errors
    }

    fn apply_inline_config(&self, symbols: &mut SymbolTable) -> Vec<ResolutionError> {
        let mut errors = Vec::new();
        let mut turned_off = Vec::new();

        for node in symbols.nodes_mut() {
            let Some(raw_code) = node.raw_code.as_deref() else {
                continue;
            };

            for (key, value) in scan_template(raw_code).config {
                if let Err(e) = node.config.apply_inline(&key, value) {
                    errors.push(ResolutionError::InvalidConfig {
                        node_id: node.unique_id.clone(),
                        message: e.to_string(),
                    });
                }
            }

            if !node.config.enabled {
                turned_off.push(node.unique_id.clone());
            }
        }

        for unique_id in turned_off {
            debug!(node = %unique_id, "disabled by inline config");
            symbols.disable(&unique_id);
        }

        errors
    }

    fn annotate(&self, symbols: &SymbolTable, node: &Node, errors: &mut Vec<ResolutionError>) -> Annotation {
        let mut annotation = Annotation::default();

        match node.resource_type {
            ResourceType::Doc | ResourceType::Group => return annotation,
            ResourceType::Macro => {
                if let Some(raw_code) = &node.raw_code {
                    self.resolve_macros(symbols, node, &scan_template(raw_code), &mut annotation);
                }
                return annotation;
            }
            _ => {}
        }

        let mut scan = node.raw_code.as_deref().map(scan_template).unwrap_or_default();
        for expression in &node.declared_depends_on {
            let declared = scan_expression(expression);
            for r in declared.refs {
                if !scan.refs.contains(&r) {
                    scan.refs.push(r);
                }
            }
            for s in declared.sources {
                if !scan.sources.contains(&s) {
                    scan.sources.push(s);
                }
            }
            for m in declared.metrics {
                if !scan.metrics.contains(&m) {
                    scan.metrics.push(m);
                }
            }
        }

        for call in &scan.refs {
            match symbols.lookup_ref(&call.name, call.package.as_deref()) {
                Ok(provider) => annotation.depends_on.add_node(&provider.unique_id),
                Err(e) => errors.push(ResolutionError::from_lookup(
                    &node.unique_id,
                    ReferenceTarget::Ref(call.clone()),
                    e,
                )),
            }
        }

        for call in &scan.sources {
            match symbols.lookup_source(call.source_name(), call.table_name(), None) {
                Ok(provider) => annotation.depends_on.add_node(&provider.unique_id),
                Err(e) => errors.push(ResolutionError::from_lookup(
                    &node.unique_id,
                    ReferenceTarget::Source(call.clone()),
                    e,
                )),
            }
        }

        for call in &scan.metrics {
            match symbols.lookup(&call.name, &[ResourceType::Metric], call.package.as_deref()) {
                Ok(provider) => annotation.depends_on.add_node(&provider.unique_id),
                Err(e) => errors.push(ResolutionError::from_lookup(
                    &node.unique_id,
                    ReferenceTarget::Metric(call.clone()),
                    e,
                )),
            }
        }

        // Docs are checked here but only substituted at render time
        let mut docs = scan.docs.clone();
        for description in std::iter::once(&node.description).chain(node.columns.values().map(|c| &c.description)) {
            for call in scan_template(description).docs {
                if !docs.contains(&call) {
                    docs.push(call);
                }
            }
        }
        for call in &docs {
            if let Err(e) = symbols.lookup_doc(&call.name, call.package.as_deref()) {
                errors.push(ResolutionError::from_lookup(
                    &node.unique_id,
                    ReferenceTarget::Doc(call.clone()),
                    e,
                ));
            }
        }

        if let Some(group) = node.group() {
            if symbols.lookup_group(group).is_err() {
                warn!(node = %node.unique_id, group, "node belongs to an undeclared group");
            }
        }

        self.resolve_macros(symbols, node, &scan, &mut annotation);

        debug!(
            node = %node.unique_id,
            parents = annotation.depends_on.nodes.len(),
            macros = annotation.depends_on.macros.len(),
            "resolved"
        );

        annotation.refs = scan.refs;
        annotation.sources = scan.sources;
        annotation.docs = docs;
        annotation
    }

    fn resolve_macros(&self, symbols: &SymbolTable, node: &Node, scan: &ScanResult, annotation: &mut Annotation) {
        for name in &scan.calls {
            if let Some(macro_node) = symbols.lookup_macro(name, &node.package_name) {
                if macro_node.unique_id != node.unique_id {
                    annotation.depends_on.add_macro(&macro_node.unique_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{Declaration, Materialization};

    fn resolve(decls: Vec<Declaration>) -> (SymbolTable, Vec<ResolutionError>) {
        let mut symbols = SymbolTable::from_declarations(decls).unwrap();
        let errors = Resolver::new().resolve(&mut symbols);
        (symbols, errors)
    }

    #[test]
    fn ref_and_source_become_edges() {
        let (symbols, errors) = resolve(vec![
            Declaration::source("shop", "raw", "orders"),
            Declaration::new(ResourceType::Model, "shop", "stg_orders")
                .with_raw_code("select * from {{ source('raw', 'orders') }}"),
            Declaration::new(ResourceType::Model, "shop", "orders")
                .with_raw_code("select * from {{ ref('stg_orders') }}"),
        ]);

        assert!(errors.is_empty());
        assert_eq!(
            symbols.get("model.shop.stg_orders").unwrap().depends_on.nodes,
            vec!["source.shop.raw.orders"]
        );
        assert_eq!(
            symbols.get("model.shop.orders").unwrap().depends_on.nodes,
            vec!["model.shop.stg_orders"]
        );
    }

    #[test]
    fn unresolved_ref_is_attributed_to_its_node() {
        let (symbols, errors) = resolve(vec![
            Declaration::new(ResourceType::Model, "shop", "a").with_raw_code("select 1"),
            Declaration::new(ResourceType::Model, "shop", "b").with_raw_code("select * from {{ ref('missing') }}"),
        ]);

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].node_id(), "model.shop.b");
        assert_eq!(errors[0].to_diagnostic().code, DiagnosticCode::RefNotFound);
        assert!(symbols.get("model.shop.b").unwrap().depends_on.nodes.is_empty());
    }

    #[test]
    fn missing_source_and_doc_have_their_own_codes() {
        let (_, errors) = resolve(vec![Declaration::new(ResourceType::Model, "shop", "a")
            .with_raw_code("select * from {{ source('raw', 'nope') }}")
            .with_description("{{ doc('undocumented') }}")]);

        let codes: Vec<DiagnosticCode> = errors.iter().map(|e| e.to_diagnostic().code).collect();
        assert_eq!(codes, vec![DiagnosticCode::SourceNotFound, DiagnosticCode::DocNotFound]);
    }

    #[test]
    fn docs_do_not_create_edges() {
        let (symbols, errors) = resolve(vec![
            Declaration::new(ResourceType::Doc, "shop", "orders_doc").with_raw_code("All orders."),
            Declaration::new(ResourceType::Model, "shop", "orders")
                .with_raw_code("select 1")
                .with_description("{{ doc('orders_doc') }}"),
        ]);

        assert!(errors.is_empty());
        let orders = symbols.get("model.shop.orders").unwrap();
        assert!(orders.depends_on.nodes.is_empty());
        assert_eq!(orders.doc_refs.len(), 1);
    }

    #[test]
    fn ref_to_disabled_model() {
        let (_, errors) = resolve(vec![
            Declaration::new(ResourceType::Model, "shop", "legacy").disabled(),
            Declaration::new(ResourceType::Model, "shop", "report").with_raw_code("{{ ref('legacy') }}"),
        ]);

        assert!(matches!(errors[0], ResolutionError::Disabled { .. }));
    }

    #[test]
    fn inline_disable_applies_before_lookup() {
        let (symbols, errors) = resolve(vec![
            Declaration::new(ResourceType::Model, "shop", "legacy")
                .with_raw_code("{{ config(enabled=false) }} select 1"),
            Declaration::new(ResourceType::Model, "shop", "report").with_raw_code("{{ ref('legacy') }}"),
        ]);

        assert!(symbols.get("model.shop.legacy").is_none());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_diagnostic().code, DiagnosticCode::RefDisabled);
    }

    #[test]
    fn inline_config_sets_materialization() {
        let (symbols, errors) = resolve(vec![Declaration::new(ResourceType::Model, "shop", "tmp")
            .with_raw_code("{{ config(materialized='ephemeral') }} select 1")]);

        assert!(errors.is_empty());
        assert_eq!(
            symbols.get("model.shop.tmp").unwrap().materialization(),
            Materialization::Ephemeral
        );
    }

    #[test]
    fn invalid_inline_config_is_reported() {
        let (_, errors) = resolve(vec![Declaration::new(ResourceType::Model, "shop", "tmp")
            .with_raw_code("{{ config(materialized='cube') }} select 1")]);

        assert_eq!(errors[0].to_diagnostic().code, DiagnosticCode::InvalidInlineConfig);
    }

    #[test]
    fn exposures_use_declared_dependencies() {
        let (symbols, errors) = resolve(vec![
            Declaration::new(ResourceType::Model, "shop", "orders").with_raw_code("select 1"),
            Declaration::new(ResourceType::Exposure, "shop", "dashboard")
                .with_depends_on(vec!["ref('orders')".to_string()]),
        ]);

        assert!(errors.is_empty());
        assert_eq!(
            symbols.get("exposure.shop.dashboard").unwrap().depends_on.nodes,
            vec!["model.shop.orders"]
        );
    }

    #[test]
    fn metric_calls_resolve_to_metrics() {
        let (symbols, errors) = resolve(vec![
            Declaration::new(ResourceType::Metric, "shop", "revenue"),
            Declaration::new(ResourceType::Model, "shop", "kpis").with_raw_code("{{ metric('revenue') }}"),
        ]);

        assert!(errors.is_empty());
        assert_eq!(
            symbols.get("model.shop.kpis").unwrap().depends_on.nodes,
            vec!["metric.shop.revenue"]
        );
    }

    #[test]
    fn macro_calls_are_recorded() {
        let (symbols, _) = resolve(vec![
            Declaration::new(ResourceType::Macro, "shop", "cents_to_dollars")
                .with_raw_code("{% macro cents_to_dollars(col) %}({{ col }} / 100){% endmacro %}"),
            Declaration::new(ResourceType::Model, "shop", "payments")
                .with_raw_code("select {{ cents_to_dollars('amount') }} from t"),
        ]);

        let payments = symbols.get("model.shop.payments").unwrap();
        assert_eq!(payments.depends_on.macros, vec!["macro.shop.cents_to_dollars"]);
        // A macro definition does not depend on itself
        assert!(symbols.get("macro.shop.cents_to_dollars").unwrap().depends_on.macros.is_empty());
    }

    #[test]
    fn resolution_is_deterministic() {
        let decls = vec![
            Declaration::new(ResourceType::Model, "shop", "a").with_raw_code("select 1"),
            Declaration::new(ResourceType::Model, "shop", "b").with_raw_code("{{ ref('a') }} {{ ref('x') }}"),
            Declaration::new(ResourceType::Model, "shop", "c").with_raw_code("{{ ref('b') }} {{ ref('a') }} {{ ref('y') }}"),
        ];

        let (first, first_errors) = resolve(decls.clone());
        let (second, second_errors) = resolve(decls);

        assert_eq!(first_errors, second_errors);
        assert_eq!(first.nodes(), second.nodes());
        assert_eq!(first_errors[0].node_id(), "model.shop.b");
    }
}
