//! Integration tests for node compilation

use pretty_assertions::assert_eq;
use std::sync::Arc;
use strata_adapter::MockExecutor;
use strata_core::{Declaration, DiagnosticCode, Materialization, ResourceType};
use strata_graph::{Resolver, SymbolTable};
use strata_jinja::{render_descriptions, CompilationError, CompileContextBuilder, Compiler};

fn model(name: &str, sql: &str) -> Declaration {
    Declaration::new(ResourceType::Model, "shop", name).with_raw_code(sql)
}

fn resolved(decls: Vec<Declaration>) -> Arc<SymbolTable> {
    let mut symbols = SymbolTable::from_declarations(decls).unwrap();
    Resolver::new().resolve(&mut symbols);
    Arc::new(symbols)
}

fn compiler(symbols: Arc<SymbolTable>) -> Compiler {
    let context = CompileContextBuilder::new()
        .target_schema("analytics")
        .var("min_amount", serde_json::json!(5))
        .build();
    Compiler::new(symbols, context, &MockExecutor::new())
}

fn ids(symbols: &SymbolTable) -> Vec<String> {
    symbols.nodes().iter().map(|n| n.unique_id.clone()).collect()
}

#[test]
fn refs_and_sources_render_relations() {
    let symbols = resolved(vec![
        Declaration::source("shop", "raw", "payments"),
        model("stg_payments", "select * from {{ source('raw', 'payments') }}"),
        model(
            "payments",
            "select * from {{ ref('stg_payments') }} where amount > {{ var('min_amount') }}",
        ),
    ]);

    let output = compiler(Arc::clone(&symbols)).compile(&ids(&symbols));
    assert!(output.errors.is_empty(), "{:?}", output.errors);

    let stg = output.compiled.get("model.shop.stg_payments").unwrap();
    assert_eq!(stg.compiled_code, "select * from \"raw\".\"payments\"");
    assert_eq!(stg.relation_name.as_deref(), Some("\"analytics\".\"stg_payments\""));

    let payments = output.compiled.get("model.shop.payments").unwrap();
    assert_eq!(
        payments.compiled_code,
        "select * from \"analytics\".\"stg_payments\" where amount > 5"
    );

    // Sources have no body to compile
    assert!(!output.compiled.contains("source.shop.raw.payments"));
}

#[test]
fn ephemeral_models_are_inlined() {
    let symbols = resolved(vec![
        model("base", "select 1 as id").with_materialization(Materialization::Ephemeral),
        model("enriched", "select id, 2 as two from {{ ref('base') }}").with_materialization(Materialization::Ephemeral),
        model("final", "select * from {{ ref('enriched') }}"),
    ]);

    let output = compiler(Arc::clone(&symbols)).compile(&["model.shop.final".to_string()]);
    assert!(output.errors.is_empty(), "{:?}", output.errors);

    let compiled = output.compiled.get("model.shop.final").unwrap();
    assert_eq!(
        compiled.compiled_code,
        "with __dbt__cte__base as (\nselect 1 as id\n),\n\
         __dbt__cte__enriched as (\nselect id, 2 as two from __dbt__cte__base\n)\n\
         select * from __dbt__cte__enriched"
    );

    let injected: Vec<&str> = compiled.extra_ctes.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(injected, vec!["model.shop.base", "model.shop.enriched"]);
}

#[test]
fn failures_are_per_node() {
    let symbols = resolved(vec![
        model("a", "select 1"),
        model("broken", "select * from {{ ref('nope') }}"),
        model("typo", "select {{ undefined_thing }}"),
        model("b", "select * from {{ ref('a') }}"),
    ]);

    let output = compiler(Arc::clone(&symbols)).compile(&ids(&symbols));

    assert_eq!(output.compiled.len(), 2);
    assert!(output.compiled.contains("model.shop.b"));

    let broken = output.error_for("model.shop.broken").unwrap();
    assert!(matches!(broken, CompilationError::UnresolvedReference { .. }));

    let typo = output.error_for("model.shop.typo").unwrap();
    assert!(matches!(typo, CompilationError::UndefinedVariable { .. }));
    assert_eq!(typo.to_diagnostic().code, DiagnosticCode::UndefinedVariable);
}

#[test]
fn macros_are_callable_from_nodes() {
    let symbols = resolved(vec![
        Declaration::new(ResourceType::Macro, "shop", "cents_to_dollars")
            .with_raw_code("{% macro cents_to_dollars(col) %}({{ col }} / 100.0){% endmacro %}"),
        model("orders", "select {{ cents_to_dollars('amount') }} as amount from t"),
    ]);

    let output = compiler(Arc::clone(&symbols)).compile(&["model.shop.orders".to_string()]);
    assert!(output.errors.is_empty(), "{:?}", output.errors);
    assert_eq!(
        output.compiled.get("model.shop.orders").unwrap().compiled_code,
        "select (amount / 100.0) as amount from t"
    );
}

#[test]
fn incremental_flag_follows_full_refresh() {
    let body = "select * from src{% if is_incremental() %} where ts > (select max(ts) from {{ this }}){% endif %}";
    let symbols = resolved(vec![model("events", body).with_materialization(Materialization::Incremental)]);
    let ids = ids(&symbols);

    let incremental = compiler(Arc::clone(&symbols)).compile(&ids);
    assert_eq!(
        incremental.compiled.get("model.shop.events").unwrap().compiled_code,
        "select * from src where ts > (select max(ts) from \"analytics\".\"events\")"
    );

    let context = CompileContextBuilder::new().target_schema("analytics").full_refresh(true).build();
    let rebuilt = Compiler::new(Arc::clone(&symbols), context, &MockExecutor::new()).compile(&ids);
    assert_eq!(
        rebuilt.compiled.get("model.shop.events").unwrap().compiled_code,
        "select * from src"
    );
}

#[test]
fn descriptions_render_doc_blocks() {
    let mut symbols = SymbolTable::from_declarations(vec![
        Declaration::new(ResourceType::Doc, "shop", "orders_doc").with_raw_code("One row per order."),
        model("orders", "select 1").with_description("{{ doc('orders_doc') }}"),
    ])
    .unwrap();

    let errors = render_descriptions(&mut symbols);
    assert!(errors.is_empty());
    assert_eq!(symbols.get("model.shop.orders").unwrap().description, "One row per order.");
}

#[test]
fn ambiguous_doc_fails_like_the_resolver() {
    let mut symbols = SymbolTable::from_declarations(vec![
        Declaration::new(ResourceType::Doc, "shop", "overview").with_raw_code("Shop overview."),
        Declaration::new(ResourceType::Doc, "util", "overview").with_raw_code("Util overview."),
        model("orders", "select 1").with_description("{{ doc('overview') }}"),
        model("items", "select 1").with_description("{{ doc('util', 'overview') }}"),
    ])
    .unwrap();

    let resolution = Resolver::new().resolve(&mut symbols);
    assert_eq!(resolution.len(), 1);
    assert_eq!(resolution[0].to_diagnostic().code, DiagnosticCode::RefAmbiguous);

    let errors = render_descriptions(&mut symbols);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].node_id(), "model.shop.orders");
    assert_eq!(symbols.get("model.shop.items").unwrap().description, "Util overview.");
}
