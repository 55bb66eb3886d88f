//! Integration tests for resolution and graph construction

use std::collections::HashSet;
use strata_core::{Declaration, DiagnosticCode, NodeConfig, ResourceType};
use strata_graph::{DependencyGraph, GraphError, Resolver, SymbolTable};

fn model(name: &str, sql: &str) -> Declaration {
    Declaration::new(ResourceType::Model, "shop", name).with_raw_code(sql)
}

fn build(decls: Vec<Declaration>) -> (SymbolTable, Vec<strata_graph::ResolutionError>, Result<DependencyGraph, GraphError>) {
    let mut symbols = SymbolTable::from_declarations(decls).unwrap();
    let errors = Resolver::new().resolve(&mut symbols);
    let graph = DependencyGraph::build(&symbols);
    (symbols, errors, graph)
}

#[test]
fn three_model_chain() {
    let (_, errors, graph) = build(vec![
        model("a", "select 1 as id"),
        model("b", "select * from {{ ref('a') }}"),
        model("c", "select * from {{ ref('a') }} join {{ ref('b') }} using (id)"),
    ]);

    assert!(errors.is_empty());
    let graph = graph.unwrap();

    let parent_map = graph.parent_map();
    assert_eq!(parent_map["model.shop.c"], vec!["model.shop.a", "model.shop.b"]);
    assert_eq!(graph.child_map()["model.shop.a"], vec!["model.shop.b", "model.shop.c"]);
    assert_eq!(
        graph.topological_order(),
        &["model.shop.a", "model.shop.b", "model.shop.c"]
    );

    // Selecting only c keeps a and b reachable as ancestors
    assert_eq!(graph.upstream("model.shop.c").len(), 2);
    let selection: HashSet<String> = ["model.shop.c".to_string()].into_iter().collect();
    let sub = graph.subgraph(&selection);
    assert_eq!(sub.len(), 1);
    assert!(sub.parents("model.shop.c").is_empty());
}

#[test]
fn commented_out_ref_is_not_an_edge() {
    let (symbols, errors, graph) = build(vec![
        model("a", "{# old: {{ ref('b') }} #} select 1"),
        model("b", "select * from {{ ref('a') }}"),
    ]);

    assert!(errors.is_empty());
    let graph = graph.unwrap();
    assert!(graph.parents("model.shop.a").is_empty());
    assert_eq!(graph.parents("model.shop.b"), &["model.shop.a".to_string()]);
    assert!(symbols.get("model.shop.a").unwrap().depends_on.nodes.is_empty());
}

#[test]
fn mutual_refs_fail_graph_build() {
    let (_, errors, graph) = build(vec![
        model("a", "select * from {{ ref('b') }}"),
        model("b", "select * from {{ ref('a') }}"),
    ]);

    assert!(errors.is_empty());
    let err = graph.unwrap_err();
    assert_eq!(err.to_diagnostic().code, DiagnosticCode::CyclicDependency);
    assert_eq!(
        err.to_string(),
        "Found a cycle: model.shop.a --> model.shop.b --> model.shop.a"
    );
}

#[test]
fn unresolved_ref_leaves_graph_valid() {
    let (_, errors, graph) = build(vec![
        model("a", "select 1"),
        model("broken", "select * from {{ ref('nope') }}"),
        model("b", "select * from {{ ref('a') }}"),
    ]);

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].node_id(), "model.shop.broken");

    let graph = graph.unwrap();
    assert_eq!(graph.len(), 3);
    assert!(graph.parents("model.shop.broken").is_empty());
}

#[test]
fn sources_tests_and_exposures_join_the_graph() {
    let test = Declaration::new(ResourceType::Test, "shop", "not_null_orders_id")
        .with_raw_code("select * from {{ ref('orders') }} where id is null");
    let exposure = Declaration::new(ResourceType::Exposure, "shop", "weekly")
        .with_depends_on(vec!["ref('orders')".to_string()]);

    let (_, errors, graph) = build(vec![
        Declaration::source("shop", "raw", "orders"),
        model("orders", "select * from {{ source('raw', 'orders') }}"),
        test,
        exposure,
        Declaration::new(ResourceType::Macro, "shop", "noop").with_raw_code("{% macro noop() %}{% endmacro %}"),
    ]);

    assert!(errors.is_empty());
    let graph = graph.unwrap();

    // Macros are not graph members
    assert_eq!(graph.len(), 4);
    assert_eq!(
        graph.downstream("source.shop.raw.orders"),
        vec![
            "model.shop.orders",
            "test.shop.not_null_orders_id",
            "exposure.shop.weekly"
        ]
    );
}

#[test]
fn group_map_lists_members() {
    let grouped = |name: &str| {
        model(name, "select 1").with_config(NodeConfig {
            group: Some("finance".to_string()),
            ..Default::default()
        })
    };

    let (_, _, graph) = build(vec![
        Declaration::new(ResourceType::Group, "shop", "finance"),
        Declaration::new(ResourceType::Group, "shop", "empty"),
        grouped("revenue"),
        grouped("costs"),
        model("other", "select 1"),
    ]);

    let graph = graph.unwrap();
    let groups = graph.group_map();
    assert_eq!(groups["finance"], vec!["model.shop.costs", "model.shop.revenue"]);
    assert!(groups["empty"].is_empty());
}

#[test]
fn topological_order_is_a_valid_linearization() {
    let (_, _, graph) = build(vec![
        model("f", "{{ ref('e') }} {{ ref('c') }}"),
        model("e", "{{ ref('d') }}"),
        model("d", "{{ ref('a') }}"),
        model("c", "{{ ref('b') }}"),
        model("b", "{{ ref('a') }}"),
        model("a", "select 1"),
    ]);

    let graph = graph.unwrap();
    for node in graph.all_nodes() {
        for parent in graph.parents(node) {
            assert!(graph.topo_index(parent).unwrap() < graph.topo_index(node).unwrap());
        }
    }
    assert_eq!(graph.layers().len(), 4);
}
