//! Integration tests for selection, compilation and scheduling

use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strata_adapter::{AdapterResponse, ExecutionError, ExecutionOutcome, Executor, MockExecutor};
use strata_core::{Declaration, Materialization, Node, ResourceType, RunConfig};
use strata_engine::{
    BuildError, Interrupt, Project, RunOutcome, RunStatus, Scheduler, SchedulerOptions, Selection, SkipReason,
};
use strata_jinja::CompileContext;

fn model(name: &str, sql: &str) -> Declaration {
    Declaration::new(ResourceType::Model, "shop", name).with_raw_code(sql)
}

fn chain() -> Vec<Declaration> {
    vec![
        model("a", "select 1 as id"),
        model("b", "select * from {{ ref('a') }}"),
        model("c", "select * from {{ ref('a') }} join {{ ref('b') }} using (id)"),
    ]
}

async fn run_with(project: &Project, run: &RunConfig, executor: MockExecutor) -> RunOutcome {
    let selection = project.select(run);
    let compiled = project.compile(&selection, CompileContext::default(), &executor);
    let scheduler = Scheduler::new(Arc::new(executor), SchedulerOptions::from_run(run));
    scheduler.run(project, &selection, &compiled).await
}

/// Executor whose task panics for one node
struct PanickingExecutor {
    panics_on: &'static str,
}

#[async_trait::async_trait]
impl Executor for PanickingExecutor {
    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn execute(&self, _compiled_sql: &str, node: &Node) -> Result<ExecutionOutcome, ExecutionError> {
        if node.unique_id == self.panics_on {
            panic!("connection dropped mid-statement");
        }
        Ok(ExecutionOutcome::success(AdapterResponse::new("OK")))
    }

    fn connection_budget(&self) -> usize {
        4
    }
}

fn statuses(outcome: &RunOutcome) -> BTreeMap<String, RunStatus> {
    outcome
        .results
        .iter()
        .map(|r| (r.unique_id.clone(), r.status))
        .collect()
}

#[tokio::test]
async fn selecting_one_model_references_its_ancestors() {
    let project = Project::build("shop", chain()).unwrap();
    let executor = MockExecutor::new();
    let run = RunConfig {
        select: vec!["c".to_string()],
        ..RunConfig::default()
    };

    let outcome = run_with(&project, &run, executor.clone()).await;

    assert_eq!(executor.calls(), vec!["model.shop.c"]);
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.status("model.shop.c"), Some(RunStatus::Success));
    assert_eq!(outcome.referenced, vec!["model.shop.a", "model.shop.b"]);
    assert_eq!(project.graph.parent_map()["model.shop.c"], vec!["model.shop.a", "model.shop.b"]);
}

#[tokio::test]
async fn fail_fast_skips_dependents_and_finishes_independent_work() {
    let mut decls = chain();
    decls.push(model("d", "select 2 as id"));
    let project = Project::build("shop", decls).unwrap();

    let executor = MockExecutor::new()
        .with_failure("model.shop.a", "relation does not exist")
        .with_node_latency("model.shop.a", 20);
    let run = RunConfig {
        fail_fast: true,
        threads: 2,
        ..RunConfig::default()
    };

    let outcome = run_with(&project, &run, executor).await;

    assert_eq!(outcome.status("model.shop.a"), Some(RunStatus::Error));
    assert_eq!(outcome.status("model.shop.b"), Some(RunStatus::Skipped));
    assert_eq!(outcome.status("model.shop.c"), Some(RunStatus::Skipped));
    assert_eq!(outcome.status("model.shop.d"), Some(RunStatus::Success));
    assert!(outcome.has_failures());

    let b = outcome.result("model.shop.b").unwrap();
    assert_eq!(
        b.skip_reason,
        Some(SkipReason::UpstreamFailed {
            upstream: "model.shop.a".to_string()
        })
    );
}

#[tokio::test]
async fn upstream_error_skips_every_transitive_dependent() {
    let project = Project::build(
        "shop",
        vec![
            model("a", "select 1"),
            model("b", "select * from {{ ref('a') }}"),
            model("c", "select * from {{ ref('b') }}"),
            model("d", "select * from {{ ref('c') }}"),
        ],
    )
    .unwrap();

    let executor = MockExecutor::new().with_failure("model.shop.a", "boom");
    let outcome = run_with(&project, &RunConfig::default(), executor.clone()).await;

    assert_eq!(executor.calls(), vec!["model.shop.a"]);
    for id in ["model.shop.b", "model.shop.c", "model.shop.d"] {
        assert_eq!(outcome.status(id), Some(RunStatus::Skipped), "{}", id);
    }
}

#[tokio::test]
async fn cycle_aborts_before_execution() {
    let err = Project::build(
        "shop",
        vec![
            model("a", "select * from {{ ref('b') }}"),
            model("b", "select * from {{ ref('a') }}"),
        ],
    )
    .unwrap_err();

    assert!(matches!(err, BuildError::Graph(_)));
    assert_eq!(
        err.to_diagnostic().code,
        strata_core::DiagnosticCode::CyclicDependency
    );
}

#[tokio::test]
async fn unresolved_ref_fails_only_its_node() {
    let project = Project::build(
        "shop",
        vec![
            model("a", "select 1"),
            model("broken", "select * from {{ ref('missing') }}"),
            model("b", "select * from {{ ref('a') }}"),
        ],
    )
    .unwrap();

    assert_eq!(project.resolution_errors.len(), 1);
    assert_eq!(project.resolution_errors[0].node_id(), "model.shop.broken");

    let executor = MockExecutor::new();
    let outcome = run_with(&project, &RunConfig::default(), executor.clone()).await;

    assert_eq!(outcome.status("model.shop.broken"), Some(RunStatus::Error));
    assert_eq!(outcome.status("model.shop.a"), Some(RunStatus::Success));
    assert_eq!(outcome.status("model.shop.b"), Some(RunStatus::Success));
    assert!(!executor.calls().contains(&"model.shop.broken".to_string()));
}

#[tokio::test]
async fn statuses_do_not_depend_on_thread_count() {
    let decls = vec![
        model("a", "select 1"),
        model("b", "select * from {{ ref('a') }}"),
        model("c", "select 1"),
        model("d", "select * from {{ ref('c') }}"),
        model("e", "select * from {{ ref('b') }} join {{ ref('d') }} using (id)"),
        model("f", "select * from {{ ref('c') }}"),
    ];
    let project = Project::build("shop", decls).unwrap();

    let failing = || MockExecutor::new().with_failure("model.shop.d", "boom").with_latency(5);

    let single = run_with(
        &project,
        &RunConfig {
            single_threaded: true,
            ..RunConfig::default()
        },
        failing(),
    )
    .await;
    let parallel = run_with(
        &project,
        &RunConfig {
            threads: 4,
            ..RunConfig::default()
        },
        failing(),
    )
    .await;

    assert_eq!(statuses(&single), statuses(&parallel));
    assert_eq!(statuses(&single)["model.shop.e"], RunStatus::Skipped);
    assert_eq!(statuses(&single)["model.shop.f"], RunStatus::Success);
}

#[tokio::test]
async fn single_thread_dispatches_in_topological_order() {
    let project = Project::build(
        "shop",
        vec![
            model("c", "select * from {{ ref('a') }}"),
            model("a", "select 1"),
            model("b", "select 1"),
        ],
    )
    .unwrap();

    let executor = MockExecutor::new();
    let run = RunConfig {
        single_threaded: true,
        ..RunConfig::default()
    };
    run_with(&project, &run, executor.clone()).await;

    assert_eq!(executor.calls(), project.graph.topological_order().to_vec());
}

#[tokio::test]
async fn concurrency_never_exceeds_thread_budget() {
    let decls: Vec<Declaration> = (0..12).map(|i| model(&format!("m{}", i), "select 1")).collect();
    let project = Project::build("shop", decls).unwrap();

    let executor = MockExecutor::new().with_latency(15);
    let run = RunConfig {
        threads: 3,
        ..RunConfig::default()
    };
    let outcome = run_with(&project, &run, executor.clone()).await;

    assert_eq!(outcome.count(RunStatus::Success), 12);
    assert!(executor.max_in_flight() <= 3);
    assert!(executor.max_in_flight() >= 2);
}

#[tokio::test]
async fn connection_budget_caps_workers() {
    let decls: Vec<Declaration> = (0..6).map(|i| model(&format!("m{}", i), "select 1")).collect();
    let project = Project::build("shop", decls).unwrap();

    let executor = MockExecutor::new().with_latency(10).with_connection_budget(1);
    let run = RunConfig {
        threads: 8,
        ..RunConfig::default()
    };
    run_with(&project, &run, executor.clone()).await;

    assert_eq!(executor.max_in_flight(), 1);
}

#[tokio::test]
async fn data_tests_pass_warn_and_fail() {
    let warn_config = strata_core::NodeConfig {
        severity: Some(strata_core::TestSeverity::Warn),
        ..strata_core::NodeConfig::default()
    };

    let project = Project::build(
        "shop",
        vec![
            model("orders", "select 1 as id"),
            Declaration::new(ResourceType::Test, "shop", "unique_orders_id")
                .with_raw_code("select id from {{ ref('orders') }} group by id having count(*) > 1"),
            Declaration::new(ResourceType::Test, "shop", "not_null_orders_id")
                .with_raw_code("select id from {{ ref('orders') }} where id is null"),
            Declaration::new(ResourceType::Test, "shop", "accepted_values_orders_id")
                .with_raw_code("select id from {{ ref('orders') }} where id not in (1)")
                .with_config(warn_config),
        ],
    )
    .unwrap();

    let executor = MockExecutor::new()
        .with_test_failures("test.shop.not_null_orders_id", 2)
        .with_test_failures("test.shop.accepted_values_orders_id", 1);
    let outcome = run_with(&project, &RunConfig::default(), executor).await;

    assert_eq!(outcome.status("test.shop.unique_orders_id"), Some(RunStatus::Pass));
    assert_eq!(outcome.status("test.shop.not_null_orders_id"), Some(RunStatus::Fail));
    assert_eq!(outcome.status("test.shop.accepted_values_orders_id"), Some(RunStatus::Warn));

    let failing = outcome.result("test.shop.not_null_orders_id").unwrap();
    assert_eq!(failing.failures, Some(2));
    assert_eq!(
        failing.message.as_deref(),
        Some("Got 2 results, configured to fail if != 0")
    );
}

#[tokio::test]
async fn ephemeral_models_are_inlined_not_executed() {
    let project = Project::build(
        "shop",
        vec![
            model("base", "select 1 as id").with_materialization(Materialization::Ephemeral),
            model("final", "select * from {{ ref('base') }}"),
        ],
    )
    .unwrap();

    let executor = MockExecutor::new();
    let outcome = run_with(&project, &RunConfig::default(), executor.clone()).await;

    assert_eq!(executor.calls(), vec!["model.shop.final"]);
    assert!(outcome.result("model.shop.base").is_none());
    assert!(executor
        .statement("model.shop.final")
        .unwrap()
        .starts_with("with __dbt__cte__base as ("));
}

#[tokio::test]
async fn interrupt_skips_undispatched_nodes() {
    let decls: Vec<Declaration> = vec![
        model("slow", "select 1"),
        model("after", "select * from {{ ref('slow') }}"),
    ];
    let project = Project::build("shop", decls).unwrap();
    let selection = project.select(&RunConfig::default());

    let executor = MockExecutor::new().with_node_latency("model.shop.slow", 10_000);
    let compiled = project.compile(&selection, CompileContext::default(), &executor);

    let interrupt = Interrupt::new();
    let scheduler = Scheduler::new(Arc::new(executor.clone()), SchedulerOptions::default()).with_interrupt(interrupt.clone());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        interrupt.trigger();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), scheduler.run(&project, &selection, &compiled))
        .await
        .unwrap();
    trigger.await.unwrap();

    assert!(outcome.interrupted);
    assert!(executor.was_cancelled());
    assert_eq!(outcome.status("model.shop.slow"), Some(RunStatus::Error));
    assert_eq!(outcome.status("model.shop.after"), Some(RunStatus::Skipped));
}

#[tokio::test]
async fn timeout_behaves_like_an_interrupt() {
    let project = Project::build(
        "shop",
        vec![model("slow", "select 1"), model("after", "select * from {{ ref('slow') }}")],
    )
    .unwrap();
    let selection = Selection::from_ids(project.graph.topological_order().to_vec());

    let executor = MockExecutor::new().with_node_latency("model.shop.slow", 10_000);
    let compiled = project.compile(&selection, CompileContext::default(), &executor);

    let options = SchedulerOptions {
        timeout: Some(Duration::from_millis(30)),
        ..SchedulerOptions::default()
    };
    let scheduler = Scheduler::new(Arc::new(executor.clone()), options);
    let outcome = tokio::time::timeout(Duration::from_secs(5), scheduler.run(&project, &selection, &compiled))
        .await
        .unwrap();

    assert!(outcome.timed_out);
    assert_eq!(
        outcome.result("model.shop.after").unwrap().skip_reason,
        Some(SkipReason::TimedOut)
    );
}

#[tokio::test]
async fn empty_selection_runs_nothing() {
    let project = Project::build("shop", chain()).unwrap();
    let executor = MockExecutor::new();
    let run = RunConfig {
        select: vec!["does_not_exist".to_string()],
        ..RunConfig::default()
    };

    let outcome = run_with(&project, &run, executor.clone()).await;
    assert!(outcome.results.is_empty());
    assert!(executor.calls().is_empty());
    assert_eq!(executor.name(), "mock");
}

#[tokio::test]
async fn panicked_task_frees_its_slot() {
    let project = Project::build(
        "shop",
        vec![
            model("a", "select 1"),
            model("b", "select 2"),
            model("c", "select * from {{ ref('a') }}"),
        ],
    )
    .unwrap();
    let selection = project.select(&RunConfig::default());
    let executor = PanickingExecutor {
        panics_on: "model.shop.a",
    };
    let compiled = project.compile(&selection, CompileContext::default(), &executor);

    // One worker: a lost slot would strand b
    let scheduler = Scheduler::new(Arc::new(executor), SchedulerOptions::default());
    let outcome = tokio::time::timeout(Duration::from_secs(5), scheduler.run(&project, &selection, &compiled))
        .await
        .unwrap();

    assert!(!outcome.interrupted);
    assert_eq!(outcome.status("model.shop.a"), Some(RunStatus::Error));
    assert_eq!(outcome.status("model.shop.b"), Some(RunStatus::Success));
    assert_eq!(outcome.status("model.shop.c"), Some(RunStatus::Skipped));

    let a = outcome.result("model.shop.a").unwrap();
    assert!(a.message.as_deref().unwrap().contains("execution task failed"));
    assert_eq!(a.thread_id, "Thread-1");
    assert_eq!(a.timing[0].name, "execute");
    assert_eq!(
        outcome.result("model.shop.c").unwrap().skip_reason,
        Some(SkipReason::UpstreamFailed {
            upstream: "model.shop.a".to_string()
        })
    );
}

#[tokio::test]
async fn interrupt_after_fail_fast_cancels_running_work() {
    let project = Project::build("shop", vec![model("a", "select 1"), model("slow", "select 2")]).unwrap();
    let selection = project.select(&RunConfig::default());

    let executor = MockExecutor::new()
        .with_failure("model.shop.a", "relation does not exist")
        .with_node_latency("model.shop.slow", 10_000);
    let compiled = project.compile(&selection, CompileContext::default(), &executor);

    let interrupt = Interrupt::new();
    let options = SchedulerOptions {
        threads: 2,
        fail_fast: true,
        ..SchedulerOptions::default()
    };
    let scheduler = Scheduler::new(Arc::new(executor.clone()), options).with_interrupt(interrupt.clone());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        interrupt.trigger();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), scheduler.run(&project, &selection, &compiled))
        .await
        .unwrap();
    trigger.await.unwrap();

    assert!(executor.was_cancelled());
    assert!(outcome.interrupted);
    assert_eq!(outcome.status("model.shop.a"), Some(RunStatus::Error));
    assert_eq!(outcome.status("model.shop.slow"), Some(RunStatus::Error));
}

#[tokio::test]
async fn compile_failure_result_carries_timing() {
    let project = Project::build("shop", vec![model("typo", "select {{ undefined_thing }}")]).unwrap();
    let outcome = run_with(&project, &RunConfig::default(), MockExecutor::new()).await;

    let typo = outcome.result("model.shop.typo").unwrap();
    assert_eq!(typo.status, RunStatus::Error);
    assert_eq!(typo.timing.len(), 1);
    assert_eq!(typo.timing[0].name, "compile");
}
