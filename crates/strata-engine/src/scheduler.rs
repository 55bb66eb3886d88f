//! Dependency-ordered execution with a bounded worker pool
//!
//! The coordinator owns the ready queue and hands nodes to at most N
//! concurrent tasks, where N is the smaller of the thread budget and the
//! executor's connection budget. A node is dispatched only after every
//! provider reached a terminal state. Ties between ready nodes are broken by
//! the project's topological order, so a single worker walks the graph the
//! same way N workers do.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_adapter::{ExecutionOutcome, Executor};
use strata_core::{Node, ResourceType, RunConfig, TestSeverity};
use strata_graph::{DependencyGraph, NodeId};
use strata_jinja::CompileOutput;
use tokio::task::{Id, JoinSet};
use tracing::{debug, info, warn};

use crate::interrupt::Interrupt;
use crate::project::{Project, Selection};
use crate::result::{RunOutcome, RunResult, RunStatus, TimingInfo};
use crate::state::{NodeState, NodeStates, SkipReason};

/// Scheduler options derived from the run configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOptions {
    pub threads: usize,

    pub fail_fast: bool,

    /// Invocation-wide deadline
    pub timeout: Option<Duration>,
}

impl SchedulerOptions {
    pub fn from_run(run: &RunConfig) -> Self {
        Self {
            threads: run.effective_threads(),
            fail_fast: run.fail_fast,
            timeout: run.timeout(),
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            fail_fast: false,
            timeout: None,
        }
    }
}

pub struct Scheduler {
    executor: Arc<dyn Executor>,
    options: SchedulerOptions,
    interrupt: Interrupt,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn Executor>, options: SchedulerOptions) -> Self {
        Self {
            executor,
            options,
            interrupt: Interrupt::new(),
        }
    }

    /// Use an interrupt handle shared with the caller
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Concurrent sessions requested from the executor
    pub fn worker_count(&self) -> usize {
        self.options.threads.max(1).min(self.executor.connection_budget().max(1))
    }

    /// Execute the executable part of a selection
    ///
    /// Ephemeral models and analyses are never dispatched. Ancestors outside
    /// the selection are reported as referenced and assumed to exist.
    pub async fn run(&self, project: &Project, selection: &Selection, compiled: &CompileOutput) -> RunOutcome {
        let clock = Instant::now();
        let symbols = &project.symbols;

        let executable: HashSet<NodeId> = selection
            .ids()
            .iter()
            .filter(|id| symbols.get(id).is_some_and(Node::is_executable))
            .cloned()
            .collect();

        let referenced = referenced_ancestors(&project.graph, selection, &executable);
        let workers = self.worker_count();

        info!(
            nodes = executable.len(),
            referenced = referenced.len(),
            threads = workers,
            "starting execution"
        );

        let mut pass = Pass::new(&project.graph, project.graph.subgraph(&executable), self.options.fail_fast);
        let deadline = self.options.timeout.map(|t| tokio::time::Instant::now() + t);

        let mut free_slots: Vec<usize> = (1..=workers).rev().collect();
        let mut tasks: JoinSet<RunResult> = JoinSet::new();
        let mut in_flight: HashMap<Id, (usize, NodeId, DateTime<Utc>)> = HashMap::new();
        let mut interrupt_seen = false;
        let mut deadline_passed = false;

        loop {
            if !interrupt_seen && self.interrupt.is_triggered() {
                interrupt_seen = true;
                pass.preempt(SkipReason::Interrupted);
                self.executor.cancel().await;
            } else if !deadline_passed && deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                deadline_passed = true;
                pass.preempt(SkipReason::TimedOut);
                self.executor.cancel().await;
            }

            while pass.stop.is_none() && !free_slots.is_empty() {
                let Some(id) = pass.next_ready() else {
                    break;
                };

                if let Some(error) = compiled.error_for(&id) {
                    if pass.states.transition(&id, NodeState::Ready, NodeState::Done(RunStatus::Error)).is_ok() {
                        pass.finish(RunResult::errored(&id, error.to_string()));
                    }
                    continue;
                }

                let Some(node) = symbols.get(&id) else {
                    continue;
                };
                if let Err(e) = pass.states.transition(&id, NodeState::Ready, NodeState::Running) {
                    warn!("{}", e);
                    continue;
                }
                let Some(slot) = free_slots.pop() else {
                    break;
                };

                let sql = compiled
                    .compiled
                    .get(&id)
                    .map(|c| c.compiled_code.clone())
                    .unwrap_or_default();
                let executor = Arc::clone(&self.executor);
                let node = node.clone();

                debug!(node = %id, thread = slot, "dispatch");
                let handle = tasks.spawn(async move { execute_node(executor.as_ref(), &node, &sql, slot).await });
                in_flight.insert(handle.id(), (slot, id, Utc::now()));
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = tasks.join_next_with_id() => match joined {
                    Some(Ok((task, result))) => {
                        if let Some((slot, _, _)) = in_flight.remove(&task) {
                            free_slots.push(slot);
                        }
                        let status = result.status;
                        if let Err(e) = pass.states.transition(&result.unique_id, NodeState::Running, NodeState::Done(status)) {
                            warn!("{}", e);
                        }
                        pass.finish(result);
                    }
                    Some(Err(e)) => {
                        // A panicked or aborted task still owns its slot and node
                        let Some((slot, id, started_at)) = in_flight.remove(&e.id()) else {
                            warn!("execution task failed: {}", e);
                            continue;
                        };
                        free_slots.push(slot);
                        if pass.states.transition(&id, NodeState::Running, NodeState::Done(RunStatus::Error)).is_ok() {
                            let mut result = RunResult::errored(&id, format!("execution task failed: {}", e));
                            result.thread_id = format!("Thread-{}", slot);
                            result.timing = vec![TimingInfo::new("execute", started_at, Utc::now())];
                            pass.finish(result);
                        }
                    }
                    None => break,
                },
                _ = self.interrupt.triggered(), if !interrupt_seen => {
                    warn!("interrupted, waiting for running nodes");
                    interrupt_seen = true;
                    pass.preempt(SkipReason::Interrupted);
                    self.executor.cancel().await;
                }
                _ = wait_until(deadline), if !deadline_passed => {
                    warn!("invocation timed out, waiting for running nodes");
                    deadline_passed = true;
                    pass.preempt(SkipReason::TimedOut);
                    self.executor.cancel().await;
                }
            }
        }

        pass.sweep();

        let outcome = RunOutcome {
            interrupted: pass.stop == Some(SkipReason::Interrupted),
            timed_out: pass.stop == Some(SkipReason::TimedOut),
            results: pass.results,
            referenced,
            elapsed: clock.elapsed(),
        };

        info!(
            success = outcome.count(RunStatus::Success) + outcome.count(RunStatus::Pass),
            error = outcome.count(RunStatus::Error) + outcome.count(RunStatus::Fail),
            warn = outcome.count(RunStatus::Warn),
            skipped = outcome.count(RunStatus::Skipped),
            "finished in {:.2}s",
            outcome.elapsed.as_secs_f64()
        );

        outcome
    }
}

/// Bookkeeping of one execution pass
struct Pass<'a> {
    /// Full project graph, for stable tie-breaking
    project_graph: &'a DependencyGraph,

    /// Graph over the executable nodes
    graph: DependencyGraph,

    states: NodeStates,

    /// Providers not yet terminal, per node
    remaining: HashMap<NodeId, usize>,

    ready: BinaryHeap<Reverse<(usize, NodeId)>>,

    results: Vec<RunResult>,

    stop: Option<SkipReason>,

    fail_fast: bool,
}

impl<'a> Pass<'a> {
    fn new(project_graph: &'a DependencyGraph, graph: DependencyGraph, fail_fast: bool) -> Self {
        let states = NodeStates::new(graph.all_nodes().iter().cloned());
        let mut pass = Self {
            project_graph,
            remaining: HashMap::new(),
            ready: BinaryHeap::new(),
            results: Vec::new(),
            stop: None,
            fail_fast,
            states,
            graph,
        };

        let order = pass.graph.topological_order().to_vec();
        for id in order {
            let waiting = pass.graph.parents(&id).len();
            pass.remaining.insert(id.clone(), waiting);
            if waiting == 0 {
                pass.advance(&id, NodeState::Pending, NodeState::Ready);
                pass.push_ready(id);
            } else {
                pass.advance(&id, NodeState::Pending, NodeState::Blocked);
            }
        }

        pass
    }

    fn advance(&self, id: &str, from: NodeState, to: NodeState) -> bool {
        match self.states.transition(id, from, to) {
            Ok(()) => true,
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    fn push_ready(&mut self, id: NodeId) {
        let rank = self.project_graph.topo_index(&id).unwrap_or(usize::MAX);
        self.ready.push(Reverse((rank, id)));
    }

    fn next_ready(&mut self) -> Option<NodeId> {
        self.ready.pop().map(|Reverse((_, id))| id)
    }

    fn halt(&mut self, reason: SkipReason) {
        if self.stop.is_none() {
            self.stop = Some(reason);
        }
    }

    /// Stop for an interrupt or deadline, overriding a fail-fast halt
    fn preempt(&mut self, reason: SkipReason) {
        if matches!(self.stop, None | Some(SkipReason::FailFast)) {
            self.stop = Some(reason);
        }
    }

    /// Record a terminal result and release or skip dependents
    fn finish(&mut self, result: RunResult) {
        let id = result.unique_id.clone();
        let status = result.status;

        match status {
            RunStatus::Error | RunStatus::Fail => {
                warn!(node = %id, status = %status, "{}", result.message.as_deref().unwrap_or_default())
            }
            _ => info!(node = %id, status = %status, "{:.2}s", result.execution_time),
        }
        self.results.push(result);

        if status.blocks_dependents() {
            // Work cancelled by a stop is attributed to the stop
            let reason = match &self.stop {
                Some(stop @ (SkipReason::Interrupted | SkipReason::TimedOut)) => stop.clone(),
                _ => SkipReason::UpstreamFailed { upstream: id.clone() },
            };

            for downstream in self.graph.downstream(&id) {
                if self.states.finish_unstarted(&downstream, RunStatus::Skipped) {
                    let reason = reason.clone();
                    debug!(node = %downstream, "{}", reason);
                    self.results.push(RunResult::skipped(downstream, reason));
                }
            }

            if self.fail_fast && status.is_failure() {
                self.halt(SkipReason::FailFast);
            }
        }

        let children = self.graph.children(&id).to_vec();
        for child in children {
            let Some(waiting) = self.remaining.get_mut(&child) else {
                continue;
            };
            *waiting = waiting.saturating_sub(1);
            if *waiting == 0 && self.advance(&child, NodeState::Blocked, NodeState::Ready) {
                self.push_ready(child);
            }
        }
    }

    /// Close out every node left unfinished when dispatch stopped
    fn sweep(&mut self) {
        let reason = self.stop.clone().unwrap_or(SkipReason::NotDispatched);
        let order = self.graph.topological_order().to_vec();

        for id in order {
            match self.states.get(&id) {
                Some(NodeState::Running) => {
                    self.advance(&id, NodeState::Running, NodeState::Done(RunStatus::Error));
                    self.finish(RunResult::errored(&id, "execution task ended without a result"));
                }
                Some(NodeState::Done(_)) | None => {}
                Some(_) => {
                    if self.states.finish_unstarted(&id, RunStatus::Skipped) {
                        self.results.push(RunResult::skipped(id, reason.clone()));
                    }
                }
            }
        }
    }
}

/// Ancestors of the selection that this pass does not execute
fn referenced_ancestors(graph: &DependencyGraph, selection: &Selection, executable: &HashSet<NodeId>) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut referenced: Vec<NodeId> = selection
        .ids()
        .iter()
        .flat_map(|id| graph.upstream(id))
        .filter(|id| !executable.contains(id) && !selection.contains(id))
        .filter(|id| seen.insert(id.clone()))
        .collect();

    referenced.sort_by_key(|id| graph.topo_index(id).unwrap_or(usize::MAX));
    referenced
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn execute_node(executor: &dyn Executor, node: &Node, sql: &str, slot: usize) -> RunResult {
    let started_at = Utc::now();
    let clock = Instant::now();
    let outcome = executor.execute(sql, node).await;
    let execution_time = clock.elapsed().as_secs_f64();
    let timing = vec![TimingInfo::new("execute", started_at, Utc::now())];

    let mut result = RunResult {
        unique_id: node.unique_id.clone(),
        status: RunStatus::Error,
        timing,
        thread_id: format!("Thread-{}", slot),
        execution_time,
        message: None,
        adapter_response: None,
        failures: None,
        skip_reason: None,
    };

    match outcome {
        Ok(outcome) => {
            result.status = status_for(node, &outcome);
            result.message = Some(match (result.status, outcome.failures) {
                (RunStatus::Fail | RunStatus::Warn, Some(n)) => {
                    format!("Got {} result{}, configured to {} if != 0", n, if n == 1 { "" } else { "s" }, result.status)
                }
                _ => outcome.response.message.clone(),
            });
            result.failures = outcome.failures;
            result.adapter_response = Some(outcome.response);
        }
        Err(e) => result.message = Some(e.to_string()),
    }

    result
}

/// Data tests pass, warn or fail on their failing row count
fn status_for(node: &Node, outcome: &ExecutionOutcome) -> RunStatus {
    if node.resource_type != ResourceType::Test {
        return RunStatus::Success;
    }

    match outcome.failures.unwrap_or(0) {
        0 => RunStatus::Pass,
        _ if node.test_severity() == TestSeverity::Warn => RunStatus::Warn,
        _ => RunStatus::Fail,
    }
}
