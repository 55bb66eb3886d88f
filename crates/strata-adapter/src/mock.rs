//! Mock executor for testing
//!
//! Runs nothing. It records every call and returns programmed outcomes, which
//! makes it useful for:
//! - Unit testing the scheduler without a target system
//! - Simulating failures, slow nodes and failing data tests
//! - Checking that the concurrency budget is honored
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strata_adapter::MockExecutor;
//!
//! let executor = MockExecutor::new()
//!     .with_failure("model.shop.orders", "division by zero")
//!     .with_test_failures("test.shop.not_null_id", 3)
//!     .with_latency(20);
//!
//! // ... run the engine ...
//! assert_eq!(executor.calls(), vec!["model.shop.customers"]);
//! assert!(executor.max_in_flight() <= 4);
//! ```

use crate::adapter::{AdapterResponse, ExecutionError, ExecutionOutcome, Executor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_core::{Node, ResourceType};
use tokio::sync::{Notify, RwLock};

/// Mock executor for testing
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another.
#[derive(Clone)]
pub struct MockExecutor {
    /// Errors to return for specific unique ids
    failures: Arc<RwLock<HashMap<String, ExecutionError>>>,

    /// Failing row counts for specific tests
    test_failures: Arc<RwLock<HashMap<String, u64>>>,

    /// Latency for specific unique ids (milliseconds)
    node_latency: Arc<RwLock<HashMap<String, u64>>>,

    /// Latency for every call (milliseconds)
    latency_ms: u64,

    /// Unique ids in call order
    calls: Arc<Mutex<Vec<String>>>,

    /// Compiled statements by unique id
    statements: Arc<Mutex<HashMap<String, String>>>,

    in_flight: Arc<AtomicUsize>,

    max_in_flight: Arc<AtomicUsize>,

    cancelled: Arc<AtomicBool>,

    cancel_signal: Arc<Notify>,

    connection_budget: usize,

    adapter_name: &'static str,
}

impl MockExecutor {
    /// Create a mock executor where every node succeeds
    pub fn new() -> Self {
        Self {
            failures: Arc::new(RwLock::new(HashMap::new())),
            test_failures: Arc::new(RwLock::new(HashMap::new())),
            node_latency: Arc::new(RwLock::new(HashMap::new())),
            latency_ms: 0,
            calls: Arc::new(Mutex::new(Vec::new())),
            statements: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_signal: Arc::new(Notify::new()),
            connection_budget: usize::MAX,
            adapter_name: "mock",
        }
    }

    /// Fail a node with a database error
    pub fn with_failure(self, unique_id: &str, message: &str) -> Self {
        self.failures
            .try_write()
            .map(|mut f| f.insert(unique_id.to_string(), ExecutionError::Database(message.to_string())))
            .ok();
        self
    }

    /// Make a data test report failing rows
    pub fn with_test_failures(self, unique_id: &str, failures: u64) -> Self {
        self.test_failures
            .try_write()
            .map(|mut f| f.insert(unique_id.to_string(), failures))
            .ok();
        self
    }

    /// Simulated latency for every call
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Simulated latency for one node
    pub fn with_node_latency(self, unique_id: &str, latency_ms: u64) -> Self {
        self.node_latency
            .try_write()
            .map(|mut l| l.insert(unique_id.to_string(), latency_ms))
            .ok();
        self
    }

    /// Limit concurrent sessions
    pub fn with_connection_budget(mut self, budget: usize) -> Self {
        self.connection_budget = budget.max(1);
        self
    }

    /// Set a custom adapter name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.adapter_name = name;
        self
    }

    /// Configure an error for a node after construction
    pub async fn add_failure(&self, unique_id: &str, error: ExecutionError) {
        self.failures.write().await.insert(unique_id.to_string(), error);
    }

    /// Unique ids executed so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Compiled statement the node was executed with
    pub fn statement(&self, unique_id: &str) -> Option<String> {
        self.statements.lock().ok().and_then(|s| s.get(unique_id).cloned())
    }

    /// Highest number of concurrent `execute` calls observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self, unique_id: &str) -> Result<(), ExecutionError> {
        let latency = self
            .node_latency
            .read()
            .await
            .get(unique_id)
            .copied()
            .unwrap_or(self.latency_ms);

        if latency == 0 {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(latency)) => Ok(()),
            _ = self.cancel_signal.notified() => Err(ExecutionError::Cancelled),
        }
    }

    async fn run(&self, node: &Node) -> Result<ExecutionOutcome, ExecutionError> {
        self.simulate_latency(&node.unique_id).await?;

        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ExecutionError::Cancelled);
        }

        if let Some(error) = self.failures.read().await.get(&node.unique_id) {
            return Err(error.clone());
        }

        if node.resource_type == ResourceType::Test {
            let failures = self
                .test_failures
                .read()
                .await
                .get(&node.unique_id)
                .copied()
                .unwrap_or(0);
            return Ok(ExecutionOutcome::test(failures));
        }

        Ok(ExecutionOutcome::success(
            AdapterResponse::new("OK").with_code("MOCK").with_rows_affected(0),
        ))
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &'static str {
        self.adapter_name
    }

    async fn execute(&self, compiled_sql: &str, node: &Node) -> Result<ExecutionOutcome, ExecutionError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(node.unique_id.clone());
        }
        if let Ok(mut statements) = self.statements.lock() {
            statements.insert(node.unique_id.clone(), compiled_sql.to_string());
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.run(node).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn connection_budget(&self) -> usize {
        self.connection_budget
    }

    async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_signal.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Declaration;

    fn node(kind: ResourceType, name: &str) -> Node {
        Node::from_declaration(Declaration::new(kind, "shop", name), 0).unwrap()
    }

    #[tokio::test]
    async fn succeeds_by_default() {
        let executor = MockExecutor::new();
        let outcome = executor.execute("select 1", &node(ResourceType::Model, "a")).await.unwrap();

        assert_eq!(outcome.response.message, "OK");
        assert_eq!(executor.calls(), vec!["model.shop.a"]);
        assert_eq!(executor.statement("model.shop.a").as_deref(), Some("select 1"));
    }

    #[tokio::test]
    async fn programmed_failure() {
        let executor = MockExecutor::new().with_failure("model.shop.a", "boom");
        let err = executor.execute("select 1", &node(ResourceType::Model, "a")).await.unwrap_err();

        assert_eq!(err, ExecutionError::Database("boom".to_string()));
    }

    #[tokio::test]
    async fn test_failure_counts() {
        let executor = MockExecutor::new().with_test_failures("test.shop.unique_id", 4);

        let failing = executor.execute("", &node(ResourceType::Test, "unique_id")).await.unwrap();
        let passing = executor.execute("", &node(ResourceType::Test, "not_null")).await.unwrap();

        assert_eq!(failing.failures, Some(4));
        assert_eq!(passing.failures, Some(0));
    }

    #[tokio::test]
    async fn cancel_interrupts_latency() {
        let executor = MockExecutor::new().with_latency(10_000);
        let handle = executor.clone();

        let task = tokio::spawn(async move { handle.execute("", &node(ResourceType::Model, "slow")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        executor.cancel().await;

        let result = task.await.unwrap();
        assert_eq!(result, Err(ExecutionError::Cancelled));
        assert!(executor.was_cancelled());
    }

    #[tokio::test]
    async fn tracks_concurrency() {
        let executor = MockExecutor::new().with_latency(30);

        let a = node(ResourceType::Model, "a");
        let b = node(ResourceType::Model, "b");
        let (ra, rb) = tokio::join!(executor.execute("", &a), executor.execute("", &b));

        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(executor.max_in_flight(), 2);
    }
}
