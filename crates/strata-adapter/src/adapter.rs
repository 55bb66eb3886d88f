//! Executor trait for running compiled statements against a target

use crate::relation::Relation;
use serde::{Deserialize, Serialize};
use strata_core::Node;

/// What the target system reported for one statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterResponse {
    /// Status message (e.g. "INSERT 0 42")
    #[serde(rename = "_message")]
    pub message: String,

    /// Status code, adapter specific
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

impl AdapterResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            rows_affected: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_rows_affected(mut self, rows: u64) -> Self {
        self.rows_affected = Some(rows);
        self
    }
}

/// Successful execution of one node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub response: AdapterResponse,

    /// Failing row count, reported for data tests only
    pub failures: Option<u64>,
}

impl ExecutionOutcome {
    pub fn success(response: AdapterResponse) -> Self {
        Self {
            response,
            failures: None,
        }
    }

    /// Outcome of a data test returning `failures` rows
    pub fn test(failures: u64) -> Self {
        Self {
            response: AdapterResponse::new(format!("{} failing rows", failures)),
            failures: Some(failures),
        }
    }
}

/// Errors that can occur while executing a statement
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Unsupported node: {0}")]
    Unsupported(String),
}

/// Capability the engine requires from its environment
///
/// Implementations own the connection pool. The engine never has more than
/// [`Executor::connection_budget`] calls to [`Executor::execute`] in flight.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Get the executor name (e.g., "postgres", "mock")
    fn name(&self) -> &'static str;

    /// Run a compiled statement for a node
    async fn execute(&self, compiled_sql: &str, node: &Node) -> Result<ExecutionOutcome, ExecutionError>;

    /// Maximum number of concurrent sessions
    fn connection_budget(&self) -> usize;

    /// Render a relation the way the target expects it
    fn relation_name(&self, relation: &Relation) -> String {
        relation.render()
    }

    /// Ask in-flight work to stop at the next safe point
    async fn cancel(&self) {}
}
