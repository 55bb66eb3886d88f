//! Executor that accepts every statement without running it
//!
//! Used by the CLI when no target connection is configured: the whole
//! pipeline runs, artifacts are written, and nothing touches a database.

use crate::adapter::{AdapterResponse, ExecutionError, ExecutionOutcome, Executor};
use std::sync::atomic::{AtomicBool, Ordering};
use strata_core::{Node, ResourceType};
use tracing::debug;

pub struct DryRunExecutor {
    connection_budget: usize,
    cancelled: AtomicBool,
}

impl DryRunExecutor {
    pub fn new(connection_budget: usize) -> Self {
        Self {
            connection_budget: connection_budget.max(1),
            cancelled: AtomicBool::new(false),
        }
    }
}

impl Default for DryRunExecutor {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

#[async_trait::async_trait]
impl Executor for DryRunExecutor {
    fn name(&self) -> &'static str {
        "dry_run"
    }

    async fn execute(&self, compiled_sql: &str, node: &Node) -> Result<ExecutionOutcome, ExecutionError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ExecutionError::Cancelled);
        }

        debug!(node = %node.unique_id, bytes = compiled_sql.len(), "dry run");

        if node.resource_type == ResourceType::Test {
            return Ok(ExecutionOutcome::test(0));
        }

        Ok(ExecutionOutcome::success(
            AdapterResponse::new(format!("DRY RUN {}", node.materialization())).with_code("DRY_RUN"),
        ))
    }

    fn connection_budget(&self) -> usize {
        self.connection_budget
    }

    async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Declaration;

    #[tokio::test]
    async fn reports_materialization() {
        let executor = DryRunExecutor::new(2);
        let node = Node::from_declaration(Declaration::new(ResourceType::Seed, "shop", "countries"), 0).unwrap();

        let outcome = executor.execute("", &node).await.unwrap();
        assert_eq!(outcome.response.message, "DRY RUN seed");
        assert_eq!(executor.connection_budget(), 2);
    }

    #[tokio::test]
    async fn refuses_work_after_cancel() {
        let executor = DryRunExecutor::default();
        executor.cancel().await;

        let node = Node::from_declaration(Declaration::new(ResourceType::Model, "shop", "a"), 0).unwrap();
        assert_eq!(executor.execute("", &node).await, Err(ExecutionError::Cancelled));
    }
}
