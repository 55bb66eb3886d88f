//! Executor capability for running compiled nodes
//!
//! The engine never talks to a target system directly. It hands each compiled
//! statement to an [`Executor`], which owns connections and dialect details
//! such as relation quoting.
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_adapter::{Executor, MockExecutor};
//!
//! let executor = MockExecutor::new().with_failure("model.shop.orders", "relation does not exist");
//! let outcome = executor.execute("select 1", &node).await;
//! ```

pub mod adapter;
pub mod dry_run;
pub mod mock;
pub mod relation;

pub use adapter::{AdapterResponse, ExecutionError, ExecutionOutcome, Executor};
pub use dry_run::DryRunExecutor;
pub use mock::MockExecutor;
pub use relation::Relation;
