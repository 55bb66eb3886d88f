//! Execution engine
//!
//! This crate handles:
//! - Building a project from declarations and selecting nodes
//! - The guarded per-node state machine
//! - Dependency-ordered, bounded-concurrency execution with fail-fast,
//!   interrupt and invocation timeout
//! - Per-node run results

pub mod interrupt;
pub mod project;
pub mod result;
pub mod scheduler;
pub mod state;

pub use interrupt::Interrupt;
pub use project::{BuildError, DeclarationsFile, Project, ProjectError, Selection};
pub use result::{RunOutcome, RunResult, RunStatus, TimingInfo};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use state::{NodeState, NodeStates, SkipReason, TransitionError};
