//! Template compilation for node bodies
//!
//! This crate handles:
//! - Rendering node templates with `ref`, `source`, `doc`, `var`, `env_var`,
//!   `config` and `is_incremental`
//! - Making user macros callable from any node that depends on them
//! - Inlining ephemeral models as CTEs
//! - Reporting render failures per node

pub mod compiler;
pub mod context;
pub mod functions;

pub use compiler::{
    inject_ctes, render_descriptions, CompilationError, CompileOutput, CompiledNode, CompiledNodes, Compiler,
    InjectedCte,
};
pub use context::{CompileContext, CompileContextBuilder};
pub use functions::{ephemeral_identifier, EPHEMERAL_PREFIX};
