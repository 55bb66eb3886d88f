//! Symbol table, reference resolution and DAG construction
//!
//! This crate handles:
//! - Registering declared nodes under stable unique ids
//! - Scanning template bodies for `ref`/`source`/`doc`/`metric`/`config` calls
//! - Resolving those calls into dependency edges, accumulating per-node errors
//! - Building the dependency graph, detecting cycles, stable topological order

pub mod dag;
pub mod resolver;
pub mod scan;
pub mod symbols;

pub use dag::{DependencyGraph, GraphError, NodeId};
pub use resolver::{ReferenceTarget, ResolutionError, Resolver};
pub use scan::{scan_expression, scan_template, ScanResult};
pub use symbols::{LookupError, SymbolError, SymbolTable};
