//! strata core
//!
//! Core domain model with stable, versioned types:
//! - Node declarations (the input boundary) and resolved nodes
//! - Diagnostic codes for every node-scoped and build-time failure
//! - Project and run configuration
//!
//! Never rename diagnostic codes - they are part of the public API.

pub mod config;
pub mod diagnostic;
pub mod node;

pub use config::{Config, ConfigError, ProjectSection, RunConfig, TargetConfig};
pub use diagnostic::{Diagnostic, DiagnosticCode, Location, Severity};
pub use node::{
    source_unique_id, unique_id, ColumnInfo, Declaration, DeclarationError, DependsOn, DocCall,
    Materialization, Node, NodeConfig, NodeConfigError, Owner, RefCall, ResourceType, SourceCall,
    TestSeverity,
};
