//! Render context for node templates
//!
//! Provides the project-wide values (`target`, `var()`) and the per-node
//! values (`this`, `model`) visible while a template renders.

use serde::Serialize;
use std::collections::BTreeMap;
use strata_core::{Config, Node, NodeConfig, RunConfig, TargetConfig};

/// Project-wide compile context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompileContext {
    /// Project variables, overridden by `--vars`
    pub vars: BTreeMap<String, serde_json::Value>,

    /// Target the invocation runs against
    pub target: TargetConfig,

    /// Rebuild incremental models from scratch
    pub full_refresh: bool,
}

impl CompileContext {
    pub fn new(target: TargetConfig) -> Self {
        Self {
            vars: BTreeMap::new(),
            target,
            full_refresh: false,
        }
    }

    /// Context for one invocation: project config plus effective run options
    pub fn from_run(config: &Config, run: &RunConfig) -> Self {
        Self {
            vars: run.vars.clone(),
            target: TargetConfig {
                threads: run.effective_threads(),
                ..config.target.clone()
            },
            full_refresh: run.full_refresh,
        }
    }

    /// Add a project variable
    pub fn add_var(&mut self, key: impl Into<String>, value: serde_json::Value) -> &mut Self {
        self.vars.insert(key.into(), value);
        self
    }
}

impl Default for CompileContext {
    fn default() -> Self {
        Self::new(TargetConfig::default())
    }
}

/// The `model` variable
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ModelContext<'a> {
    pub unique_id: &'a str,
    pub name: &'a str,
    pub package_name: &'a str,
    pub resource_type: &'static str,
    pub materialized: &'static str,
    pub original_file_path: &'a str,
    pub config: &'a NodeConfig,
}

impl<'a> ModelContext<'a> {
    pub fn new(node: &'a Node) -> Self {
        Self {
            unique_id: &node.unique_id,
            name: &node.name,
            package_name: &node.package_name,
            resource_type: node.resource_type.as_str(),
            materialized: node.materialization().as_str(),
            original_file_path: &node.original_file_path,
            config: &node.config,
        }
    }
}

/// Builder for CompileContext
pub struct CompileContextBuilder {
    context: CompileContext,
}

impl CompileContextBuilder {
    pub fn new() -> Self {
        Self {
            context: CompileContext::default(),
        }
    }

    pub fn var(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.add_var(key, value);
        self
    }

    pub fn target(mut self, target: TargetConfig) -> Self {
        self.context.target = target;
        self
    }

    pub fn target_schema(mut self, schema: impl Into<String>) -> Self {
        self.context.target.schema = schema.into();
        self
    }

    pub fn full_refresh(mut self, full_refresh: bool) -> Self {
        self.context.full_refresh = full_refresh;
        self
    }

    pub fn build(self) -> CompileContext {
        self.context
    }
}

impl Default for CompileContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
