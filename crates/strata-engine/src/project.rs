//! Project loading, graph construction and node selection

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_adapter::Executor;
use strata_core::{Declaration, Diagnostic, Node, RunConfig};
use strata_graph::{DependencyGraph, GraphError, NodeId, ResolutionError, Resolver, SymbolError, SymbolTable};
use strata_jinja::{render_descriptions, CompilationError, CompileContext, CompileOutput, Compiler};
use tracing::{debug, info};

/// The declarations document produced by the parsing front end
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclarationsFile {
    #[serde(default)]
    pub project_name: Option<String>,

    pub declarations: Vec<Declaration>,

    /// Named selector definitions, carried into the manifest as-is
    #[serde(default)]
    pub selectors: BTreeMap<String, serde_json::Value>,
}

impl DeclarationsFile {
    pub fn from_file(path: &Path) -> Result<Self, ProjectError> {
        let content = std::fs::read_to_string(path).map_err(|e| ProjectError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        serde_json::from_str(&content).map_err(|e| ProjectError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("Failed to read {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Errors that leave no valid graph to act on
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Symbols(#[from] SymbolError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl BuildError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            Self::Symbols(e) => e.to_diagnostic(),
            Self::Graph(e) => e.to_diagnostic(),
        }
    }
}

/// Resolved project for one invocation
#[derive(Debug)]
pub struct Project {
    pub name: String,

    pub symbols: Arc<SymbolTable>,

    pub graph: DependencyGraph,

    /// Node-scoped reference errors, in declaration order
    pub resolution_errors: Vec<ResolutionError>,

    /// Failures rendering `doc()` in descriptions
    pub description_errors: Vec<CompilationError>,

    pub selectors: BTreeMap<String, serde_json::Value>,
}

impl Project {
    /// Register, resolve and build the graph
    ///
    /// Duplicate identifiers and cycles are fatal; unresolved references are
    /// recorded against their nodes.
    pub fn build(name: impl Into<String>, declarations: Vec<Declaration>) -> Result<Self, BuildError> {
        let name = name.into();
        info!(project = %name, declarations = declarations.len(), "building project");

        let mut symbols = SymbolTable::from_declarations(declarations)?;
        let resolution_errors = Resolver::new().resolve(&mut symbols);
        let description_errors = render_descriptions(&mut symbols);
        let graph = DependencyGraph::build(&symbols)?;

        info!(
            nodes = symbols.len(),
            graph_nodes = graph.len(),
            resolution_errors = resolution_errors.len(),
            "graph built"
        );

        Ok(Self {
            name,
            symbols: Arc::new(symbols),
            graph,
            resolution_errors,
            description_errors,
            selectors: BTreeMap::new(),
        })
    }

    /// Build from a declarations document, falling back to `default_name`
    pub fn from_declarations(file: DeclarationsFile, default_name: &str) -> Result<Self, BuildError> {
        let name = file.project_name.unwrap_or_else(|| default_name.to_string());
        let mut project = Self::build(name, file.declarations)?;
        project.selectors = file.selectors;
        Ok(project)
    }

    /// Node-scoped diagnostics accumulated while building
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.resolution_errors
            .iter()
            .map(ResolutionError::to_diagnostic)
            .chain(self.description_errors.iter().map(CompilationError::to_diagnostic))
            .collect()
    }

    pub fn select(&self, run: &RunConfig) -> Selection {
        Selection::resolve(self, run)
    }

    /// Compile the selected nodes that have a template body
    pub fn compile(&self, selection: &Selection, context: CompileContext, executor: &dyn Executor) -> CompileOutput {
        let ids: Vec<NodeId> = selection
            .ids()
            .iter()
            .filter(|id| self.symbols.get(id).is_some_and(|n| n.raw_code.is_some()))
            .cloned()
            .collect();

        info!(nodes = ids.len(), "compiling");
        let compiler = Compiler::new(Arc::clone(&self.symbols), context, executor);
        compiler.compile(&ids)
    }
}

/// Graph nodes chosen for an invocation, in topological order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    ids: Vec<NodeId>,
    members: HashSet<NodeId>,
}

impl Selection {
    /// Apply `select`, `exclude` and `resource_types` to the graph
    ///
    /// A criterion matches a node by unique id, by name, by `tag:<tag>` or by
    /// `package:<package>`. An empty `select` matches every node.
    pub fn resolve(project: &Project, run: &RunConfig) -> Self {
        let ids = project
            .graph
            .topological_order()
            .iter()
            .filter(|id| {
                let Some(node) = project.symbols.get(id) else {
                    return false;
                };

                let kind_allowed = run.resource_types.is_empty() || run.resource_types.contains(&node.resource_type);
                let included = run.select.is_empty() || run.select.iter().any(|c| matches_criterion(node, c));
                let excluded = run.exclude.iter().any(|c| matches_criterion(node, c));

                kind_allowed && included && !excluded
            })
            .cloned()
            .collect();

        let selection = Self::from_ids(ids);
        debug!(selected = selection.len(), "selection resolved");
        selection
    }

    /// Selection of exactly these ids, kept in the given order
    pub fn from_ids(ids: Vec<NodeId>) -> Self {
        let members = ids.iter().cloned().collect();
        Self { ids, members }
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.members.contains(unique_id)
    }

    pub fn members(&self) -> &HashSet<NodeId> {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn matches_criterion(node: &Node, criterion: &str) -> bool {
    if let Some(tag) = criterion.strip_prefix("tag:") {
        return node.config.tags.iter().any(|t| t == tag);
    }
    if let Some(package) = criterion.strip_prefix("package:") {
        return node.package_name == package;
    }
    node.unique_id == criterion || node.name == criterion
}
