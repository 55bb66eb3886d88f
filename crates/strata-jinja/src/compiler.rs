//! Node compilation
//!
//! Renders each node's template body to an executable statement. References
//! become concrete relation names; ephemeral providers are inlined as CTEs.

use crate::context::{CompileContext, ModelContext};
use crate::functions::{self, ephemeral_identifier, Scope, UNRESOLVED};
use minijinja::value::Rest;
use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use strata_adapter::{Executor, Relation};
use strata_core::{Diagnostic, DiagnosticCode, Location, Node, ResourceType};
use strata_graph::SymbolTable;
use tracing::{debug, warn};

/// Per-node compilation failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompilationError {
    #[error("Compilation Error in {node_id}: {message}")]
    Render {
        node_id: String,
        message: String,
        file: String,
        line: Option<usize>,
    },

    #[error("Undefined variable in {node_id}: {message}")]
    UndefinedVariable { node_id: String, message: String },

    #[error("Unresolved reference in {node_id}: {message}")]
    UnresolvedReference { node_id: String, message: String },

    #[error("{node_id} was already compiled in this pass")]
    AlreadyCompiled { node_id: String },
}

impl CompilationError {
    pub fn node_id(&self) -> &str {
        match self {
            Self::Render { node_id, .. }
            | Self::UndefinedVariable { node_id, .. }
            | Self::UnresolvedReference { node_id, .. }
            | Self::AlreadyCompiled { node_id } => node_id,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            Self::Render { file, line, .. } => {
                let location = match line {
                    Some(line) => Location::with_line(file.clone(), *line),
                    None => Location::new(file.clone()),
                };
                Diagnostic::error(DiagnosticCode::CompilationError, self.to_string())
                    .for_node(self.node_id())
                    .with_location(location)
            }
            Self::UndefinedVariable { .. } => {
                Diagnostic::error(DiagnosticCode::UndefinedVariable, self.to_string()).for_node(self.node_id())
            }
            Self::UnresolvedReference { .. } | Self::AlreadyCompiled { .. } => {
                Diagnostic::error(DiagnosticCode::CompilationError, self.to_string()).for_node(self.node_id())
            }
        }
    }

    fn from_render(node: &Node, err: minijinja::Error) -> Self {
        let message = err.to_string();
        let node_id = node.unique_id.clone();

        if message.contains(UNRESOLVED) {
            return Self::UnresolvedReference {
                node_id,
                message: err.detail().unwrap_or(&message).to_string(),
            };
        }

        if err.kind() == ErrorKind::UndefinedError {
            return Self::UndefinedVariable { node_id, message };
        }

        Self::Render {
            node_id,
            message,
            file: node.original_file_path.clone(),
            line: err.line(),
        }
    }
}

/// An ephemeral provider inlined into a statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectedCte {
    pub id: String,
    pub sql: String,
}

/// Compiled statement of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledNode {
    pub unique_id: String,

    pub compiled_code: String,

    /// Rendered relation, absent for ephemeral models and tests
    pub relation_name: Option<String>,

    pub extra_ctes: Vec<InjectedCte>,
}

/// Compiled nodes of one pass; each node is compiled at most once
#[derive(Debug, Clone, Default)]
pub struct CompiledNodes {
    inner: BTreeMap<String, CompiledNode>,
}

impl CompiledNodes {
    pub fn insert(&mut self, node: CompiledNode) -> Result<(), CompilationError> {
        if self.inner.contains_key(&node.unique_id) {
            return Err(CompilationError::AlreadyCompiled {
                node_id: node.unique_id,
            });
        }
        self.inner.insert(node.unique_id.clone(), node);
        Ok(())
    }

    pub fn get(&self, unique_id: &str) -> Option<&CompiledNode> {
        self.inner.get(unique_id)
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.inner.contains_key(unique_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledNode> {
        self.inner.values()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Result of compiling a set of nodes
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub compiled: CompiledNodes,

    /// One entry per failed node, in compile order
    pub errors: Vec<CompilationError>,
}

impl CompileOutput {
    pub fn error_for(&self, unique_id: &str) -> Option<&CompilationError> {
        self.errors.iter().find(|e| e.node_id() == unique_id)
    }
}

/// Template compiler for one invocation
pub struct Compiler {
    scope: Arc<Scope>,

    context: CompileContext,

    /// macro unique_id -> template source
    macro_sources: Vec<(String, String)>,
}

impl Compiler {
    /// Create a compiler over resolved symbols
    ///
    /// Relation names are rendered once, through the executor, so quoting
    /// follows the target dialect.
    pub fn new(symbols: Arc<SymbolTable>, context: CompileContext, executor: &dyn Executor) -> Self {
        let relations = symbols
            .nodes()
            .iter()
            .filter(|n| has_relation(n))
            .map(|n| {
                let relation = Relation::for_node(n, &context.target);
                (n.unique_id.clone(), executor.relation_name(&relation))
            })
            .collect();

        let macro_sources = symbols
            .of_kind(ResourceType::Macro)
            .map(|m| {
                let source = format!(
                    "{}{}",
                    import_prefix(&symbols, &m.depends_on.macros),
                    m.raw_code.as_deref().unwrap_or_default()
                );
                (m.unique_id.clone(), source)
            })
            .collect();

        let scope = Scope {
            symbols,
            relations,
            vars: context.vars.clone(),
            full_refresh: context.full_refresh,
        };

        Self {
            scope: Arc::new(scope),
            context,
            macro_sources,
        }
    }

    /// Rendered relation of a node, if it has one
    pub fn relation_name(&self, unique_id: &str) -> Option<&str> {
        self.scope.relations.get(unique_id).map(String::as_str)
    }

    fn environment(&self) -> (Environment<'_>, HashMap<&str, String>) {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        functions::register(&mut env, Arc::clone(&self.scope));

        // A broken macro only fails the nodes that call it
        let mut broken = HashMap::new();
        for (id, source) in &self.macro_sources {
            if let Err(e) = env.add_template(id, source) {
                warn!(macro_id = %id, "macro failed to compile: {}", e);
                broken.insert(id.as_str(), e.to_string());
            }
        }

        (env, broken)
    }

    /// Compile the given nodes
    ///
    /// Nodes without a template body (sources, exposures, metrics) are
    /// skipped. A failure is recorded against its node and compilation of the
    /// remaining nodes continues.
    pub fn compile(&self, ids: &[String]) -> CompileOutput {
        let (env, broken) = self.environment();
        let mut output = CompileOutput::default();
        let mut ephemeral_cache: HashMap<String, Result<String, CompilationError>> = HashMap::new();

        for id in ids {
            let Some(node) = self.scope.symbols.get(id) else {
                continue;
            };
            if !compiles(node) {
                continue;
            }

            let result = self
                .compile_node(&env, &broken, node, &mut ephemeral_cache)
                .and_then(|compiled| output.compiled.insert(compiled));

            match result {
                Ok(()) => debug!(node = %id, "compiled"),
                Err(e) => {
                    warn!(node = %id, "{}", e);
                    output.errors.push(e);
                }
            }
        }

        output
    }

    fn compile_node(
        &self,
        env: &Environment<'_>,
        broken: &HashMap<&str, String>,
        node: &Node,
        ephemeral_cache: &mut HashMap<String, Result<String, CompilationError>>,
    ) -> Result<CompiledNode, CompilationError> {
        let sql = self.render(env, broken, node)?;

        let mut extra_ctes = Vec::new();
        for provider in self.ephemeral_ancestors(node) {
            let rendered = ephemeral_cache
                .entry(provider.unique_id.clone())
                .or_insert_with(|| self.render(env, broken, provider))
                .clone();

            let provider_sql = rendered.map_err(|e| CompilationError::Render {
                node_id: node.unique_id.clone(),
                message: format!("ephemeral dependency {} failed to compile: {}", provider.unique_id, e),
                file: node.original_file_path.clone(),
                line: None,
            })?;

            extra_ctes.push(InjectedCte {
                id: provider.unique_id.clone(),
                sql: provider_sql,
            });
        }

        let names: Vec<(String, &str)> = extra_ctes
            .iter()
            .filter_map(|cte| {
                let provider = self.scope.symbols.get(&cte.id)?;
                Some((ephemeral_identifier(provider), cte.sql.as_str()))
            })
            .collect();

        let relation_name = if node.is_ephemeral_model() || node.resource_type == ResourceType::Test {
            None
        } else {
            self.relation_name(&node.unique_id).map(str::to_string)
        };

        Ok(CompiledNode {
            unique_id: node.unique_id.clone(),
            compiled_code: inject_ctes(&sql, &names),
            relation_name,
            extra_ctes,
        })
    }

    fn render(&self, env: &Environment<'_>, broken: &HashMap<&str, String>, node: &Node) -> Result<String, CompilationError> {
        for macro_id in &node.depends_on.macros {
            if let Some(message) = broken.get(macro_id.as_str()) {
                return Err(CompilationError::Render {
                    node_id: node.unique_id.clone(),
                    message: format!("macro {} failed to compile: {}", macro_id, message),
                    file: node.original_file_path.clone(),
                    line: None,
                });
            }
        }

        let Some(raw_code) = node.raw_code.as_deref() else {
            return Ok(String::new());
        };

        let source = format!("{}{}", import_prefix(&self.scope.symbols, &node.depends_on.macros), raw_code);

        let this = if node.is_ephemeral_model() {
            Value::from(ephemeral_identifier(node))
        } else {
            self.scope
                .relations
                .get(&node.unique_id)
                .map(|r| Value::from(r.as_str()))
                .unwrap_or(Value::from(()))
        };

        let incremental = functions::is_incremental(&self.scope, node);
        let ctx: Value = [
            ("this", this),
            ("target", Value::from_serialize(&self.context.target)),
            ("model", Value::from_serialize(ModelContext::new(node))),
            ("is_incremental", Value::from_function(move || incremental)),
        ]
        .into_iter()
        .collect();

        env.render_named_str(&node.unique_id, &source, ctx)
            .map_err(|e| CompilationError::from_render(node, e))
    }

    /// Ephemeral models this node reads from, providers first
    fn ephemeral_ancestors(&self, node: &Node) -> Vec<&Node> {
        let mut visited = HashSet::new();
        let mut ordered = Vec::new();
        self.visit_ephemeral(node, &mut visited, &mut ordered);
        ordered
    }

    fn visit_ephemeral<'a>(&'a self, node: &Node, visited: &mut HashSet<String>, ordered: &mut Vec<&'a Node>) {
        for parent_id in &node.depends_on.nodes {
            let Some(parent) = self.scope.symbols.get(parent_id) else {
                continue;
            };
            if !parent.is_ephemeral_model() || !visited.insert(parent_id.clone()) {
                continue;
            }
            self.visit_ephemeral(parent, visited, ordered);
            ordered.push(parent);
        }
    }
}

fn has_relation(node: &Node) -> bool {
    matches!(
        node.resource_type,
        ResourceType::Source | ResourceType::Model | ResourceType::Seed | ResourceType::Snapshot
    )
}

fn compiles(node: &Node) -> bool {
    node.raw_code.is_some() || node.resource_type.is_executable()
}

/// `{% from "<macro id>" import <name> %}` for each macro, on one line so
/// template line numbers are unchanged
fn import_prefix(symbols: &SymbolTable, macro_ids: &[String]) -> String {
    macro_ids
        .iter()
        .filter_map(|id| symbols.get(id))
        .map(|m| format!("{{% from \"{}\" import {} %}}", m.unique_id, m.name))
        .collect()
}

/// Prepend ephemeral CTEs to a statement
///
/// A statement that already opens with `with` gets the CTEs merged into its
/// existing list.
pub fn inject_ctes(sql: &str, ctes: &[(String, &str)]) -> String {
    if ctes.is_empty() {
        return sql.to_string();
    }

    let definitions = ctes
        .iter()
        .map(|(name, body)| format!("{} as (\n{}\n)", name, body.trim()))
        .collect::<Vec<_>>()
        .join(",\n");

    let body = sql.trim_start();
    match strip_leading_with(body) {
        Some(rest) => format!("with {},\n{}", definitions, rest.trim_start()),
        None => format!("with {}\n{}", definitions, body),
    }
}

fn strip_leading_with(sql: &str) -> Option<&str> {
    let keyword = sql.get(..4)?;
    let rest = &sql[4..];
    if keyword.eq_ignore_ascii_case("with") && rest.starts_with(char::is_whitespace) {
        Some(rest)
    } else {
        None
    }
}

/// Render `{{ doc() }}` calls inside node and column descriptions
pub fn render_descriptions(symbols: &mut SymbolTable) -> Vec<CompilationError> {
    // Descriptions are rewritten in place, so lookups go to a snapshot
    let lookup = Arc::new(symbols.clone());

    let mut env = Environment::new();
    env.add_function("doc", move |args: Rest<Value>| functions::doc_function(&lookup, &args));

    let mut errors = Vec::new();
    for node in symbols.nodes_mut() {
        let rendered = render_text(&env, &node.description);
        match rendered {
            Ok(Some(text)) => node.description = text,
            Ok(None) => {}
            Err(e) => errors.push(CompilationError::from_render(node, e)),
        }

        let mut column_errors = Vec::new();
        for column in node.columns.values_mut() {
            match render_text(&env, &column.description) {
                Ok(Some(text)) => column.description = text,
                Ok(None) => {}
                Err(e) => column_errors.push(e),
            }
        }
        for e in column_errors {
            errors.push(CompilationError::from_render(node, e));
        }
    }

    errors
}

fn render_text(env: &Environment<'_>, text: &str) -> Result<Option<String>, minijinja::Error> {
    if !text.contains("{{") && !text.contains("{%") {
        return Ok(None);
    }
    env.render_str(text, minijinja::context! {}).map(Some)
}
