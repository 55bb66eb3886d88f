//! Template functions
//!
//! Implements `ref()`, `source()`, `doc()`, `var()`, `env_var()` and
//! `config()` against a shared, read-only scope. `is_incremental()` depends on
//! the node being rendered and is placed in its context instead.

use minijinja::{Error, ErrorKind, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use strata_core::{Materialization, Node};
use strata_graph::SymbolTable;

/// Marker in errors raised for references that do not resolve
pub(crate) const UNRESOLVED: &str = "unresolved reference";

/// Prefix of the inline name given to ephemeral models
pub const EPHEMERAL_PREFIX: &str = "__dbt__cte__";

/// Read-only data the functions resolve against
pub(crate) struct Scope {
    pub symbols: Arc<SymbolTable>,

    /// unique_id -> rendered relation name
    pub relations: HashMap<String, String>,

    pub vars: BTreeMap<String, serde_json::Value>,

    pub full_refresh: bool,
}

/// Inline name of an ephemeral model
pub fn ephemeral_identifier(node: &Node) -> String {
    format!("{}{}", EPHEMERAL_PREFIX, node.name)
}

fn string_args<'a>(function: &str, args: &'a [Value], min: usize, max: usize) -> Result<Vec<&'a str>, Error> {
    // Keyword arguments (e.g. `version=2`) arrive as a trailing map and are ignored
    let strings: Vec<&str> = args.iter().filter_map(|v| v.as_str()).collect();

    if strings.len() < min || strings.len() > max {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("{}() takes {} to {} string arguments, got {}", function, min, max, strings.len()),
        ));
    }

    Ok(strings)
}

fn relation_value(scope: &Scope, node: &Node) -> Result<Value, Error> {
    if node.is_ephemeral_model() {
        return Ok(Value::from(ephemeral_identifier(node)));
    }

    scope
        .relations
        .get(&node.unique_id)
        .map(|r| Value::from(r.as_str()))
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidOperation,
                format!("{}: {} has no relation", UNRESOLVED, node.unique_id),
            )
        })
}

/// ref() function - references another model, seed or snapshot
///
/// Usage in Jinja: {{ ref('model_name') }} or {{ ref('package', 'model_name') }}
/// Returns: the provider's relation, or its inline CTE name when ephemeral
pub(crate) fn ref_function(scope: &Scope, args: &[Value]) -> Result<Value, Error> {
    let strings = string_args("ref", args, 1, 2)?;
    let name = strings[strings.len() - 1];
    let package = if strings.len() == 2 { Some(strings[0]) } else { None };

    let node = scope.symbols.lookup_ref(name, package).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("{}: ref('{}') {}", UNRESOLVED, name, e),
        )
    })?;

    relation_value(scope, node)
}

/// source() function - references a source table
///
/// Usage in Jinja: {{ source('source_name', 'table_name') }}
pub(crate) fn source_function(scope: &Scope, args: &[Value]) -> Result<Value, Error> {
    let strings = string_args("source", args, 2, 2)?;

    let node = scope.symbols.lookup_source(strings[0], strings[1], None).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("{}: source('{}', '{}') {}", UNRESOLVED, strings[0], strings[1], e),
        )
    })?;

    relation_value(scope, node)
}

/// doc() function - inserts a docs block
///
/// Usage in Jinja: {{ doc('name') }} or {{ doc('package', 'name') }}
/// Resolves the same way the resolver does, so a bare name found in two
/// packages is an error here too.
pub(crate) fn doc_function(symbols: &SymbolTable, args: &[Value]) -> Result<Value, Error> {
    let strings = string_args("doc", args, 1, 2)?;
    let name = strings[strings.len() - 1];
    let package = if strings.len() == 2 { Some(strings[0]) } else { None };

    let doc = symbols.lookup_doc(name, package).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("{}: doc('{}') {}", UNRESOLVED, strings.join("', '"), e),
        )
    })?;

    Ok(Value::from(doc.raw_code.as_deref().unwrap_or_default()))
}

/// var() function - accesses project variables
///
/// Usage in Jinja: {{ var('variable_name') }} or {{ var('variable_name', 'default') }}
pub(crate) fn var_function(scope: &Scope, name: &str, default: Option<Value>) -> Result<Value, Error> {
    if let Some(value) = scope.vars.get(name) {
        return Ok(Value::from_serialize(value));
    }

    default.ok_or_else(|| {
        Error::new(
            ErrorKind::UndefinedError,
            format!("Required var '{}' not found in config", name),
        )
    })
}

/// env_var() function - reads a process environment variable
pub(crate) fn env_var_function(name: &str, default: Option<Value>) -> Result<Value, Error> {
    match std::env::var(name) {
        Ok(value) => Ok(Value::from(value)),
        Err(_) => default.ok_or_else(|| {
            Error::new(
                ErrorKind::UndefinedError,
                format!("Env var required but not provided: '{}'", name),
            )
        }),
    }
}

/// is_incremental() - true when an incremental model updates an existing relation
pub(crate) fn is_incremental(scope: &Scope, node: &Node) -> bool {
    !scope.full_refresh && node.materialization() == Materialization::Incremental
}

/// Register every function on an environment
pub(crate) fn register(env: &mut minijinja::Environment<'_>, scope: Arc<Scope>) {
    use minijinja::value::Rest;

    let s = Arc::clone(&scope);
    env.add_function("ref", move |args: Rest<Value>| ref_function(&s, &args));

    let s = Arc::clone(&scope);
    env.add_function("source", move |args: Rest<Value>| source_function(&s, &args));

    let s = Arc::clone(&scope);
    env.add_function("doc", move |args: Rest<Value>| doc_function(&s.symbols, &args));

    let s = Arc::clone(&scope);
    env.add_function("var", move |name: String, default: Option<Value>| var_function(&s, &name, default));

    env.add_function("env_var", |name: String, default: Option<Value>| env_var_function(&name, default));

    // config() only carries metadata, already applied during resolution
    env.add_function("config", |_args: Rest<Value>| Value::from(""));

    // Overridden per node by the render context
    env.add_function("is_incremental", || false);
}
