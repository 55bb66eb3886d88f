//! Node data model
//!
//! A [`Declaration`] is what the parsing front end hands to this core. It is
//! turned into a [`Node`] with a stable unique identifier, then annotated with
//! resolved dependencies by the reference resolver.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Kind of declared resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Model,
    Source,
    Seed,
    Snapshot,
    Test,
    Exposure,
    Metric,
    Macro,
    Group,
    Analysis,
    Doc,
}

impl ResourceType {
    /// Stable string form, also used as the unique id prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Source => "source",
            Self::Seed => "seed",
            Self::Snapshot => "snapshot",
            Self::Test => "test",
            Self::Exposure => "exposure",
            Self::Metric => "metric",
            Self::Macro => "macro",
            Self::Group => "group",
            Self::Analysis => "analysis",
            Self::Doc => "doc",
        }
    }

    /// Kinds a `ref()` call may resolve to
    pub fn is_refable(&self) -> bool {
        matches!(self, Self::Model | Self::Seed | Self::Snapshot | Self::Analysis)
    }

    /// Kinds the scheduler may dispatch to the executor
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Model | Self::Seed | Self::Snapshot | Self::Test)
    }

    /// Kinds that take part in the dependency graph
    pub fn is_graph_member(&self) -> bool {
        !matches!(self, Self::Macro | Self::Group | Self::Doc)
    }

    /// Kinds serialized under the manifest `nodes` key
    pub fn is_manifest_node(&self) -> bool {
        matches!(
            self,
            Self::Model | Self::Seed | Self::Snapshot | Self::Test | Self::Analysis
        )
    }

    /// Materialization used when the config does not set one
    pub fn default_materialization(&self) -> Materialization {
        match self {
            Self::Seed => Materialization::Seed,
            Self::Snapshot => Materialization::Snapshot,
            Self::Test => Materialization::Test,
            _ => Materialization::View,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "model" => Ok(Self::Model),
            "source" => Ok(Self::Source),
            "seed" => Ok(Self::Seed),
            "snapshot" => Ok(Self::Snapshot),
            "test" => Ok(Self::Test),
            "exposure" => Ok(Self::Exposure),
            "metric" => Ok(Self::Metric),
            "macro" => Ok(Self::Macro),
            "group" => Ok(Self::Group),
            "analysis" => Ok(Self::Analysis),
            "doc" => Ok(Self::Doc),
            other => Err(format!("unknown resource type '{}'", other)),
        }
    }
}

/// Materialization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Materialization {
    View,
    Table,
    Incremental,
    /// Not materialized; inlined into dependents as a CTE
    Ephemeral,
    Seed,
    Snapshot,
    Test,
}

impl Materialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Table => "table",
            Self::Incremental => "incremental",
            Self::Ephemeral => "ephemeral",
            Self::Seed => "seed",
            Self::Snapshot => "snapshot",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Materialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Materialization {
    type Err = NodeConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(Self::View),
            "table" => Ok(Self::Table),
            "incremental" => Ok(Self::Incremental),
            "ephemeral" => Ok(Self::Ephemeral),
            "seed" => Ok(Self::Seed),
            "snapshot" => Ok(Self::Snapshot),
            "test" => Ok(Self::Test),
            other => Err(NodeConfigError::UnknownMaterialization(other.to_string())),
        }
    }
}

/// Severity of a data test failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestSeverity {
    Warn,
    #[default]
    Error,
}

/// Declared node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Whether the node is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Materialization strategy (kind default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materialized: Option<Materialization>,

    /// Custom schema, appended to the target schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Database override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Output relation name override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,

    /// Group membership
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Test severity (tests only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<TestSeverity>,

    /// Any other literal config keys
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            materialized: None,
            schema: None,
            database: None,
            alias: None,
            tags: Vec::new(),
            meta: BTreeMap::new(),
            group: None,
            severity: None,
            extra: BTreeMap::new(),
        }
    }
}

impl NodeConfig {
    /// Apply a `config(key=value)` call found inside a template body.
    ///
    /// Keys already set by the declaration are left untouched.
    pub fn apply_inline(&mut self, key: &str, value: serde_json::Value) -> Result<(), NodeConfigError> {
        match key {
            "enabled" => {
                // Declared default is `true`, so an inline value always applies
                self.enabled = value.as_bool().ok_or_else(|| NodeConfigError::InvalidType {
                    key: key.to_string(),
                    expected: "a boolean",
                })?;
            }
            "materialized" => {
                if self.materialized.is_none() {
                    let text = expect_str(key, &value)?;
                    self.materialized = Some(text.parse()?);
                }
            }
            "schema" => set_if_none(&mut self.schema, key, &value)?,
            "database" => set_if_none(&mut self.database, key, &value)?,
            "alias" => set_if_none(&mut self.alias, key, &value)?,
            "group" => set_if_none(&mut self.group, key, &value)?,
            "severity" => {
                if self.severity.is_none() {
                    let text = expect_str(key, &value)?;
                    self.severity = Some(match text.to_ascii_lowercase().as_str() {
                        "warn" => TestSeverity::Warn,
                        "error" => TestSeverity::Error,
                        _ => {
                            return Err(NodeConfigError::InvalidType {
                                key: key.to_string(),
                                expected: "'warn' or 'error'",
                            })
                        }
                    });
                }
            }
            "tags" => {
                if let Some(tag) = value.as_str() {
                    if !self.tags.iter().any(|t| t == tag) {
                        self.tags.push(tag.to_string());
                    }
                }
            }
            _ => {
                self.extra.entry(key.to_string()).or_insert(value);
            }
        }

        Ok(())
    }
}

fn expect_str<'a>(key: &str, value: &'a serde_json::Value) -> Result<&'a str, NodeConfigError> {
    value.as_str().ok_or_else(|| NodeConfigError::InvalidType {
        key: key.to_string(),
        expected: "a string",
    })
}

fn set_if_none(
    slot: &mut Option<String>,
    key: &str,
    value: &serde_json::Value,
) -> Result<(), NodeConfigError> {
    if slot.is_none() {
        *slot = Some(expect_str(key, value)?.to_string());
    }
    Ok(())
}

/// Config errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NodeConfigError {
    #[error("Unknown materialization '{0}'")]
    UnknownMaterialization(String),

    #[error("Config key '{key}' expects {expected}")]
    InvalidType { key: String, expected: &'static str },
}

/// Column documentation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub data_type: Option<String>,
}

/// Owner of a group or exposure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub name: Option<String>,
}

/// A raw node declaration as produced by the parsing front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub resource_type: ResourceType,

    /// Node name; derived from the file stem of `path` when absent
    #[serde(default)]
    pub name: Option<String>,

    pub package_name: String,

    /// Path relative to the resource directory
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub original_file_path: Option<String>,

    /// Template body (absent for sources, exposures, groups)
    #[serde(default)]
    pub raw_code: Option<String>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub config: NodeConfig,

    /// Reference expressions for body-less nodes, e.g. `ref('orders')`
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Source group name (sources only)
    #[serde(default)]
    pub source_name: Option<String>,

    /// Physical table name (sources only)
    #[serde(default)]
    pub identifier: Option<String>,

    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub schema: Option<String>,

    #[serde(default)]
    pub columns: BTreeMap<String, ColumnInfo>,

    #[serde(default)]
    pub owner: Option<Owner>,

    /// Exposure type (dashboard, notebook, ...)
    #[serde(default)]
    pub exposure_type: Option<String>,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub maturity: Option<String>,

    /// Metric label
    #[serde(default)]
    pub label: Option<String>,
}

impl Declaration {
    /// Create a minimal declaration
    pub fn new(resource_type: ResourceType, package_name: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            resource_type,
            path: format!("{}.sql", name),
            name: Some(name),
            package_name: package_name.into(),
            original_file_path: None,
            raw_code: None,
            description: String::new(),
            config: NodeConfig::default(),
            depends_on: Vec::new(),
            source_name: None,
            identifier: None,
            database: None,
            schema: None,
            columns: BTreeMap::new(),
            owner: None,
            exposure_type: None,
            url: None,
            maturity: None,
            label: None,
        }
    }

    /// Declare a source table
    pub fn source(package_name: impl Into<String>, source_name: impl Into<String>, table: impl Into<String>) -> Self {
        let mut decl = Self::new(ResourceType::Source, package_name, table);
        decl.path = "models/sources.yml".to_string();
        decl.source_name = Some(source_name.into());
        decl
    }

    pub fn with_raw_code(mut self, raw_code: impl Into<String>) -> Self {
        self.raw_code = Some(raw_code.into());
        self
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_materialization(mut self, materialization: Materialization) -> Self {
        self.config.materialized = Some(materialization);
        self
    }

    pub fn with_depends_on(mut self, expressions: Vec<String>) -> Self {
        self.depends_on = expressions;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.config.enabled = false;
        self
    }

    /// Declared name, or the file stem of `path`
    pub fn resolved_name(&self) -> Option<String> {
        match &self.name {
            Some(name) if !name.is_empty() => Some(name.clone()),
            _ => Path::new(&self.path)
                .file_stem()
                .and_then(|stem| stem.to_str())
                .filter(|stem| !stem.is_empty())
                .map(str::to_string),
        }
    }
}

/// Errors turning a declaration into a node
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeclarationError {
    #[error("{resource_type} declared at '{path}' has no name")]
    MissingName { resource_type: ResourceType, path: String },

    #[error("source '{0}' has no source_name")]
    MissingSourceName(String),
}

/// Build a unique id: `<kind>.<package>.<name>`
pub fn unique_id(resource_type: ResourceType, package: &str, name: &str) -> String {
    format!("{}.{}.{}", resource_type, package, name)
}

/// Build a source unique id: `source.<package>.<source_name>.<table>`
pub fn source_unique_id(package: &str, source_name: &str, table: &str) -> String {
    format!("source.{}.{}.{}", package, source_name, table)
}

/// A `ref()` call found in a template
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefCall {
    pub name: String,

    #[serde(default)]
    pub package: Option<String>,
}

impl fmt::Display for RefCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "ref('{}', '{}')", package, self.name),
            None => write!(f, "ref('{}')", self.name),
        }
    }
}

/// A `source()` call, serialized as `[source_name, table_name]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceCall(pub String, pub String);

impl SourceCall {
    pub fn source_name(&self) -> &str {
        &self.0
    }

    pub fn table_name(&self) -> &str {
        &self.1
    }
}

impl fmt::Display for SourceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source('{}', '{}')", self.0, self.1)
    }
}

/// A `doc()` call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocCall {
    pub name: String,

    #[serde(default)]
    pub package: Option<String>,
}

/// Resolved dependencies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependsOn {
    /// Unique ids of provider nodes
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Unique ids of macros referenced by the body
    #[serde(default)]
    pub macros: Vec<String>,
}

impl DependsOn {
    /// Add a provider, keeping first-seen order
    pub fn add_node(&mut self, unique_id: &str) {
        if !self.nodes.iter().any(|n| n == unique_id) {
            self.nodes.push(unique_id.to_string());
        }
    }

    pub fn add_macro(&mut self, unique_id: &str) {
        if !self.macros.iter().any(|m| m == unique_id) {
            self.macros.push(unique_id.to_string());
        }
    }
}

/// A declared unit of work with stable identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier (e.g., "model.my_project.orders")
    pub unique_id: String,

    pub name: String,

    pub resource_type: ResourceType,

    pub package_name: String,

    pub path: String,

    pub original_file_path: String,

    /// Fully qualified name: package, directories, name
    pub fqn: Vec<String>,

    pub raw_code: Option<String>,

    pub description: String,

    pub config: NodeConfig,

    /// Declared reference expressions (body-less nodes)
    pub declared_depends_on: Vec<String>,

    pub source_name: Option<String>,

    pub identifier: Option<String>,

    pub database: Option<String>,

    pub schema: Option<String>,

    pub columns: BTreeMap<String, ColumnInfo>,

    pub owner: Option<Owner>,

    pub exposure_type: Option<String>,

    pub url: Option<String>,

    pub maturity: Option<String>,

    pub label: Option<String>,

    /// `ref()` calls found by the resolver
    pub refs: Vec<RefCall>,

    /// `source()` calls found by the resolver
    pub sources: Vec<SourceCall>,

    /// `doc()` calls found by the resolver
    pub doc_refs: Vec<DocCall>,

    /// Resolved providers
    pub depends_on: DependsOn,

    /// Position in the declaration list
    pub index: usize,
}

impl Node {
    /// Build a node from a declaration at position `index`
    pub fn from_declaration(decl: Declaration, index: usize) -> Result<Self, DeclarationError> {
        let name = decl.resolved_name().ok_or_else(|| DeclarationError::MissingName {
            resource_type: decl.resource_type,
            path: decl.path.clone(),
        })?;

        let unique_id = match decl.resource_type {
            ResourceType::Source => {
                let source_name = decl
                    .source_name
                    .clone()
                    .ok_or_else(|| DeclarationError::MissingSourceName(name.clone()))?;
                source_unique_id(&decl.package_name, &source_name, &name)
            }
            kind => unique_id(kind, &decl.package_name, &name),
        };

        let fqn = build_fqn(&decl, &name);
        let original_file_path = decl
            .original_file_path
            .clone()
            .unwrap_or_else(|| decl.path.clone());

        Ok(Self {
            unique_id,
            name,
            resource_type: decl.resource_type,
            package_name: decl.package_name,
            path: decl.path,
            original_file_path,
            fqn,
            raw_code: decl.raw_code,
            description: decl.description,
            config: decl.config,
            declared_depends_on: decl.depends_on,
            source_name: decl.source_name,
            identifier: decl.identifier,
            database: decl.database,
            schema: decl.schema,
            columns: decl.columns,
            owner: decl.owner,
            exposure_type: decl.exposure_type,
            url: decl.url,
            maturity: decl.maturity,
            label: decl.label,
            refs: Vec::new(),
            sources: Vec::new(),
            doc_refs: Vec::new(),
            depends_on: DependsOn::default(),
            index,
        })
    }

    /// Effective materialization
    pub fn materialization(&self) -> Materialization {
        self.config
            .materialized
            .unwrap_or_else(|| self.resource_type.default_materialization())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Ephemeral models are inlined, never executed
    pub fn is_ephemeral_model(&self) -> bool {
        self.resource_type == ResourceType::Model && self.materialization() == Materialization::Ephemeral
    }

    /// Whether the scheduler dispatches this node when selected
    pub fn is_executable(&self) -> bool {
        self.resource_type.is_executable() && !self.is_ephemeral_model()
    }

    pub fn group(&self) -> Option<&str> {
        self.config.group.as_deref()
    }

    /// Test severity (defaults to error)
    pub fn test_severity(&self) -> TestSeverity {
        self.config.severity.unwrap_or_default()
    }
}

fn build_fqn(decl: &Declaration, name: &str) -> Vec<String> {
    let mut fqn = vec![decl.package_name.clone()];

    if decl.resource_type == ResourceType::Source {
        if let Some(source_name) = &decl.source_name {
            fqn.push(source_name.clone());
        }
    } else if let Some(parent) = Path::new(&decl.path).parent() {
        fqn.extend(
            parent
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        );
    }

    fqn.push(name.to_string());
    fqn
}
