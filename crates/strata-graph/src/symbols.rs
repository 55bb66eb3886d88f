//! Symbol table
//!
//! Holds every declared node keyed by unique id, with name indexes for
//! `ref()`/`source()`/`doc()` lookups. Disabled nodes live in a side table so
//! a failed lookup can report that its target exists but is disabled.

use std::collections::{BTreeMap, HashMap};
use strata_core::{Declaration, DeclarationError, Diagnostic, DiagnosticCode, Node, ResourceType};

/// Errors that make the project ambiguous; fatal at build time
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SymbolError {
    #[error("Found two resources with the identifier \"{unique_id}\" ({existing_path} and {new_path})")]
    DuplicateIdentifier {
        unique_id: String,
        existing_path: String,
        new_path: String,
    },

    #[error("Found two resources named \"{name}\" in package \"{package}\": {first} and {second}")]
    DuplicateName {
        name: String,
        package: String,
        first: String,
        second: String,
    },

    #[error(transparent)]
    InvalidDeclaration(#[from] DeclarationError),
}

impl SymbolError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let code = match self {
            Self::InvalidDeclaration(_) => DiagnosticCode::InvalidDeclaration,
            _ => DiagnosticCode::DuplicateIdentifier,
        };
        Diagnostic::error(code, self.to_string())
    }
}

/// Why a lookup failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("not found")]
    NotFound,

    #[error("matches more than one node: {}", .candidates.join(", "))]
    Ambiguous { candidates: Vec<String> },

    #[error("target '{unique_id}' is disabled")]
    Disabled { unique_id: String },
}

/// All declared nodes of one invocation
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    /// Enabled nodes in declaration order
    nodes: Vec<Node>,

    /// unique_id -> position in `nodes`
    by_id: HashMap<String, usize>,

    /// name -> positions of non-source nodes with that name
    by_name: HashMap<String, Vec<usize>>,

    /// (source_name, table) -> positions of source nodes
    sources: HashMap<(String, String), Vec<usize>>,

    /// Disabled nodes, several variants may share an id
    disabled: BTreeMap<String, Vec<Node>>,

    /// lookup key -> disabled unique ids
    disabled_by_key: HashMap<String, Vec<String>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every declaration in order
    pub fn from_declarations(declarations: Vec<Declaration>) -> Result<Self, SymbolError> {
        let mut table = Self::new();
        for (index, decl) in declarations.into_iter().enumerate() {
            table.register(Node::from_declaration(decl, index)?)?;
        }
        Ok(table)
    }

    /// Register a node
    ///
    /// Fails when an enabled node with the same identity already exists. Two
    /// refable nodes (e.g. a model and a seed) may not share a name within a
    /// package, since `ref()` could not tell them apart.
    pub fn register(&mut self, node: Node) -> Result<(), SymbolError> {
        if !node.is_enabled() {
            let key = lookup_key(&node);
            self.disabled_by_key.entry(key).or_default().push(node.unique_id.clone());
            self.disabled.entry(node.unique_id.clone()).or_default().push(node);
            return Ok(());
        }

        if let Some(&existing) = self.by_id.get(&node.unique_id) {
            return Err(SymbolError::DuplicateIdentifier {
                unique_id: node.unique_id.clone(),
                existing_path: self.nodes[existing].original_file_path.clone(),
                new_path: node.original_file_path.clone(),
            });
        }

        if node.resource_type.is_refable() {
            let clash = self.by_name.get(&node.name).and_then(|positions| {
                positions.iter().map(|&p| &self.nodes[p]).find(|other| {
                    other.resource_type.is_refable() && other.package_name == node.package_name
                })
            });
            if let Some(other) = clash {
                return Err(SymbolError::DuplicateName {
                    name: node.name.clone(),
                    package: node.package_name.clone(),
                    first: other.unique_id.clone(),
                    second: node.unique_id.clone(),
                });
            }
        }

        self.nodes.push(node);
        self.index(self.nodes.len() - 1);
        Ok(())
    }

    /// Move an enabled node to the disabled side table
    ///
    /// Used when an inline `config(enabled=false)` turns a node off after
    /// registration.
    pub fn disable(&mut self, unique_id: &str) -> bool {
        let Some(position) = self.by_id.get(unique_id).copied() else {
            return false;
        };

        let mut node = self.nodes.remove(position);
        node.config.enabled = false;
        self.disabled_by_key
            .entry(lookup_key(&node))
            .or_default()
            .push(node.unique_id.clone());
        self.disabled.entry(node.unique_id.clone()).or_default().push(node);

        self.by_id.clear();
        self.by_name.clear();
        self.sources.clear();
        for position in 0..self.nodes.len() {
            self.index(position);
        }
        true
    }

    fn index(&mut self, position: usize) {
        let node = &self.nodes[position];
        self.by_id.insert(node.unique_id.clone(), position);

        if node.resource_type == ResourceType::Source {
            let key = (node.source_name.clone().unwrap_or_default(), node.name.clone());
            self.sources.entry(key).or_default().push(position);
        } else {
            self.by_name.entry(node.name.clone()).or_default().push(position);
        }
    }

    /// Enabled nodes in declaration order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Mutable access for annotation passes; identities must not change
    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, unique_id: &str) -> Option<&Node> {
        self.by_id.get(unique_id).map(|&p| &self.nodes[p])
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.by_id.contains_key(unique_id)
    }

    /// Disabled nodes keyed by unique id
    pub fn disabled(&self) -> &BTreeMap<String, Vec<Node>> {
        &self.disabled
    }

    /// Enabled nodes of one kind, in declaration order
    pub fn of_kind(&self, kind: ResourceType) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.resource_type == kind)
    }

    /// Look up a node by name
    ///
    /// With a package hint only that package is searched. Without one, all
    /// packages are searched and more than one match is ambiguous.
    pub fn lookup(
        &self,
        name: &str,
        kinds: &[ResourceType],
        package_hint: Option<&str>,
    ) -> Result<&Node, LookupError> {
        let mut candidates = self
            .by_name
            .get(name)
            .into_iter()
            .flatten()
            .map(|&p| &self.nodes[p])
            .filter(|n| kinds.contains(&n.resource_type))
            .filter(|n| package_hint.map_or(true, |pkg| n.package_name == pkg));

        let first = candidates.next();
        let rest: Vec<&Node> = candidates.collect();

        match first {
            Some(node) if rest.is_empty() => Ok(node),
            Some(node) => {
                let mut ids: Vec<String> = std::iter::once(node)
                    .chain(rest)
                    .map(|n| n.unique_id.clone())
                    .collect();
                ids.sort();
                Err(LookupError::Ambiguous { candidates: ids })
            }
            None => Err(self.disabled_or_missing(name, kinds, package_hint)),
        }
    }

    /// Look up a `ref()` target
    pub fn lookup_ref(&self, name: &str, package_hint: Option<&str>) -> Result<&Node, LookupError> {
        const REFABLE: [ResourceType; 4] = [
            ResourceType::Model,
            ResourceType::Seed,
            ResourceType::Snapshot,
            ResourceType::Analysis,
        ];
        self.lookup(name, &REFABLE, package_hint)
    }

    /// Look up a source table
    pub fn lookup_source(
        &self,
        source_name: &str,
        table: &str,
        package_hint: Option<&str>,
    ) -> Result<&Node, LookupError> {
        let key = (source_name.to_string(), table.to_string());
        let candidates: Vec<&Node> = self
            .sources
            .get(&key)
            .into_iter()
            .flatten()
            .map(|&p| &self.nodes[p])
            .filter(|n| package_hint.map_or(true, |pkg| n.package_name == pkg))
            .collect();

        match candidates.as_slice() {
            [node] => Ok(node),
            [] => {
                let disabled_key = format!("source:{}.{}", source_name, table);
                match self.disabled_by_key.get(&disabled_key).and_then(|ids| ids.first()) {
                    Some(id) => Err(LookupError::Disabled { unique_id: id.clone() }),
                    None => Err(LookupError::NotFound),
                }
            }
            many => {
                let mut ids: Vec<String> = many.iter().map(|n| n.unique_id.clone()).collect();
                ids.sort();
                Err(LookupError::Ambiguous { candidates: ids })
            }
        }
    }

    /// Look up a docs block
    pub fn lookup_doc(&self, name: &str, package_hint: Option<&str>) -> Result<&Node, LookupError> {
        self.lookup(name, &[ResourceType::Doc], package_hint)
    }

    /// Look up a macro, preferring the caller's package
    pub fn lookup_macro(&self, name: &str, caller_package: &str) -> Option<&Node> {
        self.lookup(name, &[ResourceType::Macro], Some(caller_package))
            .or_else(|_| self.lookup(name, &[ResourceType::Macro], None))
            .ok()
    }

    /// Look up a group by name
    pub fn lookup_group(&self, name: &str) -> Result<&Node, LookupError> {
        self.lookup(name, &[ResourceType::Group], None)
    }

    fn disabled_or_missing(&self, name: &str, kinds: &[ResourceType], package_hint: Option<&str>) -> LookupError {
        let key = format!("name:{}", name);
        let disabled = self.disabled_by_key.get(&key).and_then(|ids| {
            ids.iter().find(|id| {
                self.disabled.get(*id).map_or(false, |variants| {
                    variants.iter().any(|n| {
                        kinds.contains(&n.resource_type) && package_hint.map_or(true, |pkg| n.package_name == pkg)
                    })
                })
            })
        });

        match disabled {
            Some(id) => LookupError::Disabled { unique_id: id.clone() },
            None => LookupError::NotFound,
        }
    }
}

fn lookup_key(node: &Node) -> String {
    match (&node.resource_type, &node.source_name) {
        (ResourceType::Source, Some(source_name)) => format!("source:{}.{}", source_name, node.name),
        _ => format!("name:{}", node.name),
    }
}
