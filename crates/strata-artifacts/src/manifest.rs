//! The manifest: a snapshot of the resolved graph

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_core::{Config, Node, ResourceType};
use strata_engine::Project;
use strata_jinja::{CompileOutput, InjectedCte};

use crate::metadata::{ArtifactMetadata, Invocation};
use crate::schema::MANIFEST_SCHEMA_VERSION;

/// A node as written to the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestNode {
    #[serde(flatten)]
    pub node: Node,

    /// Whether `compiled_code` was produced in this invocation
    pub compiled: bool,

    #[serde(default)]
    pub compiled_code: Option<String>,

    #[serde(default)]
    pub relation_name: Option<String>,

    #[serde(default)]
    pub extra_ctes: Vec<InjectedCte>,
}

impl ManifestNode {
    pub fn new(node: Node, compiled: Option<&CompileOutput>) -> Self {
        let output = compiled.and_then(|c| c.compiled.get(&node.unique_id));

        Self {
            compiled: output.is_some(),
            compiled_code: output.map(|c| c.compiled_code.clone()),
            relation_name: output.and_then(|c| c.relation_name.clone()),
            extra_ctes: output.map(|c| c.extra_ctes.clone()).unwrap_or_default(),
            node,
        }
    }
}

type NodeMap = BTreeMap<String, ManifestNode>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritableManifest {
    pub metadata: ArtifactMetadata,

    /// Models, seeds, snapshots, tests and analyses
    pub nodes: NodeMap,

    pub sources: NodeMap,

    pub macros: NodeMap,

    pub docs: NodeMap,

    pub exposures: NodeMap,

    pub metrics: NodeMap,

    pub groups: NodeMap,

    pub selectors: BTreeMap<String, serde_json::Value>,

    /// Disabled variants, by unique id
    pub disabled: BTreeMap<String, Vec<ManifestNode>>,

    pub parent_map: BTreeMap<String, Vec<String>>,

    pub child_map: BTreeMap<String, Vec<String>>,

    pub group_map: BTreeMap<String, Vec<String>>,
}

impl WritableManifest {
    /// Snapshot a project, with compiled code where available
    pub fn build(
        project: &Project,
        compiled: Option<&CompileOutput>,
        config: &Config,
        invocation: &Invocation,
        adapter_type: &str,
    ) -> Self {
        let mut metadata = invocation.metadata(MANIFEST_SCHEMA_VERSION);
        metadata.project_id = Some(config.project_id());
        metadata.send_anonymous_usage_stats = Some(config.send_anonymous_usage_stats);
        metadata.adapter_type = Some(adapter_type.to_string());

        let mut manifest = Self {
            metadata,
            nodes: NodeMap::new(),
            sources: NodeMap::new(),
            macros: NodeMap::new(),
            docs: NodeMap::new(),
            exposures: NodeMap::new(),
            metrics: NodeMap::new(),
            groups: NodeMap::new(),
            selectors: project.selectors.clone(),
            disabled: BTreeMap::new(),
            parent_map: project.graph.parent_map(),
            child_map: project.graph.child_map(),
            group_map: project.graph.group_map().clone(),
        };

        for node in project.symbols.nodes() {
            let entry = ManifestNode::new(node.clone(), compiled);
            manifest.section_mut(node.resource_type).insert(node.unique_id.clone(), entry);
        }

        for (unique_id, variants) in project.symbols.disabled() {
            let nodes = variants.iter().map(|n| ManifestNode::new(n.clone(), None)).collect();
            manifest.disabled.insert(unique_id.clone(), nodes);
        }

        manifest
    }

    fn section_mut(&mut self, kind: ResourceType) -> &mut NodeMap {
        match kind {
            ResourceType::Source => &mut self.sources,
            ResourceType::Macro => &mut self.macros,
            ResourceType::Doc => &mut self.docs,
            ResourceType::Exposure => &mut self.exposures,
            ResourceType::Metric => &mut self.metrics,
            ResourceType::Group => &mut self.groups,
            ResourceType::Model
            | ResourceType::Seed
            | ResourceType::Snapshot
            | ResourceType::Test
            | ResourceType::Analysis => &mut self.nodes,
        }
    }

    /// Look a unique id up across every section
    pub fn get(&self, unique_id: &str) -> Option<&ManifestNode> {
        [
            &self.nodes,
            &self.sources,
            &self.macros,
            &self.docs,
            &self.exposures,
            &self.metrics,
            &self.groups,
        ]
        .into_iter()
        .find_map(|section| section.get(unique_id))
    }
}
