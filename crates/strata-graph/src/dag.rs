//! Resolved dependency graph: cycle check, stable order, manifest maps
//!
//! Builds forward and reverse dependency graphs from resolved nodes, rejects
//! cycles and caches a stable topological order.

use crate::symbols::SymbolTable;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use strata_core::{Diagnostic, DiagnosticCode};

/// Node identifier (unique_id)
pub type NodeId = String;

/// Fatal graph construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Found a cycle: {}", .path.join(" --> "))]
    Cycle {
        /// Dependency chain that closes on itself; first and last are equal
        path: Vec<NodeId>,
    },

    #[error("{node} depends on {parent}, which is not in the graph")]
    DanglingEdge { node: NodeId, parent: NodeId },
}

impl GraphError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            Self::Cycle { path } => {
                Diagnostic::error(DiagnosticCode::CyclicDependency, self.to_string()).for_node(&path[0])
            }
            Self::DanglingEdge { node, .. } => {
                Diagnostic::error(DiagnosticCode::RefNotFound, self.to_string()).for_node(node)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Provider/consumer edges of one invocation, read-only once built
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Forward edges: node -> list of nodes it depends on (parents)
    parents: HashMap<NodeId, Vec<NodeId>>,

    /// Reverse edges: node -> list of nodes that depend on it (children)
    children: HashMap<NodeId, Vec<NodeId>>,

    /// All nodes in declaration order
    nodes: Vec<NodeId>,

    /// node -> declaration rank, used to break ties
    rank: HashMap<NodeId, usize>,

    /// Cached topological order (providers first)
    topo: Vec<NodeId>,

    /// node -> position in `topo`
    topo_index: HashMap<NodeId, usize>,

    /// group name -> members
    groups: BTreeMap<String, Vec<NodeId>>,
}

impl DependencyGraph {
    /// Build the graph over every graph-member node of a resolved symbol table
    pub fn build(symbols: &SymbolTable) -> Result<Self, GraphError> {
        let members: Vec<_> = symbols
            .nodes()
            .iter()
            .filter(|n| n.resource_type.is_graph_member())
            .collect();

        let nodes: Vec<NodeId> = members.iter().map(|n| n.unique_id.clone()).collect();
        let edges = members
            .iter()
            .map(|n| (n.unique_id.clone(), n.depends_on.nodes.clone()))
            .collect();

        let mut graph = Self::from_edges(nodes, edges)?;

        for node in &members {
            if let Some(group) = node.group() {
                graph
                    .groups
                    .entry(group.to_string())
                    .or_default()
                    .push(node.unique_id.clone());
            }
        }
        for group in symbols.of_kind(strata_core::ResourceType::Group) {
            graph.groups.entry(group.name.clone()).or_default();
        }
        for ids in graph.groups.values_mut() {
            ids.sort();
        }

        Ok(graph)
    }

    /// Build from nodes (in declaration order) and their parent lists
    pub fn from_edges(nodes: Vec<NodeId>, parents: HashMap<NodeId, Vec<NodeId>>) -> Result<Self, GraphError> {
        let rank: HashMap<NodeId, usize> = nodes.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();

        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in &nodes {
            for parent in parents.get(node).into_iter().flatten() {
                if !rank.contains_key(parent) {
                    return Err(GraphError::DanglingEdge {
                        node: node.clone(),
                        parent: parent.clone(),
                    });
                }
                children.entry(parent.clone()).or_default().push(node.clone());
            }
        }

        let mut graph = Self {
            parents,
            children,
            nodes,
            rank,
            topo: Vec::new(),
            topo_index: HashMap::new(),
            groups: BTreeMap::new(),
        };

        graph.detect_cycles()?;
        graph.topo = graph.stable_topological_sort();
        graph.topo_index = graph
            .topo
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();

        Ok(graph)
    }

    /// Three-color depth-first search; a back edge is a cycle
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut marks: HashMap<&str, Mark> = self.nodes.iter().map(|n| (n.as_str(), Mark::Unvisited)).collect();

        for start in &self.nodes {
            if marks[start.as_str()] != Mark::Unvisited {
                continue;
            }

            // (node, index of the next parent to visit)
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), Mark::InProgress);

            while let Some(&(node, next)) = stack.last() {
                let parents = self.parents.get(node).map(Vec::as_slice).unwrap_or(&[]);

                if next >= parents.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                }

                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                let parent = parents[next].as_str();
                match marks.get(parent).copied().unwrap_or(Mark::Done) {
                    Mark::Unvisited => {
                        marks.insert(parent, Mark::InProgress);
                        stack.push((parent, 0));
                    }
                    Mark::InProgress => {
                        let start_at = stack.iter().position(|(n, _)| *n == parent).unwrap_or(0);
                        let mut path: Vec<NodeId> = stack[start_at..].iter().map(|(n, _)| n.to_string()).collect();
                        path.push(parent.to_string());
                        return Err(GraphError::Cycle { path });
                    }
                    Mark::Done => {}
                }
            }
        }

        Ok(())
    }

    /// Kahn's algorithm, ready nodes taken in declaration order
    fn stable_topological_sort(&self) -> Vec<NodeId> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.parents.get(n).map_or(0, Vec::len)))
            .collect();

        let mut ready: BinaryHeap<Reverse<(usize, &str)>> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&n, _)| Reverse((self.rank[n], n)))
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse((_, node))) = ready.pop() {
            result.push(node.to_string());

            for child in self.children.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((self.rank[child], child.as_str())));
                    }
                }
            }
        }

        result
    }

    /// All nodes in declaration order
    pub fn all_nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.rank.contains_key(node_id)
    }

    /// Stable topological order, providers before consumers
    pub fn topological_order(&self) -> &[NodeId] {
        &self.topo
    }

    /// Position of a node in the topological order
    pub fn topo_index(&self, node_id: &str) -> Option<usize> {
        self.topo_index.get(node_id).copied()
    }

    /// Nodes grouped by depth; layer 0 has no parents
    pub fn layers(&self) -> Vec<Vec<NodeId>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut layers: Vec<Vec<NodeId>> = Vec::new();

        for node in &self.topo {
            let d = self
                .parents(node)
                .iter()
                .filter_map(|p| depth.get(p.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node.as_str(), d);

            if layers.len() <= d {
                layers.resize_with(d + 1, Vec::new);
            }
            layers[d].push(node.clone());
        }

        layers
    }

    /// Get immediate parents (dependencies) of a node
    pub fn parents(&self, node_id: &str) -> &[NodeId] {
        self.parents.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Get immediate children (dependents) of a node
    pub fn children(&self, node_id: &str) -> &[NodeId] {
        self.children.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Get all downstream nodes (transitive closure of children)
    ///
    /// This is the "blast radius" - everything that cannot run if this node fails.
    pub fn downstream(&self, node_id: &str) -> Vec<NodeId> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut result = Vec::new();

        // Start with immediate children
        for child in self.children(node_id) {
            queue.push_back(child.clone());
        }

        // BFS to find all downstream nodes
        while let Some(current) = queue.pop_front() {
            if visited.contains(&current) {
                continue;
            }

            visited.insert(current.clone());
            result.push(current.clone());

            for child in self.children(&current) {
                if !visited.contains(child) {
                    queue.push_back(child.clone());
                }
            }
        }

        result
    }

    /// Get all upstream nodes (transitive closure of parents)
    pub fn upstream(&self, node_id: &str) -> Vec<NodeId> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut result = Vec::new();

        for parent in self.parents(node_id) {
            queue.push_back(parent.clone());
        }

        while let Some(current) = queue.pop_front() {
            if visited.contains(&current) {
                continue;
            }

            visited.insert(current.clone());
            result.push(current.clone());

            for parent in self.parents(&current) {
                if !visited.contains(parent) {
                    queue.push_back(parent.clone());
                }
            }
        }

        result
    }

    /// Whether `target` is reachable downstream of `source`
    pub fn has_path(&self, source: &str, target: &str) -> bool {
        self.downstream(source).iter().any(|n| n == target)
    }

    /// node -> parents, for every node
    pub fn parent_map(&self) -> BTreeMap<NodeId, Vec<NodeId>> {
        self.nodes
            .iter()
            .map(|n| (n.clone(), self.parents(n).to_vec()))
            .collect()
    }

    /// node -> children (sorted), for every node
    pub fn child_map(&self) -> BTreeMap<NodeId, Vec<NodeId>> {
        self.nodes
            .iter()
            .map(|n| {
                let mut children = self.children(n).to_vec();
                children.sort();
                (n.clone(), children)
            })
            .collect()
    }

    /// group name -> member ids (sorted)
    pub fn group_map(&self) -> &BTreeMap<String, Vec<NodeId>> {
        &self.groups
    }

    /// Graph restricted to a selection
    ///
    /// Reachability through unselected nodes is kept: with A -> x -> C and
    /// only A and C selected, the subgraph has the edge A -> C.
    pub fn subgraph(&self, selection: &HashSet<NodeId>) -> DependencyGraph {
        let nodes: Vec<NodeId> = self.nodes.iter().filter(|n| selection.contains(*n)).cloned().collect();

        let mut parents = HashMap::new();
        for node in &nodes {
            let mut found = Vec::new();
            let mut visited = HashSet::new();
            let mut queue: VecDeque<&NodeId> = self.parents(node).iter().collect();

            while let Some(current) = queue.pop_front() {
                if !visited.insert(current) {
                    continue;
                }
                if selection.contains(current) {
                    found.push(current.clone());
                } else {
                    queue.extend(self.parents(current));
                }
            }

            found.sort_by_key(|n| self.rank[n]);
            parents.insert(node.clone(), found);
        }

        let rank: HashMap<NodeId, usize> = nodes.iter().map(|n| (n.clone(), self.rank[n])).collect();
        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in &nodes {
            for parent in &parents[node] {
                children.entry(parent.clone()).or_default().push(node.clone());
            }
        }

        // Order is inherited from the acyclic parent graph
        let topo: Vec<NodeId> = self.topo.iter().filter(|n| selection.contains(*n)).cloned().collect();
        let topo_index = topo.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();

        let groups = self
            .groups
            .iter()
            .map(|(g, members)| {
                let kept = members.iter().filter(|m| selection.contains(*m)).cloned().collect();
                (g.clone(), kept)
            })
            .collect();

        DependencyGraph {
            parents,
            children,
            nodes,
            rank,
            topo,
            topo_index,
            groups,
        }
    }
}
