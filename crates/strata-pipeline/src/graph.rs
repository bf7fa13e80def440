use crate::runtime::{FnCompute, NodeContext, NodeInputs, NodeOutput, SharedNodeCompute};
use crate::{GraphValidationError, PipelineError};
use serde::{Deserialize, Serialize};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, IntoNeighbors, Reversed, Visitable};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt;
use std::sync::Arc;

/// How a dependency's materialization reaches the dependent node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyBinding {
    /// The upstream output is passed into compute.
    Input,
    /// Ordering and success gate only.
    Gate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub binding: DependencyBinding,
}

#[derive(Clone)]
pub struct NodeDefinition {
    name: String,
    description: String,
    dependencies: Vec<Dependency>,
    capabilities: BTreeSet<String>,
    compute: SharedNodeCompute,
}

impl NodeDefinition {
    pub fn new(name: impl Into<String>, compute: SharedNodeCompute) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            dependencies: Vec::new(),
            capabilities: BTreeSet::new(),
            compute,
        }
    }

    /// Wraps a synchronous closure as the node's compute function.
    pub fn from_fn<F>(name: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&NodeInputs, &NodeContext<'_>) -> Result<NodeOutput, PipelineError>
            + Send
            + Sync
            + 'static,
    {
        Self::new(name, Arc::new(FnCompute::new(compute)))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(self, dependency: impl Into<String>) -> Self {
        self.with_dependency(dependency, DependencyBinding::Input)
    }

    pub fn with_gate(self, dependency: impl Into<String>) -> Self {
        self.with_dependency(dependency, DependencyBinding::Gate)
    }

    /// Re-declaring a dependency keeps its position and updates the binding.
    pub fn with_dependency(
        mut self,
        dependency: impl Into<String>,
        binding: DependencyBinding,
    ) -> Self {
        let name = dependency.into();
        match self.dependencies.iter_mut().find(|dep| dep.name == name) {
            Some(existing) => existing.binding = binding,
            None => self.dependencies.push(Dependency { name, binding }),
        }
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn compute(&self) -> &SharedNodeCompute {
        &self.compute
    }
}

impl fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Mutable collection of node definitions. Built once per process, then
/// frozen into a [`Graph`].
#[derive(Clone, Debug, Default)]
pub struct NodeRegistry {
    nodes: Vec<NodeDefinition>,
    index: BTreeMap<String, usize>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node: NodeDefinition) -> Result<(), GraphValidationError> {
        if self.index.contains_key(node.name()) {
            return Err(GraphValidationError::DuplicateNode(node.name().to_string()));
        }
        self.index.insert(node.name().to_string(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Validates the registered nodes and freezes them into a [`Graph`].
    ///
    /// Unknown dependencies are reported before cycles. The resulting order
    /// is topological with ties broken by registration order, so the same
    /// registry always yields the same order.
    pub fn build(&self) -> Result<Graph, GraphValidationError> {
        let dag = self.dag()?;
        self.check_acyclic(&dag)?;

        let mut in_degree: Vec<usize> = dag
            .node_indices()
            .map(|idx| dag.neighbors_directed(idx, Direction::Incoming).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(position, _)| Reverse(position))
            .collect();
        let mut order = Vec::with_capacity(dag.node_count());
        while let Some(Reverse(position)) = ready.pop() {
            order.push(position);
            for dependent in dag.neighbors_directed(NodeIndex::new(position), Direction::Outgoing) {
                let dependent = dag[dependent];
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        Ok(Graph {
            nodes: self.nodes.clone(),
            index: self.index.clone(),
            order,
            dag,
        })
    }

    /// One vertex per node, weighted by registration position, with an edge
    /// from each dependency to its dependent.
    fn dag(&self) -> Result<DiGraph<usize, ()>, GraphValidationError> {
        let mut dag = DiGraph::with_capacity(self.nodes.len(), 0);
        for position in 0..self.nodes.len() {
            dag.add_node(position);
        }
        for (position, node) in self.nodes.iter().enumerate() {
            for dependency in node.dependencies() {
                let upstream = self.index.get(&dependency.name).copied().ok_or_else(|| {
                    GraphValidationError::UnknownDependency {
                        node: node.name().to_string(),
                        dependency: dependency.name.clone(),
                    }
                })?;
                dag.add_edge(NodeIndex::new(upstream), NodeIndex::new(position), ());
            }
        }
        Ok(dag)
    }

    /// Depth-first walk along dependency edges keeping the recursion stack,
    /// so a back edge yields the cycle itself.
    fn check_acyclic(&self, dag: &DiGraph<usize, ()>) -> Result<(), GraphValidationError> {
        let mut visited = vec![false; dag.node_count()];
        let mut on_stack = vec![false; dag.node_count()];
        let mut path = Vec::new();
        for start in dag.node_indices() {
            if !visited[dag[start]] {
                self.visit(dag, start, &mut visited, &mut on_stack, &mut path)?;
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        dag: &DiGraph<usize, ()>,
        idx: NodeIndex,
        visited: &mut [bool],
        on_stack: &mut [bool],
        path: &mut Vec<usize>,
    ) -> Result<(), GraphValidationError> {
        let position = dag[idx];
        visited[position] = true;
        on_stack[position] = true;
        path.push(position);

        let mut upstream: Vec<NodeIndex> = dag.neighbors_directed(idx, Direction::Incoming).collect();
        upstream.sort_by_key(|&neighbor| dag[neighbor]);
        for neighbor in upstream {
            let dependency = dag[neighbor];
            if on_stack[dependency] {
                let start = path.iter().position(|&p| p == dependency).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&p| self.nodes[p].name().to_string())
                    .collect();
                cycle.push(self.nodes[dependency].name().to_string());
                return Err(GraphValidationError::Cycle { path: cycle });
            }
            if !visited[dependency] {
                self.visit(dag, neighbor, visited, on_stack, path)?;
            }
        }

        path.pop();
        on_stack[position] = false;
        Ok(())
    }
}

/// Immutable, validated node graph. Read-only during execution.
#[derive(Clone, Debug)]
pub struct Graph {
    nodes: Vec<NodeDefinition>,
    index: BTreeMap<String, usize>,
    order: Vec<usize>,
    dag: DiGraph<usize, ()>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.index.get(name).map(|&position| &self.nodes[position])
    }

    /// Nodes in execution order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> + '_ {
        self.order.iter().map(move |&position| &self.nodes[position])
    }

    pub fn topological_order(&self) -> Vec<&str> {
        self.nodes().map(NodeDefinition::name).collect()
    }

    /// Nodes in registration order.
    pub fn registered(&self) -> impl Iterator<Item = &NodeDefinition> + '_ {
        self.nodes.iter()
    }

    /// Direct dependents of `name`, in registration order.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        let Some(&position) = self.index.get(name) else {
            return Vec::new();
        };
        let mut dependents: Vec<usize> = self
            .dag
            .neighbors_directed(NodeIndex::new(position), Direction::Outgoing)
            .map(|neighbor| self.dag[neighbor])
            .collect();
        dependents.sort_unstable();
        dependents
            .into_iter()
            .map(|dependent| self.nodes[dependent].name())
            .collect()
    }

    /// `roots` plus every node that transitively depends on one of them.
    pub fn downstream_closure<S: AsRef<str>>(
        &self,
        roots: &[S],
    ) -> Result<BTreeSet<String>, PipelineError> {
        let roots = self.positions(roots)?;
        Ok(self.reachable(&self.dag, roots))
    }

    /// `roots` plus every node they transitively depend on.
    pub fn upstream_closure<S: AsRef<str>>(
        &self,
        roots: &[S],
    ) -> Result<BTreeSet<String>, PipelineError> {
        let roots = self.positions(roots)?;
        Ok(self.reachable(Reversed(&self.dag), roots))
    }

    fn reachable<G>(&self, graph: G, roots: Vec<usize>) -> BTreeSet<String>
    where
        G: IntoNeighbors<NodeId = NodeIndex> + Visitable<NodeId = NodeIndex>,
    {
        let mut seen = BTreeSet::new();
        let mut dfs = Dfs::empty(graph);
        for root in roots {
            dfs.move_to(NodeIndex::new(root));
            while let Some(idx) = dfs.next(graph) {
                seen.insert(self.dag[idx]);
            }
        }
        self.names_of(seen)
    }

    fn positions<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<usize>, PipelineError> {
        names
            .iter()
            .map(|name| {
                self.index
                    .get(name.as_ref())
                    .copied()
                    .ok_or_else(|| PipelineError::UnknownSelection(name.as_ref().to_string()))
            })
            .collect()
    }

    fn names_of(&self, positions: BTreeSet<usize>) -> BTreeSet<String> {
        positions
            .into_iter()
            .map(|position| self.nodes[position].name().to_string())
            .collect()
    }
}
