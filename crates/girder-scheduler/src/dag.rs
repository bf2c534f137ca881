//! Dependency graph between build types.

use girder_core::definition::DependencyKind;
use girder_core::ids::BuildTypeId;
use girder_core::registry::Registry;
use girder_core::{Error, Result};
use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};

/// Directed graph of snapshot and artifact dependencies. Edges point from
/// upstream to downstream.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<BuildTypeId, DependencyKind>,
    index: HashMap<BuildTypeId, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph for every registered build type.
    pub fn resolve(registry: &Registry) -> Result<Self> {
        let mut edges = Vec::new();
        for id in registry.build_type_ids() {
            let config = registry.resolve_effective_config(id)?;
            for dependency in &config.dependencies {
                edges.push((dependency.upstream().clone(), id.clone(), dependency.kind()));
            }
        }
        Self::from_edges(registry.build_type_ids().cloned(), edges)
    }

    /// Build the graph from explicit nodes and `(upstream, downstream, kind)`
    /// edges.
    pub fn from_edges<I>(
        nodes: I,
        edges: Vec<(BuildTypeId, BuildTypeId, DependencyKind)>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = BuildTypeId>,
    {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for id in nodes {
            if !index.contains_key(&id) {
                let idx = graph.add_node(id.clone());
                index.insert(id, idx);
            }
        }

        for (upstream, downstream, kind) in edges {
            let to = *index
                .get(&downstream)
                .ok_or_else(|| Error::BuildTypeNotFound(downstream.clone()))?;
            let from = *index.get(&upstream).ok_or_else(|| Error::UnknownDependency {
                build_type: downstream.clone(),
                upstream: upstream.clone(),
            })?;
            graph.add_edge(from, to, kind);
        }

        let mut dag = Self {
            graph,
            index,
            order: Vec::new(),
        };

        if let Some(cycle) = dag.find_cycle() {
            return Err(Error::Cycle(cycle));
        }
        dag.order = toposort(&dag.graph, None).map_err(|cycle| {
            Error::Cycle(vec![dag.graph[cycle.node_id()].clone()])
        })?;

        Ok(dag)
    }

    /// First cycle found, as ids along the cycle with the first id repeated
    /// at the end.
    fn find_cycle(&self) -> Option<Vec<BuildTypeId>> {
        for component in tarjan_scc(&self.graph) {
            let Some(&start) = component.iter().min_by_key(|&&n| &self.graph[n]) else {
                continue;
            };
            if component.len() == 1 && self.graph.find_edge(start, start).is_none() {
                continue;
            }
            let members: HashSet<NodeIndex> = component.into_iter().collect();
            return Some(self.cycle_through(start, &members));
        }
        None
    }

    /// Shortest path from `start` back to itself inside one component.
    fn cycle_through(&self, start: NodeIndex, members: &HashSet<NodeIndex>) -> Vec<BuildTypeId> {
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(node) = queue.pop_front() {
            let mut successors: Vec<_> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect();
            successors.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
            for next in successors {
                if next == start {
                    let mut path = vec![node];
                    let mut current = node;
                    while current != start {
                        match parent.get(&current) {
                            Some(&p) => {
                                path.push(p);
                                current = p;
                            }
                            None => break,
                        }
                    }
                    path.reverse();
                    let mut ids: Vec<_> = path.into_iter().map(|n| self.graph[n].clone()).collect();
                    ids.push(self.graph[start].clone());
                    return ids;
                }
                if members.contains(&next) && visited.insert(next) {
                    parent.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        vec![self.graph[start].clone(), self.graph[start].clone()]
    }

    pub fn contains(&self, id: &BuildTypeId) -> bool {
        self.index.contains_key(id)
    }

    /// Build types in an order where every upstream precedes its downstreams.
    pub fn topological_order(&self) -> Vec<&BuildTypeId> {
        self.order.iter().map(|&idx| &self.graph[idx]).collect()
    }

    /// Direct upstreams of a build type.
    pub fn upstream(&self, id: &BuildTypeId) -> Vec<&BuildTypeId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct downstreams of a build type.
    pub fn downstream(&self, id: &BuildTypeId) -> Vec<&BuildTypeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Build types with no upstream.
    pub fn roots(&self) -> Vec<&BuildTypeId> {
        self.order
            .iter()
            .filter(|&&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|&idx| &self.graph[idx])
            .collect()
    }

    /// Every build type `id` depends on, directly or not, in topological
    /// order.
    pub fn transitive_upstream(&self, id: &BuildTypeId) -> Vec<&BuildTypeId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for up in self.graph.neighbors_directed(node, Direction::Incoming) {
                if seen.insert(up) {
                    stack.push(up);
                }
            }
        }
        self.order
            .iter()
            .filter(|idx| seen.contains(idx))
            .map(|&idx| &self.graph[idx])
            .collect()
    }

    /// All edges as `(upstream, downstream, kind)`, sorted.
    pub fn edges(&self) -> Vec<(&BuildTypeId, &BuildTypeId, DependencyKind)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (from, to) = self.graph.edge_endpoints(e)?;
                Some((&self.graph[from], &self.graph[to], self.graph[e]))
            })
            .collect();
        edges.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        edges
    }

    fn neighbors(&self, id: &BuildTypeId, direction: Direction) -> Vec<&BuildTypeId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<_> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| &self.graph[n])
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
