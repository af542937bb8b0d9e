//! The snapshot a link graph job works on.
//!
//! A component is a self-contained copy of one connected station cluster:
//! nodes with supply and demand, a dense edge matrix for O(1) lookup, and a
//! per-row intrusive adjacency chain for sparse iteration. The chain heads
//! live in their own vector beside the matrix, so a cell only ever means one
//! thing.
//!
//! The component also carries the settings it was extracted under; a
//! settings change mid-flight never affects a running job.

use crate::id::{CargoId, ComponentColour, Map, NodeIndex, StationId, TileIndex};
use crate::linkgraph::path::{PathArena, PathId};
use crate::settings::LinkGraphSettings;
use std::collections::BTreeMap;

/// A station's snapshot inside one component.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub station: StationId,
    pub xy: TileIndex,
    pub supply: u32,
    /// Supply not yet covered by assigned flow. Consumed by the solver.
    pub undelivered_supply: u32,
    pub demand: u32,
    /// Paths through this node, across all solver runs.
    pub(crate) paths: Vec<PathId>,
    /// Staged flow plans produced by the flow mapper:
    /// origin station -> via station -> planned flow.
    pub(crate) flows: BTreeMap<StationId, BTreeMap<StationId, u32>>,
}

impl Node {
    pub fn flows(&self) -> &BTreeMap<StationId, BTreeMap<StationId, u32>> {
        &self.flows
    }
}

/// One cell of the dense edge matrix.
#[derive(Debug, Clone, Copy, Default)]
pub struct Edge {
    pub distance: u32,
    pub capacity: u32,
    pub demand: u32,
    pub unsatisfied_demand: u32,
    pub flow: u32,
    /// Next destination in the row's adjacency chain.
    pub(crate) next_edge: Option<NodeIndex>,
}

/// A connected station cluster snapshotted for one job.
#[derive(Debug)]
pub struct LinkGraphComponent {
    cargo: CargoId,
    colour: ComponentColour,
    settings: LinkGraphSettings,
    max_distance: u32,
    nodes: Vec<Node>,
    /// Dense `size * size` matrix, row-major by source node.
    edges: Vec<Edge>,
    /// Head of each row's adjacency chain, kept apart from the matrix.
    first_edge: Vec<Option<NodeIndex>>,
    pub(crate) paths: PathArena,
}

impl LinkGraphComponent {
    pub fn new(
        cargo: CargoId,
        colour: ComponentColour,
        settings: LinkGraphSettings,
        max_distance: u32,
    ) -> Self {
        Self {
            cargo,
            colour,
            settings,
            max_distance,
            nodes: Vec::new(),
            edges: Vec::new(),
            first_edge: Vec::new(),
            paths: PathArena::new(),
        }
    }

    pub fn cargo(&self) -> CargoId {
        self.cargo
    }

    pub fn colour(&self) -> ComponentColour {
        self.colour
    }

    pub fn settings(&self) -> &LinkGraphSettings {
        &self.settings
    }

    pub fn max_distance(&self) -> u32 {
        self.max_distance
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Registers a station. All nodes must be added before
    /// [`Self::init_edges`].
    pub fn add_node(
        &mut self,
        station: StationId,
        xy: TileIndex,
        supply: u32,
        demand: u32,
    ) -> NodeIndex {
        debug_assert!(
            self.edges.is_empty(),
            "nodes must be added before the edge matrix exists"
        );
        let index = NodeIndex(self.nodes.len() as u32);
        self.nodes.push(Node {
            station,
            xy,
            supply,
            undelivered_supply: supply,
            demand,
            paths: Vec::new(),
            flows: BTreeMap::new(),
        });
        index
    }

    /// Allocates the dense edge matrix once the node set is final.
    pub fn init_edges(&mut self) {
        let n = self.nodes.len();
        self.edges = vec![Edge::default(); n * n];
        self.first_edge = vec![None; n];
    }

    /// Records link capacity from `from` to `to`, chaining the edge into
    /// the row's adjacency list on first sight.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, capacity: u32) {
        debug_assert_ne!(from, to, "a station has no link to itself");
        if capacity == 0 {
            return;
        }
        let n = self.nodes.len();
        let edge = &mut self.edges[from.index() * n + to.index()];
        if edge.capacity == 0 {
            edge.next_edge = self.first_edge[from.index()];
            self.first_edge[from.index()] = Some(to);
        }
        edge.capacity += capacity;
    }

    /// Fills the distance of every node pair: manhattan distance capped at
    /// [`Self::max_distance`]. Demand estimation needs distances between
    /// unlinked pairs too, so the whole matrix is written.
    pub fn calculate_distances(&mut self, map: &Map) {
        let n = self.nodes.len();
        for from in 0..n {
            for to in 0..n {
                let d = map
                    .manhattan_distance(self.nodes[from].xy, self.nodes[to].xy)
                    .min(self.max_distance);
                self.edges[from * n + to].distance = d;
            }
        }
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index.index()]
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> &mut Node {
        &mut self.nodes[index.index()]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeIndex(i as u32), node))
    }

    pub fn edge(&self, from: NodeIndex, to: NodeIndex) -> &Edge {
        &self.edges[from.index() * self.nodes.len() + to.index()]
    }

    pub fn edge_mut(&mut self, from: NodeIndex, to: NodeIndex) -> &mut Edge {
        let n = self.nodes.len();
        &mut self.edges[from.index() * n + to.index()]
    }

    /// Destinations with a real (positive-capacity) edge out of `from`, in
    /// chain order.
    pub fn out_edges(&self, from: NodeIndex) -> OutEdges<'_> {
        OutEdges {
            component: self,
            from,
            current: self.first_edge[from.index()],
        }
    }

    // -----------------------------------------------------------------------
    // Path plumbing (split borrows between arena and edge matrix)
    // -----------------------------------------------------------------------

    /// Pushes flow along the chain ending at `leaf`. See
    /// [`PathArena::add_flow`].
    pub(crate) fn add_flow(&mut self, leaf: PathId, flow: u32, only_positive: bool) -> u32 {
        let n = self.nodes.len();
        self.paths.add_flow(leaf, flow, &mut self.edges, n, only_positive)
    }

    /// Drops flowless, childless paths and cleans the node-side path sets.
    pub(crate) fn prune_paths(&mut self) {
        let removed = self.paths.prune_orphans();
        if removed.is_empty() {
            return;
        }
        for node in &mut self.nodes {
            node.paths.retain(|id| !removed.contains(id));
        }
    }
}

/// Iterator over a row's adjacency chain.
pub struct OutEdges<'a> {
    component: &'a LinkGraphComponent,
    from: NodeIndex,
    current: Option<NodeIndex>,
}

impl Iterator for OutEdges<'_> {
    type Item = NodeIndex;

    fn next(&mut self) -> Option<NodeIndex> {
        let current = self.current?;
        self.current = self.component.edge(self.from, current).next_edge;
        Some(current)
    }
}
