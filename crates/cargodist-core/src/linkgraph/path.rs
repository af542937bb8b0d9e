//! Path trees for the flow solver.
//!
//! Every Dijkstra run grows a tree of `Path` records rooted at the source
//! node. Paths reference their parent by generational id into a shared
//! arena, so a stale parent is detectable and the tree can never dangle.
//! Flow pushed along a leaf is propagated up the chain onto the component's
//! edges; the accumulated per-path flow is what the flow mapper later turns
//! into flow plans.

use crate::id::NodeIndex;
use crate::linkgraph::component::Edge;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Identifies a path record in a component's arena.
    pub struct PathId;
}

/// One node's position in a path tree.
#[derive(Debug, Clone)]
pub struct Path {
    pub(crate) node: NodeIndex,
    /// Root of the chain; the node the flow originates from.
    pub(crate) origin: NodeIndex,
    pub(crate) parent: Option<PathId>,
    /// Accumulated cost from the origin. `u64::MAX` while unreached.
    pub(crate) distance: u64,
    /// Residual capacity of the chain during the current search run.
    pub(crate) capacity: i64,
    /// Flow assigned through this path so far.
    pub(crate) flow: u32,
    pub(crate) num_children: u32,
}

/// Arena owning every path of one component.
#[derive(Debug, Default)]
pub struct PathArena {
    paths: SlotMap<PathId, Path>,
}

impl PathArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// A root path: zero distance, unlimited capacity.
    pub fn insert_source(&mut self, node: NodeIndex) -> PathId {
        self.paths.insert(Path {
            node,
            origin: node,
            parent: None,
            distance: 0,
            capacity: i64::MAX,
            flow: 0,
            num_children: 0,
        })
    }

    /// A not-yet-reached path; [`Self::fork`] attaches it to the tree.
    pub fn insert_unreached(&mut self, node: NodeIndex) -> PathId {
        self.paths.insert(Path {
            node,
            origin: node,
            parent: None,
            distance: u64::MAX,
            capacity: 0,
            flow: 0,
            num_children: 0,
        })
    }

    pub fn get(&self, id: PathId) -> &Path {
        &self.paths[id]
    }

    pub fn node_of(&self, id: PathId) -> NodeIndex {
        self.paths[id].node
    }

    pub fn origin_of(&self, id: PathId) -> NodeIndex {
        self.paths[id].origin
    }

    pub fn parent_of(&self, id: PathId) -> Option<PathId> {
        self.paths[id].parent
    }

    pub fn flow_of(&self, id: PathId) -> u32 {
        self.paths[id].flow
    }

    pub fn capacity_of(&self, id: PathId) -> i64 {
        self.paths[id].capacity
    }

    pub fn distance_of(&self, id: PathId) -> u64 {
        self.paths[id].distance
    }

    /// Attaches `child` below `base`: the chain capacity is the bottleneck
    /// of the base chain and `cap`, the distance extends by `dist`.
    /// Re-forking detaches from the old parent first.
    pub fn fork(&mut self, child: PathId, base: PathId, cap: i64, dist: u64) {
        debug_assert!(!self.chain_contains(base, child), "fork would close a cycle");
        self.unfork(child);
        let (base_capacity, base_distance, base_origin) = {
            let base = &mut self.paths[base];
            base.num_children += 1;
            (base.capacity, base.distance, base.origin)
        };
        let child = &mut self.paths[child];
        child.parent = Some(base);
        child.capacity = base_capacity.min(cap);
        child.distance = base_distance.saturating_add(dist);
        child.origin = base_origin;
    }

    /// Detaches a path from its parent, releasing the parent's child count.
    pub fn unfork(&mut self, child: PathId) {
        if let Some(parent) = self.paths[child].parent.take() {
            let parent = &mut self.paths[parent];
            debug_assert!(parent.num_children > 0);
            parent.num_children -= 1;
        }
    }

    /// Pushes `flow` along the chain ending at `leaf`, adding it to every
    /// edge on the way to the root and to every path record. With
    /// `only_positive` the amount is first clamped to the smallest edge
    /// residual so no edge overflows its capacity. Returns the amount
    /// actually applied.
    pub fn add_flow(
        &mut self,
        leaf: PathId,
        flow: u32,
        edges: &mut [Edge],
        num_nodes: usize,
        only_positive: bool,
    ) -> u32 {
        let mut allowed = flow;
        if only_positive {
            let mut cursor = leaf;
            let mut steps = 0usize;
            while let Some(parent) = self.paths[cursor].parent {
                let from = self.paths[parent].node.index();
                let to = self.paths[cursor].node.index();
                let edge = &edges[from * num_nodes + to];
                allowed = allowed.min(edge.capacity.saturating_sub(edge.flow));
                cursor = parent;
                steps += 1;
                debug_assert!(steps <= num_nodes, "cycle in path chain");
            }
        }
        if allowed == 0 {
            return 0;
        }
        let mut cursor = leaf;
        loop {
            self.paths[cursor].flow += allowed;
            let Some(parent) = self.paths[cursor].parent else {
                break;
            };
            let from = self.paths[parent].node.index();
            let to = self.paths[cursor].node.index();
            edges[from * num_nodes + to].flow += allowed;
            cursor = parent;
        }
        allowed
    }

    /// Drops every path that carries no flow and has no children, cascading
    /// up the chains. Returns the removed ids so node-side path sets can be
    /// cleaned.
    pub fn prune_orphans(&mut self) -> Vec<PathId> {
        let mut removed = Vec::new();
        loop {
            let orphans: Vec<PathId> = self
                .paths
                .iter()
                .filter(|(_, p)| p.flow == 0 && p.num_children == 0)
                .map(|(id, _)| id)
                .collect();
            if orphans.is_empty() {
                break;
            }
            for id in orphans {
                self.unfork(id);
                self.paths.remove(id);
                removed.push(id);
            }
        }
        removed
    }

    #[cfg(debug_assertions)]
    fn chain_contains(&self, mut cursor: PathId, needle: PathId) -> bool {
        loop {
            if cursor == needle {
                return true;
            }
            match self.paths[cursor].parent {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }

    #[cfg(not(debug_assertions))]
    #[allow(dead_code)]
    fn chain_contains(&self, _cursor: PathId, _needle: PathId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge_with_capacity(capacity: u32) -> Edge {
        Edge {
            capacity,
            ..Edge::default()
        }
    }

    #[test]
    fn fork_tracks_bottleneck_and_distance() {
        let mut arena = PathArena::new();
        let root = arena.insert_source(NodeIndex(0));
        let mid = arena.insert_unreached(NodeIndex(1));
        let leaf = arena.insert_unreached(NodeIndex(2));

        arena.fork(mid, root, 40, 10);
        arena.fork(leaf, mid, 25, 5);

        assert_eq!(arena.capacity_of(leaf), 25);
        assert_eq!(arena.distance_of(leaf), 15);
        assert_eq!(arena.origin_of(leaf), NodeIndex(0));
        assert_eq!(arena.get(root).num_children, 1);
        assert_eq!(arena.get(mid).num_children, 1);
    }

    #[test]
    fn refork_releases_the_old_parent() {
        let mut arena = PathArena::new();
        let root = arena.insert_source(NodeIndex(0));
        let a = arena.insert_unreached(NodeIndex(1));
        let b = arena.insert_unreached(NodeIndex(2));

        arena.fork(a, root, 10, 1);
        arena.fork(b, a, 10, 1);
        assert_eq!(arena.get(a).num_children, 1);

        // A shorter route directly from the root appears.
        arena.fork(b, root, 10, 1);
        assert_eq!(arena.get(a).num_children, 0);
        assert_eq!(arena.get(root).num_children, 2);
    }

    #[test]
    fn add_flow_walks_the_chain() {
        let mut arena = PathArena::new();
        let n = 3usize;
        let mut edges: Vec<Edge> = (0..n * n).map(|_| edge_with_capacity(100)).collect();

        let root = arena.insert_source(NodeIndex(0));
        let mid = arena.insert_unreached(NodeIndex(1));
        let leaf = arena.insert_unreached(NodeIndex(2));
        arena.fork(mid, root, 100, 1);
        arena.fork(leaf, mid, 100, 1);

        let applied = arena.add_flow(leaf, 30, &mut edges, n, true);
        assert_eq!(applied, 30);
        assert_eq!(edges[1].flow, 30); // 0 -> 1
        assert_eq!(edges[1 * n + 2].flow, 30); // 1 -> 2
        assert_eq!(arena.flow_of(root), 30);
        assert_eq!(arena.flow_of(mid), 30);
        assert_eq!(arena.flow_of(leaf), 30);
    }

    #[test]
    fn add_flow_clamps_to_residual() {
        let mut arena = PathArena::new();
        let n = 2usize;
        let mut edges: Vec<Edge> = (0..n * n).map(|_| edge_with_capacity(10)).collect();
        edges[1].flow = 7; // 0 -> 1 has 3 residual

        let root = arena.insert_source(NodeIndex(0));
        let leaf = arena.insert_unreached(NodeIndex(1));
        arena.fork(leaf, root, 3, 1);

        let applied = arena.add_flow(leaf, 10, &mut edges, n, true);
        assert_eq!(applied, 3);
        assert_eq!(edges[1].flow, 10);
    }

    #[test]
    fn prune_drops_flowless_chains() {
        let mut arena = PathArena::new();
        let n = 2usize;
        let mut edges: Vec<Edge> = (0..n * n).map(|_| edge_with_capacity(10)).collect();

        let root = arena.insert_source(NodeIndex(0));
        let used = arena.insert_unreached(NodeIndex(1));
        let unused = arena.insert_unreached(NodeIndex(1));
        arena.fork(used, root, 10, 1);
        arena.fork(unused, root, 10, 1);
        arena.add_flow(used, 5, &mut edges, n, true);

        let removed = arena.prune_orphans();
        assert!(removed.contains(&unused));
        assert!(!removed.contains(&used));
        assert_eq!(arena.len(), 2);
    }
}
