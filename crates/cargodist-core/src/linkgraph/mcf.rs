//! Flow assignment over the demand matrix.
//!
//! Repeated shortest-path augmentation: for every source with undelivered
//! supply, a Dijkstra run over the capacity edges finds the cheapest routes,
//! where an edge's cost grows with its congestion. Flow is pushed toward
//! every sink the source owes cargo, bounded by the source's remaining
//! supply, the pair's unsatisfied demand and the residual capacity of the
//! path. The solver stops when a full round assigns nothing or the accuracy
//! budget is spent.
//!
//! Stability over optimality: the result only has to be good and, above
//! all, reproducible. All costs are integral and the heap is keyed by
//! `(cost, node)` so equal-cost candidates resolve to the lower node index
//! on every platform.

use crate::id::NodeIndex;
use crate::linkgraph::component::LinkGraphComponent;
use crate::linkgraph::job::{CancelToken, ComponentHandler};
use crate::linkgraph::path::PathId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// The augmenting-path solver.
pub struct MultiCommodityFlow;

impl ComponentHandler for MultiCommodityFlow {
    fn run(&mut self, component: &mut LinkGraphComponent, cancel: &CancelToken) {
        let n = component.size();
        if n < 2 {
            return;
        }
        let accuracy = component.settings().clamped_accuracy();
        for _pass in 0..accuracy {
            if cancel.is_cancelled() {
                return;
            }
            let mut progressed = false;
            for source in 0..n {
                let source = NodeIndex(source as u32);
                if component.node(source).undelivered_supply == 0 {
                    continue;
                }
                progressed |= augment_from(component, source);
            }
            if !progressed {
                break;
            }
        }
        component.prune_paths();
    }
}

/// Congestion-aware cost of an edge: the base distance plus a penalty
/// growing linearly with how full the edge already is.
fn edge_cost(distance: u32, flow: u32, capacity: u32) -> u64 {
    debug_assert!(capacity > 0);
    u64::from(distance) + u64::from(distance) * u64::from(flow) / u64::from(capacity)
}

/// One Dijkstra run from `source` plus augmentation toward every indebted
/// sink. Returns whether any flow was assigned.
fn augment_from(component: &mut LinkGraphComponent, source: NodeIndex) -> bool {
    let n = component.size();
    let paths = shortest_paths(component, source);

    let mut progressed = false;
    for dest in 0..n {
        let dest = NodeIndex(dest as u32);
        if dest == source {
            continue;
        }
        let owed = component.edge(source, dest).unsatisfied_demand;
        if owed == 0 {
            continue;
        }
        let Some(leaf) = paths[dest.index()] else {
            continue; // unreachable through the capacity edges
        };
        let path_capacity = component.paths.capacity_of(leaf);
        if path_capacity <= 0 {
            continue;
        }
        let want = component
            .node(source)
            .undelivered_supply
            .min(owed)
            .min(path_capacity.min(i64::from(u32::MAX)) as u32);
        if want == 0 {
            continue;
        }
        let moved = component.add_flow(leaf, want, true);
        if moved == 0 {
            continue;
        }
        component.node_mut(source).undelivered_supply -= moved;
        component.edge_mut(source, dest).unsatisfied_demand -= moved;
        progressed = true;
    }
    progressed
}

/// Dijkstra over the capacity edges, building a fresh path tree rooted at
/// `source`. Saturated edges do not count as reachable. Returns the leaf
/// path of every reached node.
fn shortest_paths(
    component: &mut LinkGraphComponent,
    source: NodeIndex,
) -> Vec<Option<PathId>> {
    let n = component.size();
    let mut dist: Vec<u64> = vec![u64::MAX; n];
    let mut paths: Vec<Option<PathId>> = vec![None; n];

    let root = component.paths.insert_source(source);
    component.node_mut(source).paths.push(root);
    paths[source.index()] = Some(root);
    dist[source.index()] = 0;

    let mut heap: BinaryHeap<Reverse<(u64, u32)>> = BinaryHeap::new();
    heap.push(Reverse((0, source.0)));

    while let Some(Reverse((d, u))) = heap.pop() {
        let u = NodeIndex(u);
        if d > dist[u.index()] {
            continue;
        }
        let neighbours: Vec<NodeIndex> = component.out_edges(u).collect();
        for v in neighbours {
            let edge = component.edge(u, v);
            let residual = edge.capacity.saturating_sub(edge.flow);
            if residual == 0 {
                continue;
            }
            let cost = edge_cost(edge.distance, edge.flow, edge.capacity);
            let next_dist = d.saturating_add(cost);
            if next_dist >= dist[v.index()] {
                continue;
            }
            dist[v.index()] = next_dist;
            let path = match paths[v.index()] {
                Some(path) => path,
                None => {
                    let path = component.paths.insert_unreached(v);
                    component.node_mut(v).paths.push(path);
                    paths[v.index()] = Some(path);
                    path
                }
            };
            let base = paths[u.index()].expect("settled node always has a path");
            component.paths.fork(path, base, i64::from(residual), cost);
            heap.push(Reverse((next_dist, v.0)));
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{CargoId, ComponentColour, Map, StationId};
    use crate::linkgraph::demands::DemandCalculator;
    use crate::settings::{DistributionType, LinkGraphSettings};
    use slotmap::SlotMap;

    struct Builder {
        map: Map,
        stations: SlotMap<StationId, ()>,
        component: LinkGraphComponent,
    }

    impl Builder {
        fn new() -> Self {
            let map = Map::new(64, 64);
            Self {
                map,
                stations: SlotMap::with_key(),
                component: LinkGraphComponent::new(
                    CargoId(0),
                    ComponentColour(1),
                    LinkGraphSettings::default(),
                    map.max_link_distance(),
                ),
            }
        }

        fn node(&mut self, x: u32, supply: u32, demand: u32) -> NodeIndex {
            self.component
                .add_node(self.stations.insert(()), self.map.tile(x, 0), supply, demand)
        }

        fn finish(mut self, edges: &[(NodeIndex, NodeIndex, u32)]) -> LinkGraphComponent {
            self.component.init_edges();
            for &(from, to, capacity) in edges {
                self.component.add_edge(from, to, capacity);
            }
            self.component.calculate_distances(&self.map);
            self.component
        }
    }

    fn solve(component: &mut LinkGraphComponent) {
        MultiCommodityFlow.run(component, &CancelToken::new());
    }

    // -----------------------------------------------------------------------
    // Two nodes, capacity below demand: flow fills the edge, rest stays owed
    // -----------------------------------------------------------------------
    #[test]
    fn minimal_flow_respects_capacity() {
        let mut b = Builder::new();
        let a = b.node(0, 10, 0);
        let c = b.node(8, 0, 10);
        let mut component = b.finish(&[(a, c, 4)]);
        // Demand assignment: everything A has is owed to C.
        {
            let edge = component.edge_mut(a, c);
            edge.demand = 10;
            edge.unsatisfied_demand = 10;
        }

        solve(&mut component);

        assert_eq!(component.edge(a, c).flow, 4);
        assert_eq!(component.edge(a, c).unsatisfied_demand, 6);
        assert_eq!(component.node(a).undelivered_supply, 6);
    }

    #[test]
    fn flow_routes_around_congestion() {
        // a -> d directly (short) and a -> b -> d (long). Direct capacity is
        // small, so the rest must take the detour.
        let mut builder = Builder::new();
        let a = builder.node(0, 30, 0);
        let b = builder.node(16, 0, 0);
        let d = builder.node(8, 0, 30);
        let mut component = builder.finish(&[(a, d, 10), (a, b, 30), (b, d, 30)]);
        {
            let edge = component.edge_mut(a, d);
            edge.demand = 30;
            edge.unsatisfied_demand = 30;
        }

        solve(&mut component);

        let direct = component.edge(a, d).flow;
        let via_b = component.edge(a, b).flow;
        assert_eq!(direct + via_b, 30, "all supply should be routed");
        assert_eq!(component.edge(b, d).flow, via_b);
        assert_eq!(direct, 10, "direct edge should saturate first");
    }

    #[test]
    fn flow_never_exceeds_capacity() {
        let mut builder = Builder::new();
        let a = builder.node(0, 100, 0);
        let b = builder.node(8, 0, 50);
        let c = builder.node(24, 0, 60);
        let mut component = builder.finish(&[(a, b, 20), (b, c, 15), (a, c, 5)]);
        DemandCalculator::new(DistributionType::Asymmetric)
            .run(&mut component, &CancelToken::new());

        solve(&mut component);

        for from in 0..3u32 {
            for to in 0..3u32 {
                let edge = component.edge(NodeIndex(from), NodeIndex(to));
                assert!(
                    edge.flow <= edge.capacity,
                    "flow {} over capacity {} on ({from}, {to})",
                    edge.flow,
                    edge.capacity
                );
            }
        }
    }

    #[test]
    fn conservation_holds_at_every_node() {
        let mut builder = Builder::new();
        let a = builder.node(0, 40, 0);
        let b = builder.node(8, 10, 20);
        let c = builder.node(16, 0, 40);
        let mut component = builder.finish(&[(a, b, 30), (b, c, 30), (a, c, 10)]);
        DemandCalculator::new(DistributionType::Asymmetric)
            .run(&mut component, &CancelToken::new());

        solve(&mut component);

        for node in 0..3u32 {
            let node = NodeIndex(node);
            let outgoing: u64 = (0..3u32)
                .map(|to| u64::from(component.edge(node, NodeIndex(to)).flow))
                .sum();
            let incoming: u64 = (0..3u32)
                .map(|from| u64::from(component.edge(NodeIndex(from), node).flow))
                .sum();
            let supply = u64::from(component.node(node).supply);
            // Flow may only terminate here to settle assigned pair demand.
            let assigned_demand: u64 = (0..3u32)
                .map(|from| u64::from(component.edge(NodeIndex(from), node).demand))
                .sum();
            assert!(
                outgoing <= incoming + supply,
                "node {node:?} emits more than it receives plus supplies"
            );
            assert!(
                incoming <= outgoing + assigned_demand,
                "node {node:?} swallows more than was assigned to it"
            );
        }
    }

    #[test]
    fn unreachable_demand_stays_unsatisfied() {
        let mut builder = Builder::new();
        let a = builder.node(0, 10, 0);
        let b = builder.node(8, 0, 10);
        // No edges at all.
        let mut component = builder.finish(&[]);
        {
            let edge = component.edge_mut(a, b);
            edge.demand = 10;
            edge.unsatisfied_demand = 10;
        }

        solve(&mut component);
        assert_eq!(component.edge(a, b).flow, 0);
        assert_eq!(component.edge(a, b).unsatisfied_demand, 10);
        assert_eq!(component.node(a).undelivered_supply, 10);
    }

    #[test]
    fn identical_components_solve_identically() {
        let build = || {
            let mut builder = Builder::new();
            let a = builder.node(0, 50, 10);
            let b = builder.node(8, 20, 40);
            let c = builder.node(24, 10, 30);
            let mut component =
                builder.finish(&[(a, b, 25), (b, a, 25), (b, c, 20), (c, b, 20), (a, c, 5)]);
            DemandCalculator::new(DistributionType::Asymmetric)
                .run(&mut component, &CancelToken::new());
            component
        };
        let mut first = build();
        let mut second = build();
        solve(&mut first);
        solve(&mut second);

        for from in 0..3u32 {
            for to in 0..3u32 {
                assert_eq!(
                    first.edge(NodeIndex(from), NodeIndex(to)).flow,
                    second.edge(NodeIndex(from), NodeIndex(to)).flow,
                    "flows must be reproducible"
                );
            }
        }
    }
}
