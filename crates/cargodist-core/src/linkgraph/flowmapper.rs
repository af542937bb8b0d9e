//! Turns solved path flows into per-station flow plans.
//!
//! A path with flow at node `n` and parent `m` means: cargo originating at
//! the path's root passes through `m` and continues via `n`. So the staging
//! entry lands at `m`: cargo from the origin station should leave `m`
//! toward `n`'s station. Zero-flow paths produce nothing; equal
//! (origin, via) pairs merge by addition.

use crate::linkgraph::component::LinkGraphComponent;
use crate::linkgraph::job::{CancelToken, ComponentHandler};

/// Converts accumulated path flows into the nodes' staged `flows` maps,
/// which the join step writes back to the stations.
pub struct FlowMapper;

impl ComponentHandler for FlowMapper {
    fn run(&mut self, component: &mut LinkGraphComponent, _cancel: &CancelToken) {
        let n = component.size();
        for index in 0..n {
            let via_node = crate::id::NodeIndex(index as u32);
            let paths = component.node(via_node).paths.clone();
            for path in paths {
                let flow = component.paths.flow_of(path);
                if flow == 0 {
                    continue;
                }
                let Some(parent) = component.paths.parent_of(path) else {
                    continue; // the root has no previous hop
                };
                let prev_node = component.paths.node_of(parent);
                let origin = component.node(component.paths.origin_of(path)).station;
                let via = component.node(via_node).station;
                *component
                    .node_mut(prev_node)
                    .flows
                    .entry(origin)
                    .or_default()
                    .entry(via)
                    .or_insert(0) += flow;
            }
        }
    }
}
