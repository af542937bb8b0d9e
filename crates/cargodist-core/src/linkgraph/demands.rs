//! Demand estimation: who wants how much from whom.
//!
//! Turns per-node supply and demand into a pairwise demand matrix, before
//! the solver decides which links actually carry it. Integer arithmetic
//! throughout; iteration order is fixed by node index so the result is
//! identical across runs and platforms.

use crate::id::NodeIndex;
use crate::linkgraph::component::LinkGraphComponent;
use crate::linkgraph::job::{CancelToken, ComponentHandler};
use crate::settings::DistributionType;

/// Derives `Edge.demand` from node supplies and demands.
///
/// Each pass distributes every source's remaining supply over the sinks,
/// proportionally to a weight combining the sink's demand, its distance
/// (farther is less attractive, scaled by `demand_distance`) and its size
/// (bigger stations attract more, scaled by `demand_size`).
///
/// Asymmetric mode is supply-driven: a sink's demand only weights its
/// share, it does not cap it. Symmetric mode grants every amount in both
/// directions and requires headroom on both sides, which caps each pair by
/// both supply and demand and makes the matrix exactly symmetric.
///
/// Supply consumption is tracked in local scratch; `undelivered_supply` on
/// the nodes belongs to the flow solver.
pub struct DemandCalculator {
    distribution: DistributionType,
}

impl DemandCalculator {
    pub fn new(distribution: DistributionType) -> Self {
        Self { distribution }
    }

    fn weight(&self, component: &LinkGraphComponent, sink: usize, distance: u32) -> u128 {
        let node = component.node(NodeIndex(sink as u32));
        if node.demand == 0 {
            return 0;
        }
        let settings = component.settings();
        let scale = u128::from(component.max_distance()) * 100;
        let deterred = scale
            .saturating_sub(u128::from(distance) * u128::from(settings.demand_distance))
            .max(1);
        let sized = 100 + u128::from(node.supply) * u128::from(settings.demand_size) / 100;
        u128::from(node.demand) * deterred * sized
    }
}

impl ComponentHandler for DemandCalculator {
    fn run(&mut self, component: &mut LinkGraphComponent, cancel: &CancelToken) {
        if self.distribution == DistributionType::Manual {
            return;
        }
        let n = component.size();
        if n < 2 {
            return;
        }
        let symmetric = self.distribution == DistributionType::Symmetric;
        let accuracy = component.settings().clamped_accuracy();

        let mut undelivered: Vec<u32> = (0..n)
            .map(|i| component.node(NodeIndex(i as u32)).supply)
            .collect();
        let mut unsatisfied: Vec<u32> = (0..n)
            .map(|i| component.node(NodeIndex(i as u32)).demand)
            .collect();

        for _pass in 0..accuracy {
            if cancel.is_cancelled() {
                return;
            }
            let mut granted_any = false;
            for i in 0..n {
                if undelivered[i] == 0 {
                    continue;
                }
                let from = NodeIndex(i as u32);

                let mut weights = vec![0u128; n];
                let mut total = 0u128;
                for (j, weight) in weights.iter_mut().enumerate() {
                    if j == i {
                        continue;
                    }
                    if symmetric && unsatisfied[j] == 0 {
                        continue;
                    }
                    let distance = component.edge(from, NodeIndex(j as u32)).distance;
                    *weight = self.weight(component, j, distance);
                    total += *weight;
                }
                if total == 0 {
                    continue;
                }

                let budget = u128::from(undelivered[i]);
                for (j, &weight) in weights.iter().enumerate() {
                    if weight == 0 || undelivered[i] == 0 {
                        continue;
                    }
                    let to = NodeIndex(j as u32);
                    // Ceiling share so even tiny weights are served eventually.
                    let share = ((budget * weight + total - 1) / total) as u32;
                    let mut amount = share.min(undelivered[i]);
                    if symmetric {
                        amount = amount
                            .min(unsatisfied[j])
                            .min(undelivered[j])
                            .min(unsatisfied[i]);
                    }
                    if amount == 0 {
                        continue;
                    }
                    grant(component, from, to, amount);
                    undelivered[i] -= amount;
                    if symmetric {
                        unsatisfied[j] -= amount;
                        grant(component, to, from, amount);
                        undelivered[j] -= amount;
                        unsatisfied[i] -= amount;
                    }
                    granted_any = true;
                }
            }
            if !granted_any {
                break;
            }
        }
    }
}

fn grant(
    component: &mut LinkGraphComponent,
    from: NodeIndex,
    to: NodeIndex,
    amount: u32,
) {
    let edge = component.edge_mut(from, to);
    edge.demand += amount;
    edge.unsatisfied_demand += amount;
}
