//! Per-(station, cargo) state: waiting cargo, flow plans and link statistics.
//!
//! `FlowStatMap` answers "where should cargo from source S go next from
//! here?". `LinkStatMap` records the observed capacity and throughput of
//! outgoing links; it is the raw material from which components are
//! extracted.

use crate::cargolist::StationCargo;
use crate::id::{ComponentColour, StationId};
use crate::packet::CargoPacketPool;
use crate::settings::LinkGraphSettings;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Rating a goods entry starts with.
pub const INITIAL_STATION_RATING: u8 = 175;

// ---------------------------------------------------------------------------
// FlowStat
// ---------------------------------------------------------------------------

/// Planned and realised flow toward one next-hop station.
///
/// Ordered by remaining credit (`planned - sent`) descending, ties by `via`
/// descending. The ordering key is mutable, so every `sent` update must
/// remove and re-insert the entry rather than mutate it in place.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlowStat {
    pub via: StationId,
    pub planned: u32,
    pub sent: u32,
}

impl FlowStat {
    pub fn new(via: StationId, planned: u32) -> Self {
        Self {
            via,
            planned,
            sent: 0,
        }
    }

    /// Credit left on this entry. Negative once more was sent than planned.
    pub fn remaining(&self) -> i64 {
        i64::from(self.planned) - i64::from(self.sent)
    }
}

impl Ord for FlowStat {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .remaining()
            .cmp(&self.remaining())
            .then_with(|| other.via.cmp(&self.via))
    }
}

impl PartialOrd for FlowStat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Consistent with Ord: entries compare equal when remaining credit and via
// match. Within one set, `via` is unique, so this never conflates entries.
impl PartialEq for FlowStat {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FlowStat {}

/// Flow entries at one station for one source, best candidate first.
pub type FlowStatSet = BTreeSet<FlowStat>;

/// Flow plans keyed by the origin station of the cargo.
pub type FlowStatMap = BTreeMap<StationId, FlowStatSet>;

// ---------------------------------------------------------------------------
// LinkStat
// ---------------------------------------------------------------------------

/// Capacity and usage of one outgoing link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStat {
    /// Rolling sum of vehicle capacities seen on this link.
    pub capacity: u32,
    /// Realised throughput.
    pub usage: u32,
    /// Capacity reserved by in-flight link graph jobs. Ageing never takes
    /// `capacity` below this floor.
    pub frozen: u32,
}

impl LinkStat {
    /// One step of the monthly moving average: scale by 30, divide by the
    /// configured window, floor capacity at the frozen reservation.
    pub fn age(&mut self, divisor: u64) {
        self.capacity = (u64::from(self.capacity) * 30 / divisor) as u32;
        if self.capacity < self.frozen {
            self.capacity = self.frozen;
        }
        self.usage = (u64::from(self.usage) * 30 / divisor) as u32;
    }

    /// True once the link carries no information worth keeping.
    pub fn is_stale(&self) -> bool {
        self.capacity == 0 && self.usage == 0 && self.frozen == 0
    }
}

/// Outgoing link statistics keyed by the destination station.
pub type LinkStatMap = BTreeMap<StationId, LinkStat>;

// ---------------------------------------------------------------------------
// GoodsEntry
// ---------------------------------------------------------------------------

/// Everything a station tracks about one cargo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoodsEntry {
    /// Bitmask of [`GoodsEntry::ACCEPTANCE`] and [`GoodsEntry::PICKUP`].
    pub acceptance_pickup: u8,
    pub rating: u8,
    /// Rolling count of cargo generated here; aged with the link stats.
    pub supply: u32,
    /// Cargo waiting at the station, keyed by planned next hop.
    pub cargo: StationCargo,
    /// Planned flows through this station, by origin.
    pub flows: FlowStatMap,
    /// Observed outgoing links.
    pub link_stats: LinkStatMap,
    /// Component this station was last merged from.
    pub last_component: ComponentColour,
}

impl GoodsEntry {
    pub const ACCEPTANCE: u8 = 1 << 0;
    pub const PICKUP: u8 = 1 << 1;

    pub fn new() -> Self {
        Self {
            rating: INITIAL_STATION_RATING,
            ..Self::default()
        }
    }

    pub fn accepts(&self) -> bool {
        self.acceptance_pickup & Self::ACCEPTANCE != 0
    }

    pub fn picks_up(&self) -> bool {
        self.acceptance_pickup & Self::PICKUP != 0
    }

    pub fn set_acceptance(&mut self, accepts: bool) {
        if accepts {
            self.acceptance_pickup |= Self::ACCEPTANCE;
        } else {
            self.acceptance_pickup &= !Self::ACCEPTANCE;
        }
    }

    pub fn set_pickup(&mut self, picks_up: bool) {
        if picks_up {
            self.acceptance_pickup |= Self::PICKUP;
        } else {
            self.acceptance_pickup &= !Self::PICKUP;
        }
    }

    // -----------------------------------------------------------------------
    // Flow stats
    // -----------------------------------------------------------------------

    /// Records `count` cargo from `source` as sent toward `next`.
    pub fn update_flow_stats(&mut self, source: StationId, count: u32, next: StationId) {
        let Some(set) = self.flows.get_mut(&source) else {
            return;
        };
        let Some(entry) = set.iter().find(|f| f.via == next).copied() else {
            return;
        };
        set.remove(&entry);
        let mut updated = entry;
        updated.sent += count;
        set.insert(updated);
    }

    /// Picks a next hop for `count` cargo from `source` that cannot stay at
    /// `curr`: the best entry with strictly positive remaining credit,
    /// excluding `curr` itself so cargo never bounces straight back. The
    /// chosen entry's `sent` is bumped. `None` when no plan applies.
    pub fn update_flow_stats_transfer(
        &mut self,
        source: StationId,
        count: u32,
        curr: StationId,
    ) -> Option<StationId> {
        let set = self.flows.get_mut(&source)?;
        let entry = set
            .iter()
            .find(|f| f.via != curr && f.remaining() > 0)
            .copied()?;
        set.remove(&entry);
        let mut updated = entry;
        updated.sent += count;
        set.insert(updated);
        Some(updated.via)
    }

    /// Does any plan route cargo from `source` onward from here (other than
    /// back to `curr`)?
    pub fn has_onward_plan(&self, source: StationId, curr: StationId) -> bool {
        self.flows
            .get(&source)
            .is_some_and(|set| set.iter().any(|f| f.via != curr))
    }

    /// Sums planned and sent flow toward `via` across all sources.
    pub fn sum_flow_via(&self, via: StationId) -> FlowStat {
        let mut sum = FlowStat::new(via, 0);
        for set in self.flows.values() {
            for stat in set {
                if stat.via == via {
                    sum.planned += stat.planned;
                    sum.sent += stat.sent;
                }
            }
        }
        sum
    }

    // -----------------------------------------------------------------------
    // Link stats
    // -----------------------------------------------------------------------

    /// Accumulates a vehicle's capacity and realised load into the link
    /// toward `to`. The monthly ageing turns the sums into moving averages.
    pub fn increase_link_stats(&mut self, to: StationId, capacity: u32, usage: u32) {
        let stat = self.link_stats.entry(to).or_default();
        stat.capacity = stat.capacity.saturating_add(capacity);
        stat.usage = stat.usage.saturating_add(usage);
    }

    /// Re-destines every waiting packet bucketed for `to` after the link
    /// (`curr` -> `to`) became unusable. Each packet gets a fresh next hop
    /// from the flow plans (never `curr` itself) and moves to the matching
    /// bucket; packets without an applicable plan become undirected.
    pub fn reroute_stale_packets(
        &mut self,
        pool: &mut CargoPacketPool,
        curr: StationId,
        to: StationId,
    ) {
        let Some(bucket) = self.cargo.take_bucket(Some(to)) else {
            return;
        };
        for id in bucket {
            let Some(packet) = pool.get(id) else {
                continue;
            };
            let (source, count) = (packet.source, u32::from(packet.count()));
            let via = self.update_flow_stats_transfer(source, count, curr);
            if let Some(packet) = pool.get_mut(id) {
                packet.set_next(via);
            }
            self.cargo.insert_keyed(via, id);
        }
    }

    /// Monthly statistics decay. Returns the link targets that decayed to
    /// nothing and were dropped; the caller must reroute cargo bucketed for
    /// them.
    pub fn age_statistics(&mut self, settings: &LinkGraphSettings) -> Vec<StationId> {
        let divisor = settings.ageing_divisor();
        let mut dropped = Vec::new();
        for (to, stat) in self.link_stats.iter_mut() {
            stat.age(divisor);
            if stat.is_stale() {
                dropped.push(*to);
            }
        }
        for to in &dropped {
            self.link_stats.remove(to);
        }
        self.supply = (u64::from(self.supply) * 30 / divisor) as u32;
        dropped
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn station_ids(n: usize) -> Vec<StationId> {
        let mut pool = SlotMap::<StationId, ()>::with_key();
        (0..n).map(|_| pool.insert(())).collect()
    }

    fn settings_with_window(length: u32, unit: u32) -> LinkGraphSettings {
        LinkGraphSettings {
            moving_average_length: length,
            moving_average_unit: unit,
            ..LinkGraphSettings::default()
        }
    }

    // -----------------------------------------------------------------------
    // FlowStat ordering
    // -----------------------------------------------------------------------
    #[test]
    fn flow_set_orders_by_remaining_credit() {
        let ids = station_ids(3);
        let mut set = FlowStatSet::new();
        set.insert(FlowStat::new(ids[0], 10));
        set.insert(FlowStat::new(ids[1], 30));
        set.insert(FlowStat::new(ids[2], 20));

        let order: Vec<StationId> = set.iter().map(|f| f.via).collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    }

    #[test]
    fn flow_set_ties_break_by_via_descending() {
        let ids = station_ids(2);
        let (lo, hi) = if ids[0] < ids[1] {
            (ids[0], ids[1])
        } else {
            (ids[1], ids[0])
        };
        let mut set = FlowStatSet::new();
        set.insert(FlowStat::new(lo, 10));
        set.insert(FlowStat::new(hi, 10));
        assert_eq!(set.iter().next().unwrap().via, hi);
    }

    // -----------------------------------------------------------------------
    // Transfer lookup: top entry, never the current station
    // -----------------------------------------------------------------------
    #[test]
    fn transfer_picks_top_entry_and_bumps_sent() {
        let ids = station_ids(4);
        let (source, curr, a, b) = (ids[0], ids[1], ids[2], ids[3]);

        let mut ge = GoodsEntry::new();
        let mut set = FlowStatSet::new();
        set.insert(FlowStat::new(a, 50));
        set.insert(FlowStat::new(b, 10));
        ge.flows.insert(source, set);

        let via = ge.update_flow_stats_transfer(source, 7, curr);
        assert_eq!(via, Some(a));

        let sent: u32 = ge.flows[&source]
            .iter()
            .find(|f| f.via == a)
            .unwrap()
            .sent;
        assert_eq!(sent, 7);
    }

    #[test]
    fn transfer_never_returns_current_station() {
        let ids = station_ids(2);
        let (source, curr) = (ids[0], ids[1]);

        let mut ge = GoodsEntry::new();
        let mut set = FlowStatSet::new();
        set.insert(FlowStat::new(curr, 100));
        ge.flows.insert(source, set);

        assert_eq!(ge.update_flow_stats_transfer(source, 5, curr), None);
    }

    #[test]
    fn transfer_skips_exhausted_entries() {
        let ids = station_ids(4);
        let (source, curr, a, b) = (ids[0], ids[1], ids[2], ids[3]);

        let mut ge = GoodsEntry::new();
        let mut exhausted = FlowStat::new(a, 10);
        exhausted.sent = 10;
        let mut set = FlowStatSet::new();
        set.insert(exhausted);
        set.insert(FlowStat::new(b, 5));
        ge.flows.insert(source, set);

        assert_eq!(ge.update_flow_stats_transfer(source, 1, curr), Some(b));
    }

    #[test]
    fn update_flow_stats_rebalances_set() {
        let ids = station_ids(3);
        let (source, a, b) = (ids[0], ids[1], ids[2]);

        let mut ge = GoodsEntry::new();
        let mut set = FlowStatSet::new();
        set.insert(FlowStat::new(a, 20));
        set.insert(FlowStat::new(b, 15));
        ge.flows.insert(source, set);

        // Sending 10 via `a` drops its remaining credit below `b`'s.
        ge.update_flow_stats(source, 10, a);
        assert_eq!(ge.flows[&source].iter().next().unwrap().via, b);
    }

    #[test]
    fn sum_flow_via_spans_sources() {
        let ids = station_ids(3);
        let (s1, s2, via) = (ids[0], ids[1], ids[2]);

        let mut ge = GoodsEntry::new();
        let mut set = FlowStatSet::new();
        set.insert(FlowStat::new(via, 10));
        ge.flows.insert(s1, set);
        let mut set = FlowStatSet::new();
        let mut f = FlowStat::new(via, 20);
        f.sent = 5;
        set.insert(f);
        ge.flows.insert(s2, set);

        let sum = ge.sum_flow_via(via);
        assert_eq!(sum.planned, 30);
        assert_eq!(sum.sent, 5);
    }

    // -----------------------------------------------------------------------
    // Link ageing: {capacity=300, usage=150, frozen=100} * 30 / 300
    // -----------------------------------------------------------------------
    #[test]
    fn link_ageing_floors_capacity_at_frozen() {
        let ids = station_ids(2);
        let mut ge = GoodsEntry::new();
        ge.link_stats.insert(
            ids[1],
            LinkStat {
                capacity: 300,
                usage: 150,
                frozen: 100,
            },
        );

        let dropped = ge.age_statistics(&settings_with_window(30, 10));
        assert!(dropped.is_empty());

        let stat = ge.link_stats[&ids[1]];
        assert_eq!(stat.capacity, 100);
        assert_eq!(stat.usage, 15);
    }

    #[test]
    fn stale_links_are_dropped() {
        let ids = station_ids(2);
        let mut ge = GoodsEntry::new();
        ge.link_stats.insert(
            ids[1],
            LinkStat {
                capacity: 3,
                usage: 1,
                frozen: 0,
            },
        );

        let dropped = ge.age_statistics(&settings_with_window(30, 10));
        assert_eq!(dropped, vec![ids[1]]);
        assert!(ge.link_stats.is_empty());
    }

    #[test]
    fn supply_ages_with_the_same_window() {
        let mut ge = GoodsEntry::new();
        ge.supply = 600;
        ge.age_statistics(&settings_with_window(30, 10));
        assert_eq!(ge.supply, 60);
    }

    // -----------------------------------------------------------------------
    // Rerouting after a link went away
    // -----------------------------------------------------------------------
    #[test]
    fn reroute_stale_packets_rekeys_by_new_plan() {
        use crate::id::{Map, SourceKind};
        use crate::packet::CargoPacketPool;

        let ids = station_ids(4);
        let (source, curr, dead, alive) = (ids[0], ids[1], ids[2], ids[3]);
        let map = Map::new(32, 32);
        let mut pool = CargoPacketPool::new();

        let mut ge = GoodsEntry::new();
        let mut set = FlowStatSet::new();
        set.insert(FlowStat::new(alive, 40));
        ge.flows.insert(source, set);

        let packet = pool
            .create(source, map.tile(0, 0), Some(dead), 12, SourceKind::Town, None)
            .unwrap();
        ge.cargo.append(&mut pool, packet, false);

        ge.reroute_stale_packets(&mut pool, curr, dead);

        assert_eq!(pool.get(packet).unwrap().next(), Some(alive));
        assert_eq!(ge.cargo.count(), 12);
        let sent = ge.flows[&source].iter().find(|f| f.via == alive).unwrap().sent;
        assert_eq!(sent, 12);
    }

    #[test]
    fn reroute_without_plan_goes_undirected() {
        use crate::id::{Map, SourceKind};
        use crate::packet::CargoPacketPool;

        let ids = station_ids(3);
        let (source, curr, dead) = (ids[0], ids[1], ids[2]);
        let map = Map::new(32, 32);
        let mut pool = CargoPacketPool::new();
        let mut ge = GoodsEntry::new();

        let packet = pool
            .create(source, map.tile(0, 0), Some(dead), 5, SourceKind::Town, None)
            .unwrap();
        ge.cargo.append(&mut pool, packet, false);

        ge.reroute_stale_packets(&mut pool, curr, dead);
        assert_eq!(pool.get(packet).unwrap().next(), None);
        assert_eq!(ge.cargo.count(), 5);
    }
}
