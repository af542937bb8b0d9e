//! Per-cargo link graph: component extraction and result merging.
//!
//! Extraction walks the station links breadth-first from a rotating cursor,
//! colours the stations it reaches and snapshots them into a
//! [`LinkGraphComponent`] handed to a background job. Merging happens in
//! FIFO order once a job's join date arrives: the computed flow plans
//! replace the stations' previous plans pair by pair.
//!
//! A station is in at most one in-flight component: the search neither
//! seeds from nor crosses stations whose colour is held by a running job,
//! which keeps components disjoint at any instant.

use crate::goods::{FlowStat, FlowStatSet};
use crate::id::{CargoId, ComponentColour, Date, Map, NodeIndex, StationId};
use crate::linkgraph::component::LinkGraphComponent;
use crate::linkgraph::job::LinkGraphJob;
use crate::settings::{DistributionType, LinkGraphSettings};
use crate::station::StationPool;
use slotmap::SecondaryMap;
use std::collections::{BTreeSet, VecDeque};

/// Builder and merger for one cargo's link graph.
#[derive(Debug)]
pub struct LinkGraph {
    cargo: CargoId,
    pub(crate) current_colour: ComponentColour,
    pub(crate) station_colours: SecondaryMap<StationId, ComponentColour>,
    /// Seed of the most recently extracted component; the next search
    /// starts just past it.
    pub(crate) cursor: Option<StationId>,
    jobs: VecDeque<LinkGraphJob>,
}

impl LinkGraph {
    pub fn new(cargo: CargoId) -> Self {
        Self {
            cargo,
            current_colour: ComponentColour(0),
            station_colours: SecondaryMap::new(),
            cursor: None,
            jobs: VecDeque::new(),
        }
    }

    /// Rebuilds a graph from saved bookkeeping; jobs are never saved, so
    /// the job queue starts empty.
    pub(crate) fn restore(
        cargo: CargoId,
        current_colour: ComponentColour,
        station_colours: SecondaryMap<StationId, ComponentColour>,
        cursor: Option<StationId>,
    ) -> Self {
        Self {
            cargo,
            current_colour,
            station_colours,
            cursor,
            jobs: VecDeque::new(),
        }
    }

    pub fn cargo(&self) -> CargoId {
        self.cargo
    }

    pub fn num_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn colour_of(&self, station: StationId) -> Option<ComponentColour> {
        self.station_colours.get(station).copied()
    }

    /// Extracts the next component and hands it to a worker. No-op when the
    /// cargo is in manual distribution, when no eligible seed exists, or
    /// when the found cluster is a single station.
    pub fn next_component(
        &mut self,
        stations: &mut StationPool,
        map: &Map,
        settings: &LinkGraphSettings,
        date: Date,
    ) {
        if settings.distribution_for(self.cargo) == DistributionType::Manual {
            return;
        }
        let active = self.active_colours();
        let Some(seed) = self.find_seed(stations, &active) else {
            return;
        };
        let visited = self.breadth_first(stations, seed, &active);
        self.cursor = Some(seed);
        if visited.len() < 2 {
            return;
        }

        let colour = self.fresh_colour(&active);
        let mut component = LinkGraphComponent::new(
            self.cargo,
            colour,
            settings.clone(),
            map.max_link_distance(),
        );

        // Snapshot nodes in discovery order; remember which index each
        // station got.
        let mut index_of: SecondaryMap<StationId, NodeIndex> = SecondaryMap::new();
        for &station_id in &visited {
            let station = stations.get(station_id).expect("visited stations are valid");
            let goods = station.goods(self.cargo);
            let demand = if goods.accepts() {
                goods.supply.max(1)
            } else {
                0
            };
            let index = component.add_node(station_id, station.xy, goods.supply, demand);
            index_of.insert(station_id, index);
            self.station_colours.insert(station_id, colour);
        }

        // Snapshot edges and freeze their capacity for the job's lifetime.
        component.init_edges();
        let mut frozen_links = Vec::new();
        for &station_id in &visited {
            let from = index_of[station_id];
            let station = stations.get_mut(station_id).expect("visited stations are valid");
            let goods = station.goods_mut(self.cargo);
            for (&to_station, stat) in goods.link_stats.iter_mut() {
                if stat.capacity == 0 || to_station == station_id {
                    continue;
                }
                let Some(&to) = index_of.get(to_station) else {
                    continue; // link leads out of the component
                };
                component.add_edge(from, to, stat.capacity);
                stat.frozen += stat.capacity;
                frozen_links.push((station_id, to_station, stat.capacity));
            }
        }
        component.calculate_distances(map);

        tracing::debug!(
            target: "linkgraph::builder",
            cargo = self.cargo.0,
            colour = colour.0,
            nodes = visited.len(),
            links = frozen_links.len(),
            "spawning component job"
        );
        let mut job = LinkGraphJob::new(component, date + settings.recalc_interval, frozen_links);
        job.spawn();
        self.jobs.push_back(job);
    }

    /// Joins every job whose date has come, strictly FIFO, and merges its
    /// results. Stations that vanished while the job ran are skipped; the
    /// rest of the component is still merged.
    pub fn join_ready(&mut self, stations: &mut StationPool, date: Date) {
        while self
            .jobs
            .front()
            .is_some_and(|job| job.join_date() <= date)
        {
            let mut job = self.jobs.pop_front().expect("front was just checked");
            let colour = job.colour();

            // The links thaw no matter how the job ended.
            for &(from, to, capacity) in job.frozen_links() {
                let Some(station) = stations.get_mut(from) else {
                    continue;
                };
                if let Some(stat) = station.goods_mut(self.cargo).link_stats.get_mut(&to) {
                    stat.frozen = stat.frozen.saturating_sub(capacity);
                }
            }

            match job.join() {
                Ok(component) => {
                    self.merge(stations, &component, colour);
                    tracing::debug!(
                        target: "linkgraph::builder",
                        cargo = self.cargo.0,
                        colour = colour.0,
                        "merged component job"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: "linkgraph::builder",
                        cargo = self.cargo.0,
                        colour = colour.0,
                        error = %err,
                        "discarding job without results"
                    );
                }
            }
        }
    }

    /// Cancels and discards every in-flight job (game teardown or load).
    pub fn clear(&mut self, stations: &mut StationPool) {
        for job in &self.jobs {
            job.cancel();
        }
        while let Some(mut job) = self.jobs.pop_front() {
            for &(from, to, capacity) in job.frozen_links() {
                let Some(station) = stations.get_mut(from) else {
                    continue;
                };
                if let Some(stat) = station.goods_mut(self.cargo).link_stats.get_mut(&to) {
                    stat.frozen = stat.frozen.saturating_sub(capacity);
                }
            }
            let _ = job.join();
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn active_colours(&self) -> BTreeSet<ComponentColour> {
        self.jobs.iter().map(|job| job.colour()).collect()
    }

    /// The next unused colour, skipping tags still held by running jobs.
    fn fresh_colour(&mut self, active: &BTreeSet<ComponentColour>) -> ComponentColour {
        loop {
            self.current_colour = ComponentColour(self.current_colour.0.wrapping_add(1));
            if !active.contains(&self.current_colour) {
                return self.current_colour;
            }
        }
    }

    /// Scans station ids starting just past the cursor (wrapping once) for
    /// a station that participates in this cargo and is not in an in-flight
    /// component.
    fn find_seed(
        &self,
        stations: &StationPool,
        active: &BTreeSet<ComponentColour>,
    ) -> Option<StationId> {
        let ids: Vec<StationId> = stations.ids().collect();
        if ids.is_empty() {
            return None;
        }
        let start = match self.cursor {
            Some(cursor) => ids
                .iter()
                .position(|&id| id == cursor)
                .map(|pos| pos + 1)
                .unwrap_or(0),
            None => 0,
        };
        let order = ids[start..].iter().chain(ids[..start].iter());
        for &candidate in order {
            if self.in_flight(candidate, active) {
                continue;
            }
            let Some(station) = stations.get(candidate) else {
                continue;
            };
            let goods = station.goods(self.cargo);
            if goods.picks_up() || goods.supply > 0 || !goods.link_stats.is_empty() {
                return Some(candidate);
            }
        }
        None
    }

    fn in_flight(&self, station: StationId, active: &BTreeSet<ComponentColour>) -> bool {
        self.station_colours
            .get(station)
            .is_some_and(|colour| active.contains(colour))
    }

    /// BFS over positive-capacity links, skipping in-flight stations.
    /// Returns the stations reached, in discovery order.
    fn breadth_first(
        &self,
        stations: &StationPool,
        seed: StationId,
        active: &BTreeSet<ComponentColour>,
    ) -> Vec<StationId> {
        let mut visited = vec![seed];
        let mut seen: BTreeSet<StationId> = BTreeSet::from([seed]);
        let mut queue = VecDeque::from([seed]);
        while let Some(current) = queue.pop_front() {
            let Some(station) = stations.get(current) else {
                continue;
            };
            for (&to, stat) in station.goods(self.cargo).link_stats.iter() {
                if stat.capacity == 0
                    || seen.contains(&to)
                    || !stations.is_valid(to)
                    || self.in_flight(to, active)
                {
                    continue;
                }
                seen.insert(to);
                visited.push(to);
                queue.push_back(to);
            }
        }
        visited
    }

    /// Writes one joined component back into the station records: the
    /// staged flow plans replace the previous plan of every touched
    /// (station, source) pair, and the stations remember the component tag.
    fn merge(
        &mut self,
        stations: &mut StationPool,
        component: &LinkGraphComponent,
        colour: ComponentColour,
    ) {
        for (_, node) in component.nodes() {
            let Some(station) = stations.get_mut(node.station) else {
                continue; // station vanished mid-job; keep the rest
            };
            let goods = station.goods_mut(self.cargo);
            goods.last_component = colour;
            for (&origin, vias) in node.flows() {
                let mut set = FlowStatSet::new();
                for (&via, &planned) in vias {
                    set.insert(FlowStat::new(via, planned));
                }
                goods.flows.insert(origin, set);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goods::LinkStat;
    use crate::id::TileIndex;
    use crate::packet::CargoPacketPool;

    const CARGO: CargoId = CargoId(0);

    fn settings() -> LinkGraphSettings {
        LinkGraphSettings {
            distribution_pax: DistributionType::Asymmetric,
            ..LinkGraphSettings::default()
        }
    }

    /// Builds `n` stations in a row; `links` are (from, to, capacity).
    fn world(n: usize, links: &[(usize, usize, u32)]) -> (StationPool, Map, Vec<StationId>) {
        let map = Map::new(64, 64);
        let mut stations = StationPool::new();
        let ids: Vec<StationId> = (0..n)
            .map(|i| stations.create(map.tile(i as u32 * 4, 0)).unwrap())
            .collect();
        for &id in &ids {
            let goods = stations.get_mut(id).unwrap().goods_mut(CARGO);
            goods.set_pickup(true);
            goods.set_acceptance(true);
            goods.supply = 10;
        }
        for &(from, to, capacity) in links {
            stations
                .get_mut(ids[from])
                .unwrap()
                .goods_mut(CARGO)
                .link_stats
                .insert(
                    ids[to],
                    LinkStat {
                        capacity,
                        usage: 0,
                        frozen: 0,
                    },
                );
        }
        (stations, map, ids)
    }

    #[test]
    fn component_covers_the_connected_cluster() {
        // 0 <-> 1 <-> 2 linked; 3 isolated.
        let (mut stations, map, ids) = world(
            4,
            &[(0, 1, 10), (1, 0, 10), (1, 2, 10), (2, 1, 10)],
        );
        let mut graph = LinkGraph::new(CARGO);
        graph.next_component(&mut stations, &map, &settings(), 0);

        assert_eq!(graph.num_jobs(), 1);
        let colour = graph.colour_of(ids[0]).unwrap();
        assert_eq!(graph.colour_of(ids[1]), Some(colour));
        assert_eq!(graph.colour_of(ids[2]), Some(colour));
        assert_eq!(graph.colour_of(ids[3]), None);
    }

    #[test]
    fn extraction_freezes_link_capacity() {
        let (mut stations, map, ids) = world(2, &[(0, 1, 25), (1, 0, 25)]);
        let mut graph = LinkGraph::new(CARGO);
        graph.next_component(&mut stations, &map, &settings(), 0);

        let stat = stations.get(ids[0]).unwrap().goods(CARGO).link_stats[&ids[1]];
        assert_eq!(stat.frozen, 25);

        // Joining (even discarding) releases the freeze.
        graph.join_ready(&mut stations, 1_000);
        let stat = stations.get(ids[0]).unwrap().goods(CARGO).link_stats[&ids[1]];
        assert_eq!(stat.frozen, 0);
    }

    #[test]
    fn stations_in_flight_are_not_reextracted() {
        let (mut stations, map, ids) = world(2, &[(0, 1, 10), (1, 0, 10)]);
        let mut graph = LinkGraph::new(CARGO);
        graph.next_component(&mut stations, &map, &settings(), 0);
        assert_eq!(graph.num_jobs(), 1);

        // Both stations sit in the running job; no new component forms.
        graph.next_component(&mut stations, &map, &settings(), 1);
        assert_eq!(graph.num_jobs(), 1);
    }

    #[test]
    fn join_writes_flow_plans_back() {
        let (mut stations, map, ids) = world(2, &[(0, 1, 50), (1, 0, 50)]);
        let mut graph = LinkGraph::new(CARGO);
        let settings = settings();
        graph.next_component(&mut stations, &map, &settings, 0);
        graph.join_ready(&mut stations, Date::from(settings.recalc_interval));

        assert_eq!(graph.num_jobs(), 0);
        let goods = stations.get(ids[0]).unwrap().goods(CARGO);
        assert_eq!(goods.last_component, graph.colour_of(ids[0]).unwrap());
        // Station 0 plans flow from itself via station 1.
        let plan = goods.flows.get(&ids[0]).expect("a plan for local cargo");
        assert!(plan.iter().any(|f| f.via == ids[1] && f.planned > 0));
    }

    #[test]
    fn join_skips_vanished_stations() {
        let (mut stations, map, ids) = world(3, &[(0, 1, 10), (1, 0, 10), (1, 2, 10), (2, 1, 10)]);
        let mut graph = LinkGraph::new(CARGO);
        let settings = settings();
        graph.next_component(&mut stations, &map, &settings, 0);

        let mut packets = CargoPacketPool::new();
        stations.remove(ids[2], &mut packets);

        // Joining must not fail; the surviving stations still get plans.
        graph.join_ready(&mut stations, Date::from(settings.recalc_interval));
        assert!(stations
            .get(ids[0])
            .unwrap()
            .goods(CARGO)
            .flows
            .contains_key(&ids[0]));
    }

    #[test]
    fn jobs_join_in_fifo_order() {
        // Two disjoint pairs produce two jobs; they must drain oldest first.
        let (mut stations, map, _ids) = world(
            4,
            &[(0, 1, 10), (1, 0, 10), (2, 3, 10), (3, 2, 10)],
        );
        let mut graph = LinkGraph::new(CARGO);
        let settings = settings();
        graph.next_component(&mut stations, &map, &settings, 0);
        graph.next_component(&mut stations, &map, &settings, 1);
        assert_eq!(graph.num_jobs(), 2);

        let first_colour = graph.jobs[0].colour();
        let second_colour = graph.jobs[1].colour();
        assert!(first_colour.0 < second_colour.0);

        // Only the first job's date has come.
        graph.join_ready(&mut stations, Date::from(settings.recalc_interval));
        assert_eq!(graph.num_jobs(), 1);
        assert_eq!(graph.jobs[0].colour(), second_colour);

        graph.join_ready(&mut stations, Date::from(settings.recalc_interval + 1));
        assert_eq!(graph.num_jobs(), 0);
    }

    #[test]
    fn cursor_rotates_over_seeds() {
        // Two disjoint pairs: consecutive extractions pick different seeds.
        let (mut stations, map, ids) = world(
            4,
            &[(0, 1, 10), (1, 0, 10), (2, 3, 10), (3, 2, 10)],
        );
        let mut graph = LinkGraph::new(CARGO);
        let settings = settings();
        graph.next_component(&mut stations, &map, &settings, 0);
        graph.next_component(&mut stations, &map, &settings, 0);

        let colour_a = graph.colour_of(ids[0]).unwrap();
        let colour_b = graph.colour_of(ids[2]).unwrap();
        assert_ne!(colour_a, colour_b);
    }

    #[test]
    fn manual_distribution_spawns_nothing() {
        let (mut stations, map, _ids) = world(2, &[(0, 1, 10), (1, 0, 10)]);
        let mut graph = LinkGraph::new(CARGO);
        let manual = LinkGraphSettings {
            distribution_pax: DistributionType::Manual,
            ..LinkGraphSettings::default()
        };
        graph.next_component(&mut stations, &map, &manual, 0);
        assert_eq!(graph.num_jobs(), 0);
    }

    #[test]
    fn clear_discards_all_jobs() {
        let (mut stations, map, ids) = world(2, &[(0, 1, 10), (1, 0, 10)]);
        let mut graph = LinkGraph::new(CARGO);
        graph.next_component(&mut stations, &map, &settings(), 0);
        graph.clear(&mut stations);

        assert_eq!(graph.num_jobs(), 0);
        let stat = stations.get(ids[0]).unwrap().goods(CARGO).link_stats[&ids[1]];
        assert_eq!(stat.frozen, 0);
        // No results were merged.
        assert!(stations.get(ids[0]).unwrap().goods(CARGO).flows.is_empty());
    }

    #[test]
    fn single_station_clusters_are_skipped() {
        let map = Map::new(64, 64);
        let mut stations = StationPool::new();
        let id = stations.create(TileIndex(0)).unwrap();
        stations.get_mut(id).unwrap().goods_mut(CARGO).set_pickup(true);

        let mut graph = LinkGraph::new(CARGO);
        graph.next_component(&mut stations, &map, &settings(), 0);
        assert_eq!(graph.num_jobs(), 0);
    }
}
