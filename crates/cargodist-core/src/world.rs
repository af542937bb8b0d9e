//! The per-game state object and its tick scheduler.
//!
//! One [`World`] owns the station pool, the packet pool and one
//! [`LinkGraph`] per cargo; nothing here is process-global. The simulation
//! thread calls [`World::tick`] once per tick; component extraction and job
//! merging happen on fixed tick offsets within the 74-tick day, staggered
//! over the cargos so at most one cargo spawns or joins per day.

use crate::id::{
    CargoId, CargoPacketId, Date, Map, SourceId, SourceKind, StationId, Ticks, NUM_CARGO,
};
use crate::linkgraph::LinkGraph;
use crate::packet::{CargoPacketPool, PoolError};
use crate::settings::LinkGraphSettings;
use crate::station::StationPool;

/// Ticks per game day.
pub const DAY_TICKS: Ticks = 74;

/// Tick of the day on which ready jobs are joined.
pub const COMPONENTS_JOIN_TICK: Ticks = 21;

/// Tick of the day on which the next component is extracted.
pub const COMPONENTS_SPAWN_TICK: Ticks = 58;

/// Days between two statistics ageing rounds.
const AGEING_INTERVAL: Date = 30;

/// The cargo-distribution state of one game.
#[derive(Debug)]
pub struct World {
    pub map: Map,
    pub settings: LinkGraphSettings,
    pub stations: StationPool,
    pub packets: CargoPacketPool,
    pub(crate) link_graphs: Vec<LinkGraph>,
    pub(crate) tick: Ticks,
    pub(crate) date: Date,
}

impl World {
    pub fn new(map: Map, settings: LinkGraphSettings) -> Self {
        Self {
            map,
            settings,
            stations: StationPool::new(),
            packets: CargoPacketPool::new(),
            link_graphs: (0..NUM_CARGO).map(|c| LinkGraph::new(CargoId(c as u8))).collect(),
            tick: 0,
            date: 0,
        }
    }

    pub fn current_tick(&self) -> Ticks {
        self.tick
    }

    pub fn current_date(&self) -> Date {
        self.date
    }

    pub fn link_graph(&self, cargo: CargoId) -> &LinkGraph {
        &self.link_graphs[cargo.index()]
    }

    /// Advances the simulation by one tick.
    pub fn tick(&mut self) {
        self.tick += 1;
        let tick_of_day = self.tick % DAY_TICKS;
        if tick_of_day == 0 {
            self.on_new_day();
        }
        if tick_of_day == COMPONENTS_JOIN_TICK {
            for cargo in self.due_cargos() {
                self.link_graphs[cargo.index()].join_ready(&mut self.stations, self.date);
            }
        }
        if tick_of_day == COMPONENTS_SPAWN_TICK {
            for cargo in self.due_cargos() {
                self.link_graphs[cargo.index()].next_component(
                    &mut self.stations,
                    &self.map,
                    &self.settings,
                    self.date,
                );
            }
        }
    }

    /// Cargos whose day slot in the recalc cadence is today. Each cargo gets
    /// its own offset so the work spreads over the interval.
    fn due_cargos(&self) -> Vec<CargoId> {
        let interval = self.settings.recalc_interval.max(1);
        (0..NUM_CARGO)
            .map(|c| CargoId(c as u8))
            .filter(|cargo| {
                let offset = u32::from(cargo.0) * interval / NUM_CARGO as u32;
                self.date % interval == offset
            })
            .collect()
    }

    fn on_new_day(&mut self) {
        self.date += 1;
        for (_, station) in self.stations.iter_mut() {
            for goods in station.goods.iter_mut() {
                goods.cargo.age_cargo(&mut self.packets);
            }
        }
        if self.date % AGEING_INTERVAL == 0 {
            self.age_statistics();
        }
    }

    /// Monthly decay of link statistics and supply. Links that decayed away
    /// get their waiting cargo rerouted.
    fn age_statistics(&mut self) {
        let settings = self.settings.clone();
        let ids: Vec<StationId> = self.stations.ids().collect();
        for id in ids {
            let Some(station) = self.stations.get_mut(id) else {
                continue;
            };
            for goods in station.goods.iter_mut() {
                let dropped = goods.age_statistics(&settings);
                for to in dropped {
                    goods.reroute_stale_packets(&mut self.packets, id, to);
                }
            }
        }
        tracing::trace!(target: "cargodist::world", date = self.date, "statistics aged");
    }

    /// Creates a packet of freshly produced cargo and books it into the
    /// station, bumping the rolling supply. The common pickup entry point.
    pub fn generate_cargo(
        &mut self,
        station_id: StationId,
        cargo: CargoId,
        count: u16,
        source_kind: SourceKind,
        source_id: Option<SourceId>,
    ) -> Result<CargoPacketId, PoolError> {
        let Some(station) = self.stations.get_mut(station_id) else {
            debug_assert!(false, "generating cargo at an invalid station");
            return Err(PoolError::Exhausted);
        };
        let packet = self.packets.create(
            station_id,
            station.xy,
            None,
            count,
            source_kind,
            source_id,
        )?;
        let goods = station.goods_mut(cargo);
        goods.supply = goods.supply.saturating_add(u32::from(count));
        goods.set_pickup(true);
        goods.cargo.append(&mut self.packets, packet, true);
        Ok(packet)
    }

    /// Cancels and discards every in-flight job. Called on game end; also
    /// the reason dropping a world never leaves detached workers writing.
    pub fn shutdown(&mut self) {
        for graph in self.link_graphs.iter_mut() {
            graph.clear(&mut self.stations);
        }
    }
}

impl Drop for World {
    fn drop(&mut self) {
        self.shutdown();
    }
}
