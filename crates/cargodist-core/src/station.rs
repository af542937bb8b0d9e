//! Stations and their bounded pool.

use crate::goods::GoodsEntry;
use crate::id::{CargoId, StationId, TileIndex, NUM_CARGO};
use crate::packet::CargoPacketPool;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

/// Hard capacity of the station pool.
pub const MAX_STATIONS: usize = 64_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StationPoolError {
    #[error("station pool exhausted ({MAX_STATIONS} slots)")]
    Exhausted,
}

/// A station: a tile anchor plus one goods record per cargo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub xy: TileIndex,
    pub goods: [GoodsEntry; NUM_CARGO],
}

impl Station {
    pub fn new(xy: TileIndex) -> Self {
        Self {
            xy,
            goods: std::array::from_fn(|_| GoodsEntry::new()),
        }
    }

    pub fn goods(&self, cargo: CargoId) -> &GoodsEntry {
        &self.goods[cargo.index()]
    }

    pub fn goods_mut(&mut self, cargo: CargoId) -> &mut GoodsEntry {
        &mut self.goods[cargo.index()]
    }
}

/// Bounded registry of stations with stable generational ids.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StationPool {
    stations: SlotMap<StationId, Station>,
}

impl StationPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, xy: TileIndex) -> Result<StationId, StationPoolError> {
        if self.stations.len() >= MAX_STATIONS {
            return Err(StationPoolError::Exhausted);
        }
        Ok(self.stations.insert(Station::new(xy)))
    }

    /// Removes a station, freeing all cargo waiting at it.
    pub fn remove(&mut self, id: StationId, packets: &mut CargoPacketPool) -> Option<Station> {
        let mut station = self.stations.remove(id)?;
        for goods in station.goods.iter_mut() {
            goods.cargo.clear(packets);
        }
        Some(station)
    }

    pub fn is_valid(&self, id: StationId) -> bool {
        self.stations.contains_key(id)
    }

    pub fn get(&self, id: StationId) -> Option<&Station> {
        self.stations.get(id)
    }

    pub fn get_mut(&mut self, id: StationId) -> Option<&mut Station> {
        self.stations.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Station ids in deterministic pool order.
    pub fn ids(&self) -> impl Iterator<Item = StationId> + '_ {
        self.stations.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StationId, &Station)> {
        self.stations.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (StationId, &mut Station)> {
        self.stations.iter_mut()
    }
}
