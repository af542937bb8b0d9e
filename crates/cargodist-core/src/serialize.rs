//! Versioned binary snapshots of the logical world state.
//!
//! The snapshot covers everything that must survive a save: pools, goods
//! records (flows, link statistics, component tags, waiting cargo) and the
//! per-cargo builder state. In-flight link graph jobs are deliberately not
//! part of it: they are discarded on save and respawned from fresh
//! statistics after a load, so frozen link reservations reload as zero.

use crate::id::{CargoId, ComponentColour, Date, Map, StationId, Ticks, NUM_CARGO};
use crate::linkgraph::LinkGraph;
use crate::packet::CargoPacketPool;
use crate::settings::LinkGraphSettings;
use crate::station::StationPool;
use crate::world::World;
use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;

/// Magic number identifying a cargo-distribution snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0xCD15_7001;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("invalid magic number: expected 0x{SNAPSHOT_MAGIC:08X}, got 0x{0:08X}")]
    InvalidMagic(u32),
    #[error("unsupported format version {0} (this build reads {FORMAT_VERSION})")]
    UnsupportedVersion(u32),
    #[error("snapshot from future version {0} (this build reads {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("snapshot decoding failed: {0}")]
    Decode(String),
    #[error("snapshot is corrupt: {0}")]
    Corrupt(&'static str),
}

// ---------------------------------------------------------------------------
// Snapshot layout
// ---------------------------------------------------------------------------

/// Header prepended to every snapshot, checked before the payload is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    pub tick: Ticks,
    pub date: Date,
}

impl SnapshotHeader {
    fn new(tick: Ticks, date: Date) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: FORMAT_VERSION,
            tick,
            date,
        }
    }

    pub fn validate(&self) -> Result<(), RestoreError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(RestoreError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(RestoreError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(RestoreError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

/// Per-cargo builder bookkeeping that survives a save.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BuilderState {
    current_colour: ComponentColour,
    station_colours: SecondaryMap<StationId, ComponentColour>,
    cursor: Option<StationId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorldSnapshot {
    header: SnapshotHeader,
    map: Map,
    settings: LinkGraphSettings,
    stations: StationPool,
    packets: CargoPacketPool,
    builders: Vec<BuilderState>,
}

// ---------------------------------------------------------------------------
// Save / load
// ---------------------------------------------------------------------------

/// Serializes the world's logical state.
pub fn save(world: &World) -> Result<Vec<u8>, SnapshotError> {
    let builders = (0..NUM_CARGO)
        .map(|c| {
            let graph = world.link_graph(CargoId(c as u8));
            BuilderState {
                current_colour: graph.current_colour,
                station_colours: graph.station_colours.clone(),
                cursor: graph.cursor,
            }
        })
        .collect();
    let snapshot = WorldSnapshot {
        header: SnapshotHeader::new(world.current_tick(), world.current_date()),
        map: world.map,
        settings: world.settings.clone(),
        stations: world.stations.clone(),
        packets: world.packets.clone(),
        builders,
    };
    bitcode::serialize(&snapshot).map_err(|e| SnapshotError::Encode(e.to_string()))
}

/// Rebuilds a world from a snapshot. Frozen link reservations are reset:
/// the jobs that held them were discarded with the save.
pub fn load(data: &[u8]) -> Result<World, RestoreError> {
    let snapshot: WorldSnapshot =
        bitcode::deserialize(data).map_err(|e| RestoreError::Decode(e.to_string()))?;
    snapshot.header.validate()?;
    if snapshot.builders.len() != NUM_CARGO {
        return Err(RestoreError::Corrupt("wrong number of cargo builders"));
    }

    let mut world = World::new(snapshot.map, snapshot.settings);
    world.stations = snapshot.stations;
    world.packets = snapshot.packets;
    world.tick = snapshot.header.tick;
    world.date = snapshot.header.date;
    for (c, state) in snapshot.builders.into_iter().enumerate() {
        world.link_graphs[c] = LinkGraph::restore(
            CargoId(c as u8),
            state.current_colour,
            state.station_colours,
            state.cursor,
        );
    }
    for (_, station) in world.stations.iter_mut() {
        for goods in station.goods.iter_mut() {
            for stat in goods.link_stats.values_mut() {
                stat.frozen = 0;
            }
        }
    }
    Ok(world)
}

// ===========================================================================
// Tests
// ===========================================================================
