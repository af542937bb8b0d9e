use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a station in the station pool.
    pub struct StationId;

    /// Identifies a cargo packet in the packet pool.
    pub struct CargoPacketId;
}

/// Number of cargo classes per game. Fixed at world creation.
pub const NUM_CARGO: usize = 32;

/// Identifies one of the [`NUM_CARGO`] cargo slots. Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CargoId(pub u8);

impl CargoId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifies the industry, town or headquarters a packet originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId(pub u32);

/// What kind of entity produced a packet. Determines how a delivery is
/// credited back to its origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SourceKind {
    #[default]
    Industry,
    Town,
    Headquarters,
}

/// A node handle local to one link graph component. Plain index into the
/// component's node vector; never outlives the component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIndex(pub u32);

impl NodeIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// 16-bit component tag. Assigned to every station of a component when the
/// component is extracted; the counter wraps, skipping tags still held by
/// in-flight jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentColour(pub u16);

/// Linearised map tile. `index = y * size_x + x`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileIndex(pub u32);

/// Map dimensions, fixed for the lifetime of a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Map {
    pub size_x: u32,
    pub size_y: u32,
}

impl Map {
    pub fn new(size_x: u32, size_y: u32) -> Self {
        assert!(size_x > 0 && size_y > 0, "map dimensions must be positive");
        Self { size_x, size_y }
    }

    pub fn tile(&self, x: u32, y: u32) -> TileIndex {
        TileIndex(y * self.size_x + x)
    }

    pub fn tile_x(&self, tile: TileIndex) -> u32 {
        tile.0 % self.size_x
    }

    pub fn tile_y(&self, tile: TileIndex) -> u32 {
        tile.0 / self.size_x
    }

    pub fn manhattan_distance(&self, a: TileIndex, b: TileIndex) -> u32 {
        let dx = self.tile_x(a).abs_diff(self.tile_x(b));
        let dy = self.tile_y(a).abs_diff(self.tile_y(b));
        dx + dy
    }

    /// Upper bound on any link distance; also the demand deterrence cap.
    pub fn max_link_distance(&self) -> u32 {
        self.size_x + self.size_y + 1
    }
}

/// Money amounts (feeder shares, payments).
pub type Money = i64;

/// Game date in days since world creation.
pub type Date = u32;

/// Ticks are the atomic unit of simulation time.
pub type Ticks = u64;
