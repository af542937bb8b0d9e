//! Cargo packets and their bounded pool.
//!
//! A packet is a homogeneous bundle of cargo sharing an origin. Packets are
//! referenced by id from vehicle and station cargo lists and may outlive any
//! particular holder, so they live in a pool with generational keys: a freed
//! slot is detectable and ids never alias within a game.
//!
//! The fields involved in list caches (`count`, `days_in_transit`,
//! `feeder_share`, `next`) are crate-private; only the pool and the cargo
//! lists mutate them, keeping the caches exact.

use crate::id::{CargoPacketId, Money, SourceId, SourceKind, StationId, TileIndex};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

/// Hard capacity of the packet pool.
pub const MAX_CARGO_PACKETS: usize = 1 << 20;

/// Largest count a single packet can carry.
pub const MAX_PACKET_COUNT: u16 = u16::MAX;

/// Errors raised by pool allocation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("cargo packet pool exhausted ({MAX_CARGO_PACKETS} slots)")]
    Exhausted,
}

// ---------------------------------------------------------------------------
// CargoPacket
// ---------------------------------------------------------------------------

/// A bundle of cargo from one origin, picked up at one time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoPacket {
    pub(crate) count: u16,
    pub(crate) days_in_transit: u8,
    pub(crate) feeder_share: Money,
    pub(crate) next: Option<StationId>,

    /// The station where the cargo entered the network.
    pub source: StationId,
    /// What kind of entity produced the cargo.
    pub source_kind: SourceKind,
    /// The producing entity, if still known.
    pub source_id: Option<SourceId>,
    /// Tile of the first station in the feeder chain. Never changes.
    pub source_xy: TileIndex,
    /// Tile where the cargo was last loaded into a vehicle.
    pub loaded_at_xy: TileIndex,
}

impl CargoPacket {
    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn days_in_transit(&self) -> u8 {
        self.days_in_transit
    }

    pub fn feeder_share(&self) -> Money {
        self.feeder_share
    }

    /// The station this packet should be carried to next, if planned.
    pub fn next(&self) -> Option<StationId> {
        self.next
    }

    /// True when two packets share origin, age and plan and can be merged.
    pub fn same_source(&self, other: &CargoPacket) -> bool {
        self.source_xy == other.source_xy
            && self.days_in_transit == other.days_in_transit
            && self.next == other.next
            && self.source_kind == other.source_kind
            && self.source_id == other.source_id
    }

    pub(crate) fn set_next(&mut self, next: Option<StationId>) {
        self.next = next;
    }

    pub(crate) fn add_feeder_share(&mut self, share: Money) {
        self.feeder_share += share;
    }

    /// Ages the packet by one day. Returns false once saturated.
    pub(crate) fn age(&mut self) -> bool {
        if self.days_in_transit == u8::MAX {
            return false;
        }
        self.days_in_transit += 1;
        true
    }

    pub(crate) fn shrink(&mut self, by: u16, feeder_loss: Money) {
        debug_assert!(by < self.count);
        self.count -= by;
        self.feeder_share -= feeder_loss;
    }
}

// ---------------------------------------------------------------------------
// CargoPacketPool
// ---------------------------------------------------------------------------

/// Bounded allocator for cargo packets.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CargoPacketPool {
    packets: SlotMap<CargoPacketId, CargoPacket>,
}

impl CargoPacketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a packet freshly picked up at `source`. Fails when the pool
    /// is full; the caller is expected to load less, not to retry.
    pub fn create(
        &mut self,
        source: StationId,
        source_xy: TileIndex,
        next: Option<StationId>,
        count: u16,
        source_kind: SourceKind,
        source_id: Option<SourceId>,
    ) -> Result<CargoPacketId, PoolError> {
        assert!(count > 0, "a cargo packet must carry cargo");
        if self.packets.len() >= MAX_CARGO_PACKETS {
            return Err(PoolError::Exhausted);
        }
        Ok(self.packets.insert(CargoPacket {
            count,
            days_in_transit: 0,
            feeder_share: 0,
            next,
            source,
            source_kind,
            source_id,
            source_xy,
            loaded_at_xy: source_xy,
        }))
    }

    /// Creates a packet that is already mid-journey: transit days and
    /// feeder share accumulated on earlier legs.
    pub fn create_in_transit(
        &mut self,
        source: StationId,
        source_xy: TileIndex,
        next: Option<StationId>,
        count: u16,
        days_in_transit: u8,
        feeder_share: Money,
    ) -> Result<CargoPacketId, PoolError> {
        let id = self.create(source, source_xy, next, count, SourceKind::Industry, None)?;
        let packet = &mut self.packets[id];
        packet.days_in_transit = days_in_transit;
        packet.feeder_share = feeder_share;
        Ok(id)
    }

    /// Destroys a packet, returning its final state.
    pub fn free(&mut self, id: CargoPacketId) -> Option<CargoPacket> {
        self.packets.remove(id)
    }

    pub fn get(&self, id: CargoPacketId) -> Option<&CargoPacket> {
        self.packets.get(id)
    }

    pub fn get_mut(&mut self, id: CargoPacketId) -> Option<&mut CargoPacket> {
        self.packets.get_mut(id)
    }

    pub fn contains(&self, id: CargoPacketId) -> bool {
        self.packets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CargoPacketId, &CargoPacket)> {
        self.packets.iter()
    }

    /// Splits `new_size` units off a packet into a fresh packet carrying a
    /// proportional share of the accumulated feeder credit. The original
    /// keeps the remainder of both.
    ///
    /// Pre: `0 < new_size < count`.
    pub fn split(&mut self, id: CargoPacketId, new_size: u16) -> Result<CargoPacketId, PoolError> {
        if self.packets.len() >= MAX_CARGO_PACKETS {
            return Err(PoolError::Exhausted);
        }
        let original = &mut self.packets[id];
        assert!(
            new_size > 0 && new_size < original.count,
            "split size must leave both halves non-empty"
        );
        let moved_share =
            original.feeder_share * Money::from(new_size) / Money::from(original.count);
        original.shrink(new_size, moved_share);
        let mut piece = original.clone();
        piece.count = new_size;
        piece.feeder_share = moved_share;
        Ok(self.packets.insert(piece))
    }

    /// Absorbs `other` into `into` and destroys `other`.
    ///
    /// Pre: `same_source(into, other)` and the merged count fits a packet.
    /// Callers owning a cache over these packets must account for the merge
    /// themselves.
    pub fn merge(&mut self, into: CargoPacketId, other: CargoPacketId) {
        let absorbed = self
            .packets
            .remove(other)
            .expect("merge of a packet that is not live");
        let target = &mut self.packets[into];
        debug_assert!(target.same_source(&absorbed));
        debug_assert!(
            u32::from(target.count) + u32::from(absorbed.count) <= u32::from(MAX_PACKET_COUNT)
        );
        target.count += absorbed.count;
        target.feeder_share += absorbed.feeder_share;
    }

    /// Forgets the origin of every packet produced by the given entity.
    /// Called when an industry or town is removed, so later deliveries no
    /// longer credit a vanished origin.
    pub fn invalidate_all_from(&mut self, source_kind: SourceKind, source_id: SourceId) {
        for (_, packet) in self.packets.iter_mut() {
            if packet.source_kind == source_kind && packet.source_id == Some(source_id) {
                packet.source_id = None;
            }
        }
    }
}

impl std::ops::Index<CargoPacketId> for CargoPacketPool {
    type Output = CargoPacket;

    fn index(&self, id: CargoPacketId) -> &CargoPacket {
        &self.packets[id]
    }
}

impl std::ops::IndexMut<CargoPacketId> for CargoPacketPool {
    fn index_mut(&mut self, id: CargoPacketId) -> &mut CargoPacket {
        &mut self.packets[id]
    }
}

// ===========================================================================
// Tests
// ===========================================================================
