//! Vehicle and station cargo lists.
//!
//! Both lists own packet ids into the [`CargoPacketPool`] and maintain three
//! cached scalars (count, feeder share, summed transit days) that every
//! mutation keeps exact. The vehicle list is an arrival-ordered sequence;
//! the head is delivered first. The station list is a multimap keyed by the
//! planned next hop, so a loading vehicle can ask "what do you have for
//! route X" in one lookup.

use crate::goods::GoodsEntry;
use crate::id::{CargoPacketId, Map, Money, StationId, TileIndex};
use crate::packet::{CargoPacket, CargoPacketPool, MAX_PACKET_COUNT};
use crate::settings::DistributionType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// The cached scalars of a cargo list. `days_in_transit` is the sum of
/// `packet.count * packet.days_in_transit`; divide by `count` for the mean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoCache {
    pub count: u32,
    pub feeder_share: Money,
    pub days_in_transit: u64,
}

impl CargoCache {
    fn add_packet(&mut self, packet: &CargoPacket) {
        self.count += u32::from(packet.count());
        self.feeder_share += packet.feeder_share();
        self.days_in_transit +=
            u64::from(packet.count()) * u64::from(packet.days_in_transit());
    }

    fn remove_packet(&mut self, packet: &CargoPacket) {
        debug_assert!(self.count >= u32::from(packet.count()), "cache underflow");
        self.count -= u32::from(packet.count());
        self.feeder_share -= packet.feeder_share();
        self.days_in_transit -=
            u64::from(packet.count()) * u64::from(packet.days_in_transit());
    }
}

// ---------------------------------------------------------------------------
// Unload flags and actions
// ---------------------------------------------------------------------------

/// Order flags steering the unload decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadFlags(u8);

impl UnloadFlags {
    pub const NONE: Self = Self(0);
    /// Force cargo off, wanted here or not. Under flow plans, cargo the
    /// vehicle would drop at its own next stop still rides along.
    pub const UNLOAD: Self = Self(1 << 0);
    /// Never deliver; leave cargo at the station for another leg.
    pub const TRANSFER: Self = Self(1 << 1);
    /// Do not unload at this station at all.
    pub const NO_UNLOAD: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for UnloadFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What to do with one packet during unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadAction {
    Keep,
    Deliver,
    Transfer,
}

/// The context of one unload round at a station.
pub struct UnloadDescription<'a> {
    /// Goods entry of the station being unloaded at.
    pub dest: &'a mut GoodsEntry,
    pub curr_station: StationId,
    pub curr_xy: TileIndex,
    /// The vehicle's next scheduled stop, if any.
    pub next_station: Option<StationId>,
    pub flags: UnloadFlags,
    /// Distribution mode of the cargo being unloaded.
    pub distribution: DistributionType,
    pub map: &'a Map,
}

// ---------------------------------------------------------------------------
// Payment seam
// ---------------------------------------------------------------------------

/// The economy's side of unloading. Delivery pays out the final price
/// (including accumulated feeder shares); a transfer pays the credit for the
/// finished leg, which the packet then carries forward.
pub trait CargoPayment {
    fn deliver(
        &mut self,
        count: u32,
        days_in_transit: u8,
        distance: u32,
        feeder_share: Money,
    ) -> Money;

    fn transfer(&mut self, count: u32, days_in_transit: u8, distance: u32) -> Money;
}

// ---------------------------------------------------------------------------
// VehicleCargo
// ---------------------------------------------------------------------------

/// Cargo aboard one vehicle, in arrival order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleCargo {
    packets: VecDeque<CargoPacketId>,
    cache: CargoCache,
}

impl VehicleCargo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn count(&self) -> u32 {
        self.cache.count
    }

    pub fn feeder_share(&self) -> Money {
        self.cache.feeder_share
    }

    /// Mean days in transit, weighted by packet count.
    pub fn days_in_transit(&self) -> u64 {
        if self.cache.count == 0 {
            0
        } else {
            self.cache.days_in_transit / u64::from(self.cache.count)
        }
    }

    pub fn cache(&self) -> &CargoCache {
        &self.cache
    }

    pub fn packets(&self) -> impl Iterator<Item = CargoPacketId> + '_ {
        self.packets.iter().copied()
    }

    /// Appends a packet. With `merge`, a tail packet with the same source
    /// header absorbs it instead (when the merged count still fits).
    pub fn append(&mut self, pool: &mut CargoPacketPool, id: CargoPacketId, merge: bool) {
        let Some(incoming) = pool.get(id) else {
            debug_assert!(false, "appending a packet that is not live");
            return;
        };
        self.cache.add_packet(incoming);
        if merge && let Some(&tail) = self.packets.back() {
            if let Some(existing) = pool.get(tail)
                && existing.same_source(incoming)
                && u32::from(existing.count()) + u32::from(incoming.count())
                    <= u32::from(MAX_PACKET_COUNT)
            {
                pool.merge(tail, id);
                return;
            }
        }
        self.packets.push_back(id);
    }

    /// Truncates the list to at most `max_remaining` units, dropping from the
    /// head. A head packet straddling the boundary is shaved in place; the
    /// excess and its feeder share are destroyed.
    pub fn truncate(&mut self, pool: &mut CargoPacketPool, max_remaining: u32) {
        let mut excess = self.cache.count.saturating_sub(max_remaining);
        while excess > 0 {
            let Some(&id) = self.packets.front() else {
                break;
            };
            excess = shave_or_free(pool, &mut self.cache, id, excess);
            if excess > 0 || !pool.contains(id) {
                self.packets.pop_front();
            }
        }
    }

    /// Ages every packet by one day, saturating at 255 days.
    pub fn age_cargo(&mut self, pool: &mut CargoPacketPool) {
        age_packets(pool, &mut self.cache, self.packets.iter().copied());
    }

    /// Rebuilds the cache from the pool, dropping ids that are no longer
    /// live. Recovery path for a detected cache mismatch.
    pub fn invalidate_cache(&mut self, pool: &CargoPacketPool) {
        self.packets.retain(|id| pool.contains(*id));
        self.cache = rebuild_cache(pool, self.packets.iter().copied());
    }

    // -----------------------------------------------------------------------
    // Unloading
    // -----------------------------------------------------------------------

    /// Decides what happens to `packet` at the station described by `ul`.
    pub fn will_unload(&self, ul: &UnloadDescription<'_>, packet: &CargoPacket) -> UnloadAction {
        match ul.distribution {
            DistributionType::Manual => will_unload_legacy(ul, packet),
            DistributionType::Symmetric | DistributionType::Asymmetric => {
                will_unload_planned(ul, packet)
            }
        }
    }

    /// Moves up to `max_unload` units off the vehicle: delivering, keeping or
    /// transferring each head packet per [`Self::will_unload`]. Returns the
    /// number of units moved.
    pub fn move_to_station(
        &mut self,
        pool: &mut CargoPacketPool,
        ul: &mut UnloadDescription<'_>,
        max_unload: u32,
        payment: &mut dyn CargoPayment,
    ) -> u32 {
        let mut moved = 0u32;
        let mut idx = 0usize;
        while moved < max_unload && idx < self.packets.len() {
            let id = self.packets[idx];
            let Some(packet) = pool.get(id) else {
                self.packets.remove(idx);
                self.invalidate_cache(pool);
                continue;
            };
            let action = self.will_unload(ul, packet);
            if action == UnloadAction::Keep {
                idx += 1;
                continue;
            }

            let count = u32::from(packet.count());
            let remaining = max_unload - moved;
            let (move_id, move_count) = if count > remaining {
                // Packet straddles the limit: split off the part that moves,
                // the remainder stays at `idx` and ends this round.
                let Ok(piece) = pool.split(id, remaining as u16) else {
                    break;
                };
                (piece, remaining)
            } else {
                self.packets.remove(idx);
                (id, count)
            };
            if let Some(p) = pool.get(move_id) {
                self.cache.remove_packet(p);
            }

            let (days, distance, feeder, source) = {
                let p = &pool[move_id];
                (
                    p.days_in_transit(),
                    ul.map.manhattan_distance(p.loaded_at_xy, ul.curr_xy),
                    p.feeder_share(),
                    p.source,
                )
            };
            match action {
                UnloadAction::Deliver => {
                    payment.deliver(move_count, days, distance, feeder);
                    pool.free(move_id);
                }
                UnloadAction::Transfer => {
                    let fee = payment.transfer(move_count, days, distance);
                    let via =
                        ul.dest
                            .update_flow_stats_transfer(source, move_count, ul.curr_station);
                    if let Some(p) = pool.get_mut(move_id) {
                        p.add_feeder_share(fee);
                        p.set_next(via);
                    }
                    ul.dest.cargo.append(pool, move_id, true);
                }
                UnloadAction::Keep => unreachable!(),
            }
            moved += move_count;
        }
        moved
    }

    /// Moves up to `cap` units onto another vehicle, head first.
    pub fn move_to_vehicle(
        &mut self,
        pool: &mut CargoPacketPool,
        dest: &mut VehicleCargo,
        cap: u32,
        load_place: Option<TileIndex>,
    ) -> u32 {
        let mut moved = 0u32;
        while moved < cap {
            let Some(&id) = self.packets.front() else {
                break;
            };
            if !pool.contains(id) {
                self.packets.pop_front();
                self.invalidate_cache(pool);
                continue;
            }
            let count = u32::from(pool[id].count());
            let remaining = cap - moved;
            let (move_id, move_count) = if count > remaining {
                let Ok(piece) = pool.split(id, remaining as u16) else {
                    break;
                };
                (piece, remaining)
            } else {
                self.packets.pop_front();
                (id, count)
            };
            if let Some(p) = pool.get_mut(move_id) {
                self.cache.remove_packet(p);
                if let Some(xy) = load_place {
                    p.loaded_at_xy = xy;
                }
            }
            dest.append(pool, move_id, true);
            moved += move_count;
        }
        moved
    }

    /// Marks every carried packet as sent toward `next` after the vehicle
    /// committed to that hop: bumps the matching flow entries and the link's
    /// realised usage at the departure station, and points the packets at
    /// their new leg.
    pub fn update_flows(
        &mut self,
        pool: &mut CargoPacketPool,
        next: StationId,
        ge: &mut GoodsEntry,
    ) {
        let mut total = 0u32;
        for &id in &self.packets {
            let Some(packet) = pool.get_mut(id) else {
                continue;
            };
            let count = u32::from(packet.count());
            let source = packet.source;
            packet.set_next(Some(next));
            ge.update_flow_stats(source, count, next);
            total += count;
        }
        if total > 0 {
            ge.link_stats.entry(next).or_default().usage += total;
        }
    }

    /// Frees all packets back to the pool (vehicle destruction).
    pub fn clear(&mut self, pool: &mut CargoPacketPool) {
        for id in self.packets.drain(..) {
            pool.free(id);
        }
        self.cache = CargoCache::default();
    }
}

// ---------------------------------------------------------------------------
// Unload policies
// ---------------------------------------------------------------------------

/// Classic rules, used when distribution is off for this cargo: deliver
/// where accepted unless the order forbids it, transfer when asked to,
/// otherwise keep.
fn will_unload_legacy(ul: &UnloadDescription<'_>, _packet: &CargoPacket) -> UnloadAction {
    if ul.flags.contains(UnloadFlags::NO_UNLOAD) {
        return UnloadAction::Keep;
    }
    if ul.dest.accepts() && !ul.flags.contains(UnloadFlags::TRANSFER) {
        return UnloadAction::Deliver;
    }
    if ul.flags.contains(UnloadFlags::TRANSFER) || ul.flags.contains(UnloadFlags::UNLOAD) {
        return UnloadAction::Transfer;
    }
    UnloadAction::Keep
}

/// Flow-plan rules: cargo gets off where its plan says (or where its journey
/// ends). Cargo bound for the vehicle's own next stop rides along; a forced
/// unload pushes everything else off to be rerouted.
fn will_unload_planned(ul: &UnloadDescription<'_>, packet: &CargoPacket) -> UnloadAction {
    if ul.flags.contains(UnloadFlags::NO_UNLOAD) {
        return UnloadAction::Keep;
    }
    let accepted = ul.dest.accepts() && !ul.flags.contains(UnloadFlags::TRANSFER);
    // Cargo wants off here when this station is its planned hop (or it has
    // no plan at all), or when its journey can end here: the station accepts
    // and no plan routes it onward.
    let planned_here = match packet.next() {
        None => true,
        Some(next) => next == ul.curr_station,
    };
    let journey_ends_here =
        accepted && !ul.dest.has_onward_plan(packet.source, ul.curr_station);
    if planned_here || journey_ends_here {
        return if accepted {
            UnloadAction::Deliver
        } else {
            UnloadAction::Transfer
        };
    }
    // Bound elsewhere. The vehicle keeps what it will drop at its own next
    // stop anyway; under a forced unload everything else is transferred so
    // the station can replan it.
    if packet.next() == ul.next_station {
        UnloadAction::Keep
    } else if ul.flags.contains(UnloadFlags::UNLOAD) {
        UnloadAction::Transfer
    } else {
        UnloadAction::Keep
    }
}

// ---------------------------------------------------------------------------
// StationCargo
// ---------------------------------------------------------------------------

/// Cargo waiting at a station, bucketed by planned next hop. The `None`
/// bucket holds cargo without a plan; any vehicle may take it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationCargo {
    packets: BTreeMap<Option<StationId>, VecDeque<CargoPacketId>>,
    cache: CargoCache,
}

impl StationCargo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.count == 0
    }

    pub fn count(&self) -> u32 {
        self.cache.count
    }

    pub fn feeder_share(&self) -> Money {
        self.cache.feeder_share
    }

    /// Mean days in transit, weighted by packet count.
    pub fn days_in_transit(&self) -> u64 {
        if self.cache.count == 0 {
            0
        } else {
            self.cache.days_in_transit / u64::from(self.cache.count)
        }
    }

    pub fn cache(&self) -> &CargoCache {
        &self.cache
    }

    pub fn packets(&self) -> impl Iterator<Item = CargoPacketId> + '_ {
        self.packets.values().flatten().copied()
    }

    /// Appends a packet into the bucket matching its next hop. With `merge`,
    /// a same-source packet already in the bucket absorbs it (when the
    /// merged count fits).
    pub fn append(&mut self, pool: &mut CargoPacketPool, id: CargoPacketId, merge: bool) {
        let Some(incoming) = pool.get(id) else {
            debug_assert!(false, "appending a packet that is not live");
            return;
        };
        let key = incoming.next();
        self.cache.add_packet(incoming);
        let bucket = self.packets.entry(key).or_default();
        if merge {
            for &existing_id in bucket.iter() {
                if let Some(existing) = pool.get(existing_id)
                    && existing.same_source(incoming)
                    && u32::from(existing.count()) + u32::from(incoming.count())
                        <= u32::from(MAX_PACKET_COUNT)
                {
                    pool.merge(existing_id, id);
                    return;
                }
            }
        }
        bucket.push_back(id);
    }

    /// Truncates to at most `max_remaining` units, removing from the front
    /// of the first bucket onward.
    pub fn truncate(&mut self, pool: &mut CargoPacketPool, max_remaining: u32) {
        let mut excess = self.cache.count.saturating_sub(max_remaining);
        while excess > 0 {
            let Some(key) = self
                .packets
                .iter()
                .find(|(_, bucket)| !bucket.is_empty())
                .map(|(key, _)| *key)
            else {
                break;
            };
            let Some(bucket) = self.packets.get_mut(&key) else {
                break;
            };
            let Some(&id) = bucket.front() else {
                break;
            };
            excess = shave_or_free(pool, &mut self.cache, id, excess);
            if excess > 0 || !pool.contains(id) {
                bucket.pop_front();
            }
        }
        self.packets.retain(|_, bucket| !bucket.is_empty());
    }

    /// Ages every packet by one day, saturating at 255 days.
    pub fn age_cargo(&mut self, pool: &mut CargoPacketPool) {
        let ids: Vec<CargoPacketId> = self.packets().collect();
        age_packets(pool, &mut self.cache, ids.into_iter());
    }

    /// Rebuilds the cache from the pool, dropping dead ids.
    pub fn invalidate_cache(&mut self, pool: &CargoPacketPool) {
        for bucket in self.packets.values_mut() {
            bucket.retain(|id| pool.contains(*id));
        }
        self.packets.retain(|_, bucket| !bucket.is_empty());
        self.cache = rebuild_cache(pool, self.packets.values().flatten().copied());
    }

    /// Moves up to `cap` units onto a vehicle headed for `next_station`:
    /// first from the matching bucket, then from the undirected bucket.
    /// Without a known next station every bucket may serve.
    pub fn move_to_vehicle(
        &mut self,
        pool: &mut CargoPacketPool,
        dest: &mut VehicleCargo,
        cap: u32,
        next_station: Option<StationId>,
        load_place: TileIndex,
    ) -> u32 {
        let mut moved = 0u32;
        match next_station {
            Some(next) => {
                moved += self.move_bucket(pool, dest, Some(next), cap, load_place);
                if moved < cap {
                    moved += self.move_bucket(pool, dest, None, cap - moved, load_place);
                }
            }
            None => {
                let keys: Vec<Option<StationId>> = self.packets.keys().copied().collect();
                for key in keys {
                    if moved >= cap {
                        break;
                    }
                    moved += self.move_bucket(pool, dest, key, cap - moved, load_place);
                }
            }
        }
        moved
    }

    fn move_bucket(
        &mut self,
        pool: &mut CargoPacketPool,
        dest: &mut VehicleCargo,
        key: Option<StationId>,
        cap: u32,
        load_place: TileIndex,
    ) -> u32 {
        let mut moved = 0u32;
        while moved < cap {
            let Some(bucket) = self.packets.get_mut(&key) else {
                break;
            };
            let Some(&id) = bucket.front() else {
                break;
            };
            if !pool.contains(id) {
                bucket.pop_front();
                self.invalidate_cache(pool);
                continue;
            }
            let count = u32::from(pool[id].count());
            let remaining = cap - moved;
            let (move_id, move_count) = if count > remaining {
                let Ok(piece) = pool.split(id, remaining as u16) else {
                    break;
                };
                (piece, remaining)
            } else {
                bucket.pop_front();
                (id, count)
            };
            if let Some(p) = pool.get_mut(move_id) {
                self.cache.remove_packet(p);
                p.loaded_at_xy = load_place;
            }
            dest.append(pool, move_id, true);
            moved += move_count;
        }
        if self.packets.get(&key).is_some_and(|b| b.is_empty()) {
            self.packets.remove(&key);
        }
        moved
    }

    /// Frees all packets back to the pool (station destruction).
    pub fn clear(&mut self, pool: &mut CargoPacketPool) {
        for bucket in std::mem::take(&mut self.packets).into_values() {
            for id in bucket {
                pool.free(id);
            }
        }
        self.cache = CargoCache::default();
    }

    /// Removes and returns a whole bucket. Cache is untouched; callers must
    /// re-insert every packet via [`Self::insert_keyed`].
    pub(crate) fn take_bucket(
        &mut self,
        key: Option<StationId>,
    ) -> Option<VecDeque<CargoPacketId>> {
        self.packets.remove(&key)
    }

    /// Re-inserts a packet under a new key without touching the cache.
    /// Counterpart of [`Self::take_bucket`].
    pub(crate) fn insert_keyed(&mut self, key: Option<StationId>, id: CargoPacketId) {
        self.packets.entry(key).or_default().push_back(id);
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Removes `excess` units from the packet: frees it whole when it fits,
/// otherwise shaves the packet in place (dropping the proportional feeder
/// share, as a split-and-destroy would). Returns the excess still left.
fn shave_or_free(
    pool: &mut CargoPacketPool,
    cache: &mut CargoCache,
    id: CargoPacketId,
    excess: u32,
) -> u32 {
    let Some(packet) = pool.get_mut(id) else {
        return excess;
    };
    let count = u32::from(packet.count());
    if count <= excess {
        cache.remove_packet(packet);
        pool.free(id);
        return excess - count;
    }
    let shaved = excess as u16;
    let feeder_loss =
        packet.feeder_share() * Money::from(shaved) / Money::from(packet.count());
    cache.remove_packet(packet);
    packet.shrink(shaved, feeder_loss);
    cache.add_packet(packet);
    0
}

fn age_packets(
    pool: &mut CargoPacketPool,
    cache: &mut CargoCache,
    ids: impl Iterator<Item = CargoPacketId>,
) {
    for id in ids {
        if let Some(packet) = pool.get_mut(id)
            && packet.age()
        {
            // Only packets that actually aged contribute, or the cache
            // drifts from the saturated per-packet values.
            cache.days_in_transit += u64::from(packet.count());
        }
    }
}

fn rebuild_cache(
    pool: &CargoPacketPool,
    ids: impl Iterator<Item = CargoPacketId>,
) -> CargoCache {
    let mut cache = CargoCache::default();
    for id in ids {
        if let Some(packet) = pool.get(id) {
            cache.add_packet(packet);
        }
    }
    cache
}

// ===========================================================================
// Tests
// ===========================================================================
