//! Minimal network example: two stations trading passengers.
//!
//! Creates a world with two linked stations, books fresh cargo, runs the
//! tick scheduler until the background job has planned flows, then walks a
//! vehicle through one load/commit/unload round.
//!
//! Run with: `cargo run -p cargodist-core --example minimal_network`

use cargodist_core::cargolist::{
    CargoPayment, UnloadDescription, UnloadFlags, VehicleCargo,
};
use cargodist_core::goods::LinkStat;
use cargodist_core::id::{CargoId, Map, Money, SourceKind};
use cargodist_core::settings::{DistributionType, LinkGraphSettings};
use cargodist_core::world::{World, DAY_TICKS};

struct PrintingPayment;

impl CargoPayment for PrintingPayment {
    fn deliver(&mut self, count: u32, days: u8, distance: u32, feeder_share: Money) -> Money {
        let payout = Money::from(count) * 3 + feeder_share;
        println!("delivered {count} units after {days} days over {distance} tiles -> {payout}");
        payout
    }

    fn transfer(&mut self, count: u32, _days: u8, distance: u32) -> Money {
        Money::from(count) * Money::from(distance) / 16
    }
}

fn main() {
    // --- Step 1: a world with two stations and a link between them ---

    let settings = LinkGraphSettings {
        distribution_pax: DistributionType::Asymmetric,
        recalc_interval: 4,
        ..LinkGraphSettings::default()
    };
    let mut world = World::new(Map::new(64, 64), settings);
    let cargo = CargoId(0);

    let mine_town = world.stations.create(world.map.tile(4, 4)).unwrap();
    let port_town = world.stations.create(world.map.tile(40, 20)).unwrap();

    {
        let goods = world.stations.get_mut(mine_town).unwrap().goods_mut(cargo);
        goods.set_pickup(true);
        goods.link_stats.insert(
            port_town,
            LinkStat {
                capacity: 120,
                usage: 0,
                frozen: 0,
            },
        );
    }
    world
        .stations
        .get_mut(port_town)
        .unwrap()
        .goods_mut(cargo)
        .set_acceptance(true);

    // --- Step 2: book produced cargo and let the scheduler plan ---

    world
        .generate_cargo(mine_town, cargo, 80, SourceKind::Town, None)
        .unwrap();

    let interval = u64::from(world.settings.recalc_interval);
    for _ in 0..(DAY_TICKS * (interval + 1)) {
        world.tick();
    }

    let goods = world.stations.get(mine_town).unwrap().goods(cargo);
    println!("plans at the producing station after one cycle:");
    for (origin, set) in &goods.flows {
        for stat in set {
            println!("  cargo from {origin:?}: via {:?}, planned {}", stat.via, stat.planned);
        }
    }

    // --- Step 3: one vehicle round: load, commit, unload ---

    let mut vehicle = VehicleCargo::new();
    let mine_xy = world.stations.get(mine_town).unwrap().xy;
    let loaded = {
        let station = world.stations.get_mut(mine_town).unwrap();
        station.goods_mut(cargo).cargo.move_to_vehicle(
            &mut world.packets,
            &mut vehicle,
            60,
            Some(port_town),
            mine_xy,
        )
    };
    println!("loaded {loaded} units for the trip");
    {
        let station = world.stations.get_mut(mine_town).unwrap();
        vehicle.update_flows(&mut world.packets, port_town, station.goods_mut(cargo));
    }

    let map = world.map;
    let port_xy = world.stations.get(port_town).unwrap().xy;
    let mut payment = PrintingPayment;
    let station = world.stations.get_mut(port_town).unwrap();
    let mut ul = UnloadDescription {
        dest: station.goods_mut(cargo),
        curr_station: port_town,
        curr_xy: port_xy,
        next_station: None,
        flags: UnloadFlags::NONE,
        distribution: DistributionType::Asymmetric,
        map: &map,
    };
    let unloaded = vehicle.move_to_station(&mut world.packets, &mut ul, 60, &mut payment);
    println!("unloaded {unloaded} units at the destination");
}
