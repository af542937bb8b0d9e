//! Distribution settings consumed by the link graph pipeline.
//!
//! A running job keeps the settings copy it was spawned with; changes made
//! mid-flight only affect components extracted afterwards.

use crate::id::CargoId;
use serde::{Deserialize, Serialize};

/// How cargo of a class is routed between stations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DistributionType {
    /// No flow planning; the classic accept-or-transfer unload rules apply.
    #[default]
    Manual,
    /// Every pair of stations exchanges equal amounts in both directions.
    Symmetric,
    /// Supply-driven: sources push toward sinks, no return obligation.
    Asymmetric,
}

/// Coarse cargo classification used to pick a distribution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CargoClass {
    Passengers,
    Mail,
    Armoured,
    Other,
}

impl CargoClass {
    /// The classic fixed cargo table: slot 0 carries passengers, slot 2
    /// mail, slot 10 valuables; everything else is freight.
    pub fn of(cargo: CargoId) -> Self {
        match cargo.0 {
            0 => CargoClass::Passengers,
            2 => CargoClass::Mail,
            10 => CargoClass::Armoured,
            _ => CargoClass::Other,
        }
    }
}

/// Tunables for demand estimation, flow assignment and statistics ageing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkGraphSettings {
    pub distribution_pax: DistributionType,
    pub distribution_mail: DistributionType,
    pub distribution_armoured: DistributionType,
    pub distribution_default: DistributionType,
    /// Iteration budget for demand passes and flow augmentation rounds.
    /// Clamped to 1..=16.
    pub accuracy: u32,
    /// How strongly distance deters demand (0..=100).
    pub demand_distance: u32,
    /// How strongly station size attracts demand (0..=100).
    pub demand_size: u32,
    /// Together with `moving_average_unit`, the divisor applied to link
    /// statistics every 30 days.
    pub moving_average_length: u32,
    pub moving_average_unit: u32,
    /// Days between two component extractions of the same cargo; also the
    /// horizon after which a spawned job is joined.
    pub recalc_interval: u32,
}

impl Default for LinkGraphSettings {
    fn default() -> Self {
        Self {
            distribution_pax: DistributionType::Symmetric,
            distribution_mail: DistributionType::Asymmetric,
            distribution_armoured: DistributionType::Asymmetric,
            distribution_default: DistributionType::Manual,
            accuracy: 4,
            demand_distance: 50,
            demand_size: 50,
            moving_average_length: 30,
            moving_average_unit: 10,
            recalc_interval: 8,
        }
    }
}

impl LinkGraphSettings {
    /// The distribution mode governing `cargo`.
    pub fn distribution_for(&self, cargo: CargoId) -> DistributionType {
        match CargoClass::of(cargo) {
            CargoClass::Passengers => self.distribution_pax,
            CargoClass::Mail => self.distribution_mail,
            CargoClass::Armoured => self.distribution_armoured,
            CargoClass::Other => self.distribution_default,
        }
    }

    /// Accuracy clamped to its valid range.
    pub fn clamped_accuracy(&self) -> u32 {
        self.accuracy.clamp(1, 16)
    }

    /// Divisor for monthly statistics ageing. Never zero.
    pub fn ageing_divisor(&self) -> u64 {
        u64::from(self.moving_average_length.max(1)) * u64::from(self.moving_average_unit.max(1))
    }
}
