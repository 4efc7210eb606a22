//! Tile size selection from device memory budget.
//!
//! Stateless; safe to call from any thread.  Larger budgets never produce a
//! smaller tile.

use crate::context::DeviceBudget;
use crate::types::DeviceTarget;

/// Tile used on the CPU, where no device budget applies.
pub const CPU_TILE_SIZE: u32 = 400;

/// Smallest tier; also the fallback when budget reporting fails.
pub const MIN_TILE_SIZE: u32 = 32;

/// Share of the device-local heap assumed usable when a direct-budget vendor
/// exposes no memory-budget extension.
pub const DIRECT_BUDGET_HEAP_DIVISOR: u64 = 4;

/// `(exclusive lower bound in MiB, tile)` pairs, largest first.
type Ladder = [(u32, u32); 4];

const LADDER_2X: Ladder = [(1300, 400), (800, 300), (400, 200), (200, 100)];
const LADDER_3X: Ladder = [(3300, 400), (1900, 300), (950, 200), (320, 100)];
const LADDER_4X: Ladder = [(1690, 400), (980, 300), (530, 200), (240, 100)];

pub struct TileSizeAdvisor;

impl TileSizeAdvisor {
    /// Pick a tile size for `scale` on `target`.
    ///
    /// `budget` is ignored on the CPU.  On a GPU, `None` means reporting
    /// failed and yields [`MIN_TILE_SIZE`].
    pub fn recommend(target: DeviceTarget, scale: u32, budget: Option<&DeviceBudget>) -> u32 {
        if !target.is_gpu() {
            return CPU_TILE_SIZE;
        }
        let Some(budget) = budget else {
            return MIN_TILE_SIZE;
        };
        if budget.vendor.uses_direct_budget() {
            Self::direct(budget, scale)
        } else {
            match budget.heap_budget_mb {
                Some(heap) => Self::from_ladder(heap, scale),
                None => MIN_TILE_SIZE,
            }
        }
    }

    /// Threshold ladder for vendors with a trustworthy heap budget.
    pub fn from_ladder(heap_budget_mb: u32, scale: u32) -> u32 {
        let ladder = match scale {
            2 => &LADDER_2X,
            3 => &LADDER_3X,
            _ => &LADDER_4X,
        };
        ladder
            .iter()
            .find(|(floor, _)| heap_budget_mb > *floor)
            .map(|(_, tile)| *tile)
            .unwrap_or(MIN_TILE_SIZE)
    }

    /// `effective_budget / scale`, floored at the smallest tier.
    fn direct(budget: &DeviceBudget, scale: u32) -> u32 {
        let effective = budget
            .memory_budget_ext_mb
            .map(u64::from)
            .unwrap_or(budget.device_local_heap_mb / DIRECT_BUDGET_HEAP_DIVISOR);
        let tile = effective / u64::from(scale.max(1));
        u32::try_from(tile)
            .unwrap_or(u32::MAX)
            .max(MIN_TILE_SIZE)
    }
}
