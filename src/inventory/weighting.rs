//! # Weighting Resolver
//!
//! Converts fractional test weights into a flat selection table. Each test
//! appears `round_half_up(weight × multiplier)` times (at least once), so a
//! uniform index into the table honours the configured weights.
//!
//! The multiplier is found by an exhaustive search over `1..=MAX_MULTIPLIER`
//! using exact integer arithmetic on [`Weight`] units. The first multiplier
//! with zero rounding error wins outright; otherwise the smallest worst-case
//! error wins, then the smallest total error, then the smallest multiplier.

use thiserror::Error;

use super::weight::{Weight, WEIGHT_SCALE};

/// Largest flat table the resolver will build
pub const MAX_TABLE_SIZE: usize = 500_000;

/// Largest multiplier considered by the search
pub const MAX_MULTIPLIER: u32 = 999;

/// Weighting resolution errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WeightingError {
    #[error("cannot build a weighting table for an empty inventory")]
    Empty,

    #[error("multiplier {0} is outside 1..={MAX_MULTIPLIER}")]
    InvalidMultiplier(u32),

    #[error(
        "weighting table at multiplier {multiplier} needs {required} entries, exceeding the maximum of {max}"
    )]
    TableTooLarge {
        multiplier: u32,
        required: u64,
        max: usize,
    },
}

/// Rounding outcome of one candidate multiplier.
///
/// Errors are expressed in `1e-9` weight units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiplierScore {
    pub multiplier: u32,
    pub table_len: u64,
    pub worst_error: u128,
    pub total_error: u128,
}

impl MultiplierScore {
    pub fn is_exact(&self) -> bool {
        self.worst_error == 0
    }
}

/// Table slots for one weight and their distance from the exact share.
///
/// The error is measured on the count actually placed in the table, so a
/// weight that rounds to zero is charged for the slot it still receives.
fn rounded_slots(weight: Weight, multiplier: u32) -> (u128, u128) {
    let scale = WEIGHT_SCALE as u128;
    let ideal = weight.units() as u128 * multiplier as u128;
    let slots = ((ideal + scale / 2) / scale).max(1);
    let error = (slots * scale).abs_diff(ideal);
    (slots, error)
}

/// Score a single multiplier against a set of weights
pub fn score(weights: &[Weight], multiplier: u32) -> MultiplierScore {
    let mut table_len: u64 = 0;
    let mut worst_error = 0u128;
    let mut total_error = 0u128;

    for &weight in weights {
        let (slots, error) = rounded_slots(weight, multiplier);
        let slots = slots.min(u64::MAX as u128) as u64;
        table_len = table_len.saturating_add(slots);
        worst_error = worst_error.max(error);
        total_error += error;
    }

    MultiplierScore {
        multiplier,
        table_len,
        worst_error,
        total_error,
    }
}

/// Search for the best multiplier within the default table size
pub fn resolve_multiplier(weights: &[Weight]) -> Result<MultiplierScore, WeightingError> {
    resolve_multiplier_with_limit(weights, MAX_TABLE_SIZE)
}

/// Search for the best multiplier whose table fits in `max_table` entries
pub fn resolve_multiplier_with_limit(
    weights: &[Weight],
    max_table: usize,
) -> Result<MultiplierScore, WeightingError> {
    if weights.is_empty() {
        return Err(WeightingError::Empty);
    }

    let mut best: Option<MultiplierScore> = None;

    for multiplier in 1..=MAX_MULTIPLIER {
        let candidate = score(weights, multiplier);

        // Table length never shrinks as the multiplier grows
        if candidate.table_len > max_table as u64 {
            break;
        }

        if candidate.is_exact() {
            return Ok(candidate);
        }

        let improves = best.map_or(true, |b| {
            (candidate.worst_error, candidate.total_error) < (b.worst_error, b.total_error)
        });
        if improves {
            best = Some(candidate);
        }
    }

    best.ok_or_else(|| WeightingError::TableTooLarge {
        multiplier: 1,
        required: score(weights, 1).table_len,
        max: max_table,
    })
}

/// Flat selection table: each entry is an index into the inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightingTable {
    multiplier: u32,
    slots: Vec<u32>,
}

impl WeightingTable {
    /// Build the table for a known multiplier
    pub fn build(
        weights: &[Weight],
        multiplier: u32,
        max_table: usize,
    ) -> Result<Self, WeightingError> {
        if weights.is_empty() {
            return Err(WeightingError::Empty);
        }
        if multiplier == 0 || multiplier > MAX_MULTIPLIER {
            return Err(WeightingError::InvalidMultiplier(multiplier));
        }

        let required = score(weights, multiplier).table_len;
        if required > max_table as u64 {
            return Err(WeightingError::TableTooLarge {
                multiplier,
                required,
                max: max_table,
            });
        }

        let mut slots = Vec::with_capacity(required as usize);
        for (index, &weight) in weights.iter().enumerate() {
            let (count, _) = rounded_slots(weight, multiplier);
            let count = count as usize;
            slots.extend(std::iter::repeat(index as u32).take(count));
        }

        Ok(Self { multiplier, slots })
    }

    /// One slot per test at multiplier 1, whatever the weights
    pub fn uniform(len: usize) -> Self {
        Self {
            multiplier: 1,
            slots: (0..len as u32).collect(),
        }
    }

    /// Resolve the multiplier and build the table in one step
    pub fn resolve(weights: &[Weight]) -> Result<Self, WeightingError> {
        let best = resolve_multiplier(weights)?;
        Self::build(weights, best.multiplier, MAX_TABLE_SIZE)
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Inventory index stored at `slot`
    pub fn get(&self, slot: usize) -> usize {
        self.slots[slot] as usize
    }

    pub fn slots(&self) -> &[u32] {
        &self.slots
    }
}
