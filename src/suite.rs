//! # Suite
//!
//! A suite owns one inventory and hands out the next test to run to any of
//! its worker threads. All selection state sits behind a single mutex so
//! every `next_test` call is one short critical section.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::inventory::{Inventory, TestUnit, WeightingError, WeightingTable, MAX_TABLE_SIZE};
use crate::inventory::weighting;

/// How a suite picks its next test
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SelectionMode {
    /// Walk the inventory in order, wrapping at the end
    Sequential,
    /// Uniform pick from the weighting table
    #[default]
    Random,
}

/// Delay range a worker sleeps between tests, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkTimeRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl ThinkTimeRange {
    pub fn is_enabled(&self) -> bool {
        self.max_ms > 0
    }
}

/// Suite configuration resolved from the run settings
#[derive(Debug, Clone)]
pub struct SuiteSettings {
    pub threads: u32,
    pub mode: SelectionMode,
    pub repeat_count: u32,
    pub total_tests: Option<u64>,
    /// Random seed (None = pick one and log it)
    pub seed: Option<u64>,
    pub think_time: ThinkTimeRange,
    /// Forced weighting multiplier (None = search)
    pub multiplier: Option<u32>,
}

impl Default for SuiteSettings {
    fn default() -> Self {
        Self {
            threads: 1,
            mode: SelectionMode::Random,
            repeat_count: 1,
            total_tests: None,
            seed: None,
            think_time: ThinkTimeRange::default(),
            multiplier: None,
        }
    }
}

/// Suite construction errors
#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("suite {suite}: inventory {inventory} contains no runnable tests")]
    EmptyInventory { suite: u32, inventory: String },

    #[error("suite {suite}: {source}")]
    Weighting {
        suite: u32,
        #[source]
        source: WeightingError,
    },
}

/// Progress counters of one suite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SuiteProgress {
    pub suite_id: u32,
    pub issued: u64,
    pub total: Option<u64>,
}

impl SuiteProgress {
    /// Fraction of a bounded suite that has been handed out
    pub fn completion(&self) -> Option<f64> {
        self.total.map(|total| {
            if total == 0 {
                1.0
            } else {
                (self.issued as f64 / total as f64).min(1.0)
            }
        })
    }
}

struct SelectionState {
    cursor: usize,
    rng: StdRng,
    current: Option<usize>,
    outstanding_repeats: u32,
    remaining: Option<u64>,
    issued: u64,
}

/// A group of worker threads sharing one inventory and selection policy
pub struct Suite {
    id: u32,
    threads: u32,
    mode: SelectionMode,
    repeat_count: u32,
    total_tests: Option<u64>,
    seed: u64,
    think_time: ThinkTimeRange,
    inventory: Inventory,
    table: WeightingTable,
    state: Mutex<SelectionState>,
}

impl Suite {
    pub fn new(id: u32, inventory: Inventory, settings: SuiteSettings) -> Result<Self, SuiteError> {
        if inventory.is_empty() {
            return Err(SuiteError::EmptyInventory {
                suite: id,
                inventory: inventory.reference().to_string(),
            });
        }

        // Sequential selection never reads the table
        let table = match settings.mode {
            SelectionMode::Sequential => WeightingTable::uniform(inventory.len()),
            SelectionMode::Random => {
                let weights = inventory.weights();
                let weighting_err = |source| SuiteError::Weighting { suite: id, source };
                let multiplier = match settings.multiplier {
                    Some(forced) => forced,
                    None => weighting::resolve_multiplier(&weights)
                        .map_err(weighting_err)?
                        .multiplier,
                };
                WeightingTable::build(&weights, multiplier, MAX_TABLE_SIZE).map_err(weighting_err)?
            }
        };

        let seed = settings.seed.unwrap_or_else(rand::random);
        if settings.mode == SelectionMode::Random {
            info!(
                suite = id,
                seed,
                multiplier = table.multiplier(),
                table_len = table.len(),
                "random selection configured"
            );
        }

        Ok(Self {
            id,
            threads: settings.threads.max(1),
            mode: settings.mode,
            repeat_count: settings.repeat_count.max(1),
            total_tests: settings.total_tests,
            seed,
            think_time: settings.think_time,
            inventory,
            table,
            state: Mutex::new(SelectionState {
                cursor: 0,
                rng: StdRng::seed_from_u64(seed),
                current: None,
                outstanding_repeats: 0,
                remaining: settings.total_tests,
                issued: 0,
            }),
        })
    }

    /// Next test to run, or `None` once the suite's test budget is spent
    pub fn next_test(&self) -> Option<Arc<TestUnit>> {
        let mut state = self.state.lock();

        if state.remaining == Some(0) {
            return None;
        }

        let index = match state.current {
            Some(index) if state.outstanding_repeats > 0 => index,
            _ => {
                let index = match self.mode {
                    SelectionMode::Sequential => {
                        let index = state.cursor;
                        state.cursor = (index + 1) % self.inventory.len();
                        index
                    }
                    SelectionMode::Random => {
                        let slot = state.rng.gen_range(0..self.table.len());
                        self.table.get(slot)
                    }
                };
                state.current = Some(index);
                state.outstanding_repeats = self.repeat_count;
                index
            }
        };

        state.outstanding_repeats -= 1;
        if let Some(remaining) = state.remaining.as_mut() {
            *remaining -= 1;
        }
        state.issued += 1;

        self.inventory.get(index).cloned()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn threads(&self) -> u32 {
        self.threads
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    pub fn total_tests(&self) -> Option<u64> {
        self.total_tests
    }

    /// Seed of the random selection generator
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn think_time(&self) -> ThinkTimeRange {
        self.think_time
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn table(&self) -> &WeightingTable {
        &self.table
    }

    pub fn progress(&self) -> SuiteProgress {
        let state = self.state.lock();
        SuiteProgress {
            suite_id: self.id,
            issued: state.issued,
            total: self.total_tests,
        }
    }
}

/// Per-thread think-time generator.
///
/// Seeded from the thread name and the configured range, so a given worker
/// sleeps the same sequence of delays on every run.
pub struct ThinkTime {
    range: ThinkTimeRange,
    rng: StdRng,
}

impl ThinkTime {
    pub fn for_thread(thread_name: &str, range: ThinkTimeRange) -> Self {
        Self {
            range,
            rng: StdRng::seed_from_u64(think_seed(thread_name, range)),
        }
    }

    /// Delay before the next test, if thinking time is configured
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.range.is_enabled() {
            return None;
        }
        let spread = self.range.max_ms.saturating_sub(self.range.min_ms);
        let jitter = if spread == 0 {
            0
        } else {
            self.rng.gen_range(0..=spread)
        };
        Some(Duration::from_millis(self.range.min_ms + jitter))
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the thread name and range, stable across builds and releases
fn think_seed(thread_name: &str, range: ThinkTimeRange) -> u64 {
    thread_name
        .bytes()
        .chain(range.min_ms.to_be_bytes())
        .chain(range.max_ms.to_be_bytes())
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME))
}
