//! # Test Inventory
//!
//! An inventory is the ordered list of test units a suite draws from. It is
//! parsed from a TOML file whose `[[entry]]` tables either describe a test or
//! include another inventory file in place:
//!
//! ```toml
//! [[entry]]
//! kind = "junit"
//! class = "org.example.MathTest"
//! weighting = "0.5"
//!
//! [[entry]]
//! kind = "include"
//! inventory = "common.toml"
//! ```
//!
//! Exclude files use the same format. Any test that equals an excluded entry
//! (same adaptor kind, class and method) is dropped from the inventory.

mod parser;
pub mod weight;
pub mod weighting;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub use weight::{ParseWeightError, Weight};
pub use weighting::{WeightingError, WeightingTable, MAX_MULTIPLIER, MAX_TABLE_SIZE};

use parser::InventoryParser;

/// Adaptor family that knows how to execute a test unit
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AdaptorKind {
    /// JUnit-style test class
    JUnit,
    /// Mauve-style test class
    Mauve,
    /// Arbitrary static method
    Method,
    /// External command run as a child process
    Command,
}

/// Immutable description of one runnable test.
///
/// Equality and hashing use the test's identity (adaptor kind, class and
/// method) so exclude lists can be applied by set subtraction. The id and
/// weight do not take part.
#[derive(Debug, Clone)]
pub struct TestUnit {
    id: u32,
    kind: AdaptorKind,
    class: String,
    method: Option<String>,
    command: Vec<String>,
    weight: Weight,
}

impl TestUnit {
    pub fn new(id: u32, kind: AdaptorKind, class: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            class: class.into(),
            method: None,
            command: Vec::new(),
            weight: Weight::ONE,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn with_weight(mut self, weight: Weight) -> Self {
        self.weight = weight;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> AdaptorKind {
        self.kind
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Program and arguments for command units
    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn weight(&self) -> Weight {
        self.weight
    }

    /// Name shown in reports and stored in the execution log metadata
    pub fn name(&self) -> String {
        match &self.method {
            Some(method) => format!("{}.{}", self.class, method),
            None => self.class.clone(),
        }
    }
}

impl PartialEq for TestUnit {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.class == other.class && self.method == other.method
    }
}

impl Eq for TestUnit {}

impl Hash for TestUnit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.class.hash(state);
        self.method.hash(state);
    }
}

/// Run-wide source of test ids.
///
/// Shared by every suite so an id is never handed out twice in one run.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of ids handed out so far
    pub fn allocated(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}

/// Inventory parsing errors
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("cannot read inventory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse inventory {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("inventory include cycle: {chain}")]
    IncludeCycle { chain: String },

    #[error("invalid weighting '{value}' for {class} in {path}: {source}")]
    InvalidWeight {
        path: PathBuf,
        class: String,
        value: String,
        #[source]
        source: ParseWeightError,
    },

    #[error("invalid entry for {class} in {path}: {reason}")]
    InvalidEntry {
        path: PathBuf,
        class: String,
        reason: String,
    },
}

/// Ordered collection of runnable tests
#[derive(Debug, Clone)]
pub struct Inventory {
    reference: String,
    units: Vec<Arc<TestUnit>>,
}

impl Inventory {
    /// Build an inventory from already-constructed units
    pub fn from_units(reference: impl Into<String>, units: Vec<TestUnit>) -> Self {
        Self {
            reference: reference.into(),
            units: units.into_iter().map(Arc::new).collect(),
        }
    }

    /// Parse an inventory file, resolving includes, then apply exclude files.
    ///
    /// Ids for the inventory's tests come from `ids`. Exclude files draw from
    /// a private allocator so they do not consume run-wide ids.
    pub fn load(
        path: &Path,
        excludes: &[PathBuf],
        ids: &IdAllocator,
    ) -> Result<Self, InventoryError> {
        let units = InventoryParser::new(ids).parse(path)?;
        let mut inventory = Self::from_units(path.display().to_string(), units);

        let scratch = IdAllocator::new();
        for exclude in excludes {
            let excluded = InventoryParser::new(&scratch).parse(exclude)?;
            let before = inventory.len();
            inventory.exclude(&excluded);
            tracing::debug!(
                inventory = %inventory.reference,
                exclude = %exclude.display(),
                removed = before - inventory.len(),
                "applied exclude file"
            );
        }

        Ok(inventory)
    }

    /// Remove every unit equal to one of `excluded`
    pub fn exclude(&mut self, excluded: &[TestUnit]) {
        let excluded: HashSet<&TestUnit> = excluded.iter().collect();
        self.units.retain(|unit| !excluded.contains(unit.as_ref()));
    }

    /// Source reference recorded in the execution log metadata
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn units(&self) -> &[Arc<TestUnit>] {
        &self.units
    }

    pub fn get(&self, index: usize) -> Option<&Arc<TestUnit>> {
        self.units.get(index)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn weights(&self) -> Vec<Weight> {
        self.units.iter().map(|u| u.weight()).collect()
    }

    /// Distinct adaptor kinds used by this inventory
    pub fn kinds(&self) -> HashSet<AdaptorKind> {
        self.units.iter().map(|u| u.kind()).collect()
    }
}
