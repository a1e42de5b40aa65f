use itertools::Itertools;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use super::{AdaptorKind, IdAllocator, InventoryError, TestUnit, Weight};

#[derive(Debug, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    entry: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum RawEntry {
    Junit(RawTest),
    Mauve(RawTest),
    Method(RawTest),
    Command(RawTest),
    Include { inventory: PathBuf },
}

#[derive(Debug, Deserialize)]
struct RawTest {
    class: String,
    method: Option<String>,
    #[serde(default)]
    command: Vec<String>,
    weighting: Option<RawWeight>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawWeight {
    Text(String),
    Integer(i64),
    Float(f64),
}

/// Recursive inventory reader.
///
/// `chain` holds the canonical paths of the files currently being expanded;
/// meeting one of them again means the includes form a cycle.
pub(super) struct InventoryParser<'a> {
    ids: &'a IdAllocator,
    chain: Vec<PathBuf>,
}

impl<'a> InventoryParser<'a> {
    pub(super) fn new(ids: &'a IdAllocator) -> Self {
        Self {
            ids,
            chain: Vec::new(),
        }
    }

    pub(super) fn parse(mut self, path: &Path) -> Result<Vec<TestUnit>, InventoryError> {
        let mut units = Vec::new();
        self.parse_file(path, &mut units)?;
        Ok(units)
    }

    fn parse_file(&mut self, path: &Path, out: &mut Vec<TestUnit>) -> Result<(), InventoryError> {
        let canonical = fs::canonicalize(path).map_err(|source| InventoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if self.chain.contains(&canonical) {
            let chain = self
                .chain
                .iter()
                .chain(std::iter::once(&canonical))
                .map(|p| p.display())
                .join(" -> ");
            return Err(InventoryError::IncludeCycle { chain });
        }

        let text = fs::read_to_string(&canonical).map_err(|source| InventoryError::Io {
            path: canonical.clone(),
            source,
        })?;
        let file: InventoryFile = toml::from_str(&text).map_err(|source| InventoryError::Parse {
            path: canonical.clone(),
            source,
        })?;

        self.chain.push(canonical.clone());
        let base = canonical.parent().map(Path::to_path_buf).unwrap_or_default();

        for entry in file.entry {
            let (kind, raw) = match entry {
                RawEntry::Include { inventory } => {
                    self.parse_file(&base.join(inventory), out)?;
                    continue;
                }
                RawEntry::Junit(raw) => (AdaptorKind::JUnit, raw),
                RawEntry::Mauve(raw) => (AdaptorKind::Mauve, raw),
                RawEntry::Method(raw) => (AdaptorKind::Method, raw),
                RawEntry::Command(raw) => (AdaptorKind::Command, raw),
            };
            out.push(self.build_unit(&canonical, kind, raw)?);
        }

        self.chain.pop();
        Ok(())
    }

    fn build_unit(
        &self,
        path: &Path,
        kind: AdaptorKind,
        raw: RawTest,
    ) -> Result<TestUnit, InventoryError> {
        let invalid = |reason: &str| InventoryError::InvalidEntry {
            path: path.to_path_buf(),
            class: raw.class.clone(),
            reason: reason.to_string(),
        };

        if raw.class.trim().is_empty() {
            return Err(invalid("class must not be empty"));
        }
        if kind == AdaptorKind::Method && raw.method.is_none() {
            return Err(invalid("method entries need a 'method' attribute"));
        }
        if kind == AdaptorKind::Command && raw.command.is_empty() {
            return Err(invalid("command entries need a non-empty 'command' list"));
        }

        let weight = match &raw.weighting {
            None => Weight::ONE,
            Some(value) => parse_weight(value).map_err(|(value, source)| {
                InventoryError::InvalidWeight {
                    path: path.to_path_buf(),
                    class: raw.class.clone(),
                    value,
                    source,
                }
            })?,
        };

        let mut unit = TestUnit::new(self.ids.next_id(), kind, raw.class)
            .with_command(raw.command)
            .with_weight(weight);
        if let Some(method) = raw.method {
            unit = unit.with_method(method);
        }
        Ok(unit)
    }
}

fn parse_weight(raw: &RawWeight) -> Result<Weight, (String, super::ParseWeightError)> {
    match raw {
        RawWeight::Text(text) => text.parse().map_err(|e| (text.clone(), e)),
        RawWeight::Integer(value) => value.to_string().parse().map_err(|e| (value.to_string(), e)),
        RawWeight::Float(value) => Weight::try_from(*value).map_err(|e| (value.to_string(), e)),
    }
}
