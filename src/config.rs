use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::execution_log::LogLimits;
use crate::inventory::MAX_MULTIPLIER;
use crate::suite::{SelectionMode, SuiteSettings, ThinkTimeRange};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const CONFIG_PATH_ENV: &str = "LOADTEST_CONFIG";
pub const ENV_PREFIX: &str = "LOADTEST__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration value for '{key}': {reason}")]
    Invalid { key: String, reason: String },

    #[error("configuration defines no suites")]
    NoSuites,
}

impl ConfigError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("empty value")]
    Empty,
    #[error("'{0}' is not a number followed by a unit")]
    Malformed(String),
    #[error("unknown unit '{0}'")]
    UnknownUnit(String),
    #[error("value overflows")]
    Overflow,
}

/// Integer or string form of a spec value, as TOML or env may supply it
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSpec {
    Number(u64),
    Text(String),
}

/// Split "1h30m" into [(1, "h"), (30, "m")]
fn split_terms(text: &str) -> Result<Vec<(u64, String)>, SpecError> {
    let text = text.trim().to_ascii_lowercase();
    if text.is_empty() {
        return Err(SpecError::Empty);
    }
    let mut terms = Vec::new();
    let mut chars = text.chars().peekable();
    while chars.peek().is_some() {
        let digits: String = std::iter::from_fn(|| chars.next_if(|c| c.is_ascii_digit())).collect();
        let unit: String = std::iter::from_fn(|| chars.next_if(|c| c.is_ascii_alphabetic())).collect();
        if digits.is_empty() {
            return Err(SpecError::Malformed(text.clone()));
        }
        let value = digits.parse().map_err(|_| SpecError::Overflow)?;
        terms.push((value, unit));
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
    }
    Ok(terms)
}

/// Duration written as `"1h30m"`, `"90s"`, `"250ms"`; a bare number is seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSpec")]
pub struct TimeSpec(pub Duration);

impl TimeSpec {
    pub fn duration(self) -> Duration {
        self.0
    }
}

impl FromStr for TimeSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut millis: u64 = 0;
        for (value, unit) in split_terms(s)? {
            let scale = match unit.as_str() {
                "ms" => 1,
                "" | "s" => 1_000,
                "m" => 60_000,
                "h" => 3_600_000,
                "d" => 86_400_000,
                other => return Err(SpecError::UnknownUnit(other.to_string())),
            };
            millis = value
                .checked_mul(scale)
                .and_then(|v| millis.checked_add(v))
                .ok_or(SpecError::Overflow)?;
        }
        Ok(TimeSpec(Duration::from_millis(millis)))
    }
}

impl TryFrom<RawSpec> for TimeSpec {
    type Error = SpecError;

    fn try_from(raw: RawSpec) -> Result<Self, Self::Error> {
        match raw {
            RawSpec::Number(secs) => Ok(TimeSpec(Duration::from_secs(secs))),
            RawSpec::Text(text) => text.parse(),
        }
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Byte count written as `"200m"`, `"64k"`, `"1g"` (binary units)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSpec")]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let terms = split_terms(s)?;
        let [(value, unit)] = terms.as_slice() else {
            return Err(SpecError::Malformed(s.to_string()));
        };
        let shift = match unit.trim_end_matches('b') {
            "" => 0,
            "k" => 10,
            "m" => 20,
            "g" => 30,
            other => return Err(SpecError::UnknownUnit(other.to_string())),
        };
        value
            .checked_mul(1u64 << shift)
            .map(ByteSize)
            .ok_or(SpecError::Overflow)
    }
}

impl TryFrom<RawSpec> for ByteSize {
    type Error = SpecError;

    fn try_from(raw: RawSpec) -> Result<Self, Self::Error> {
        match raw {
            RawSpec::Number(bytes) => Ok(ByteSize(bytes)),
            RawSpec::Text(text) => text.parse(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub suites: Vec<SuiteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub results_dir: PathBuf,
    pub time_limit: Option<TimeSpec>,
    pub inactivity_limit: TimeSpec,
    pub report_interval: TimeSpec,
    pub abort_if_out_of_memory: bool,
    pub report_failure_limit: u32,
    /// 0 = never abort on failures
    pub abort_at_failure_limit: u64,
    pub dump_on_first_failure: bool,
    pub timezone: String,
    pub capture_limit: ByteSize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            time_limit: None,
            inactivity_limit: TimeSpec(Duration::from_secs(600)),
            report_interval: TimeSpec(Duration::from_secs(60)),
            abort_if_out_of_memory: true,
            report_failure_limit: 10,
            abort_at_failure_limit: 0,
            dump_on_first_failure: true,
            timezone: "UTC".to_string(),
            capture_limit: ByteSize(64 * 1024),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub total_space: ByteSize,
    pub segment_space: ByteSize,
}

impl Default for LogConfig {
    fn default() -> Self {
        let limits = LogLimits::default();
        Self {
            total_space: ByteSize(limits.total_space),
            segment_space: ByteSize(limits.segment_space),
        }
    }
}

impl LogConfig {
    pub fn limits(&self) -> LogLimits {
        LogLimits {
            total_space: self.total_space.bytes(),
            segment_space: self.segment_space.bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuiteConfig {
    pub inventory: PathBuf,
    #[serde(default)]
    pub exclude: Vec<PathBuf>,
    #[serde(default = "default_one")]
    pub threads: u32,
    #[serde(default)]
    pub selection: SelectionMode,
    pub seed: Option<u64>,
    #[serde(default = "default_one")]
    pub repeat_count: u32,
    #[serde(default)]
    pub think_min_ms: u64,
    #[serde(default)]
    pub think_max_ms: u64,
    pub total_tests: Option<u64>,
    pub multiplier: Option<u32>,
}

fn default_one() -> u32 {
    1
}

impl SuiteConfig {
    pub fn settings(&self) -> SuiteSettings {
        SuiteSettings {
            threads: self.threads,
            mode: self.selection,
            repeat_count: self.repeat_count,
            total_tests: self.total_tests,
            seed: self.seed,
            think_time: ThinkTimeRange {
                min_ms: self.think_min_ms,
                max_ms: self.think_max_ms,
            },
            multiplier: self.multiplier,
        }
    }
}

impl Config {
    /// Load from `$LOADTEST_CONFIG` (or the default path) plus `LOADTEST__` env overrides
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    /// Parse a TOML document without environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Config = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let run = &self.run;
        if run.report_interval.duration().is_zero() {
            return Err(ConfigError::invalid("run.report_interval", "must be positive"));
        }
        if run.inactivity_limit.duration().is_zero() {
            return Err(ConfigError::invalid("run.inactivity_limit", "must be positive"));
        }
        if run.capture_limit.bytes() == 0 {
            return Err(ConfigError::invalid("run.capture_limit", "must be positive"));
        }
        if run.timezone.parse::<Tz>().is_err() {
            return Err(ConfigError::invalid(
                "run.timezone",
                format!("unknown timezone '{}'", run.timezone),
            ));
        }

        let log = self.log.limits();
        if log.segment_space == 0 {
            return Err(ConfigError::invalid("log.segment_space", "must be positive"));
        }
        if log.segment_space > log.total_space {
            return Err(ConfigError::invalid(
                "log.segment_space",
                "must not exceed log.total_space",
            ));
        }

        if self.suites.is_empty() {
            return Err(ConfigError::NoSuites);
        }
        for (i, suite) in self.suites.iter().enumerate() {
            let key = |field: &str| format!("suites[{i}].{field}");
            if suite.threads == 0 {
                return Err(ConfigError::invalid(key("threads"), "must be at least 1"));
            }
            if suite.repeat_count == 0 {
                return Err(ConfigError::invalid(key("repeat_count"), "must be at least 1"));
            }
            if suite.think_min_ms > suite.think_max_ms {
                return Err(ConfigError::invalid(
                    key("think_min_ms"),
                    "must not exceed think_max_ms",
                ));
            }
            if let Some(m) = suite.multiplier {
                if m == 0 || m > MAX_MULTIPLIER {
                    return Err(ConfigError::invalid(
                        key("multiplier"),
                        format!("must be within 1..={MAX_MULTIPLIER}"),
                    ));
                }
            }
        }
        Ok(())
    }
}
