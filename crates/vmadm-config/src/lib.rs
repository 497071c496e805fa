// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the vmadm engine.
///
/// Every section is optional in the TOML source; omitted sections and keys
/// take the defaults documented on each field.
#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub sizing: Sizing,

    #[serde(default)]
    pub settle: Settle,

    #[serde(default)]
    pub policy: Policy,

    #[serde(default)]
    pub bundle: Bundle,

    #[serde(default)]
    pub log: Log,
}

/// Memory sizing defaults.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Sizing {
    /// The smallest `max_swap` (MiB) a VM is ever given.
    #[serde(default = "default_min_swap_mib")]
    pub min_swap_mib: u64,
}

impl Default for Sizing {
    fn default() -> Self {
        Self { min_swap_mib: default_min_swap_mib() }
    }
}

fn default_min_swap_mib() -> u64 {
    256
}

/// How long, and how often, to wait for a VM to reach a settled state.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Settle {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on the total time spent polling.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Settle {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl Default for Settle {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_wait_ms() -> u64 {
    120_000
}

/// Knobs that decide how tolerant updates are of questionable input.
///
/// The defaults reproduce the historical behavior: brand-restricted fields
/// and removals of absent NICs are dropped and reported rather than failing
/// the request, and a NIC may carry only a single address.
#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Policy {
    /// Fail updates that set a field the VM's brand does not accept.
    #[serde(default)]
    pub strict_brand_fields: bool,

    /// Fail updates that remove a NIC the VM does not have.
    #[serde(default)]
    pub strict_nic_removal: bool,

    /// Accept comma-separated address lists in a NIC's `ip`.
    #[serde(default)]
    pub allow_ip_lists: bool,
}

/// Bundle encoding parameters.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Bundle {
    /// Largest storage-extent chunk carried in a single frame, in bytes.
    #[serde(default = "default_chunk_size")]
    pub extent_chunk_size: usize,
}

impl Default for Bundle {
    fn default() -> Self {
        Self { extent_chunk_size: default_chunk_size() }
    }
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

/// Where log records go.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output on a terminal, bunyan JSON otherwise.
    #[default]
    Auto,
    Terminal,
    Bunyan,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Log {
    pub fn level(&self) -> Result<slog::Level, ParseError> {
        slog::Level::from_str(&self.level)
            .map_err(|_| ParseError::InvalidLogLevel(self.level.clone()))
    }
}

impl Default for Log {
    fn default() -> Self {
        Self { level: default_log_level(), format: LogFormat::default() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid log level {0:?}")]
    InvalidLogLevel(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

impl Config {
    /// Checks the cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.settle.poll_interval_ms == 0 {
            return Err(ParseError::InvalidValue(
                "settle.poll_interval_ms",
                "must be non-zero".to_string(),
            ));
        }
        if self.settle.max_wait_ms < self.settle.poll_interval_ms {
            return Err(ParseError::InvalidValue(
                "settle.max_wait_ms",
                format!(
                    "{} is shorter than the poll interval ({})",
                    self.settle.max_wait_ms, self.settle.poll_interval_ms
                ),
            ));
        }
        if self.bundle.extent_chunk_size == 0 {
            return Err(ParseError::InvalidValue(
                "bundle.extent_chunk_size",
                "must be non-zero".to_string(),
            ));
        }
        self.log.level()?;
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg = toml::from_str::<Config>(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    Config::from_str(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config {
            policy: Policy { allow_ip_lists: true, ..Default::default() },
            ..Default::default()
        };
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = Config::from_str("").unwrap();
        assert_eq!(cfg.sizing.min_swap_mib, 256);
        assert_eq!(cfg.settle.poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.settle.max_wait(), Duration::from_secs(120));
        assert!(!cfg.policy.strict_brand_fields);
        assert!(!cfg.policy.strict_nic_removal);
        assert!(!cfg.policy.allow_ip_lists);
        assert_eq!(cfg.log.level().unwrap(), slog::Level::Info);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = Config::from_str(
            r#"
            [sizing]
            min_swap_mib = 512

            [settle]
            poll_interval_ms = 250

            [log]
            level = "debug"
            format = "bunyan"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sizing.min_swap_mib, 512);
        assert_eq!(cfg.settle.poll_interval_ms, 250);
        assert_eq!(cfg.settle.max_wait_ms, 120_000);
        assert_eq!(cfg.log.level().unwrap(), slog::Level::Debug);
        assert_eq!(cfg.log.format, LogFormat::Bunyan);
    }

    #[test]
    fn rejects_inconsistent_settle_window() {
        let err = Config::from_str(
            r#"
            [settle]
            poll_interval_ms = 1000
            max_wait_ms = 10
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::InvalidValue("settle.max_wait_ms", _)));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let err = Config::from_str("[log]\nlevel = \"chatty\"\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidLogLevel(_)));
    }

    #[test]
    fn parses_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[policy]\nstrict_nic_removal = true").unwrap();
        let cfg = parse(file.path()).unwrap();
        assert!(cfg.policy.strict_nic_removal);
    }
}
