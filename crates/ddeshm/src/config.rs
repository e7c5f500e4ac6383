//! Runtime configuration.
//!
//! Settings come from an optional TOML file, then environment overrides.
//! Every field has a default, so an empty file (or none) is valid:
//!
//! ```toml
//! shm_key = 0x44444521
//! key_range = 8
//! ack_timeout_ms = 1000
//! log_level = "debug"
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Environment override for [`DdeConfig::shm_key`].
pub const KEY_ENV: &str = "DDESHM_KEY";
/// Environment override for [`DdeConfig::ack_timeout_ms`].
pub const ACK_TIMEOUT_ENV: &str = "DDESHM_ACK_TIMEOUT_MS";

/// Smallest segment an arena is created with.
pub const MIN_SEGMENT_SIZE: usize = 64 * 1024;

/// Settings of one DDE context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdeConfig {
    /// First SysV key probed for the main block.
    pub shm_key: u32,
    /// Number of consecutive keys probed.
    pub key_range: u32,
    /// How long a synchronous send waits for its ACK.
    pub ack_timeout_ms: u64,
    /// Size of each per-process arena segment.
    pub segment_size: usize,
    /// How long an attacher waits for another process to finish building
    /// the main block.
    pub build_wait_ms: u64,
    /// Inbound messages serviced re-entrantly while waiting for an ACK.
    pub max_nesting: u32,
    /// Deferred POST acknowledgments kept before they are flushed.
    pub deferred_ack_capacity: usize,
    /// Level name handed to `ddeshm_log`.
    pub log_level: String,
}

impl Default for DdeConfig {
    fn default() -> Self {
        Self {
            shm_key: 0x4444_4521,
            key_range: 8,
            ack_timeout_ms: 1000,
            segment_size: MIN_SEGMENT_SIZE,
            build_wait_ms: 2000,
            max_nesting: 10,
            deferred_ack_capacity: 16,
            log_level: String::from("info"),
        }
    }
}

fn parse_u32(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

impl DdeConfig {
    /// Loads `path` if given and present, else defaults; then applies
    /// environment overrides and validates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on unreadable or malformed files, bad
    /// environment values, or failed validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
                Self::from_toml(&contents)?
            }
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on malformed input.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }

    /// Renders the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Applies overrides looked up through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(KEY_ENV) {
            self.shm_key = parse_u32(&value)
                .ok_or_else(|| Error::Config(format!("{KEY_ENV}={value} is not a key")))?;
        }
        if let Some(value) = lookup(ACK_TIMEOUT_ENV) {
            self.ack_timeout_ms = value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{ACK_TIMEOUT_ENV}={value} is not a number")))?;
        }
        if let Some(value) = lookup(ddeshm_log::LOG_ENV) {
            self.log_level = value;
        }
        Ok(())
    }

    /// Checks the settings for usable values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.key_range == 0 {
            return Err(Error::Config("key_range must be at least 1".into()));
        }
        if self.shm_key.checked_add(self.key_range).is_none() {
            return Err(Error::Config("shm_key + key_range overflows".into()));
        }
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(Error::Config(format!(
                "segment_size must be at least {MIN_SEGMENT_SIZE}"
            )));
        }
        if self.ack_timeout_ms == 0 || self.build_wait_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        if self.deferred_ack_capacity == 0 {
            return Err(Error::Config("deferred_ack_capacity must be at least 1".into()));
        }
        self.log_level
            .parse::<ddeshm_log::Level>()
            .map_err(Error::Config)?;
        Ok(())
    }

    /// ACK deadline as a `Duration`.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Build-wait deadline as a `Duration`.
    #[must_use]
    pub fn build_wait(&self) -> Duration {
        Duration::from_millis(self.build_wait_ms)
    }

    /// Keys probed for the main block.
    pub fn keys(&self) -> impl Iterator<Item = libc::key_t> {
        (self.shm_key..self.shm_key.saturating_add(self.key_range)).map(|k| k as libc::key_t)
    }
}
