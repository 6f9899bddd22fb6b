//! Engine configuration.
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. A TOML file
//! 3. Environment variables (`RELAXSIM_*`)

use std::{ env, path::Path };
use serde::{ Deserialize, Serialize };
use crate::{
    cache::PropagatorCache,
    error::{ Error, Result },
};

/// Enables the propagator cache when set to `1` or `true`.
pub const ENV_CACHE_EIGEN: &str = "RELAXSIM_CACHE_EIGEN";

/// Overrides the propagator cache capacity.
pub const ENV_CACHE_CAPACITY: &str = "RELAXSIM_CACHE_CAPACITY";

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub propagator_cache: PropagatorCacheConfig,
}

/// Settings of the eigendecomposition cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropagatorCacheConfig {
    /// Opt-in flag; the cache is off by default.
    #[serde(default)]
    pub enabled: bool,

    /// Maximum number of stored decompositions.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize { PropagatorCache::DEFAULT_CAPACITY }

impl Default for PropagatorCacheConfig {
    fn default() -> Self {
        Self { enabled: false, capacity: default_capacity() }
    }
}

impl Config {
    /// Parse a TOML document; missing tables and keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from `path` if it exists (defaults otherwise), then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config
            = match path {
                Some(path) if path.exists() => {
                    let content = std::fs::read_to_string(path)?;
                    Self::from_toml_str(&content)?
                },
                _ => Self::default(),
            };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `RELAXSIM_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Capacities that do not parse as integers are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where F: Fn(&str) -> Option<String>
    {
        if let Some(val) = lookup(ENV_CACHE_EIGEN) {
            let val = val.trim().to_lowercase();
            self.propagator_cache.enabled = val == "1" || val == "true";
        }
        if let Some(val) = lookup(ENV_CACHE_CAPACITY) {
            match val.trim().parse() {
                Ok(capacity) => { self.propagator_cache.capacity = capacity; },
                Err(_) => {
                    log::warn!(
                        "ignoring non-integer {}={:?}", ENV_CACHE_CAPACITY, val);
                },
            }
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.propagator_cache.capacity == 0 {
            return Err(Error::Config(
                "propagator cache capacity must be positive".into()));
        }
        Ok(())
    }
}
