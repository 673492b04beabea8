//! Search configuration.
//!
//! The retry bound and the prefix length are tuning parameters: they make it
//! likely, not certain, that the allocator hands out a block exposing the defect.
//! They live in [`SearchConfig`] and can be loaded from JSON.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exchange::{ExchangePolicy, Sentinel};
use crate::util::{MAX_ORDER, Order};

/// Errors that can occur when loading or validating a configuration.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Parameters of one search.
///
/// Missing JSON fields fall back to [`SearchConfig::default`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Pages verified contiguous before a block counts as a candidate.
    /// Should not be a power of two, otherwise the prefix covers the whole block.
    pub prefix_pages: usize,
    /// Maximum number of allocation attempts
    pub max_attempts: u64,
    /// Sentinel used to detect relocation
    pub sentinel: Sentinel,
    /// Whether exchanges may exceed the verified prefix
    pub policy: ExchangePolicy,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            prefix_pages: 3,
            max_attempts: 10_000,
            sentinel: Sentinel::default(),
            policy: ExchangePolicy::Defective,
        }
    }
}

impl SearchConfig {
    /// Allocation order of the blocks requested by the search.
    pub fn order(&self) -> Order {
        Order::for_pages(self.prefix_pages)
    }

    /// Pages per block, i.e. `prefix_pages` rounded up to a power of two.
    pub fn full_pages(&self) -> usize {
        self.order().pages()
    }

    /// Checks the configuration for values the search cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] if the prefix is empty, the block order exceeds
    /// [`MAX_ORDER`], the attempt budget is zero or the sentinel lies outside
    /// the first page.
    pub fn validate(&self) -> Result<()> {
        if self.prefix_pages == 0 {
            return Err(Error::Invalid("prefix_pages must be greater than 0".into()));
        }
        if self.prefix_pages > MAX_ORDER.pages() {
            return Err(Error::Invalid(format!(
                "prefix_pages = {} exceeds {} pages of {}",
                self.prefix_pages,
                MAX_ORDER.pages(),
                MAX_ORDER
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::Invalid("max_attempts must be greater than 0".into()));
        }
        if !self.sentinel.is_valid() {
            return Err(Error::Invalid(format!(
                "sentinel offset {} outside of the first page",
                self.sentinel.offset
            )));
        }
        Ok(())
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_jsonfile<P: AsRef<Path>>(filepath: P) -> Result<SearchConfig> {
        let mut file = File::open(filepath)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: SearchConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SearchConfig::default();
        assert_eq!(config.order(), Order::new(2));
        assert_eq!(config.full_pages(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() -> anyhow::Result<()> {
        let config: SearchConfig =
            serde_json::from_str(r#"{"prefix_pages": 5, "policy": "guarded"}"#)?;
        assert_eq!(config.prefix_pages, 5);
        assert_eq!(config.full_pages(), 8);
        assert_eq!(config.max_attempts, 10_000);
        assert_eq!(config.policy, ExchangePolicy::Guarded);
        assert_eq!(config.sentinel, Sentinel::default());
        Ok(())
    }

    #[test]
    fn test_invalid_configs() {
        let invalid = [
            SearchConfig {
                prefix_pages: 0,
                ..Default::default()
            },
            SearchConfig {
                prefix_pages: 1025,
                ..Default::default()
            },
            SearchConfig {
                prefix_pages: usize::MAX,
                ..Default::default()
            },
            SearchConfig {
                max_attempts: 0,
                ..Default::default()
            },
            SearchConfig {
                sentinel: Sentinel {
                    offset: 4096,
                    value: 0xAA,
                },
                ..Default::default()
            },
        ];
        for config in invalid {
            assert!(
                matches!(config.validate(), Err(Error::Invalid(_))),
                "{:?}",
                config
            );
        }
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            SearchConfig::from_jsonfile("does/not/exist.json"),
            Err(Error::IoError(_))
        ));
    }
}
