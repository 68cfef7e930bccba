use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BtreeError, Result};

/// Size of a child pointer inside an interior node.
pub(crate) const CHILD_PTR_SIZE: usize = 8;

/// Tuning knobs for node fill and rebalancing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BtreeConfig {
    /// Human-readable tree name used in logs.
    pub name: String,
    /// Bytes available for entries in every node.
    pub node_area_size: usize,
    /// Largest key the tree accepts.
    pub max_key_size: usize,
    /// Largest value the tree accepts.
    pub max_value_size: usize,
    /// Fill percentage merges rebalance towards.
    pub ideal_fill_pct: u8,
    /// Percentage of a node's occupied bytes moved to the new sibling on split.
    pub split_pct: u8,
    /// Occupancy percentage below which a node asks to be merged.
    pub merge_pct: u8,
    /// Upper bound on siblings taking part in one merge.
    pub max_nodes_to_rebalance: usize,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            name: "btree".to_string(),
            node_area_size: 4096,
            max_key_size: 64,
            max_value_size: 256,
            ideal_fill_pct: 90,
            split_pct: 50,
            merge_pct: 10,
            max_nodes_to_rebalance: 3,
        }
    }
}

impl BtreeConfig {
    /// Creates a config with the given node area and entry size limits.
    pub fn new(node_area_size: usize, max_key_size: usize, max_value_size: usize) -> Self {
        Self {
            node_area_size,
            max_key_size,
            max_value_size,
            ..Self::default()
        }
    }

    /// Bytes a merge fills each surviving node up to.
    pub fn ideal_fill_size(&self) -> usize {
        self.node_area_size * usize::from(self.ideal_fill_pct) / 100
    }

    /// Occupancy below which a node is merged with its siblings.
    pub fn merge_threshold(&self) -> usize {
        self.node_area_size * usize::from(self.merge_pct) / 100
    }

    /// Bytes to move out of a node holding `occupied` bytes when splitting it.
    pub fn split_size(&self, occupied: usize) -> usize {
        occupied * usize::from(self.split_pct) / 100
    }

    /// Largest entry a leaf must be able to absorb without overflowing.
    pub fn max_leaf_entry_size(&self) -> usize {
        self.max_key_size + self.max_value_size
    }

    /// Largest entry an interior node must be able to absorb.
    pub fn max_interior_entry_size(&self) -> usize {
        self.max_key_size + CHILD_PTR_SIZE
    }

    /// Rejects settings the algorithms cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.ideal_fill_pct == 0 || self.ideal_fill_pct > 100 {
            return Err(BtreeError::Invalid("ideal_fill_pct must be in 1..=100"));
        }
        if self.split_pct == 0 || self.split_pct >= 100 {
            return Err(BtreeError::Invalid("split_pct must be in 1..100"));
        }
        if self.merge_pct >= self.ideal_fill_pct {
            return Err(BtreeError::Invalid("merge_pct must be below ideal_fill_pct"));
        }
        if self.max_nodes_to_rebalance < 2 {
            return Err(BtreeError::Invalid("max_nodes_to_rebalance must be at least 2"));
        }
        if self.max_key_size == 0 || self.max_value_size == 0 {
            return Err(BtreeError::Invalid("entry size limits must be non-zero"));
        }
        // Interior nodes need room for three children or splits stop reducing depth.
        if self.node_area_size < 3 * self.max_interior_entry_size()
            || self.node_area_size < 2 * self.max_leaf_entry_size()
        {
            return Err(BtreeError::Invalid("node_area_size too small for entry limits"));
        }
        if self.ideal_fill_size() < self.max_leaf_entry_size()
            || self.ideal_fill_size() < self.max_interior_entry_size()
        {
            return Err(BtreeError::Invalid("ideal fill cannot hold a maximal entry"));
        }
        for max_entry in [self.max_leaf_entry_size(), self.max_interior_entry_size()] {
            // A merge fills survivors to the ideal size; they must still take one more entry.
            if self.node_area_size - self.ideal_fill_size() < max_entry {
                return Err(BtreeError::Invalid("merged nodes would need an immediate split"));
            }
            if self.merge_threshold() >= self.split_remainder(max_entry) {
                return Err(BtreeError::Invalid("split halves would need an immediate merge"));
            }
        }
        Ok(())
    }

    /// Smallest share a split leaves on either side of a node whose largest entry is `max_entry`.
    fn split_remainder(&self, max_entry: usize) -> usize {
        let smaller_pct = self.split_pct.min(100 - self.split_pct);
        (self.node_area_size - max_entry) * usize::from(smaller_pct) / 100
    }

    /// Parses a TOML document; missing fields keep their defaults.
    pub fn from_toml_str(contents: &str) -> std::result::Result<Self, ConfigError> {
        let cfg: BtreeConfig =
            toml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        cfg.validate().map_err(|err| ConfigError::Invalid {
            reason: err.to_string(),
        })?;
        Ok(cfg)
    }

    /// Loads and validates a TOML config file.
    pub fn from_toml_file(path: &Path) -> std::result::Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: BtreeConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate().map_err(|err| ConfigError::Invalid {
            reason: err.to_string(),
        })?;
        Ok(cfg)
    }
}

/// Errors raised while loading a [`BtreeConfig`] from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config at {}: {source}", .path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The TOML could not be parsed.
    #[error("failed to parse config at {}: {source}", .path.display())]
    Parse {
        /// File that failed, `<inline>` for in-memory documents.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The config parsed but failed validation.
    #[error("invalid config: {reason}")]
    Invalid {
        /// What was rejected.
        reason: String,
    },
}

/// Test-only fault injection switches.
#[derive(Clone, Debug, Default)]
pub struct Flips {
    /// Number of upcoming lock upgrades forced to fail.
    pub upgrade_fail_count: u64,
    /// Sleep inserted before each upgrade acquires its write latch.
    pub upgrade_delay: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_sizes_follow_percentages() {
        let cfg = BtreeConfig::default();
        assert_eq!(cfg.ideal_fill_size(), 3686);
        assert_eq!(cfg.merge_threshold(), 409);
        assert_eq!(cfg.split_size(1000), 500);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn toml_overrides_and_validation() {
        let cfg = BtreeConfig::from_toml_str(
            "name = \"small\"\nnode_area_size = 160\nmax_key_size = 8\nmax_value_size = 24\nideal_fill_pct = 75\nmerge_pct = 30\n",
        )
        .expect("parse");
        assert_eq!(cfg.name, "small");
        assert_eq!(cfg.split_pct, 50);
        assert_eq!(cfg.merge_threshold(), 48);

        let err = BtreeConfig::from_toml_str("node_area_size = 8\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        let err = BtreeConfig::from_toml_str(
            "node_area_size = 160\nmax_key_size = 8\nmax_value_size = 24\nideal_fill_pct = 100\nmerge_pct = 30\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        let err = BtreeConfig::from_toml_str("node_area_size = \"big\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn fill_thresholds_that_would_thrash_are_rejected() {
        // Merges fill to 48 bytes, which is already split-needed for 24-byte entries.
        let mut cfg = BtreeConfig::new(48, 8, 16);
        cfg.ideal_fill_pct = 100;
        cfg.merge_pct = 60;
        assert!(matches!(
            cfg.validate(),
            Err(BtreeError::Invalid("merged nodes would need an immediate split"))
        ));

        // Merged nodes keep room, but a split leaves 40-byte halves against a 40-byte threshold.
        let mut cfg = BtreeConfig::new(96, 8, 8);
        cfg.ideal_fill_pct = 80;
        cfg.merge_pct = 42;
        assert!(matches!(
            cfg.validate(),
            Err(BtreeError::Invalid("split halves would need an immediate merge"))
        ));

        cfg.merge_pct = 40;
        assert!(cfg.validate().is_ok());

        let mut cfg = BtreeConfig::new(96, 8, 8);
        cfg.split_pct = 20;
        cfg.ideal_fill_pct = 80;
        cfg.merge_pct = 20;
        assert!(matches!(
            cfg.validate(),
            Err(BtreeError::Invalid("split halves would need an immediate merge"))
        ));
    }

    #[test]
    fn config_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tree.toml");
        let mut cfg = BtreeConfig::new(128, 8, 8);
        cfg.ideal_fill_pct = 80;
        fs::write(&path, toml::to_string_pretty(&cfg).expect("serialize")).expect("write");
        let loaded = BtreeConfig::from_toml_file(&path).expect("load");
        assert_eq!(loaded.node_area_size, 128);
        assert!(BtreeConfig::from_toml_file(&dir.path().join("missing.toml")).is_err());
    }
}
