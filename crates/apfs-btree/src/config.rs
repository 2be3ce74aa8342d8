//! Configuration for the B-tree engine

use crate::key::NameComparison;
use crate::MAX_TREE_DEPTH;
use serde::{Deserialize, Serialize};

/// Volume incompatible-feature bit: file names compare case-insensitively.
pub const INCOMPAT_CASE_INSENSITIVE: u64 = 0x0000_0001;

/// Volume incompatible-feature bit: file names compare after normalization.
pub const INCOMPAT_NORMALIZATION_INSENSITIVE: u64 = 0x0000_0008;

/// Configuration for the B-tree engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BtreeConfig {
    /// Verify object checksums whenever a node is opened
    pub verify_checksums: bool,

    /// Compare directory entry and xattr names case-insensitively
    pub case_insensitive: bool,

    /// Compare names after Unicode canonical decomposition
    pub normalization_insensitive: bool,

    /// Descent depth treated as corruption
    pub max_depth: usize,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            case_insensitive: false,
            normalization_insensitive: false,
            max_depth: MAX_TREE_DEPTH,
        }
    }
}

impl BtreeConfig {
    /// Create a configuration from a volume's incompatible-feature flags
    pub fn from_incompat_features(features: u64) -> Self {
        Self {
            case_insensitive: features & INCOMPAT_CASE_INSENSITIVE != 0,
            normalization_insensitive: features & INCOMPAT_NORMALIZATION_INSENSITIVE != 0,
            ..Default::default()
        }
    }

    /// Enable or disable checksum verification on read
    #[must_use]
    pub const fn with_checksum_verification(mut self, enable: bool) -> Self {
        self.verify_checksums = enable;
        self
    }

    /// Enable or disable case-insensitive name comparison
    #[must_use]
    pub const fn with_case_insensitive(mut self, enable: bool) -> Self {
        self.case_insensitive = enable;
        self
    }

    /// Enable or disable normalization-insensitive name comparison
    #[must_use]
    pub const fn with_normalization_insensitive(mut self, enable: bool) -> Self {
        self.normalization_insensitive = enable;
        self
    }

    /// Set the depth ceiling for tree descents
    #[must_use]
    pub const fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Name comparison mode selected by this configuration
    pub const fn names(&self) -> NameComparison {
        NameComparison {
            case_insensitive: self.case_insensitive,
            normalization_insensitive: self.normalization_insensitive,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BtreeConfig::default();
        assert!(config.verify_checksums);
        assert!(!config.case_insensitive);
        assert_eq!(config.max_depth, 12);
    }

    #[test]
    fn test_from_incompat_features() {
        let config = BtreeConfig::from_incompat_features(
            INCOMPAT_CASE_INSENSITIVE | INCOMPAT_NORMALIZATION_INSENSITIVE,
        );
        assert!(config.case_insensitive);
        assert!(config.normalization_insensitive);

        let config = BtreeConfig::from_incompat_features(0x2);
        assert!(!config.case_insensitive);
        assert!(!config.normalization_insensitive);
    }

    #[test]
    fn test_serde_fills_missing_fields() {
        let config: BtreeConfig = serde_json::from_str(r#"{"case_insensitive": true}"#).unwrap();
        assert!(config.case_insensitive);
        assert!(config.verify_checksums);
        assert_eq!(config.max_depth, 12);

        let json = serde_json::to_string(&config.clone().with_max_depth(4)).unwrap();
        let back: BtreeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_depth, 4);
        assert_eq!(back.names(), config.names());
    }
}
