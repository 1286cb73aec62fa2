//! Configuration for the union-mount backend.
//!
//! This module provides the [`StorageConfig`] structure describing how the
//! store talks to the host union filesystem. The defaults match the stock
//! aufs backend; an alternate backend is selected by pointing `driver` at a
//! different filesystem type identifier.
//!
//! # Configuration Structure
//!
//! Configuration uses TOML format:
//!
//! ```toml
//! driver = "aufs"
//! source = "none"
//! unmount_retries = 1000
//! ```

use serde::Deserialize;

fn default_driver() -> String {
    "aufs".to_string()
}

fn default_source() -> String {
    "none".to_string()
}

fn default_unmount_retries() -> u32 {
    1000
}

/// Union-mount backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Filesystem type identifier passed to the mount syscall.
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Mount source; unused by union filesystems, conventionally "none".
    #[serde(default = "default_source")]
    pub source: String,

    /// How many times to retry removing the mount root after unmount.
    ///
    /// Union filesystems release the mount-point inode lazily, so the
    /// removal can spuriously fail for a bounded period. Each retry waits
    /// 10 ms, so the default budget is about ten seconds.
    #[serde(default = "default_unmount_retries")]
    pub unmount_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            source: default_source(),
            unmount_retries: default_unmount_retries(),
        }
    }
}

impl StorageConfig {
    /// Parse backend configuration from TOML content.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML content is invalid.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.driver, "aufs");
        assert_eq!(config.source, "none");
        assert_eq!(config.unmount_retries, 1000);
    }

    #[test]
    fn test_parse_basic_config() {
        let config_str = r#"
driver = "overlay"
unmount_retries = 50
"#;
        let config = StorageConfig::from_toml(config_str).unwrap();
        assert_eq!(config.driver, "overlay");
        assert_eq!(config.source, "none");
        assert_eq!(config.unmount_retries, 50);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = StorageConfig::from_toml("").unwrap();
        assert_eq!(config.driver, "aufs");
    }
}
