//! # Allocator Configuration
//!
//! Construction-time settings for every allocator, loadable from TOML once
//! at startup.
//!
//! ```toml
//! [host.arena]
//! initial_extent_size = 67108864
//! max_alignment = 256
//!
//! [[device.classes]]
//! class = "static"
//! freelist = { initial_extent_size = 268435456, max_alignment = 65536, unit = 256 }
//! ```

use crate::context::UsageClass;
use crate::error::{MemoryError, MemoryResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn check_power_of_two(name: &str, value: u64) -> MemoryResult<()> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(MemoryError::InvalidConfig(format!(
            "{name} must be a power of two, got {value}"
        )))
    }
}

fn check_non_zero(name: &str, value: u64) -> MemoryResult<()> {
    if value == 0 {
        Err(MemoryError::InvalidConfig(format!("{name} must be non-zero")))
    } else {
        Ok(())
    }
}

/// Limits of an external heap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Total bytes the heap may hand out, `None` for unlimited.
    pub budget: Option<u64>,
    /// Largest single extent.
    pub max_extent_size: u64,
    /// Largest alignment an extent may request.
    pub max_alignment: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            budget: None,
            max_extent_size: 1 << 30,
            max_alignment: 1 << 16,
        }
    }
}

impl HeapConfig {
    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> MemoryResult<()> {
        check_non_zero("heap.max_extent_size", self.max_extent_size)?;
        check_power_of_two("heap.max_alignment", self.max_alignment)
    }
}

/// Settings for a freelist allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreelistConfig {
    /// Minimum size of every extent requested from upstream.
    pub initial_extent_size: u64,
    /// Largest alignment accepted.
    pub max_alignment: u64,
    /// Granularity sizes are rounded to (device variant).
    pub unit: u64,
}

impl Default for FreelistConfig {
    fn default() -> Self {
        Self {
            initial_extent_size: 1 << 20,
            max_alignment: 256,
            unit: 16,
        }
    }
}

impl FreelistConfig {
    /// Creates a config with the default unit.
    #[must_use]
    pub fn new(initial_extent_size: u64, max_alignment: u64) -> Self {
        Self {
            initial_extent_size,
            max_alignment,
            ..Self::default()
        }
    }

    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> MemoryResult<()> {
        check_non_zero("freelist.initial_extent_size", self.initial_extent_size)?;
        check_power_of_two("freelist.max_alignment", self.max_alignment)?;
        check_power_of_two("freelist.unit", self.unit)
    }
}

/// Settings for a pool allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Size of every slot.
    pub block_size: u64,
    /// Alignment of every slot.
    pub block_alignment: u64,
}

impl PoolConfig {
    /// Creates a pool config.
    #[must_use]
    pub const fn new(block_size: u64, block_alignment: u64) -> Self {
        Self {
            block_size,
            block_alignment,
        }
    }

    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> MemoryResult<()> {
        check_non_zero("pool.block_size", self.block_size)?;
        check_power_of_two("pool.block_alignment", self.block_alignment)
    }
}

/// Settings for a monotonic allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonotonicConfig {
    /// Size of the first chunk. Doubles on every growth.
    pub initial_chunk_size: u64,
    /// Largest alignment accepted.
    pub max_alignment: u64,
}

impl Default for MonotonicConfig {
    fn default() -> Self {
        Self {
            initial_chunk_size: 64 * 1024,
            max_alignment: 64,
        }
    }
}

impl MonotonicConfig {
    /// Creates a monotonic config.
    #[must_use]
    pub const fn new(initial_chunk_size: u64, max_alignment: u64) -> Self {
        Self {
            initial_chunk_size,
            max_alignment,
        }
    }

    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> MemoryResult<()> {
        check_non_zero("monotonic.initial_chunk_size", self.initial_chunk_size)?;
        check_power_of_two("monotonic.max_alignment", self.max_alignment)
    }
}

/// Host-side memory layout.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostMemoryConfig {
    /// The process heap.
    pub heap: HeapConfig,
    /// General-purpose arena shared by host consumers.
    pub arena: FreelistConfig,
    /// Per-frame scratch arenas carved from the general arena.
    pub scratch: MonotonicConfig,
}

/// One device usage class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceClassConfig {
    /// Which class this entry configures.
    pub class: UsageClass,
    /// The class allocator. Its initial extent is the class budget.
    #[serde(default)]
    pub freelist: FreelistConfig,
}

/// Device-side memory layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceMemoryConfig {
    /// The GPU heap all classes draw from.
    pub heap: HeapConfig,
    /// One allocator per usage class.
    pub classes: Vec<DeviceClassConfig>,
}

impl Default for DeviceMemoryConfig {
    fn default() -> Self {
        let freelist = FreelistConfig {
            initial_extent_size: 64 << 20,
            max_alignment: 1 << 16,
            unit: 256,
        };
        Self {
            heap: HeapConfig::default(),
            classes: vec![
                DeviceClassConfig {
                    class: UsageClass::Static,
                    freelist,
                },
                DeviceClassConfig {
                    class: UsageClass::Dynamic,
                    freelist,
                },
            ],
        }
    }
}

/// Complete memory configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Host memory.
    pub host: HostMemoryConfig,
    /// Device memory.
    pub device: DeviceMemoryConfig,
}

impl MemoryConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the document does not parse or fails validation.
    pub fn from_toml_str(source: &str) -> MemoryResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| MemoryError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| MemoryError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Serialises the configuration back to TOML.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if serialisation fails.
    pub fn to_toml_string(&self) -> MemoryResult<String> {
        toml::to_string(self).map_err(|e| MemoryError::InvalidConfig(e.to_string()))
    }

    /// Checks every section.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> MemoryResult<()> {
        self.host.heap.validate()?;
        self.host.arena.validate()?;
        self.host.scratch.validate()?;
        if self.host.scratch.max_alignment > self.host.arena.max_alignment {
            return Err(MemoryError::InvalidConfig(
                "host.scratch.max_alignment exceeds host.arena.max_alignment".to_string(),
            ));
        }

        self.device.heap.validate()?;
        for (i, entry) in self.device.classes.iter().enumerate() {
            entry.freelist.validate()?;
            if self.device.classes[..i].iter().any(|e| e.class == entry.class) {
                return Err(MemoryError::InvalidConfig(format!(
                    "usage class {} configured twice",
                    entry.class
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        MemoryConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_partial_document() {
        let config = MemoryConfig::from_toml_str(
            r#"
            [host.arena]
            initial_extent_size = 4096
            max_alignment = 64

            [host.heap]
            budget = 1048576

            [[device.classes]]
            class = "dynamic"
            freelist = { initial_extent_size = 65536, max_alignment = 256, unit = 256 }
            "#,
        )
        .unwrap();

        assert_eq!(config.host.arena.initial_extent_size, 4096);
        assert_eq!(config.host.arena.unit, FreelistConfig::default().unit);
        assert_eq!(config.host.heap.budget, Some(1_048_576));
        assert_eq!(config.host.scratch, MonotonicConfig::default());
        assert_eq!(config.device.classes.len(), 1);
        assert_eq!(config.device.classes[0].class, UsageClass::Dynamic);
    }

    #[test]
    fn test_rejects_bad_alignment() {
        let result = MemoryConfig::from_toml_str(
            r#"
            [host.arena]
            max_alignment = 48
            "#,
        );
        assert!(matches!(result, Err(MemoryError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_duplicate_class() {
        let mut config = MemoryConfig::default();
        config.device.classes[1].class = UsageClass::Static;
        assert!(matches!(config.validate(), Err(MemoryError::InvalidConfig(_))));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = MemoryConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(MemoryConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_pool_config_validation() {
        assert!(PoolConfig::new(64, 16).validate().is_ok());
        assert!(PoolConfig::new(0, 16).validate().is_err());
        assert!(PoolConfig::new(64, 12).validate().is_err());
    }
}
