use crate::error::{SpaceError, SpaceResult};
use crate::space::MemorySpace;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name searched for by [`RuntimeConfig::from_current_dir`].
pub const CONFIG_FILE_NAME: &str = "memspace.toml";

const DEFAULT_ALIGNMENT: usize = 256;

/// Runtime settings, usually read from `memspace.toml`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Emit a `debug` log line for every tracked allocation, reallocation and release.
    #[serde(default)]
    pub trace_allocations: bool,

    /// Minimum alignment, in bytes, of every raw allocation. Must be a power of two.
    #[serde(default = "default_alignment")]
    pub alignment: usize,

    /// Optional per-space byte limits enforced by the reference driver.
    #[serde(default)]
    pub capacity: CapacityConfig,
}

/// Byte limits per memory space. `None` means unlimited.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityConfig {
    #[serde(default)]
    pub host: Option<usize>,
    #[serde(default)]
    pub device: Option<usize>,
    #[serde(default)]
    pub restricted_device: Option<usize>,
    #[serde(default)]
    pub managed_unified: Option<usize>,
    #[serde(default)]
    pub pinned_host: Option<usize>,
}

impl CapacityConfig {
    #[must_use]
    pub const fn limit(&self, space: MemorySpace) -> Option<usize> {
        match space {
            MemorySpace::Host => self.host,
            MemorySpace::Device => self.device,
            MemorySpace::RestrictedDevice => self.restricted_device,
            MemorySpace::ManagedUnified => self.managed_unified,
            MemorySpace::PinnedHost => self.pinned_host,
        }
    }
}

const fn default_alignment() -> usize {
    DEFAULT_ALIGNMENT
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trace_allocations: false,
            alignment: DEFAULT_ALIGNMENT,
            capacity: CapacityConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    /// Returns [`SpaceError::Config`] if the text is not valid or the alignment is not a power of two.
    pub fn parse(text: &str) -> SpaceResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| SpaceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the file at `path`.
    ///
    /// # Errors
    /// Returns an I/O error if the file can't be read, or a config error if it can't be parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> SpaceResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Loads `memspace.toml` from the current directory or its closest parent that has one.
    ///
    /// Falls back to the defaults when no file is found or the file is invalid.
    #[must_use]
    pub fn from_current_dir() -> Self {
        let Some(path) = std::env::current_dir().ok().and_then(|dir| find_config(&dir)) else {
            return Self::default();
        };

        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Applies `MEMSPACE_TRACE_ALLOCATIONS` and `MEMSPACE_DEVICE_CAPACITY` on top of `self`.
    #[must_use]
    pub fn override_from_env(mut self) -> Self {
        if let Ok(val) = std::env::var("MEMSPACE_TRACE_ALLOCATIONS") {
            self.trace_allocations = matches!(val.as_str(), "1" | "true" | "on");
        }

        if let Ok(val) = std::env::var("MEMSPACE_DEVICE_CAPACITY") {
            match val.parse::<usize>() {
                Ok(bytes) => self.capacity.device = Some(bytes),
                Err(_) => log::warn!("MEMSPACE_DEVICE_CAPACITY is not a byte count: {val}"),
            }
        }

        self
    }

    fn validate(&self) -> SpaceResult<()> {
        if !self.alignment.is_power_of_two() {
            return Err(SpaceError::Config(format!(
                "alignment must be a power of two, got {}",
                self.alignment
            )));
        }
        Ok(())
    }
}

fn find_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(RuntimeConfig::parse("").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn parses_capacity_table() {
        let config = RuntimeConfig::parse(
            r"
            trace_allocations = true
            alignment = 64

            [capacity]
            device = 4096
            pinned_host = 1024
            ",
        )
        .unwrap();

        assert!(config.trace_allocations);
        assert_eq!(config.alignment, 64);
        assert_eq!(config.capacity.limit(MemorySpace::Device), Some(4096));
        assert_eq!(config.capacity.limit(MemorySpace::PinnedHost), Some(1024));
        assert_eq!(config.capacity.limit(MemorySpace::Host), None);
    }

    #[test]
    fn rejects_bad_alignment() {
        let err = RuntimeConfig::parse("alignment = 48").unwrap_err();
        assert!(matches!(err, SpaceError::Config(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = std::env::temp_dir().join(format!("memspace-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[capacity]\nhost = 10\n").unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.capacity.host, Some(10));
        assert_eq!(find_config(&dir), Some(path));

        std::fs::remove_dir_all(&dir).ok();
    }
}
