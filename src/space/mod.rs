pub mod access;
pub mod guard;

use std::fmt;

/// A memory space: a region of memory with its own placement and its own rules
/// about which execution units may dereference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemorySpace {
    /// Ordinary pageable host RAM.
    Host,
    /// Accelerator global memory.
    Device,
    /// Device memory reserved for the read-only (const / texture) fetch path.
    RestrictedDevice,
    /// Managed memory migrated on demand between host and device.
    ManagedUnified,
    /// Page-locked host memory mapped into the device address space.
    PinnedHost,
}

/// Where the bytes of a space physically live, as far as copy selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    HostResident,
    DeviceResident,
}

impl MemorySpace {
    pub const COUNT: usize = 5;

    /// Every space known to the system, in matrix order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Host,
        Self::Device,
        Self::RestrictedDevice,
        Self::ManagedUnified,
        Self::PinnedHost,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Host => "HostSpace",
            Self::Device => "DeviceSpace",
            Self::RestrictedDevice => "RestrictedDeviceSpace",
            Self::ManagedUnified => "ManagedUnifiedSpace",
            Self::PinnedHost => "PinnedHostSpace",
        }
    }

    #[must_use]
    pub const fn placement(self) -> Placement {
        match self {
            Self::Host | Self::PinnedHost => Placement::HostResident,
            Self::Device | Self::RestrictedDevice | Self::ManagedUnified => {
                Placement::DeviceResident
            }
        }
    }

    /// The space whose compute units run code scheduled "in" this space.
    ///
    /// Pinned host memory is driven by host threads; managed memory by the device.
    #[must_use]
    pub const fn execution_space(self) -> Self {
        match self {
            Self::Host | Self::PinnedHost => Self::Host,
            Self::Device | Self::ManagedUnified => Self::Device,
            Self::RestrictedDevice => Self::RestrictedDevice,
        }
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_all_order() {
        for (i, space) in MemorySpace::ALL.iter().enumerate() {
            assert_eq!(space.index(), i);
        }
    }

    #[test]
    fn pinned_host_runs_on_host() {
        assert_eq!(MemorySpace::PinnedHost.execution_space(), MemorySpace::Host);
        assert_eq!(
            MemorySpace::PinnedHost.placement(),
            Placement::HostResident
        );
        assert_eq!(
            MemorySpace::ManagedUnified.placement(),
            Placement::DeviceResident
        );
    }
}
