//! The memory-space accessibility matrix.
//!
//! For an ordered pair `(A, B)` the matrix answers three questions:
//!
//! * `assignable`: a handle to memory in `B` may be held where `A` is expected.
//! * `accessible`: code executing in `A`'s execution space may dereference `B`.
//! * `deepcopy`: bytes can be moved between `A` and `B` with an explicit deep copy.
//!
//! Accessibility is directional. Pairs without a rule resolve to [`AccessEntry::DENIED`].

use super::MemorySpace;
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessEntry {
    pub assignable: bool,
    pub accessible: bool,
    pub deepcopy: bool,
}

impl AccessEntry {
    pub const DENIED: Self = Self::new(false, false, false);
    const SAME: Self = Self::new(true, true, true);

    #[must_use]
    pub const fn new(assignable: bool, accessible: bool, deepcopy: bool) -> Self {
        Self {
            assignable,
            accessible,
            deepcopy,
        }
    }
}

use MemorySpace::{Device, Host, ManagedUnified, PinnedHost, RestrictedDevice};

/// Cross-space rules as `(A, B, assignable, accessible, deepcopy)`.
const RULES: &[(MemorySpace, MemorySpace, bool, bool, bool)] = &[
    // Host <-> device family
    (Host, Device, false, false, true),
    (Device, Host, false, false, true),
    (Host, RestrictedDevice, false, false, true),
    (RestrictedDevice, Host, false, false, true),
    (Host, ManagedUnified, false, false, true),
    (ManagedUnified, Host, false, false, true),
    // Restricted and full device share hardware and layout
    (Device, RestrictedDevice, true, true, true),
    (RestrictedDevice, Device, true, true, true),
    // Managed memory is reachable from the device execution space
    (RestrictedDevice, ManagedUnified, false, true, true),
    (ManagedUnified, RestrictedDevice, false, true, true),
    (Device, ManagedUnified, true, true, true),
    (ManagedUnified, Device, false, true, true),
    // Pinned host memory is mapped for the device, but the host can't see device memory
    (RestrictedDevice, PinnedHost, false, true, true),
    (PinnedHost, RestrictedDevice, false, false, true),
    (Device, PinnedHost, false, true, true),
    (PinnedHost, Device, false, false, true),
    (Host, PinnedHost, true, true, true),
    (PinnedHost, Host, false, true, true),
    (ManagedUnified, PinnedHost, false, true, true),
    (PinnedHost, ManagedUnified, false, true, true),
];

/// Immutable lookup table, built once per process.
#[derive(Debug)]
pub struct AccessMatrix {
    entries: HashMap<(MemorySpace, MemorySpace), AccessEntry>,
}

impl AccessMatrix {
    fn build() -> Self {
        let mut entries = HashMap::with_capacity(RULES.len() + MemorySpace::ALL.len());

        for space in MemorySpace::ALL {
            entries.insert((space, space), AccessEntry::SAME);
        }
        for &(a, b, assignable, accessible, deepcopy) in RULES {
            let previous = entries.insert((a, b), AccessEntry::new(assignable, accessible, deepcopy));
            debug_assert!(previous.is_none(), "duplicate access rule {a} -> {b}");
        }

        Self { entries }
    }

    /// Returns the process-wide matrix.
    pub fn global() -> &'static Self {
        static MATRIX: OnceLock<AccessMatrix> = OnceLock::new();
        MATRIX.get_or_init(Self::build)
    }

    #[must_use]
    pub fn get(&self, a: MemorySpace, b: MemorySpace) -> AccessEntry {
        self.entries.get(&(a, b)).copied().unwrap_or(AccessEntry::DENIED)
    }
}

/// Looks up the entry for `(a, b)` in the global matrix.
#[must_use]
pub fn query(a: MemorySpace, b: MemorySpace) -> AccessEntry {
    AccessMatrix::global().get(a, b)
}

#[must_use]
pub fn assignable(a: MemorySpace, b: MemorySpace) -> bool {
    query(a, b).assignable
}

#[must_use]
pub fn accessible(a: MemorySpace, b: MemorySpace) -> bool {
    query(a, b).accessible
}

#[must_use]
pub fn deepcopy(a: MemorySpace, b: MemorySpace) -> bool {
    query(a, b).deepcopy
}
