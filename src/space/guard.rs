use super::MemorySpace;
use super::access;
use crate::error::fatal;

/// Non-fatal form of [`verify_access`].
#[must_use]
pub fn can_access(executing: MemorySpace, target: MemorySpace) -> bool {
    access::accessible(executing, target)
}

/// Checks, at a kernel-launch boundary, that code running in `executing` may
/// dereference memory in `target`.
///
/// Returns only when the access is legal; otherwise the calling task is
/// terminated.
#[track_caller]
pub fn verify_access(executing: MemorySpace, target: MemorySpace) {
    if !can_access(executing, target) {
        fatal(&format!(
            "compute running in {executing} attempted to access memory in {target}"
        ));
    }
}

/// Same as [`verify_access`]; `ptr` only appears in the message.
#[track_caller]
pub fn verify_access_ptr(executing: MemorySpace, target: MemorySpace, ptr: *const u8) {
    if !can_access(executing, target) {
        fatal(&format!(
            "compute running in {executing} attempted to access memory in {target} at {ptr:p}"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    #[test]
    fn legal_access_returns() {
        verify_access(MemorySpace::RestrictedDevice, MemorySpace::ManagedUnified);
        verify_access(MemorySpace::RestrictedDevice, MemorySpace::PinnedHost);
        verify_access_ptr(MemorySpace::Device, MemorySpace::Device, std::ptr::null());
    }

    #[test]
    #[should_panic(
        expected = "compute running in RestrictedDeviceSpace attempted to access memory in HostSpace"
    )]
    fn device_touching_host_is_fatal() {
        verify_access(MemorySpace::RestrictedDevice, MemorySpace::Host);
    }

    #[test]
    #[should_panic(expected = "attempted to access memory in RestrictedDeviceSpace at 0x")]
    fn pointer_overload_names_the_address() {
        verify_access_ptr(MemorySpace::Host, MemorySpace::RestrictedDevice, 0x1000 as *const u8);
    }

    #[test]
    fn verify_is_noop_iff_accessible() {
        for a in MemorySpace::ALL {
            for b in MemorySpace::ALL {
                let returned = panic::catch_unwind(|| verify_access(a, b)).is_ok();
                assert_eq!(returned, access::accessible(a, b), "{a} -> {b}");
            }
        }
    }
}
