//! Secure Memory
//!
//! Pins the pages holding raw key bytes so they are not written to swap.
//! This complements `zeroize`: pinning keeps the bytes off disk while the
//! identity is alive, zeroize clears them when it is dropped.
//!
//! - **Unix**: `mlock()` / `munlock()`
//! - **Other**: logs a debug message and continues unpinned
//!
//! Failures never abort the caller; the identity stays usable without the
//! extra protection.

use std::ptr::NonNull;

/// Outcome of a pin attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinResult {
    Pinned,
    Failed,
    Unsupported,
}

/// Pin a memory region.
///
/// # Safety
/// `ptr` must point to valid memory of at least `len` bytes.
unsafe fn pin(ptr: NonNull<u8>, len: usize) -> PinResult {
    if len == 0 {
        return PinResult::Pinned;
    }

    #[cfg(unix)]
    {
        if libc::mlock(ptr.as_ptr() as *const libc::c_void, len) == 0 {
            tracing::debug!("Pinned {} bytes of key material", len);
            PinResult::Pinned
        } else {
            let error = std::io::Error::last_os_error();
            let reason = match error.raw_os_error().unwrap_or(0) {
                libc::ENOMEM => "exceeds RLIMIT_MEMLOCK",
                libc::EPERM => "insufficient permissions",
                _ => "unknown error",
            };
            tracing::warn!(
                "Failed to pin key material: {}. Key bytes may be swapped to disk.",
                reason
            );
            PinResult::Failed
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ptr;
        tracing::debug!("Memory pinning not supported on this platform");
        PinResult::Unsupported
    }
}

/// # Safety
/// `ptr`/`len` must describe a region previously pinned with [`pin`].
unsafe fn unpin(ptr: NonNull<u8>, len: usize) {
    #[cfg(unix)]
    {
        if libc::munlock(ptr.as_ptr() as *const libc::c_void, len) != 0 {
            tracing::debug!("munlock returned non-zero (likely already unlocked)");
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (ptr, len);
    }
}

/// RAII guard that unpins its region on drop.
#[derive(Debug)]
pub struct PinnedRegion {
    ptr: NonNull<u8>,
    len: usize,
    result: PinResult,
}

impl PinnedRegion {
    pub fn is_pinned(&self) -> bool {
        self.result == PinResult::Pinned
    }

    pub fn result(&self) -> PinResult {
        self.result
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        if self.result == PinResult::Pinned && self.len > 0 {
            // SAFETY: the owner keeps the bytes alive until after this guard drops.
            unsafe { unpin(self.ptr, self.len) }
        }
    }
}

// SAFETY: the pointer is never dereferenced, only handed to the OS.
unsafe impl Send for PinnedRegion {}
unsafe impl Sync for PinnedRegion {}

/// Pin the memory backing `bytes`.
///
/// # Safety
/// `bytes` must not move or be freed while the returned guard is alive.
pub unsafe fn pin_bytes(bytes: &[u8]) -> PinnedRegion {
    match NonNull::new(bytes.as_ptr() as *mut u8) {
        Some(ptr) if !bytes.is_empty() => PinnedRegion {
            ptr,
            len: bytes.len(),
            result: pin(ptr, bytes.len()),
        },
        _ => PinnedRegion {
            ptr: NonNull::dangling(),
            len: 0,
            result: PinResult::Pinned,
        },
    }
}
