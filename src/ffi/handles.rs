//! The opaque handle type passed across the native boundary.
//!
//! A handle is a newtype around u64. Its bit layout is private to the
//! handle table; native code only compares it against the null handle.

/// Opaque handle to a host object.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    _h: u64,
}

impl Handle {
    /// The null handle, returned by operations that failed.
    pub const NULL: Handle = Handle { _h: 0 };

    /// Create an invalid (null) handle.
    #[inline]
    pub const fn invalid() -> Self {
        Self::NULL
    }

    /// Check if this handle is valid (non-zero).
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self._h != 0
    }

    /// Rebuild a handle from its raw bits.
    #[inline]
    pub const fn from_raw(bits: u64) -> Self {
        Self { _h: bits }
    }

    /// The raw bits of this handle.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self._h
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::invalid()
    }
}
