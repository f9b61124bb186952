//! Logical file addresses.
//!
//! Addresses are unsigned 64-bit offsets into the logical address space of an
//! open file. The all-ones pattern is reserved as [`HADDR_UNDEF`] and is never
//! the result of an allocation.

use crate::core::error::VfdError;

/// A logical file address.
pub type Haddr = u64;

/// The "undefined" address.
pub const HADDR_UNDEF: Haddr = u64::MAX;

/// The largest address a driver may declare as its ceiling.
pub const HADDR_MAX: Haddr = HADDR_UNDEF - 1;

/// Returns whether `addr` is a usable address.
#[inline]
pub fn addr_defined(addr: Haddr) -> bool {
    addr != HADDR_UNDEF
}

/// Computes `addr + size`, failing if `addr` is undefined, the sum wraps, or
/// the end lands past `limit`.
pub(crate) fn checked_end(addr: Haddr, size: u64, limit: Haddr) -> Result<Haddr, VfdError> {
    let overflow = VfdError::AddressOverflow { addr, size, limit };
    if !addr_defined(addr) {
        return Err(overflow);
    }
    match addr.checked_add(size) {
        Some(end) if addr_defined(end) && end <= limit => Ok(end),
        _ => Err(overflow),
    }
}

/// Returns whether `[a, a + a_size)` and `[b, b + b_size)` share any byte.
/// Empty ranges overlap nothing.
#[inline]
pub(crate) fn overlaps(a: Haddr, a_size: u64, b: Haddr, b_size: u64) -> bool {
    if a_size == 0 || b_size == 0 {
        return false;
    }
    a < b.saturating_add(b_size) && b < a.saturating_add(a_size)
}
