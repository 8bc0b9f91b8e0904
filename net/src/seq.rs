//! Wraparound-safe storage and comparison of packet ids.
//!
//! The wire representation of a [`PacketId`] is a plain 16-bit little-endian integer
//! (see [`crate::buffer`]), but comparing two such ids with a naive `<=` breaks the
//! moment the counter wraps past `u16::MAX`. [`PacketId`] instead compares ids with
//! the RFC 1982 serial number arithmetic trick: take the wrapping difference and look
//! at which half of the id space it falls into.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// A 16-bit packet id with wraparound-safe ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketId(u16);

impl PacketId {

    pub const ZERO: Self = Self(0);

    /// Half of the id space; differences larger than this are considered to have
    /// wrapped and therefore compare the other way around.
    const HALF: u16 = 0x8000;

    #[inline]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Compare two ids using modular sequence arithmetic (RFC 1982 style) instead of
    /// a plain integer comparison, so that ordering stays correct across a wrap.
    ///
    /// This is not a total order usable for sorting arbitrary ids: it's only
    /// meaningful for ids that are "close" to each other in the sequence, which is
    /// always the case for reliable/unreliable counters within a live connection.
    #[inline]
    pub const fn wrapping_cmp(self, other: Self) -> Ordering {
        let a = self.0;
        let b = other.0;
        if a == b {
            Ordering::Equal
        } else if a.wrapping_sub(b) > Self::HALF {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// Shorthand for `self.wrapping_cmp(other) != Ordering::Greater`, i.e. `self <= other`
    /// in the wraparound-safe sense.
    #[inline]
    pub const fn wrapping_le(self, other: Self) -> bool {
        !matches!(self.wrapping_cmp(other), Ordering::Greater)
    }

}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Add<u16> for PacketId {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u16) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u16> for PacketId {
    #[inline]
    fn add_assign(&mut self, rhs: u16) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u16> for PacketId {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u16) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<u16> for PacketId {
    #[inline]
    fn sub_assign(&mut self, rhs: u16) {
        self.0 = self.0.wrapping_sub(rhs);
    }
}

impl From<u16> for PacketId {
    #[inline]
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<PacketId> for u16 {
    #[inline]
    fn from(value: PacketId) -> Self {
        value.0
    }
}

/// Allocates monotonically increasing, wrapping packet ids for one direction of one
/// reliability class of a connection.
#[derive(Debug, Default)]
pub struct PacketIdAlloc {
    next: PacketId,
}

impl PacketIdAlloc {

    #[inline]
    pub const fn new() -> Self {
        Self { next: PacketId::ZERO }
    }

    /// Allocate and return the next id, advancing the counter by one.
    #[inline]
    pub fn alloc(&mut self) -> PacketId {
        self.next += 1;
        self.next
    }

}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn ordering() {

        const ZERO: PacketId = PacketId(0);
        const HALF: PacketId = PacketId(0x8000);
        const FULL: PacketId = PacketId(0xFFFF);

        assert_eq!(ZERO - 1, FULL);

        assert_eq!(PacketId::wrapping_cmp(ZERO, ZERO + 1), Ordering::Less);
        assert_eq!(PacketId::wrapping_cmp(ZERO, ZERO - 1), Ordering::Greater);

        assert_eq!(PacketId::wrapping_cmp(ZERO, HALF - 1), Ordering::Less);
        assert_eq!(PacketId::wrapping_cmp(ZERO, HALF), Ordering::Greater); // too far, wrapped.
    }

    #[test]
    fn alloc_increments_from_one() {
        let mut alloc = PacketIdAlloc::new();
        assert_eq!(alloc.alloc(), PacketId::new(1));
        assert_eq!(alloc.alloc(), PacketId::new(2));
        assert_eq!(alloc.alloc(), PacketId::new(3));
    }

}
