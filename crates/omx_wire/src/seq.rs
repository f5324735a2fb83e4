//! Sequence numbers identifying messages between a pair of endpoints.
//!
//! A sequence number is stored as a [`u16`] whose low 14 bits are the
//! actual message counter and whose high 2 bits are a *session epoch*.
//! The counter wraps inside its 14-bit ring, so all comparisons must be
//! taken modulo 2^14; the epoch only changes when one side disconnects
//! and lets receivers discard traffic from a previous incarnation of the
//! pairing without consulting the 32-bit session id.

use std::fmt;

/// Number of bits of the message counter.
pub const SEQNUM_BITS: u32 = 14;

/// Mask extracting the 14-bit message counter.
pub const SEQNUM_MASK: u16 = (1 << SEQNUM_BITS) - 1;

/// One unit of the 2-bit session epoch stored above the counter.
pub const SESNUM_ONE: u16 = 1 << SEQNUM_BITS;

/// Mask extracting the session epoch bits.
pub const SESNUM_MASK: u16 = !SEQNUM_MASK;

/// A 14-bit wrapping sequence number carrying a 2-bit session epoch.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Seq(pub u16);

impl Seq {
    /// Gets the 14-bit message counter.
    #[must_use]
    pub const fn seqnum(self) -> u16 {
        self.0 & SEQNUM_MASK
    }

    /// Gets the session epoch, shifted down to `0..4`.
    #[must_use]
    pub const fn sesnum(self) -> u16 {
        (self.0 & SESNUM_MASK) >> SEQNUM_BITS
    }

    /// Advances the counter by `n`, wrapping inside the 14-bit ring and
    /// leaving the epoch untouched.
    #[must_use]
    pub const fn wrapping_add(self, n: u16) -> Self {
        Self((self.0 & SESNUM_MASK) | (self.0.wrapping_add(n) & SEQNUM_MASK))
    }

    /// Returns the current value and advances `self` by one.
    pub fn get_inc(&mut self) -> Self {
        let cur = *self;
        *self = cur.wrapping_add(1);
        cur
    }

    /// Resets the counter to 1 inside the current epoch.
    #[must_use]
    pub const fn reset(self) -> Self {
        Self((self.0 & SESNUM_MASK) | 1)
    }

    /// Moves to the next session epoch.
    #[must_use]
    pub const fn next_session(self) -> Self {
        Self(self.0.wrapping_add(SESNUM_ONE))
    }

    /// Number of counter steps from `from` up to `self`, taken modulo
    /// 2^14. The epoch bits do not participate.
    ///
    /// An outstanding-send window check is then simply
    /// `seq.dist_from(next_acked) < window`.
    #[must_use]
    pub const fn dist_from(self, from: Self) -> u16 {
        self.0.wrapping_sub(from.0) & SEQNUM_MASK
    }

    /// Whether `self` and `other` belong to the same session epoch.
    #[must_use]
    pub const fn same_session(self, other: Self) -> bool {
        (self.0 ^ other.0) & SESNUM_MASK == 0
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({}#{})", self.seqnum(), self.sesnum())
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.seqnum(), self.sesnum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_inside_ring() {
        let s = Seq(SEQNUM_MASK);
        assert_eq!(s.seqnum(), SEQNUM_MASK);
        assert_eq!(s.wrapping_add(1).seqnum(), 0);
        // the epoch must survive the counter wrap
        let s = Seq(SESNUM_ONE | SEQNUM_MASK);
        let next = s.wrapping_add(1);
        assert_eq!(next.seqnum(), 0);
        assert_eq!(next.sesnum(), 1);
    }

    #[test]
    fn distance_is_modular() {
        assert_eq!(Seq(5).dist_from(Seq(3)), 2);
        assert_eq!(Seq(1).dist_from(Seq(SEQNUM_MASK)), 2);
        assert_eq!(Seq(3).dist_from(Seq(5)), SEQNUM_MASK - 1);
    }

    #[test]
    fn reset_keeps_epoch() {
        let s = Seq(2 * SESNUM_ONE | 1234);
        assert_eq!(s.reset().seqnum(), 1);
        assert_eq!(s.reset().sesnum(), 2);
    }

    #[test]
    fn session_change() {
        let s = Seq(17);
        assert!(s.same_session(Seq(9999 & SEQNUM_MASK)));
        assert!(!s.same_session(s.next_session()));
        // four epochs wrap back around
        assert!(s.same_session(
            s.next_session().next_session().next_session().next_session()
        ));
    }
}
