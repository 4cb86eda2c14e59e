use std::fmt::{Display, Formatter};

/// A 16-bit wrapping sequence number.
///
/// The sequence space wraps at 2^16, so "before" and "after" are only meaningful
///  relative to another sequence number, and only within a window of 2^15. All
///  ordering comparisons go through [`Seq::dist`] - raw unsigned comparison of
///  two sequence numbers is a bug.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Seq(u16);

impl Display for Seq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Seq {
    pub const ZERO: Seq = Seq(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> Seq {
        Seq(self.0.wrapping_add(1))
    }

    /// The signed distance from `other` to `self`: positive if `self` is after
    ///  `other`, negative if before, in wrap-around order.
    pub fn dist(&self, other: Seq) -> i16 {
        self.0.wrapping_sub(other.0) as i16
    }
}
