//! Bit field accessors for the register values of the hardware we talk to.

use core::ops::{Bound, RangeBounds};

/// Resolve a range of bit indices into an inclusive `(first, last)` pair for an integer `bits` wide.
fn bit_bounds<R: RangeBounds<u32>>(range: &R, bits: u32) -> (u32, u32) {
    let first = match range.start_bound() {
        Bound::Included(&i) => i,
        Bound::Excluded(&i) => i + 1,
        Bound::Unbounded => 0,
    };
    let last = match range.end_bound() {
        Bound::Included(&i) => i,
        Bound::Excluded(&i) => i - 1,
        Bound::Unbounded => bits - 1,
    };
    assert!(first <= last && last < bits, "invalid bit range");
    (first, last)
}

pub trait Bits: Sized + Copy {
    fn get_bit(self, idx: u32) -> bool;
    fn set_bit(&mut self, idx: u32, value: bool);
    fn get_bits<R: RangeBounds<u32>>(self, range: R) -> Self;
    fn set_bits<R: RangeBounds<u32>>(&mut self, range: R, value: Self);
}

macro_rules! impl_bits {
    ($t:ty) => {
        impl Bits for $t {
            #[inline(always)]
            fn get_bit(self, idx: u32) -> bool {
                self & (1 << idx) != 0
            }

            #[inline(always)]
            fn set_bit(&mut self, idx: u32, value: bool) {
                if value {
                    *self |= 1 << idx;
                } else {
                    *self &= !(1 << idx);
                }
            }

            #[inline(always)]
            fn get_bits<R: RangeBounds<u32>>(self, range: R) -> Self {
                let (first, last) = bit_bounds(&range, <$t>::BITS);
                let width = last - first + 1;
                let mask = <$t>::MAX >> (<$t>::BITS - width);
                (self >> first) & mask
            }

            #[inline(always)]
            fn set_bits<R: RangeBounds<u32>>(&mut self, range: R, value: Self) {
                let (first, last) = bit_bounds(&range, <$t>::BITS);
                let width = last - first + 1;
                let mask = (<$t>::MAX >> (<$t>::BITS - width)) << first;
                *self = (*self & !mask) | ((value << first) & mask);
            }
        }
    };
}

impl_bits!(u8);
impl_bits!(u32);
impl_bits!(u64);

/// Index of the highest set bit, `None` for zero.
#[inline]
pub fn highest_set_bit(value: u64) -> Option<u32> {
    if value == 0 {
        None
    } else {
        Some(63 - value.leading_zeros())
    }
}

/// Number of bits needed to represent `n` distinct values, i.e. `ceil(log2(n))`.
///
/// Both zero and one need no bits at all.
#[inline]
pub fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        highest_set_bit(u64::from(n - 1)).map_or(0, |bit| bit + 1)
    }
}
