//! Key and value words that can live in an atomically accessed hash slot.
//!
//! The set is sealed: keys are `u32`, `u64`, `i32`, `i64`; values are those
//! plus `f32` and `f64`. Floating point values are stored as their bit
//! pattern in an integer atomic, so compare-and-swap compares bits.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::ops::AtomicHint;

mod private {
    pub trait Sealed {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// A fixed-size word with a matching atomic cell.
pub trait DeviceWord: private::Sealed + Copy + PartialEq + Debug + Send + Sync + 'static {
    type Atomic: Send + Sync;

    fn new_atomic(value: Self) -> Self::Atomic;

    fn load(cell: &Self::Atomic, order: Ordering) -> Self;

    fn compare_exchange(
        cell: &Self::Atomic,
        current: Self,
        new: Self,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Self, Self>;

    fn compare_exchange_weak(
        cell: &Self::Atomic,
        current: Self,
        new: Self,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Self, Self>;

    /// Apply `hint` with a single hardware atomic. Returns `false` when the
    /// word has no such instruction and the caller must fall back to CAS.
    fn fetch_native(cell: &Self::Atomic, hint: AtomicHint, value: Self) -> bool;
}

/// Arithmetic needed by the built-in aggregation operators.
pub trait Numeric: DeviceWord + PartialOrd {
    const ZERO: Self;
    const ONE: Self;
    /// Identity for `max`: `MIN` for integers, `-inf` for floats.
    const LOWEST: Self;
    /// Identity for `min`: `MAX` for integers, `+inf` for floats.
    const HIGHEST: Self;

    /// Addition; wraps on integer overflow.
    fn add(self, other: Self) -> Self;

    fn min_of(self, other: Self) -> Self;

    fn max_of(self, other: Self) -> Self;
}

/// A group-by key.
///
/// `Self::SENTINEL` (the type's maximum) is reserved to mark empty slots and
/// must never appear in the input.
pub trait GroupKey: DeviceWord + Eq + Ord {
    const SENTINEL: Self;
    /// Width in bytes of the radix representation.
    const RADIX_BYTES: usize;

    /// Raw bit pattern, zero-extended.
    fn to_bits64(self) -> u64;

    /// Bit pattern whose unsigned order matches the key order.
    fn radix_bits(self) -> u64;
}

macro_rules! int_word {
    ($ty:ty, $atomic:ty) => {
        impl DeviceWord for $ty {
            type Atomic = $atomic;

            #[inline(always)]
            fn new_atomic(value: Self) -> Self::Atomic {
                <$atomic>::new(value)
            }

            #[inline(always)]
            fn load(cell: &Self::Atomic, order: Ordering) -> Self {
                cell.load(order)
            }

            #[inline(always)]
            fn compare_exchange(
                cell: &Self::Atomic,
                current: Self,
                new: Self,
                success: Ordering,
                failure: Ordering,
            ) -> Result<Self, Self> {
                cell.compare_exchange(current, new, success, failure)
            }

            #[inline(always)]
            fn compare_exchange_weak(
                cell: &Self::Atomic,
                current: Self,
                new: Self,
                success: Ordering,
                failure: Ordering,
            ) -> Result<Self, Self> {
                cell.compare_exchange_weak(current, new, success, failure)
            }

            #[inline(always)]
            fn fetch_native(cell: &Self::Atomic, hint: AtomicHint, value: Self) -> bool {
                match hint {
                    AtomicHint::Add => {
                        cell.fetch_add(value, Ordering::AcqRel);
                    }
                    AtomicHint::Min => {
                        cell.fetch_min(value, Ordering::AcqRel);
                    }
                    AtomicHint::Max => {
                        cell.fetch_max(value, Ordering::AcqRel);
                    }
                    AtomicHint::None => return false,
                }
                true
            }
        }

        impl Numeric for $ty {
            const ZERO: Self = 0;
            const ONE: Self = 1;
            const LOWEST: Self = <$ty>::MIN;
            const HIGHEST: Self = <$ty>::MAX;

            #[inline(always)]
            fn add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }

            #[inline(always)]
            fn min_of(self, other: Self) -> Self {
                Ord::min(self, other)
            }

            #[inline(always)]
            fn max_of(self, other: Self) -> Self {
                Ord::max(self, other)
            }
        }
    };
}

int_word!(u32, AtomicU32);
int_word!(u64, AtomicU64);
int_word!(i32, AtomicI32);
int_word!(i64, AtomicI64);

macro_rules! float_word {
    ($ty:ty, $bits:ty, $atomic:ty) => {
        impl DeviceWord for $ty {
            type Atomic = $atomic;

            #[inline(always)]
            fn new_atomic(value: Self) -> Self::Atomic {
                <$atomic>::new(value.to_bits())
            }

            #[inline(always)]
            fn load(cell: &Self::Atomic, order: Ordering) -> Self {
                <$ty>::from_bits(cell.load(order))
            }

            #[inline(always)]
            fn compare_exchange(
                cell: &Self::Atomic,
                current: Self,
                new: Self,
                success: Ordering,
                failure: Ordering,
            ) -> Result<Self, Self> {
                cell.compare_exchange(current.to_bits(), new.to_bits(), success, failure)
                    .map(<$ty>::from_bits)
                    .map_err(<$ty>::from_bits)
            }

            #[inline(always)]
            fn compare_exchange_weak(
                cell: &Self::Atomic,
                current: Self,
                new: Self,
                success: Ordering,
                failure: Ordering,
            ) -> Result<Self, Self> {
                cell.compare_exchange_weak(current.to_bits(), new.to_bits(), success, failure)
                    .map(<$ty>::from_bits)
                    .map_err(<$ty>::from_bits)
            }

            #[inline(always)]
            fn fetch_native(_cell: &Self::Atomic, _hint: AtomicHint, _value: Self) -> bool {
                false
            }
        }

        impl Numeric for $ty {
            const ZERO: Self = 0.0;
            const ONE: Self = 1.0;
            const LOWEST: Self = <$ty>::NEG_INFINITY;
            const HIGHEST: Self = <$ty>::INFINITY;

            #[inline(always)]
            fn add(self, other: Self) -> Self {
                self + other
            }

            #[inline(always)]
            fn min_of(self, other: Self) -> Self {
                <$ty>::min(self, other)
            }

            #[inline(always)]
            fn max_of(self, other: Self) -> Self {
                <$ty>::max(self, other)
            }
        }

        const _: () = assert!(std::mem::size_of::<$ty>() == std::mem::size_of::<$bits>());
    };
}

float_word!(f32, u32, AtomicU32);
float_word!(f64, u64, AtomicU64);

impl GroupKey for u32 {
    const SENTINEL: Self = u32::MAX;
    const RADIX_BYTES: usize = 4;

    #[inline(always)]
    fn to_bits64(self) -> u64 {
        self as u64
    }

    #[inline(always)]
    fn radix_bits(self) -> u64 {
        self as u64
    }
}

impl GroupKey for u64 {
    const SENTINEL: Self = u64::MAX;
    const RADIX_BYTES: usize = 8;

    #[inline(always)]
    fn to_bits64(self) -> u64 {
        self
    }

    #[inline(always)]
    fn radix_bits(self) -> u64 {
        self
    }
}

impl GroupKey for i32 {
    const SENTINEL: Self = i32::MAX;
    const RADIX_BYTES: usize = 4;

    #[inline(always)]
    fn to_bits64(self) -> u64 {
        self as u32 as u64
    }

    // Flipping the sign bit maps i32::MIN..=i32::MAX onto 0..=u32::MAX.
    #[inline(always)]
    fn radix_bits(self) -> u64 {
        (self as u32 ^ 0x8000_0000) as u64
    }
}

impl GroupKey for i64 {
    const SENTINEL: Self = i64::MAX;
    const RADIX_BYTES: usize = 8;

    #[inline(always)]
    fn to_bits64(self) -> u64 {
        self as u64
    }

    #[inline(always)]
    fn radix_bits(self) -> u64 {
        self as u64 ^ 0x8000_0000_0000_0000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_type_max() {
        assert_eq!(<u32 as GroupKey>::SENTINEL, u32::MAX);
        assert_eq!(<u64 as GroupKey>::SENTINEL, u64::MAX);
        assert_eq!(<i32 as GroupKey>::SENTINEL, i32::MAX);
        assert_eq!(<i64 as GroupKey>::SENTINEL, i64::MAX);
    }

    #[test]
    fn signed_radix_bits_preserve_order() {
        let keys = [i32::MIN, -1000, -1, 0, 1, 77, i32::MAX];
        for pair in keys.windows(2) {
            assert!(pair[0].radix_bits() < pair[1].radix_bits(), "{pair:?}");
        }
        let keys = [i64::MIN, -5, 0, 5, i64::MAX];
        for pair in keys.windows(2) {
            assert!(pair[0].radix_bits() < pair[1].radix_bits(), "{pair:?}");
        }
    }

    #[test]
    fn float_cas_compares_bits() {
        let cell = f64::new_atomic(1.5);
        assert_eq!(
            f64::compare_exchange(&cell, 1.5, 2.5, Ordering::AcqRel, Ordering::Acquire),
            Ok(1.5)
        );
        assert_eq!(
            f64::compare_exchange(&cell, 1.5, 9.0, Ordering::AcqRel, Ordering::Acquire),
            Err(2.5)
        );
        assert_eq!(f64::load(&cell, Ordering::Acquire), 2.5);
    }

    #[test]
    fn native_atomics_only_for_integers() {
        let cell = u64::new_atomic(10);
        assert!(u64::fetch_native(&cell, AtomicHint::Add, 5));
        assert!(u64::fetch_native(&cell, AtomicHint::Max, 12));
        assert_eq!(u64::load(&cell, Ordering::Acquire), 15);
        assert!(!u64::fetch_native(&cell, AtomicHint::None, 1));

        let cell = f32::new_atomic(1.0);
        assert!(!f32::fetch_native(&cell, AtomicHint::Add, 1.0));
        assert_eq!(f32::load(&cell, Ordering::Acquire), 1.0);
    }

    #[test]
    fn integer_add_wraps() {
        assert_eq!(Numeric::add(u32::MAX, 2), 1);
        assert_eq!(Numeric::add(i64::MAX, 1), i64::MIN);
    }
}
