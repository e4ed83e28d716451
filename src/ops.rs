//! Aggregation operators.
//!
//! An operator is a capability: an identity element and a binary combine.
//! Concurrent writers apply `combine` in an unspecified order, so it must be
//! associative and commutative.

use std::marker::PhantomData;

use crate::word::{DeviceWord, Numeric};

/// Single-instruction atomic an operator maps onto, if any.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AtomicHint {
    None,
    Add,
    Min,
    Max,
}

pub trait AggregationOp<V: DeviceWord>: Send + Sync {
    fn identity(&self) -> V;

    fn combine(&self, current: V, value: V) -> V;

    /// Lets the hash map bypass the CAS retry loop when the value word has a
    /// matching hardware atomic. `combine` stays the reference semantics.
    fn atomic_hint(&self) -> AtomicHint {
        AtomicHint::None
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Sum<V>(PhantomData<V>);

#[derive(Copy, Clone, Debug)]
pub struct Min<V>(PhantomData<V>);

#[derive(Copy, Clone, Debug)]
pub struct Max<V>(PhantomData<V>);

/// Counts rows per group; the input value is ignored.
#[derive(Copy, Clone, Debug)]
pub struct Count<V>(PhantomData<V>);

macro_rules! op_ctor {
    ($($name:ident),*) => {
        $(
            impl<V> $name<V> {
                pub const fn new() -> Self {
                    Self(PhantomData)
                }
            }

            impl<V> Default for $name<V> {
                fn default() -> Self {
                    Self::new()
                }
            }
        )*
    };
}

op_ctor!(Sum, Min, Max, Count);

impl<V: Numeric> AggregationOp<V> for Sum<V> {
    #[inline(always)]
    fn identity(&self) -> V {
        V::ZERO
    }

    #[inline(always)]
    fn combine(&self, current: V, value: V) -> V {
        current.add(value)
    }

    fn atomic_hint(&self) -> AtomicHint {
        AtomicHint::Add
    }
}

impl<V: Numeric> AggregationOp<V> for Min<V> {
    #[inline(always)]
    fn identity(&self) -> V {
        V::HIGHEST
    }

    #[inline(always)]
    fn combine(&self, current: V, value: V) -> V {
        current.min_of(value)
    }

    fn atomic_hint(&self) -> AtomicHint {
        AtomicHint::Min
    }
}

impl<V: Numeric> AggregationOp<V> for Max<V> {
    #[inline(always)]
    fn identity(&self) -> V {
        V::LOWEST
    }

    #[inline(always)]
    fn combine(&self, current: V, value: V) -> V {
        current.max_of(value)
    }

    fn atomic_hint(&self) -> AtomicHint {
        AtomicHint::Max
    }
}

// No native hint: a native add would add `value`, not one.
impl<V: Numeric> AggregationOp<V> for Count<V> {
    #[inline(always)]
    fn identity(&self) -> V {
        V::ZERO
    }

    #[inline(always)]
    fn combine(&self, current: V, _value: V) -> V {
        current.add(V::ONE)
    }
}
