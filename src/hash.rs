//! Pluggable hash function and equality predicate over group keys.

use crate::word::GroupKey;

pub trait KeyHasher<K>: Send + Sync {
    fn hash(&self, key: K) -> u64;
}

pub trait KeyEqual<K>: Send + Sync {
    fn equal(&self, probe_key: K, slot_key: K) -> bool;
}

/// Fibonacci (multiplicative) hashing with the high half folded into the
/// low half, so `hash % capacity` sees well-mixed bits for any capacity.
#[derive(Copy, Clone, Debug, Default)]
pub struct FibonacciHash;

impl FibonacciHash {
    const FIBONACCI: u64 = 11_400_714_819_323_198_485;
}

impl<K: GroupKey> KeyHasher<K> for FibonacciHash {
    #[inline(always)]
    fn hash(&self, key: K) -> u64 {
        let v = key.to_bits64().wrapping_mul(Self::FIBONACCI);
        v ^ (v >> 32)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultKeyEqual;

impl<K: GroupKey> KeyEqual<K> for DefaultKeyEqual {
    #[inline(always)]
    fn equal(&self, probe_key: K, slot_key: K) -> bool {
        probe_key == slot_key
    }
}
