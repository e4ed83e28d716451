//! Concurrent open-addressing hash map for aggregation.
//!
//! ```text
//!  slots (DeviceBuffer<Slot<K, V>>)
//! ┌──────────────────────────────┐
//! │ key: SENTINEL  value: ident  │  empty
//! ├──────────────────────────────┤
//! │ key: 42        value: 130    │  occupied, owns group 42
//! ├──────────────────────────────┤
//! │ ...                          │
//! └──────────────────────────────┘
//! ```
//!
//! Inserting is a two-level compare-and-swap. The first level claims a slot
//! by swapping the empty sentinel for the key; once claimed the key never
//! changes again. The second level folds the value in with a load/combine/CAS
//! retry loop, since an arbitrary operator does not map to one hardware
//! atomic. Operators that do (sum, min, max over integers) skip the loop.

use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::device::{Device, DeviceBuffer};
use crate::error::{GroupByError, Result};
use crate::hash::{DefaultKeyEqual, FibonacciHash, KeyEqual, KeyHasher};
use crate::ops::AggregationOp;
use crate::word::{DeviceWord, GroupKey};

pub struct Slot<K: DeviceWord, V: DeviceWord> {
    key: K::Atomic,
    value: V::Atomic,
}

pub struct ConcurrentMap<K: GroupKey, V: DeviceWord, H = FibonacciHash, E = DefaultKeyEqual> {
    slots: DeviceBuffer<Slot<K, V>>,
    hasher: H,
    key_equal: E,
}

impl<K: GroupKey, V: DeviceWord> ConcurrentMap<K, V> {
    /// Allocate `capacity` empty slots on `device`, each value set to
    /// `identity`.
    pub fn new(device: &Arc<Device>, capacity: usize, identity: V) -> Result<Self> {
        Self::with_hasher(device, capacity, identity, FibonacciHash, DefaultKeyEqual)
    }
}

impl<K, V, H, E> ConcurrentMap<K, V, H, E>
where
    K: GroupKey,
    V: DeviceWord,
    H: KeyHasher<K>,
    E: KeyEqual<K>,
{
    pub fn with_hasher(
        device: &Arc<Device>,
        capacity: usize,
        identity: V,
        hasher: H,
        key_equal: E,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(GroupByError::InvalidArgument(
                "hash table capacity must be positive".into(),
            ));
        }
        let slots = device.alloc_with(capacity, |_| Slot {
            key: K::new_atomic(K::SENTINEL),
            value: V::new_atomic(identity),
        })?;
        Ok(Self {
            slots,
            hasher,
            key_equal,
        })
    }

    /// Bytes a table of `capacity` slots requests from the device.
    pub fn memory_footprint(capacity: usize) -> usize {
        capacity.saturating_mul(size_of::<Slot<K, V>>())
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    fn start_index(&self, key: K) -> usize {
        (self.hasher.hash(key) % self.slots.len() as u64) as usize
    }

    #[inline(always)]
    fn next_index(&self, index: usize) -> usize {
        if index + 1 == self.slots.len() {
            0
        } else {
            index + 1
        }
    }

    /// Fold `value` into the group for `key`, claiming an empty slot for it
    /// if the key is not yet present.
    ///
    /// `key` must not be [`GroupKey::SENTINEL`]; if it is, the result is
    /// unspecified.
    pub fn insert_or_combine<O>(&self, key: K, value: V, op: &O) -> Result<()>
    where
        O: AggregationOp<V> + ?Sized,
    {
        let capacity = self.slots.len();
        let mut index = self.start_index(key);

        for _ in 0..capacity {
            let slot = &self.slots[index];
            let mut current = K::load(&slot.key, Ordering::Acquire);

            if current == K::SENTINEL {
                match K::compare_exchange(
                    &slot.key,
                    K::SENTINEL,
                    key,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        Self::combine_value(slot, value, op);
                        return Ok(());
                    }
                    // Lost the race; the winner may have stored our key.
                    Err(observed) => current = observed,
                }
            }

            if self.key_equal.equal(key, current) {
                Self::combine_value(slot, value, op);
                return Ok(());
            }

            index = self.next_index(index);
        }

        Err(GroupByError::TableOverflow { capacity })
    }

    #[inline(always)]
    fn combine_value<O>(slot: &Slot<K, V>, value: V, op: &O)
    where
        O: AggregationOp<V> + ?Sized,
    {
        if V::fetch_native(&slot.value, op.atomic_hint(), value) {
            return;
        }

        let mut current = V::load(&slot.value, Ordering::Relaxed);
        loop {
            let combined = op.combine(current, value);
            match V::compare_exchange_weak(
                &slot.value,
                current,
                combined,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Aggregated value for `key`, if present.
    pub fn find(&self, key: K) -> Option<V> {
        let mut index = self.start_index(key);
        for _ in 0..self.slots.len() {
            let slot = &self.slots[index];
            let current = K::load(&slot.key, Ordering::Acquire);
            if current == K::SENTINEL {
                return None;
            }
            if self.key_equal.equal(key, current) {
                return Some(V::load(&slot.value, Ordering::Acquire));
            }
            index = self.next_index(index);
        }
        None
    }

    /// Contents of slot `index`, or `None` when it is empty.
    #[inline(always)]
    pub fn slot(&self, index: usize) -> Option<(K, V)> {
        let slot = &self.slots[index];
        let key = K::load(&slot.key, Ordering::Acquire);
        if key == K::SENTINEL {
            None
        } else {
            Some((key, V::load(&slot.value, Ordering::Acquire)))
        }
    }

    /// Occupied slots in table order.
    pub fn iter(&self) -> impl Iterator<Item = (K, V)> + '_ {
        (0..self.slots.len()).filter_map(|i| self.slot(i))
    }

    /// Number of occupied slots. Linear in capacity.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}
