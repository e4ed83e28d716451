//! Build and extraction kernels.
//!
//! Neither kernel returns an error directly. Faults are recorded on the
//! stream and must be collected with [`Stream::last_error`] or
//! [`Stream::synchronize`] after the launch.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::device::{LaunchConfig, ScatterSlice, Stream};
use crate::hash::{KeyEqual, KeyHasher};
use crate::map::ConcurrentMap;
use crate::ops::AggregationOp;
use crate::word::{DeviceWord, GroupKey};

/// One thread per input row: `map.insert_or_combine(keys[i], values[i])`.
pub fn build_aggregation_table<K, V, H, E, O>(
    stream: &Stream,
    map: &ConcurrentMap<K, V, H, E>,
    keys: &[K],
    values: &[V],
    op: &O,
    block_size: usize,
) where
    K: GroupKey,
    V: DeviceWord,
    H: KeyHasher<K>,
    E: KeyEqual<K>,
    O: AggregationOp<V> + ?Sized,
{
    debug_assert_eq!(keys.len(), values.len());
    let n = keys.len().min(values.len());
    let config = LaunchConfig::for_threads(n, block_size);

    stream.launch("build_aggregation_table", config, n, |i| {
        map.insert_or_combine(keys[i], values[i], op)
    });
}

/// One thread per table slot. Each occupied slot takes the next output
/// position from `write_index` and stores its pair there, so after the
/// launch `write_index` holds the number of groups. Output order is
/// unspecified.
pub fn extract_groupby_result<K, V, H, E>(
    stream: &Stream,
    map: &ConcurrentMap<K, V, H, E>,
    out_keys: &mut [K],
    out_values: &mut [V],
    write_index: &AtomicUsize,
    block_size: usize,
) where
    K: GroupKey,
    V: DeviceWord,
    H: KeyHasher<K>,
    E: KeyEqual<K>,
{
    let capacity = map.capacity();
    let config = LaunchConfig::for_threads(capacity, block_size);
    let out_keys = ScatterSlice::new(out_keys);
    let out_values = ScatterSlice::new(out_values);

    stream.launch("extract_groupby_result", config, capacity, |slot| {
        if let Some((key, value)) = map.slot(slot) {
            let index = write_index.fetch_add(1, Ordering::Relaxed);
            // SAFETY: `fetch_add` hands out each index exactly once.
            unsafe {
                out_keys.write(index, key)?;
                out_values.write(index, value)?;
            }
        }
        Ok(())
    });
}
