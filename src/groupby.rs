//! Group-by orchestration: validate, size, build, extract, optionally sort.
//!
//! ```text
//!  keys/values ──► build ──► ConcurrentMap ──► extract ──► out_keys/out_values
//!                                                              │
//!                                                   sort_result│
//!                                                              ▼
//!                                                   radix sort (double buffer)
//! ```
//!
//! Every call runs its kernels on a stream of its own, so concurrent calls on
//! one [`Device`] never see each other's faults. Each stage is checked as soon
//! as it finishes and the first error ends the call. The table, the write
//! counter, and the sort buffers are [`DeviceBuffer`](crate::DeviceBuffer)s,
//! so they go back to the device pool on every return path.

use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace};

use crate::device::{Device, Stream, THREAD_BLOCK_SIZE};
use crate::error::{GroupByError, Result, StatusCode};
use crate::hash::{DefaultKeyEqual, FibonacciHash, KeyEqual, KeyHasher};
use crate::kernels::{build_aggregation_table, extract_groupby_result};
use crate::map::ConcurrentMap;
use crate::ops::AggregationOp;
use crate::sort::{DoubleBuffer, RadixSort};
use crate::word::{DeviceWord, GroupKey};

/// A value of 50 means 50% occupancy, i.e. twice as many slots as rows.
pub const DEFAULT_HASH_TABLE_OCCUPANCY: u32 = 50;

pub const DEFAULT_MIN_CAPACITY: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupByConfig {
    /// Expected rows per 100 table slots, in `1..=100`.
    pub occupancy_percent: u32,
    /// Threads per block for the build and extraction kernels.
    pub block_size: usize,
    /// Lower bound on table capacity.
    pub min_capacity: usize,
    /// Sort the output ascending by key.
    pub sort_result: bool,
    /// Reject input containing the reserved empty-slot key.
    pub check_sentinel: bool,
}

impl Default for GroupByConfig {
    fn default() -> Self {
        Self {
            occupancy_percent: DEFAULT_HASH_TABLE_OCCUPANCY,
            block_size: THREAD_BLOCK_SIZE,
            min_capacity: DEFAULT_MIN_CAPACITY,
            sort_result: false,
            check_sentinel: true,
        }
    }
}

impl GroupByConfig {
    pub fn with_occupancy(mut self, percent: u32) -> Self {
        self.occupancy_percent = percent;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_min_capacity(mut self, min_capacity: usize) -> Self {
        self.min_capacity = min_capacity;
        self
    }

    pub fn sorted(mut self, sort_result: bool) -> Self {
        self.sort_result = sort_result;
        self
    }

    pub fn with_sentinel_check(mut self, check: bool) -> Self {
        self.check_sentinel = check;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.occupancy_percent) {
            return Err(GroupByError::InvalidArgument(format!(
                "occupancy must be within 1..=100, got {}",
                self.occupancy_percent
            )));
        }
        if self.block_size == 0 {
            return Err(GroupByError::InvalidArgument(
                "block size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Slots needed to hold `n` rows at `occupancy_percent`, rounded up and
/// never below `min_capacity` (or one slot).
pub fn compute_capacity(n: usize, occupancy_percent: u32, min_capacity: usize) -> Result<usize> {
    if !(1..=100).contains(&occupancy_percent) {
        return Err(GroupByError::InvalidArgument(format!(
            "occupancy must be within 1..=100, got {occupancy_percent}"
        )));
    }
    let scaled = n.checked_mul(100).ok_or_else(|| {
        GroupByError::InvalidArgument(format!("{n} rows overflow the table size"))
    })?;
    Ok(scaled
        .div_ceil(occupancy_percent as usize)
        .max(min_capacity)
        .max(1))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GroupByOutput {
    /// Number of groups written to the front of the output columns.
    pub len: usize,
    /// Slots in the hash table used for the call.
    pub capacity: usize,
}

/// Aggregate `values` per distinct key with `op`.
///
/// The output columns must hold at least `keys.len()` elements. On success
/// `out_keys[..len]` and `out_values[..len]` hold one entry per distinct
/// key, ascending by key if `config.sort_result` is set and in unspecified
/// order otherwise. On failure the outputs hold nothing meaningful.
pub fn group_by<K, V, O>(
    device: &Arc<Device>,
    keys: &[K],
    values: &[V],
    out_keys: &mut [K],
    out_values: &mut [V],
    op: &O,
    config: &GroupByConfig,
) -> Result<GroupByOutput>
where
    K: GroupKey,
    V: DeviceWord,
    O: AggregationOp<V> + ?Sized,
{
    group_by_with_hasher(
        device,
        keys,
        values,
        out_keys,
        out_values,
        op,
        config,
        FibonacciHash,
        DefaultKeyEqual,
    )
}

/// [`group_by`] with the output sorted by key.
pub fn group_by_sorted<K, V, O>(
    device: &Arc<Device>,
    keys: &[K],
    values: &[V],
    out_keys: &mut [K],
    out_values: &mut [V],
    op: &O,
) -> Result<GroupByOutput>
where
    K: GroupKey,
    V: DeviceWord,
    O: AggregationOp<V> + ?Sized,
{
    let config = GroupByConfig::default().sorted(true);
    group_by(device, keys, values, out_keys, out_values, op, &config)
}

/// [`group_by`] with a caller-supplied hash function and key equality.
#[allow(clippy::too_many_arguments)]
pub fn group_by_with_hasher<K, V, O, H, E>(
    device: &Arc<Device>,
    keys: &[K],
    values: &[V],
    out_keys: &mut [K],
    out_values: &mut [V],
    op: &O,
    config: &GroupByConfig,
    hasher: H,
    key_equal: E,
) -> Result<GroupByOutput>
where
    K: GroupKey,
    V: DeviceWord,
    O: AggregationOp<V> + ?Sized,
    H: KeyHasher<K>,
    E: KeyEqual<K>,
{
    let n = keys.len();
    if n == 0 {
        return Err(GroupByError::InvalidArgument("input columns are empty".into()));
    }
    if values.len() != n {
        return Err(GroupByError::InvalidArgument(format!(
            "{n} keys but {} values",
            values.len()
        )));
    }
    if out_keys.len() < n || out_values.len() < n {
        return Err(GroupByError::InvalidArgument(format!(
            "output columns hold {}/{} entries, {n} required",
            out_keys.len(),
            out_values.len()
        )));
    }
    config.validate()?;
    if config.check_sentinel {
        if let Some(row) = keys.iter().position(|&k| k == K::SENTINEL) {
            return Err(GroupByError::InvalidArgument(format!(
                "row {row} holds the reserved key {:?}",
                K::SENTINEL
            )));
        }
    }

    let capacity = compute_capacity(n, config.occupancy_percent, config.min_capacity)?;
    debug!(
        "group_by: rows={n} capacity={capacity} occupancy={}% sort={}",
        config.occupancy_percent, config.sort_result
    );

    let stream = device.stream();
    let map = ConcurrentMap::with_hasher(device, capacity, op.identity(), hasher, key_equal)?;

    build_aggregation_table(&stream, &map, keys, values, op, config.block_size);
    stream.last_error()?;
    trace!("group_by: build complete");

    let write_index = device.alloc_with(1, |_| AtomicUsize::new(0))?;
    extract_groupby_result(
        &stream,
        &map,
        out_keys,
        out_values,
        &write_index[0],
        config.block_size,
    );
    stream.synchronize()?;
    let len = write_index[0].load(Ordering::Acquire);
    drop(write_index);
    debug!("group_by: extracted {len} groups");

    if config.sort_result {
        sort_groups(&stream, &mut out_keys[..len], &mut out_values[..len], op.identity())?;
        trace!("group_by: sort complete");
    }

    Ok(GroupByOutput { len, capacity })
}

/// Sort the compacted groups in place. The alternates and scratch live only
/// for the duration of this stage.
fn sort_groups<K: GroupKey, V: DeviceWord>(
    stream: &Stream,
    out_keys: &mut [K],
    out_values: &mut [V],
    fill: V,
) -> Result<()> {
    let len = out_keys.len();
    if len <= 1 {
        return Ok(());
    }

    let device = stream.device();
    let mut alt_keys = device.alloc_filled(len, K::SENTINEL)?;
    let mut alt_values = device.alloc_filled(len, fill)?;
    let mut keys = DoubleBuffer::new(out_keys, &mut alt_keys[..]);
    let mut values = DoubleBuffer::new(out_values, &mut alt_values[..]);

    let sorter = RadixSort::default();
    let temp_bytes = sorter.sort_pairs(stream, None, &mut keys, &mut values, len)?;
    let mut temp = device.alloc_filled(temp_bytes, 0u8)?;
    sorter.sort_pairs(stream, Some(&mut temp[..]), &mut keys, &mut values, len)?;
    stream.synchronize()?;

    if keys.alternate_is_current() {
        trace!("group_by: sorted keys landed in the alternate buffer");
        keys.restore_primary(len);
    }
    if values.alternate_is_current() {
        values.restore_primary(len);
    }
    Ok(())
}

/// Pointer-based entry point reporting a [`StatusCode`].
///
/// Null pointers and `n == 0` are rejected with
/// [`StatusCode::InvalidArgument`] before anything is written. On success
/// `*out_size` receives the number of groups.
///
/// # Safety
///
/// Non-null `keys` and `values` must be valid for `n` reads, non-null
/// `out_keys` and `out_values` valid for `n` writes, `out_size` valid for one
/// write, and none of the output regions may overlap each other or the
/// inputs.
#[allow(clippy::too_many_arguments)]
pub unsafe fn group_by_raw<K, V, O>(
    device: &Arc<Device>,
    keys: *const K,
    values: *const V,
    n: usize,
    out_keys: *mut K,
    out_values: *mut V,
    out_size: *mut usize,
    op: &O,
    sort_result: bool,
) -> StatusCode
where
    K: GroupKey,
    V: DeviceWord,
    O: AggregationOp<V> + ?Sized,
{
    if keys.is_null() || values.is_null() {
        return StatusCode::InvalidArgument;
    }
    if n == 0 {
        return StatusCode::InvalidArgument;
    }
    if out_keys.is_null() || out_values.is_null() || out_size.is_null() {
        return StatusCode::InvalidArgument;
    }

    // SAFETY: pointers are non-null and the caller guarantees their extents.
    let (keys, values, out_keys, out_values) = unsafe {
        (
            slice::from_raw_parts(keys, n),
            slice::from_raw_parts(values, n),
            slice::from_raw_parts_mut(out_keys, n),
            slice::from_raw_parts_mut(out_values, n),
        )
    };

    let config = GroupByConfig::default().sorted(sort_result);
    match group_by(device, keys, values, out_keys, out_values, op, &config) {
        Ok(output) => {
            unsafe { *out_size = output.len };
            StatusCode::Success
        }
        Err(err) => {
            debug!("group_by_raw failed: {err}");
            StatusCode::from(&err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::ops::{Count, Max, Sum};

    fn device() -> Arc<Device> {
        Device::new(DeviceConfig::default().with_workers(4))
    }

    // -- Sizing -------------------------------------------------------------

    #[test]
    fn capacity_rounds_up() {
        assert_eq!(compute_capacity(1000, 50, 0).unwrap(), 2000);
        assert_eq!(compute_capacity(3, 70, 0).unwrap(), 5);
        assert_eq!(compute_capacity(100, 100, 0).unwrap(), 100);
    }

    #[test]
    fn capacity_small_input_not_truncated() {
        // Truncating (n / occupancy) * 100 would give zero slots here.
        assert_eq!(compute_capacity(6, 50, 0).unwrap(), 12);
        assert_eq!(compute_capacity(1, 50, 0).unwrap(), 2);
        assert_eq!(compute_capacity(6, 50, DEFAULT_MIN_CAPACITY).unwrap(), 16);
    }

    #[test]
    fn capacity_rejects_bad_occupancy_and_overflow() {
        assert!(compute_capacity(10, 0, 0).is_err());
        assert!(compute_capacity(10, 101, 0).is_err());
        assert!(compute_capacity(usize::MAX, 50, 0).is_err());
    }

    #[test]
    fn config_validation() {
        assert!(GroupByConfig::default().validate().is_ok());
        assert!(GroupByConfig::default().with_occupancy(0).validate().is_err());
        assert!(GroupByConfig::default().with_block_size(0).validate().is_err());
    }

    // -- Validation order ---------------------------------------------------

    #[test]
    fn rejects_empty_input_without_touching_output() {
        let dev = device();
        let mut out_k = vec![7u32; 4];
        let mut out_v = vec![7u64; 4];
        let res = group_by(
            &dev,
            &[],
            &[],
            &mut out_k,
            &mut out_v,
            &Sum::new(),
            &GroupByConfig::default(),
        );
        assert!(matches!(res, Err(GroupByError::InvalidArgument(_))));
        assert_eq!(out_k, vec![7; 4]);
        assert_eq!(out_v, vec![7; 4]);
    }

    #[test]
    fn rejects_mismatched_and_short_columns() {
        let dev = device();
        let mut out_k = vec![0u32; 3];
        let mut out_v = vec![0u64; 3];
        let cfg = GroupByConfig::default();
        let res = group_by(&dev, &[1, 2, 3], &[1, 2], &mut out_k, &mut out_v, &Sum::new(), &cfg);
        assert!(matches!(res, Err(GroupByError::InvalidArgument(_))));

        let mut short_k = vec![0u32; 2];
        let res = group_by(&dev, &[1, 2, 3], &[1, 2, 3], &mut short_k, &mut out_v, &Sum::new(), &cfg);
        assert!(matches!(res, Err(GroupByError::InvalidArgument(_))));
    }

    #[test]
    fn rejects_sentinel_key_when_checked() {
        let dev = device();
        let mut out_k = vec![0u32; 2];
        let mut out_v = vec![0u64; 2];
        let res = group_by(
            &dev,
            &[1, u32::MAX],
            &[1, 2],
            &mut out_k,
            &mut out_v,
            &Sum::new(),
            &GroupByConfig::default(),
        );
        assert!(matches!(res, Err(GroupByError::InvalidArgument(_))));
        assert_eq!(dev.memory_used(), 0);
    }

    // -- Pipeline -----------------------------------------------------------

    #[test]
    fn sum_example_sorted() {
        let dev = device();
        let keys = [1u32, 2, 1, 3, 2, 1];
        let values = [10u64, 20, 30, 40, 50, 60];
        let mut out_k = vec![0u32; 6];
        let mut out_v = vec![0u64; 6];
        let out = group_by_sorted(&dev, &keys, &values, &mut out_k, &mut out_v, &Sum::new())
            .unwrap();
        assert_eq!(out.len, 3);
        assert_eq!(out.capacity, 16);
        assert_eq!(&out_k[..3], &[1, 2, 3]);
        assert_eq!(&out_v[..3], &[100, 70, 40]);
        assert_eq!(dev.memory_used(), 0);
    }

    #[test]
    fn count_example() {
        let dev = device();
        let keys = [5i64, -5, 5, 5];
        let values = [0u32; 4];
        let mut out_k = vec![0i64; 4];
        let mut out_v = vec![0u32; 4];
        let cfg = GroupByConfig::default().sorted(true);
        let out = group_by(&dev, &keys, &values, &mut out_k, &mut out_v, &Count::new(), &cfg)
            .unwrap();
        assert_eq!(&out_k[..out.len], &[-5, 5]);
        assert_eq!(&out_v[..out.len], &[1, 3]);
    }

    #[test]
    fn raw_entry_rejects_nulls() {
        let dev = device();
        let keys = [1u32, 2];
        let values = [1u64, 2];
        let mut out_k = [9u32; 2];
        let mut out_v = [9u64; 2];
        let mut out_size = 42usize;
        let op = Max::new();
        unsafe {
            assert_eq!(
                group_by_raw(
                    &dev,
                    std::ptr::null(),
                    values.as_ptr(),
                    2,
                    out_k.as_mut_ptr(),
                    out_v.as_mut_ptr(),
                    &mut out_size,
                    &op,
                    false,
                ),
                StatusCode::InvalidArgument
            );
            assert_eq!(
                group_by_raw(
                    &dev,
                    keys.as_ptr(),
                    values.as_ptr(),
                    0,
                    out_k.as_mut_ptr(),
                    out_v.as_mut_ptr(),
                    &mut out_size,
                    &op,
                    false,
                ),
                StatusCode::InvalidArgument
            );
            assert_eq!(
                group_by_raw(
                    &dev,
                    keys.as_ptr(),
                    values.as_ptr(),
                    2,
                    std::ptr::null_mut(),
                    out_v.as_mut_ptr(),
                    &mut out_size,
                    &op,
                    false,
                ),
                StatusCode::InvalidArgument
            );
        }
        assert_eq!(out_k, [9; 2]);
        assert_eq!(out_v, [9; 2]);
        assert_eq!(out_size, 42);
    }

    #[test]
    fn raw_entry_success() {
        let dev = device();
        let keys = [1u32, 2, 1, 3, 2, 1];
        let values = [10u64, 20, 30, 40, 50, 60];
        let mut out_k = [0u32; 6];
        let mut out_v = [0u64; 6];
        let mut out_size = 0usize;
        let status = unsafe {
            group_by_raw(
                &dev,
                keys.as_ptr(),
                values.as_ptr(),
                keys.len(),
                out_k.as_mut_ptr(),
                out_v.as_mut_ptr(),
                &mut out_size,
                &Max::new(),
                true,
            )
        };
        assert_eq!(status, StatusCode::Success);
        assert_eq!(out_size, 3);
        assert_eq!(&out_k[..3], &[1, 2, 3]);
        assert_eq!(&out_v[..3], &[60, 50, 40]);
    }
}
