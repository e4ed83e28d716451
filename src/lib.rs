//! Parallel hash group-by aggregation.
//!
//! Rows of `(key, value)` are folded into one value per distinct key by a
//! concurrent open-addressing table, compacted into output columns, and
//! optionally sorted by key with an LSD radix sort.
//!
//! Work runs on a [`Device`]: a memory pool plus a pool of worker threads
//! that executes kernels as a grid of blocks. Kernels are issued on a
//! [`Stream`], and faults stay sticky on that stream until read with
//! [`Stream::last_error`] or [`Stream::synchronize`].
//!
//! ```no_run
//! use hashgroup::{Device, GroupByConfig, Sum, group_by};
//!
//! let device = Device::with_defaults();
//! let keys = [1u32, 2, 1, 3, 2, 1];
//! let values = [10u64, 20, 30, 40, 50, 60];
//! let mut out_keys = [0u32; 6];
//! let mut out_values = [0u64; 6];
//!
//! let config = GroupByConfig::default().sorted(true);
//! let out = group_by(
//!     &device,
//!     &keys,
//!     &values,
//!     &mut out_keys,
//!     &mut out_values,
//!     &Sum::new(),
//!     &config,
//! )?;
//! assert_eq!(&out_keys[..out.len], &[1, 2, 3]);
//! assert_eq!(&out_values[..out.len], &[100, 70, 40]);
//! # Ok::<(), hashgroup::GroupByError>(())
//! ```

pub mod device;
pub mod error;
pub mod groupby;
pub mod hash;
pub mod kernels;
pub mod map;
pub mod ops;
pub mod sort;
pub mod word;

pub use device::{Device, DeviceBuffer, DeviceConfig, LaunchConfig, Stream, THREAD_BLOCK_SIZE};
pub use error::{GroupByError, Result, StatusCode};
pub use groupby::{
    DEFAULT_HASH_TABLE_OCCUPANCY, GroupByConfig, GroupByOutput, compute_capacity, group_by,
    group_by_raw, group_by_sorted, group_by_with_hasher,
};
pub use hash::{DefaultKeyEqual, FibonacciHash, KeyEqual, KeyHasher};
pub use map::ConcurrentMap;
pub use ops::{AggregationOp, AtomicHint, Count, Max, Min, Sum};
pub use sort::{DoubleBuffer, RadixSort};
pub use word::{DeviceWord, GroupKey, Numeric};
