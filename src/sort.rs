//! Key-value LSD radix sort over a double buffer.
//!
//! The sort follows a two-phase protocol. Calling [`RadixSort::sort_pairs`]
//! without scratch storage only reports how many scratch bytes the sort
//! needs; the caller allocates them and calls again to sort.
//!
//! Each pass handles one 8-bit digit in three steps:
//! 1. Per-block digit histograms (parallel, one block per key range).
//! 2. Exclusive scan over `(digit, block)` into scatter offsets (sequential).
//! 3. Stable scatter from the current buffer into the alternate (parallel).
//!
//! A pass whose digit is the same for every key is skipped, so the sorted
//! data ends up in whichever half of the [`DoubleBuffer`] is current.

use std::mem::{align_of, size_of};

use log::trace;

use crate::device::{LaunchConfig, ScatterSlice, Stream};
use crate::error::{GroupByError, Result};
use crate::word::{DeviceWord, GroupKey};

const RADIX_BITS: u32 = 8;
const RADIX_BINS: usize = 1 << RADIX_BITS;
const RADIX_MASK: u64 = RADIX_BINS as u64 - 1;

/// Keys handled by one block in the histogram and scatter kernels.
pub const SORT_BLOCK_ITEMS: usize = 2048;

/// A primary and an alternate buffer plus a selector naming the one that
/// currently holds valid data.
pub struct DoubleBuffer<'a, T> {
    buffers: [&'a mut [T]; 2],
    selector: usize,
}

impl<'a, T: Copy> DoubleBuffer<'a, T> {
    pub fn new(primary: &'a mut [T], alternate: &'a mut [T]) -> Self {
        Self {
            buffers: [primary, alternate],
            selector: 0,
        }
    }

    pub fn current(&self) -> &[T] {
        &self.buffers[self.selector]
    }

    /// `0` for the primary buffer, `1` for the alternate.
    pub fn selector(&self) -> usize {
        self.selector
    }

    pub fn alternate_is_current(&self) -> bool {
        self.selector == 1
    }

    /// Copy the first `len` elements of the alternate into the primary and
    /// make the primary current.
    pub fn restore_primary(&mut self, len: usize) {
        if self.selector == 1 {
            let [primary, alternate] = &mut self.buffers;
            primary[..len].copy_from_slice(&alternate[..len]);
            self.selector = 0;
        }
    }

    fn len(&self) -> usize {
        self.buffers[0].len().min(self.buffers[1].len())
    }

    /// `(current, alternate)`.
    fn split(&mut self) -> (&[T], &mut [T]) {
        let [primary, alternate] = &mut self.buffers;
        if self.selector == 0 {
            (&**primary, &mut **alternate)
        } else {
            (&**alternate, &mut **primary)
        }
    }

    fn flip(&mut self) {
        self.selector ^= 1;
    }
}

#[derive(Copy, Clone, Debug)]
pub struct RadixSort {
    block_items: usize,
}

impl Default for RadixSort {
    fn default() -> Self {
        Self {
            block_items: SORT_BLOCK_ITEMS,
        }
    }
}

impl RadixSort {
    pub fn with_block_items(block_items: usize) -> Self {
        Self {
            block_items: block_items.max(1),
        }
    }

    fn temp_storage_bytes(&self, n: usize) -> usize {
        let grid = n.div_ceil(self.block_items);
        // Slack so the counters can be aligned inside a byte buffer.
        grid * RADIX_BINS * size_of::<usize>() + align_of::<usize>() - 1
    }

    /// Sort the first `n` pairs ascending by key.
    ///
    /// With `temp_storage == None` nothing is sorted and the required scratch
    /// size in bytes is returned. Otherwise the scratch must be at least that
    /// large; the pairs are sorted (stable) and the same size is returned.
    /// Afterwards `keys.current()` and `values.current()` hold the result.
    ///
    /// A fault in any pass, or an error already pending on `stream`, is
    /// returned before the buffer selectors move.
    pub fn sort_pairs<K: GroupKey, V: DeviceWord>(
        &self,
        stream: &Stream,
        temp_storage: Option<&mut [u8]>,
        keys: &mut DoubleBuffer<'_, K>,
        values: &mut DoubleBuffer<'_, V>,
        n: usize,
    ) -> Result<usize> {
        let required = self.temp_storage_bytes(n);
        let Some(temp_storage) = temp_storage else {
            return Ok(required);
        };

        if temp_storage.len() < required {
            return Err(GroupByError::InvalidArgument(format!(
                "sort scratch holds {} bytes, {required} required",
                temp_storage.len()
            )));
        }
        if keys.len() < n || values.len() < n {
            return Err(GroupByError::InvalidArgument(format!(
                "sort buffers shorter than {n} elements"
            )));
        }
        if n <= 1 {
            return Ok(required);
        }

        let config = LaunchConfig::for_threads(n, self.block_items);
        // SAFETY: every bit pattern is a valid usize.
        let (_, counts, _) = unsafe { temp_storage.align_to_mut::<usize>() };
        let counts = &mut counts[..config.grid * RADIX_BINS];

        for pass in 0..K::RADIX_BYTES as u32 {
            let shift = pass * RADIX_BITS;

            self.histogram(stream, config, keys.current(), n, shift, counts);
            stream.last_error()?;
            if !exclusive_scan(counts, config.grid, n) {
                trace!("radix pass {pass}: single digit, skipped");
                continue;
            }
            self.scatter(stream, config, keys, values, n, shift, counts);
            stream.last_error()?;
            keys.flip();
            values.flip();
        }

        Ok(required)
    }

    fn histogram<K: GroupKey>(
        &self,
        stream: &Stream,
        config: LaunchConfig,
        keys: &[K],
        n: usize,
        shift: u32,
        counts: &mut [usize],
    ) {
        let counts = ScatterSlice::new(counts);
        stream.launch_blocks("radix_histogram", config, |block| {
            let mut local = [0usize; RADIX_BINS];
            for &key in &keys[config.block_range(block, n)] {
                local[digit(key, shift)] += 1;
            }
            for (bin, &count) in local.iter().enumerate() {
                // SAFETY: each block owns its own RADIX_BINS counters.
                unsafe { counts.write(block * RADIX_BINS + bin, count)? };
            }
            Ok(())
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn scatter<K: GroupKey, V: DeviceWord>(
        &self,
        stream: &Stream,
        config: LaunchConfig,
        keys: &mut DoubleBuffer<'_, K>,
        values: &mut DoubleBuffer<'_, V>,
        n: usize,
        shift: u32,
        offsets: &[usize],
    ) {
        let (keys_in, keys_out) = keys.split();
        let (values_in, values_out) = values.split();
        let keys_out = ScatterSlice::new(keys_out);
        let values_out = ScatterSlice::new(values_out);

        stream.launch_blocks("radix_scatter", config, |block| {
            let mut cursor = [0usize; RADIX_BINS];
            cursor.copy_from_slice(&offsets[block * RADIX_BINS..(block + 1) * RADIX_BINS]);
            for i in config.block_range(block, n) {
                let key = keys_in[i];
                let bin = digit(key, shift);
                let pos = cursor[bin];
                cursor[bin] += 1;
                // SAFETY: the scan gives every (block, digit) a disjoint range.
                unsafe {
                    keys_out.write(pos, key)?;
                    values_out.write(pos, values_in[i])?;
                }
            }
            Ok(())
        });
    }
}

#[inline(always)]
fn digit<K: GroupKey>(key: K, shift: u32) -> usize {
    ((key.radix_bits() >> shift) & RADIX_MASK) as usize
}

/// Turn per-block counts (block-major) into scatter offsets, digit-major
/// then block. Returns `false` when one digit holds all `n` keys, in which
/// case the pass would be the identity permutation.
fn exclusive_scan(counts: &mut [usize], grid: usize, n: usize) -> bool {
    let mut running = 0;
    let mut moves = true;
    for bin in 0..RADIX_BINS {
        let start = running;
        for block in 0..grid {
            let count = &mut counts[block * RADIX_BINS + bin];
            let c = *count;
            *count = running;
            running += c;
        }
        if running - start == n {
            moves = false;
        }
    }
    debug_assert_eq!(running, n);
    moves
}
