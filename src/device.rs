//! In-process compute device.
//!
//! A [`Device`] owns a bounded memory pool shared by everyone holding it.
//! Work is issued on a [`Stream`], an execution queue with its own error
//! state; independent callers each open their own stream on the same device.
//! Kernels are launched as a grid of fixed-size blocks; worker threads claim
//! blocks from a shared cursor until the grid is exhausted. Every launch runs
//! to completion before it returns, so launches on a stream are ordered.
//!
//! Faults raised by a kernel (an `Err` from a block, or a panic) are recorded
//! as the stream's sticky error and surface through [`Stream::last_error`] or
//! [`Stream::synchronize`]. While an error is pending, further launches on
//! that stream are skipped. Other streams are unaffected.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use log::{trace, warn};

use crate::error::{GroupByError, Result};

/// Threads per block used by the group-by kernels.
pub const THREAD_BLOCK_SIZE: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Upper bound on bytes held by live [`DeviceBuffer`]s.
    pub memory_limit: usize,
    /// OS threads executing blocks.
    pub workers: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_limit: usize::MAX,
            workers: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl DeviceConfig {
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Grid geometry of a launch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: usize,
    pub block: usize,
}

impl LaunchConfig {
    /// Smallest grid of `block`-sized blocks covering `threads`.
    pub fn for_threads(threads: usize, block: usize) -> Self {
        debug_assert!(block > 0);
        Self {
            grid: threads.div_ceil(block),
            block,
        }
    }

    /// Range of global thread ids covered by `block`, clipped to `limit`.
    #[inline(always)]
    pub fn block_range(&self, block: usize, limit: usize) -> std::ops::Range<usize> {
        let start = block * self.block;
        start.min(limit)..(start + self.block).min(limit)
    }
}

pub struct Device {
    config: DeviceConfig,
    allocated: AtomicUsize,
}

impl Device {
    /// Create a device. The returned `Arc` is shared by every buffer and
    /// stream created from it.
    pub fn new(config: DeviceConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            allocated: AtomicUsize::new(0),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DeviceConfig::default())
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Open a new execution stream with a clean error state.
    pub fn stream(self: &Arc<Self>) -> Stream {
        Stream {
            device: Arc::clone(self),
            last_error: Mutex::new(None),
        }
    }

    /// Bytes currently held by live buffers.
    pub fn memory_used(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn memory_available(&self) -> usize {
        self.config.memory_limit.saturating_sub(self.memory_used())
    }

    /// Allocate `len` elements, each produced by `init(index)`.
    pub fn alloc_with<T>(
        self: &Arc<Self>,
        len: usize,
        init: impl FnMut(usize) -> T,
    ) -> Result<DeviceBuffer<T>> {
        let bytes = len
            .checked_mul(size_of::<T>())
            .ok_or(GroupByError::ResourceExhausted {
                requested: usize::MAX,
                available: self.memory_available(),
            })?;
        self.reserve(bytes)?;
        let data: Box<[T]> = (0..len).map(init).collect();
        Ok(DeviceBuffer {
            data,
            bytes,
            device: Arc::clone(self),
        })
    }

    pub fn alloc_filled<T: Clone>(
        self: &Arc<Self>,
        len: usize,
        value: T,
    ) -> Result<DeviceBuffer<T>> {
        self.alloc_with(len, |_| value.clone())
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        let limit = self.config.memory_limit;
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= limit)
            })
            .map(|_| ())
            .map_err(|used| GroupByError::ResourceExhausted {
                requested: bytes,
                available: limit.saturating_sub(used),
            })
    }

    fn release(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Ordered queue of kernel launches on a [`Device`].
///
/// The sticky error belongs to the stream, so two calls running on one
/// device never observe or clear each other's faults.
pub struct Stream {
    device: Arc<Device>,
    last_error: Mutex<Option<GroupByError>>,
}

impl Stream {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Launch one logical thread per global id in `0..threads`.
    pub fn launch<F>(&self, name: &str, config: LaunchConfig, threads: usize, kernel: F)
    where
        F: Fn(usize) -> Result<()> + Sync,
    {
        self.launch_blocks(name, config, |block| {
            for tid in config.block_range(block, threads) {
                kernel(tid)?;
            }
            Ok(())
        });
    }

    /// Launch `config.grid` blocks; `kernel` receives the block index and is
    /// responsible for every thread in it.
    pub fn launch_blocks<F>(&self, name: &str, config: LaunchConfig, kernel: F)
    where
        F: Fn(usize) -> Result<()> + Sync,
    {
        if self.error_pending() {
            warn!("skipping launch of `{name}`: stream has a pending error");
            return;
        }
        if config.grid == 0 {
            return;
        }

        let workers = self.device.config.workers.min(config.grid).max(1);
        trace!(
            "launch `{name}`: grid={} block={} workers={workers}",
            config.grid, config.block
        );

        let cursor = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let kernel = &kernel;
        let cursor = &cursor;
        let abort = &abort;

        thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    s.spawn(move || {
                        while !abort.load(Ordering::Relaxed) {
                            let block = cursor.fetch_add(1, Ordering::Relaxed);
                            if block >= config.grid {
                                break;
                            }
                            if let Err(err) = kernel(block) {
                                abort.store(true, Ordering::Relaxed);
                                self.record_error(name, err);
                                break;
                            }
                        }
                    })
                })
                .collect();

            for handle in handles {
                if handle.join().is_err() {
                    abort.store(true, Ordering::Relaxed);
                    self.record_error(
                        name,
                        GroupByError::DeviceFault(format!("kernel `{name}` panicked")),
                    );
                }
            }
        });
    }

    /// Keeps the first error; later ones are dropped.
    fn record_error(&self, kernel: &str, err: GroupByError) {
        warn!("kernel `{kernel}` faulted: {err}");
        let mut slot = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn error_pending(&self) -> bool {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Return and clear the pending error, if any.
    pub fn last_error(&self) -> Result<()> {
        match self
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Block until all launched work is complete and report its outcome.
    ///
    /// Launches already run to completion, so this only drains the sticky
    /// error.
    pub fn synchronize(&self) -> Result<()> {
        self.last_error()
    }
}

/// Device-resident allocation. The reservation is returned to the pool
/// exactly once, when the buffer is dropped.
pub struct DeviceBuffer<T> {
    data: Box<[T]>,
    bytes: usize,
    device: Arc<Device>,
}

impl<T> DeviceBuffer<T> {
    pub fn size_in_bytes(&self) -> usize {
        self.bytes
    }
}

impl<T> Deref for DeviceBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> DerefMut for DeviceBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        self.device.release(self.bytes);
    }
}

/// Wrapper to send raw pointers across thread boundaries.
///
/// Safety: callers must ensure threads write to disjoint memory regions.
#[derive(Copy, Clone)]
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

/// A mutable slice that many kernel threads write into at distinct indices.
pub(crate) struct ScatterSlice<'a, T> {
    ptr: SendPtr<T>,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<'a, T: Copy> ScatterSlice<'a, T> {
    pub(crate) fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: SendPtr(slice.as_mut_ptr()),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    /// Bounds-checked store.
    ///
    /// Safety: no other thread may access `index` during this launch.
    #[inline(always)]
    pub(crate) unsafe fn write(&self, index: usize, value: T) -> Result<()> {
        if index >= self.len {
            return Err(GroupByError::DeviceFault(format!(
                "write to index {index} out of bounds for length {}",
                self.len
            )));
        }
        unsafe { self.ptr.0.add(index).write(value) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_with(workers: usize) -> Arc<Device> {
        Device::new(DeviceConfig::default().with_workers(workers))
    }

    fn stream(workers: usize) -> Stream {
        device_with(workers).stream()
    }

    #[test]
    fn launch_covers_every_thread_once() {
        let stream = stream(4);
        let hits: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
        stream.launch("count", LaunchConfig::for_threads(1000, 64), 1000, |tid| {
            hits[tid].fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        stream.synchronize().unwrap();
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn launch_geometry() {
        let cfg = LaunchConfig::for_threads(1000, 256);
        assert_eq!(cfg.grid, 4);
        assert_eq!(cfg.block_range(3, 1000), 768..1000);
        assert_eq!(LaunchConfig::for_threads(0, 256).grid, 0);
    }

    #[test]
    fn first_error_is_sticky_then_cleared() {
        let stream = stream(2);
        stream.launch("fail", LaunchConfig::for_threads(10, 1), 10, |tid| {
            Err(GroupByError::TableOverflow { capacity: tid })
        });
        assert!(matches!(
            stream.last_error(),
            Err(GroupByError::TableOverflow { .. })
        ));
        assert_eq!(stream.last_error(), Ok(()));
    }

    #[test]
    fn pending_error_skips_later_launches() {
        let stream = stream(1);
        stream.launch("fail", LaunchConfig::for_threads(1, 1), 1, |_| {
            Err(GroupByError::DeviceFault("first".into()))
        });
        let ran = AtomicBool::new(false);
        stream.launch("after", LaunchConfig::for_threads(1, 1), 1, |_| {
            ran.store(true, Ordering::Relaxed);
            Ok(())
        });
        assert!(!ran.load(Ordering::Relaxed));
        assert_eq!(
            stream.synchronize(),
            Err(GroupByError::DeviceFault("first".into()))
        );
    }

    #[test]
    fn panic_becomes_device_fault() {
        let stream = stream(2);
        stream.launch("panics", LaunchConfig::for_threads(4, 1), 4, |tid| {
            if tid == 2 {
                panic!("kernel bug");
            }
            Ok(())
        });
        assert!(matches!(stream.synchronize(), Err(GroupByError::DeviceFault(_))));
    }

    #[test]
    fn streams_keep_errors_apart() {
        let dev = device_with(2);
        let faulty = dev.stream();
        let healthy = dev.stream();
        faulty.launch("fail", LaunchConfig::for_threads(1, 1), 1, |_| {
            Err(GroupByError::DeviceFault("faulty".into()))
        });

        let ran = AtomicBool::new(false);
        healthy.launch("ok", LaunchConfig::for_threads(1, 1), 1, |_| {
            ran.store(true, Ordering::Relaxed);
            Ok(())
        });
        assert!(ran.load(Ordering::Relaxed));
        assert_eq!(healthy.synchronize(), Ok(()));
        assert_eq!(
            faulty.synchronize(),
            Err(GroupByError::DeviceFault("faulty".into()))
        );
    }

    #[test]
    fn streams_run_concurrently_on_one_device() {
        let dev = device_with(2);
        thread::scope(|s| {
            for round in 0..8 {
                let dev = &dev;
                s.spawn(move || {
                    let stream = dev.stream();
                    stream.launch("maybe_fail", LaunchConfig::for_threads(64, 8), 64, |tid| {
                        if round % 2 == 0 && tid == 17 {
                            return Err(GroupByError::TableOverflow { capacity: round });
                        }
                        Ok(())
                    });
                    let res = stream.synchronize();
                    if round % 2 == 0 {
                        assert_eq!(res, Err(GroupByError::TableOverflow { capacity: round }));
                    } else {
                        assert_eq!(res, Ok(()));
                    }
                });
            }
        });
    }

    #[test]
    fn buffers_return_memory_on_drop() {
        let dev = Device::new(DeviceConfig::default().with_memory_limit(1024));
        {
            let a = dev.alloc_filled(64, 0u64).unwrap();
            assert_eq!(a.size_in_bytes(), 512);
            assert_eq!(dev.memory_used(), 512);
            let b = dev.alloc_filled(100, 0u64);
            assert_eq!(
                b.err(),
                Some(GroupByError::ResourceExhausted {
                    requested: 800,
                    available: 512
                })
            );
            // The failed allocation reserved nothing.
            assert_eq!(dev.memory_used(), 512);
            drop(a);
            assert_eq!(dev.memory_used(), 0);
            let _c = dev.alloc_filled(128, 0u64).unwrap();
            assert_eq!(dev.memory_available(), 0);
        }
        assert_eq!(dev.memory_used(), 0);
    }

    #[test]
    fn scatter_rejects_out_of_bounds() {
        let mut out = vec![0u32; 4];
        let scatter = ScatterSlice::new(&mut out);
        unsafe {
            scatter.write(3, 9).unwrap();
            assert!(scatter.write(4, 1).is_err());
        }
        assert_eq!(out, vec![0, 0, 0, 9]);
    }
}
