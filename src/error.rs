//! Error taxonomy for a group-by call.
//!
//! Every failure is fatal to the call that produced it. The first error
//! recorded by any stage short-circuits the pipeline and is handed back to
//! the caller unchanged.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupByError {
    /// Empty input, mismatched column lengths, undersized outputs, a null
    /// pointer at the raw entry point, a reserved key, or a bad config.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The device pool could not satisfy an allocation.
    #[error("device memory exhausted: requested {requested} bytes, {available} available")]
    ResourceExhausted { requested: usize, available: usize },

    /// A probe visited every slot without finding an empty or matching one.
    #[error("hash table overflow: no free slot in {capacity} slots")]
    TableOverflow { capacity: usize },

    /// Any other execution fault surfaced by a kernel.
    #[error("device fault: {0}")]
    DeviceFault(String),
}

pub type Result<T> = std::result::Result<T, GroupByError>;

/// Status code reported by [`group_by_raw`](crate::group_by_raw).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    InvalidArgument = 1,
    ResourceExhausted = 2,
    TableOverflow = 3,
    DeviceFault = 4,
}

impl From<&GroupByError> for StatusCode {
    fn from(err: &GroupByError) -> Self {
        match err {
            GroupByError::InvalidArgument(_) => StatusCode::InvalidArgument,
            GroupByError::ResourceExhausted { .. } => StatusCode::ResourceExhausted,
            GroupByError::TableOverflow { .. } => StatusCode::TableOverflow,
            GroupByError::DeviceFault(_) => StatusCode::DeviceFault,
        }
    }
}

impl<T> From<&Result<T>> for StatusCode {
    fn from(res: &Result<T>) -> Self {
        match res {
            Ok(_) => StatusCode::Success,
            Err(e) => e.into(),
        }
    }
}
