//! Volume reconstruction
//!
//! Turns a stopped recording into a voxel volume in two steps:
//!
//! 1. [`ReconstructionInputAssembler`] joins each frame with the probe pose
//!    interpolated at the frame's wall-clock time, dropping frames without
//!    close tracking data.
//! 2. [`VolumeReconstructor`] inserts the pixels of every assembled frame into
//!    an axis-aligned grid and averages overlapping contributions.
//!
//! Both steps are pure functions of their inputs and run on the
//! reconstruction worker thread.

pub mod assembler;
pub mod interpolator;
pub mod reconstructor;
pub mod volume;

pub use assembler::{AssembledFrame, DropStats, ReconstructInputData, ReconstructionInputAssembler};
pub use interpolator::InterpolationKernel;
pub use reconstructor::{ReconstructionResult, VolumeReconstructor};
pub use volume::{GridGeometry, Volume};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared with a running job
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Check if both tokens share one flag
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}
