//! Reusable pixel buffers for frame deep copies
//!
//! Every received frame is copied because the source may reuse its buffer as
//! soon as the callback returns. At 30 fps per stream those copies dominate
//! allocation traffic, so buffers released by finished recordings are kept
//! and handed out again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, UsReconError};
use crate::types::ImageFrame;

/// Pool of pixel buffers
#[derive(Debug)]
pub struct FramePool {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    reused: AtomicUsize,
    allocated: AtomicUsize,
}

impl FramePool {
    /// Create a pool keeping at most `capacity` idle buffers
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            capacity,
            reused: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Deep-copy a frame into a pooled buffer
    ///
    /// Fails with [`UsReconError::Allocation`] when a new buffer cannot be
    /// reserved.
    pub fn copy_frame(&self, frame: &ImageFrame) -> Result<ImageFrame> {
        let mut buf = self.acquire(frame.len())?;
        buf.extend(frame.pixels().iter().copied());
        ImageFrame::new(frame.width(), frame.height(), frame.spacing(), buf)
    }

    /// Return a frame's storage to the pool
    pub fn recycle(&self, frame: ImageFrame) {
        let mut buffers = self.lock();
        if buffers.len() < self.capacity {
            let mut buf = frame.into_raw_vec();
            buf.clear();
            buffers.push(buf);
        }
    }

    /// Return shared frames whose last reference is being dropped
    pub fn recycle_shared<I>(&self, frames: I)
    where
        I: IntoIterator<Item = Arc<ImageFrame>>,
    {
        for frame in frames {
            if let Ok(frame) = Arc::try_unwrap(frame) {
                self.recycle(frame);
            }
        }
    }

    /// Number of idle buffers
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    /// Buffers handed out again instead of allocated
    pub fn reused(&self) -> usize {
        self.reused.load(Ordering::Relaxed)
    }

    /// Buffers newly allocated
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn acquire(&self, len: usize) -> Result<Vec<u8>> {
        let pooled = {
            let mut buffers = self.lock();
            buffers
                .iter()
                .position(|b| b.capacity() >= len)
                .map(|idx| buffers.swap_remove(idx))
        };

        if let Some(buf) = pooled {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(buf);
        }

        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|e| {
            UsReconError::Allocation(format!("cannot reserve {} bytes for frame copy: {}", len, e))
        })?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_FRAME_POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_is_deep_and_equal() {
        let pool = FramePool::new(4);
        let frame = ImageFrame::new(3, 2, [0.5, 0.5], vec![1, 2, 3, 4, 5, 6]).unwrap();
        let copy = pool.copy_frame(&frame).unwrap();
        assert_eq!(copy, frame);
        assert_ne!(copy.pixels().as_ptr(), frame.pixels().as_ptr());
    }

    #[test]
    fn test_recycled_buffer_is_reused() {
        let pool = FramePool::new(4);
        let frame = ImageFrame::filled(8, 8, [1.0, 1.0], 7);

        let first = pool.copy_frame(&frame).unwrap();
        assert_eq!(pool.allocated(), 1);
        pool.recycle_shared(vec![Arc::new(first)]);
        assert_eq!(pool.idle(), 1);

        let second = pool.copy_frame(&frame).unwrap();
        assert_eq!(second, frame);
        assert_eq!(pool.reused(), 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_shared_frames_still_referenced_are_not_recycled() {
        let pool = FramePool::new(4);
        let frame = Arc::new(pool.copy_frame(&ImageFrame::filled(2, 2, [1.0, 1.0], 0)).unwrap());
        let _held = frame.clone();
        pool.recycle_shared(vec![frame]);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_capacity_bounds_idle_buffers() {
        let pool = FramePool::new(1);
        pool.recycle(ImageFrame::filled(2, 2, [1.0, 1.0], 0));
        pool.recycle(ImageFrame::filled(2, 2, [1.0, 1.0], 0));
        assert_eq!(pool.idle(), 1);
    }
}
