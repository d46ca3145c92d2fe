//! Video frame recorder
//!
//! Buffers deep copies of every frame a [`VideoSource`] delivers while
//! recording, keyed by the source-reported timestamp.
//!
//! # Clock synchronisation
//!
//! Video devices stamp frames with their own clock. On the first frame of a
//! recording the offset `now - reported` is latched as the sync shift and
//! applied to every read. It is not recomputed until the next
//! [`FrameRecorder::start_record`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backend::source_trait::{FrameEvent, SharedVideoSource};
use crate::clock::Clock;
use crate::error::{Result, UsReconError};
use crate::events::SubscriptionToken;
use crate::types::{ImageFrame, Timestamp};

use super::buffer::SampleBuffer;
use super::frame_pool::FramePool;
use super::types::RecordingWindow;

/// Called once when the recorder hits a fatal fault
pub type FaultHook = Box<dyn Fn(&str, &UsReconError) + Send + Sync>;

#[derive(Default)]
struct RecorderInner {
    frames: SampleBuffer<Arc<ImageFrame>>,
    sync_shift: Option<f64>,
    stored_bytes: u64,
    fault: Option<String>,
    /// Bumped on every start and stop
    generation: u64,
    source: Option<SharedVideoSource>,
    token: Option<SubscriptionToken>,
}

/// Recorder for one video stream
pub struct FrameRecorder {
    stream_id: String,
    clock: Arc<dyn Clock>,
    pool: Arc<FramePool>,
    max_bytes: u64,
    recording: AtomicBool,
    ignored: AtomicUsize,
    inner: Mutex<RecorderInner>,
    fault_hook: Mutex<Option<FaultHook>>,
}

impl std::fmt::Debug for FrameRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRecorder")
            .field("stream_id", &self.stream_id)
            .field("recording", &self.is_recording())
            .field("frames", &self.len())
            .finish()
    }
}

impl FrameRecorder {
    /// Create a recorder for `stream_id`
    pub fn new(stream_id: impl Into<String>, clock: Arc<dyn Clock>, pool: Arc<FramePool>) -> Self {
        Self {
            stream_id: stream_id.into(),
            clock,
            pool,
            max_bytes: 0,
            recording: AtomicBool::new(false),
            ignored: AtomicUsize::new(0),
            inner: Mutex::new(RecorderInner::default()),
            fault_hook: Mutex::new(None),
        }
    }

    /// Limit buffered pixel bytes (0 = unlimited)
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Install the fault notification hook
    pub fn set_fault_hook(&self, hook: FaultHook) {
        *self.fault_hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Stream id
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Check if recording
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Start recording from `source`
    ///
    /// Clears the previous buffer and sync shift. A missing source is logged
    /// and ignored.
    pub fn start_record(self: &Arc<Self>, source: Option<SharedVideoSource>) {
        let Some(source) = source else {
            tracing::warn!("Stream {}: no video source, recording skipped", self.stream_id);
            return;
        };

        self.detach();
        self.clear();

        let weak: Weak<FrameRecorder> = Arc::downgrade(self);
        let token = source.subscribe_frames(Box::new(move |event: &FrameEvent| {
            if let Some(recorder) = weak.upgrade() {
                // Faults are stored and reported through the hook
                let _ = recorder.on_frame(event.timestamp, &event.frame);
            }
        }));

        {
            let mut inner = self.lock();
            inner.source = Some(source);
            inner.token = Some(token);
            inner.generation += 1;
            self.recording.store(true, Ordering::Release);
        }
        tracing::debug!("Stream {}: recording started", self.stream_id);
    }

    /// Stop recording; the buffer becomes read-only
    ///
    /// A frame still being copied on a producer thread is discarded.
    pub fn stop_record(&self) {
        let was_recording = {
            let mut inner = self.lock();
            inner.generation += 1;
            self.recording.swap(false, Ordering::AcqRel)
        };
        self.detach();
        if was_recording {
            tracing::debug!(
                "Stream {}: recording stopped with {} frames ({} ignored)",
                self.stream_id,
                self.len(),
                self.ignored()
            );
        }
    }

    /// Store a frame delivered by the source
    ///
    /// Frames arriving while not recording, or after a fault, are counted and
    /// ignored.
    pub fn on_frame(&self, reported: Timestamp, frame: &ImageFrame) -> Result<()> {
        if !self.is_recording() {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        if !reported.is_finite() {
            tracing::warn!("Stream {}: non-finite frame timestamp dropped", self.stream_id);
            self.ignored.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let now = self.clock.now();
        let bytes = frame.len() as u64;

        let generation = {
            let mut inner = self.lock();
            if inner.fault.is_some() || !self.is_recording() {
                drop(inner);
                self.ignored.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            inner.sync_shift.get_or_insert_with(|| {
                let shift = now - reported;
                tracing::debug!("Stream {}: sync shift latched at {:.3} ms", self.stream_id, shift);
                shift
            });
            if self.max_bytes > 0 && inner.stored_bytes + bytes > self.max_bytes {
                drop(inner);
                return Err(self.fail(UsReconError::Allocation(format!(
                    "stream {} exceeded its buffer limit of {} bytes",
                    self.stream_id, self.max_bytes
                ))));
            }
            inner.generation
        };

        let copy = match self.pool.copy_frame(frame) {
            Ok(copy) => copy,
            Err(e) => return Err(self.fail(e)),
        };

        let mut inner = self.lock();
        if !self.is_recording() || inner.generation != generation || inner.fault.is_some() {
            drop(inner);
            self.ignored.fetch_add(1, Ordering::Relaxed);
            self.pool.recycle(copy);
            return Ok(());
        }
        inner.frames.insert(reported, Arc::new(copy));
        inner.stored_bytes += bytes;
        Ok(())
    }

    /// Frames whose wall-clock time lies in `[start, stop]`
    ///
    /// The bounds are translated into source time with the latched sync
    /// shift. The stored recording is not modified.
    pub fn get_recording(&self, start: Timestamp, stop: Timestamp) -> RecordingWindow<Arc<ImageFrame>> {
        let inner = self.lock();
        let shift = inner.sync_shift.unwrap_or(0.0);
        RecordingWindow {
            sync_shift: shift,
            samples: inner.frames.window(start - shift, stop - shift),
        }
    }

    /// Every stored frame
    pub fn get_all(&self) -> RecordingWindow<Arc<ImageFrame>> {
        let inner = self.lock();
        RecordingWindow {
            sync_shift: inner.sync_shift.unwrap_or(0.0),
            samples: inner.frames.as_slice().to_vec(),
        }
    }

    /// Latched sync shift, if a frame has been received
    pub fn sync_shift(&self) -> Option<f64> {
        self.lock().sync_shift
    }

    /// Fatal fault recorded during this recording
    pub fn fault(&self) -> Option<String> {
        self.lock().fault.clone()
    }

    /// Number of stored frames
    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    /// Check if no frames are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames ignored because the recorder was not accepting them
    pub fn ignored(&self) -> usize {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Discard all frames and the sync shift
    pub fn clear(&self) {
        let frames = {
            let mut inner = self.lock();
            inner.sync_shift = None;
            inner.fault = None;
            inner.stored_bytes = 0;
            inner.frames.take()
        };
        self.ignored.store(0, Ordering::Relaxed);
        self.pool.recycle_shared(frames.into_iter().map(|s| s.value));
    }

    fn detach(&self) {
        let (source, token) = {
            let mut inner = self.lock();
            (inner.source.take(), inner.token.take())
        };
        if let (Some(source), Some(token)) = (source, token) {
            source.unsubscribe(token);
        }
    }

    fn fail(&self, error: UsReconError) -> UsReconError {
        tracing::error!("Stream {}: recorder fault: {}", self.stream_id, error);
        let first = {
            let mut inner = self.lock();
            if inner.fault.is_none() {
                inner.fault = Some(error.to_string());
                true
            } else {
                false
            }
        };
        if first {
            if let Some(hook) = self.fault_hook.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                hook(&self.stream_id, &error);
            }
        }
        error
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for FrameRecorder {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock_source::MockVideoSource;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    fn recorder(clock: Arc<ManualClock>) -> Arc<FrameRecorder> {
        Arc::new(FrameRecorder::new("video", clock, Arc::new(FramePool::new(16))))
    }

    fn frame(value: u8) -> ImageFrame {
        ImageFrame::filled(4, 4, [1.0, 1.0], value)
    }

    #[test]
    fn test_sync_shift_latched_on_first_frame() {
        let clock = Arc::new(ManualClock::new(10_000.0));
        let source = Arc::new(MockVideoSource::new("video"));
        let rec = recorder(clock.clone());
        rec.start_record(Some(source.clone()));

        source.emit_frame(500.0, frame(1));
        assert_eq!(rec.sync_shift(), Some(9_500.0));

        // Source clock drifts; the shift stays
        clock.advance(100.0);
        source.emit_frame(550.0, frame(2));
        assert_eq!(rec.sync_shift(), Some(9_500.0));

        let window = rec.get_recording(10_000.0, 10_050.0);
        let walls: Vec<f64> = window.wall_clock().map(|(t, _)| t).collect();
        assert_eq!(walls, vec![10_000.0, 10_050.0]);
    }

    #[test]
    fn test_restart_resets_shift_and_buffer() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let source = Arc::new(MockVideoSource::new("video"));
        let rec = recorder(clock.clone());

        rec.start_record(Some(source.clone()));
        source.emit_frame(0.0, frame(1));
        rec.stop_record();
        assert_eq!(rec.sync_shift(), Some(1_000.0));

        clock.set(5_000.0);
        rec.start_record(Some(source.clone()));
        assert_eq!(rec.sync_shift(), None);
        assert!(rec.is_empty());

        source.emit_frame(100.0, frame(2));
        assert_eq!(rec.sync_shift(), Some(4_900.0));
    }

    #[test]
    fn test_frames_after_stop_are_ignored() {
        let clock = Arc::new(ManualClock::new(0.0));
        let source = Arc::new(MockVideoSource::new("video"));
        let rec = recorder(clock);

        rec.start_record(Some(source.clone()));
        source.emit_frame(1.0, frame(1));
        rec.stop_record();
        source.emit_frame(2.0, frame(2));
        rec.on_frame(3.0, &frame(3)).unwrap();

        assert_eq!(rec.len(), 1);
        assert_eq!(rec.ignored(), 1);
    }

    #[test]
    fn test_missing_source_is_ignored() {
        let rec = recorder(Arc::new(ManualClock::new(0.0)));
        rec.start_record(None);
        assert!(!rec.is_recording());
    }

    #[test]
    fn test_deep_copy_survives_source_buffer_reuse() {
        let clock = Arc::new(ManualClock::new(0.0));
        let rec = recorder(clock);
        rec.start_record(Some(Arc::new(MockVideoSource::new("video"))));

        let buffer = frame(10);
        rec.on_frame(0.0, &buffer).unwrap();
        drop(buffer);

        let window = rec.get_all();
        assert_eq!(window.samples[0].value.get(0, 0), Some(10));
    }

    #[test]
    fn test_byte_limit_is_fatal_fault() {
        let clock = Arc::new(ManualClock::new(0.0));
        let rec = Arc::new(
            FrameRecorder::new("video", clock, Arc::new(FramePool::new(4))).with_max_bytes(20),
        );
        let faults = Arc::new(AtomicUsize::new(0));
        let f = faults.clone();
        rec.set_fault_hook(Box::new(move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        rec.start_record(Some(Arc::new(MockVideoSource::new("video"))));

        assert!(rec.on_frame(0.0, &frame(1)).is_ok());
        let err = rec.on_frame(1.0, &frame(2)).unwrap_err();
        assert!(matches!(err, UsReconError::Allocation(_)));
        assert!(rec.fault().is_some());

        // Further frames are dropped silently; the hook fires once
        assert!(rec.on_frame(2.0, &frame(3)).is_ok());
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert_eq!(rec.len(), 1);
    }

    #[test]
    fn test_empty_and_inverted_windows() {
        let rec = recorder(Arc::new(ManualClock::new(0.0)));
        assert!(rec.get_recording(0.0, 100.0).is_empty());

        rec.start_record(Some(Arc::new(MockVideoSource::new("video"))));
        rec.on_frame(0.0, &frame(1)).unwrap();
        assert!(rec.get_recording(10.0, 0.0).is_empty());
    }

    /// Clock that runs `action` on the recorder the first time it is read
    struct InterleavingClock {
        target: Mutex<Option<(Weak<FrameRecorder>, fn(&FrameRecorder))>>,
    }

    impl Clock for InterleavingClock {
        fn now(&self) -> Timestamp {
            let pending = self.target.lock().unwrap().take();
            if let Some((weak, action)) = pending {
                if let Some(rec) = weak.upgrade() {
                    action(&rec);
                }
            }
            0.0
        }
    }

    fn interleaved(action: fn(&FrameRecorder)) -> Arc<FrameRecorder> {
        let clock = Arc::new(InterleavingClock {
            target: Mutex::new(None),
        });
        let rec = Arc::new(FrameRecorder::new("video", clock.clone(), Arc::new(FramePool::new(4))));
        rec.start_record(Some(Arc::new(MockVideoSource::new("video"))));
        *clock.target.lock().unwrap() = Some((Arc::downgrade(&rec), action));
        rec
    }

    #[test]
    fn test_frame_in_flight_during_stop_is_discarded() {
        let rec = interleaved(|rec| rec.stop_record());
        rec.on_frame(1.0, &frame(1)).unwrap();

        assert!(!rec.is_recording());
        assert!(rec.is_empty());
        assert_eq!(rec.ignored(), 1);
    }

    #[test]
    fn test_frame_in_flight_during_cancel_is_discarded() {
        let rec = interleaved(|rec| {
            rec.stop_record();
            rec.clear();
        });
        rec.on_frame(1.0, &frame(1)).unwrap();

        assert!(rec.is_empty());
        assert_eq!(rec.get_all().len(), 0);
    }

    #[test]
    fn test_concurrent_producers_and_reader() {
        const PER_PRODUCER: usize = 500;
        let clock = Arc::new(ManualClock::new(0.0));
        let rec = Arc::new(FrameRecorder::new("video", clock, Arc::new(FramePool::new(64))));
        rec.start_record(Some(Arc::new(MockVideoSource::new("video"))));

        let producers: Vec<_> = (0..2)
            .map(|p| {
                let rec = rec.clone();
                std::thread::spawn(move || {
                    // Interleaved timestamps: producer 0 even, producer 1 odd
                    for i in 0..PER_PRODUCER {
                        let t = (2 * i + p) as f64;
                        rec.on_frame(t, &frame(p as u8)).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let rec = rec.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let window = rec.get_recording(f64::MIN, f64::MAX);
                    let times: Vec<f64> = window.samples.iter().map(|s| s.timestamp).collect();
                    assert!(times.windows(2).all(|w| w[0] <= w[1]));
                }
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        reader.join().unwrap();

        let all = rec.get_all();
        assert_eq!(all.len(), 2 * PER_PRODUCER);
        let times: Vec<f64> = all.samples.iter().map(|s| s.timestamp).collect();
        let expected: Vec<f64> = (0..2 * PER_PRODUCER).map(|i| i as f64).collect();
        assert_eq!(times, expected);
    }

    proptest! {
        #[test]
        fn prop_window_contains_exactly_frames_in_bounds(
            offsets in proptest::collection::vec(0u32..2_000, 1..40),
            shift in -5_000i32..5_000,
            a in 0u32..2_500,
            b in 0u32..2_500,
        ) {
            let clock = Arc::new(ManualClock::new(100_000.0));
            let rec = recorder(clock.clone());
            rec.start_record(Some(Arc::new(MockVideoSource::new("video"))));

            // First frame fixes the shift; integer times keep arithmetic exact
            let base = 100_000.0 - shift as f64;
            let mut expected = Vec::new();
            for (i, off) in offsets.iter().enumerate() {
                let reported = if i == 0 { base } else { base + *off as f64 };
                rec.on_frame(reported, &frame(i as u8)).unwrap();
                expected.push(reported + shift as f64);
            }

            let (start, stop) = (100_000.0 + a as f64, 100_000.0 + b as f64);
            let window = rec.get_recording(start, stop);
            let before = rec.len();
            let again = rec.get_recording(start, stop);

            let mut want: Vec<f64> = expected
                .into_iter()
                .filter(|t| start <= *t && *t <= stop)
                .collect();
            want.sort_by(|x, y| x.partial_cmp(y).unwrap());
            let got: Vec<f64> = window.wall_clock().map(|(t, _)| t).collect();

            prop_assert_eq!(&got, &want);
            prop_assert_eq!(rec.len(), before);
            prop_assert_eq!(
                again.samples.iter().map(|s| s.timestamp).collect::<Vec<_>>(),
                window.samples.iter().map(|s| s.timestamp).collect::<Vec<_>>()
            );
        }
    }
}
