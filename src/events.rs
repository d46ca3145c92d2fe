//! Notifications
//!
//! Two mechanisms are used:
//!
//! - [`Signal`] - synchronous observer list. Producers (video sources, trackers)
//!   call handlers on their own thread. Subscribing returns a
//!   [`SubscriptionToken`] used to unsubscribe.
//! - [`EventBus`] - crossbeam channel carrying [`AcquisitionEvent`]s from the
//!   acquisition core and the reconstruction worker to the application.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::session::SessionState;

/// Capacity of the event channel
///
/// The last eighth is kept for events that must not be lost; progress,
/// readiness and warnings are dropped (and logged) once the rest is full.
pub const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Tokens are unique across all signals in the process, so a source owning
/// several signals can route `unsubscribe` without knowing which one issued it.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Handle identifying a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Thread-safe observer list
pub struct Signal<T> {
    handlers: Mutex<Vec<(SubscriptionToken, Handler<T>)>>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<T> Signal<T> {
    /// Create an empty signal
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        self.lock().push((token, Arc::new(handler)));
        token
    }

    /// Remove a handler; returns false if the token was unknown
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(t, _)| *t != token);
        handlers.len() != before
    }

    /// Call every handler with `value`
    ///
    /// Handlers run outside the lock so they may subscribe or unsubscribe.
    pub fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(value);
        }
    }

    /// Number of registered handlers
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionToken, Handler<T>)>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-stream result line of a finished reconstruction
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    /// Video stream id
    pub stream_id: String,
    /// Frames inserted into the volume
    pub frames_used: usize,
    /// Frames dropped by the assembler
    pub frames_dropped: usize,
    /// Output grid size `(x, y, z)`
    pub dimensions: (usize, usize, usize),
    /// Output voxel spacing in mm
    pub spacing: f64,
    /// Error message if this stream failed
    pub error: Option<String>,
}

/// Notification published by the acquisition core
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    /// Readiness level changed
    ReadinessChanged { ready: bool, reason: Option<String> },
    /// A session changed state
    StateChanged {
        session_id: String,
        state: SessionState,
    },
    /// A recording was cancelled and its data discarded
    RecordingCancelled { session_id: String },
    /// A recorder failed to store a frame
    RecordingFault {
        session_id: String,
        stream_id: String,
        message: String,
    },
    /// Reconstruction progress, once per processed frame
    ReconstructionProgress {
        session_id: String,
        stream_id: String,
        processed: usize,
        total: usize,
    },
    /// Post-processing completed
    ReconstructionFinished {
        session_id: String,
        streams: Vec<StreamSummary>,
    },
    /// Post-processing failed; the recording is kept
    ReconstructionFailed { session_id: String, message: String },
    /// Post-processing was cancelled by the user
    ReconstructionCancelled { session_id: String },
    /// Non-fatal condition worth showing to the user
    Warning { message: String },
    /// The reconstruction worker stopped
    Shutdown,
}

impl AcquisitionEvent {
    /// Events superseded by later ones of the same kind
    pub fn is_lossy(&self) -> bool {
        matches!(
            self,
            AcquisitionEvent::ReconstructionProgress { .. }
                | AcquisitionEvent::ReadinessChanged { .. }
                | AcquisitionEvent::Warning { .. }
        )
    }
}

/// Sending side of the acquisition event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Sender<AcquisitionEvent>,
    /// Queue length above which lossy events are dropped
    lossy_limit: usize,
}

impl EventBus {
    /// Create a bus and the receiver the application drains
    pub fn new() -> (Self, Receiver<AcquisitionEvent>) {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    /// Create a bus holding at most `capacity` undrained events
    pub fn with_capacity(capacity: usize) -> (Self, Receiver<AcquisitionEvent>) {
        let capacity = capacity.max(2);
        let (tx, rx) = bounded(capacity);
        let bus = Self {
            sender: tx,
            lossy_limit: capacity - (capacity / 8).max(1),
        };
        (bus, rx)
    }

    /// Publish without blocking
    ///
    /// Outcome and state events may use the reserved tail of the channel;
    /// they are only lost if the receiver stops draining altogether.
    pub fn publish(&self, event: AcquisitionEvent) {
        if event.is_lossy() && self.sender.len() >= self.lossy_limit {
            tracing::debug!("Event channel busy, dropping {:?}", event);
            return;
        }
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::error!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!("Event receiver gone");
            }
        }
    }

    /// Publish a user-visible warning and log it
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.publish(AcquisitionEvent::Warning { message });
    }
}

/// Drain all pending events without blocking
pub fn drain(receiver: &Receiver<AcquisitionEvent>) -> Vec<AcquisitionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}
