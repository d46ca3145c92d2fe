//! Acquisition readiness
//!
//! Recording may start only when the tracker is tracking, at least one video
//! stream is connected and (unless disabled) a probe tool with usable geometry
//! is known. The [`ReadinessMonitor`] re-evaluates this level whenever a
//! source reports a status change and publishes transitions on the event bus.

use std::sync::{Arc, Mutex, Weak};

use crate::backend::source_trait::{SharedTrackingSource, SharedVideoSource, StatusEvent};
use crate::events::{AcquisitionEvent, SubscriptionToken};

use super::acquisition::AcquisitionContext;

/// Readiness level with the first unmet requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// All requirements met
    pub ready: bool,
    /// Why recording cannot start
    pub reason: Option<String>,
}

impl Readiness {
    fn ready() -> Self {
        Self {
            ready: true,
            reason: None,
        }
    }

    fn not_ready(reason: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: Some(reason.into()),
        }
    }
}

/// Evaluate readiness from the current source states
pub fn evaluate(context: &AcquisitionContext) -> Readiness {
    let Some(tracking) = &context.tracking else {
        return Readiness::not_ready("no tracking source configured");
    };
    if !tracking.is_tracking() {
        return Readiness::not_ready("tracker is not tracking");
    }
    if !context.video_sources.iter().any(|v| v.is_connected()) {
        return Readiness::not_ready("no video stream connected");
    }
    if context.settings.require_probe {
        match context.probe_tool() {
            Some(tool) if tool.is_valid_probe() => {}
            Some(tool) => {
                return Readiness::not_ready(format!("probe tool {} has no valid geometry", tool.id))
            }
            None => return Readiness::not_ready("no probe tool available"),
        }
    }
    Readiness::ready()
}

enum Subscription {
    Tracking(SharedTrackingSource, SubscriptionToken),
    Video(SharedVideoSource, SubscriptionToken),
}

/// Level-triggered readiness watcher
pub struct ReadinessMonitor {
    context: Arc<AcquisitionContext>,
    last: Mutex<Option<bool>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for ReadinessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessMonitor")
            .field("last", &*self.last.lock().unwrap_or_else(|e| e.into_inner()))
            .finish()
    }
}

impl ReadinessMonitor {
    /// Create a monitor; call [`ReadinessMonitor::start`] to subscribe
    pub fn new(context: Arc<AcquisitionContext>) -> Self {
        Self {
            context,
            last: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to source status changes and publish the initial level
    pub fn start(self: &Arc<Self>) {
        self.stop();

        let mut subscriptions = Vec::new();
        if let Some(tracking) = &self.context.tracking {
            let token = tracking.subscribe_status(self.status_handler());
            subscriptions.push(Subscription::Tracking(tracking.clone(), token));
        }
        for video in &self.context.video_sources {
            let token = video.subscribe_status(self.status_handler());
            subscriptions.push(Subscription::Video(video.clone(), token));
        }
        *self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()) = subscriptions;

        self.refresh();
    }

    /// Remove all status subscriptions
    pub fn stop(&self) {
        let subscriptions =
            std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()));
        for subscription in subscriptions {
            match subscription {
                Subscription::Tracking(source, token) => source.unsubscribe(token),
                Subscription::Video(source, token) => source.unsubscribe(token),
            }
        }
    }

    /// Current readiness, evaluated now
    pub fn current(&self) -> Readiness {
        evaluate(&self.context)
    }

    /// Re-evaluate and publish if the level changed
    pub fn refresh(&self) -> Readiness {
        let readiness = evaluate(&self.context);
        let changed = {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *last != Some(readiness.ready);
            *last = Some(readiness.ready);
            changed
        };

        if changed {
            match &readiness.reason {
                None => tracing::info!("Acquisition ready"),
                Some(reason) => tracing::info!("Acquisition not ready: {}", reason),
            }
            self.context.events.publish(AcquisitionEvent::ReadinessChanged {
                ready: readiness.ready,
                reason: readiness.reason.clone(),
            });
        }
        readiness
    }

    fn status_handler(self: &Arc<Self>) -> Box<dyn Fn(&StatusEvent) + Send + Sync> {
        let weak: Weak<ReadinessMonitor> = Arc::downgrade(self);
        Box::new(move |event: &StatusEvent| {
            tracing::debug!("Source {} active: {}", event.source_id, event.active);
            if let Some(monitor) = weak.upgrade() {
                monitor.refresh();
            }
        })
    }
}

impl Drop for ReadinessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
