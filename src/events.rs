//! Session lifecycle notifications.
//!
//! An [`EventDispatcher`] holds the set of registered listeners. Views made
//! with [`EventDispatcher::with_context`] share that set but stamp every
//! event they dispatch with their own [`EventContext`], so a listener always
//! learns which playback window and period an event belongs to.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::SharedError;
use crate::looper::DeliveryContext;

/// Identifies a media period within the playback timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaPeriodId {
    pub period_uid: u64,
    pub window_sequence_number: u64,
}

/// The (window, period) pair events are stamped with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventContext {
    pub window_index: usize,
    pub media_period_id: Option<MediaPeriodId>,
}

/// Receives session lifecycle events. Every method defaults to a no-op.
pub trait DrmSessionEventListener: Send + Sync {
    fn on_drm_session_acquired(&self, _context: &EventContext) {}

    fn on_drm_keys_loaded(&self, _context: &EventContext) {}

    /// Reported for every fatal session error, including ones that do not
    /// move a session with loaded keys out of its state.
    fn on_drm_session_manager_error(&self, _context: &EventContext, _error: &SharedError) {}

    fn on_drm_keys_restored(&self, _context: &EventContext) {}

    fn on_drm_keys_removed(&self, _context: &EventContext) {}

    fn on_drm_session_released(&self, _context: &EventContext) {}
}

#[derive(Debug, Clone)]
pub enum DrmEvent {
    SessionAcquired,
    KeysLoaded,
    SessionManagerError(SharedError),
    KeysRestored,
    KeysRemoved,
    SessionReleased,
}

impl DrmEvent {
    pub fn deliver(&self, listener: &dyn DrmSessionEventListener, context: &EventContext) {
        match self {
            DrmEvent::SessionAcquired => listener.on_drm_session_acquired(context),
            DrmEvent::KeysLoaded => listener.on_drm_keys_loaded(context),
            DrmEvent::SessionManagerError(error) => {
                listener.on_drm_session_manager_error(context, error)
            }
            DrmEvent::KeysRestored => listener.on_drm_keys_restored(context),
            DrmEvent::KeysRemoved => listener.on_drm_keys_removed(context),
            DrmEvent::SessionReleased => listener.on_drm_session_released(context),
        }
    }
}

struct ListenerEntry {
    delivery: Arc<dyn DeliveryContext>,
    listener: Arc<dyn DrmSessionEventListener>,
    active: Arc<AtomicBool>,
}

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// A context-stamped view over a shared listener set.
#[derive(Clone)]
pub struct EventDispatcher {
    id: u64,
    context: EventContext,
    listeners: Arc<RwLock<Vec<ListenerEntry>>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            id: NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed),
            context: EventContext::default(),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// A new view sharing this listener set, stamping events with the given context.
    pub fn with_context(&self, window_index: usize, media_period_id: Option<MediaPeriodId>) -> Self {
        Self {
            id: NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed),
            context: EventContext {
                window_index,
                media_period_id,
            },
            listeners: self.listeners.clone(),
        }
    }

    /// Identity of this view. Views sharing a listener set still differ here.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context(&self) -> EventContext {
        self.context
    }

    pub fn add_listener(
        &self,
        delivery: Arc<dyn DeliveryContext>,
        listener: Arc<dyn DrmSessionEventListener>,
    ) {
        self.listeners.write().push(ListenerEntry {
            delivery,
            listener,
            active: Arc::new(AtomicBool::new(true)),
        });
    }

    /// Remove every registration of `listener`. Tasks already posted for it
    /// are discarded when they run.
    pub fn remove_listener(&self, listener: &Arc<dyn DrmSessionEventListener>) {
        self.listeners.write().retain(|entry| {
            let same = std::ptr::addr_eq(Arc::as_ptr(&entry.listener), Arc::as_ptr(listener));
            if same {
                entry.active.store(false, Ordering::Release);
            }
            !same
        });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Post `event` to every listener on its own delivery context.
    pub fn dispatch(&self, event: DrmEvent) {
        // Snapshot so inline listeners may register or remove listeners.
        let entries: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|e| (e.delivery.clone(), e.listener.clone(), e.active.clone()))
            .collect();
        for (delivery, listener, active) in entries {
            let event = event.clone();
            let context = self.context;
            delivery.post(Box::new(move || {
                if active.load(Ordering::Acquire) {
                    event.deliver(listener.as_ref(), &context);
                }
            }));
        }
    }

    pub fn drm_session_acquired(&self) {
        self.dispatch(DrmEvent::SessionAcquired);
    }

    pub fn drm_keys_loaded(&self) {
        self.dispatch(DrmEvent::KeysLoaded);
    }

    pub fn drm_session_manager_error(&self, error: SharedError) {
        self.dispatch(DrmEvent::SessionManagerError(error));
    }

    pub fn drm_keys_restored(&self) {
        self.dispatch(DrmEvent::KeysRestored);
    }

    pub fn drm_keys_removed(&self) {
        self.dispatch(DrmEvent::KeysRemoved);
    }

    pub fn drm_session_released(&self) {
        self.dispatch(DrmEvent::SessionReleased);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::Error;
    use crate::looper::{Immediate, Looper};
    use crate::testing::RecordingListener;

    #[test]
    fn views_share_listeners_but_not_context() {
        let base = EventDispatcher::new();
        let listener = Arc::new(RecordingListener::default());
        base.add_listener(Arc::new(Immediate), listener.clone());

        let view = base.with_context(2, None);
        view.drm_keys_loaded();
        base.drm_session_acquired();

        assert_eq!(view.listener_count(), 1);
        assert_ne!(view.id(), base.id());
        let events = listener.events_with_context();
        assert_eq!(events[0], ("keys_loaded".to_string(), 2));
        assert_eq!(events[1], ("acquired".to_string(), 0));
    }

    #[test]
    fn error_event_carries_the_error() {
        let dispatcher = EventDispatcher::new();
        let listener = Arc::new(RecordingListener::default());
        dispatcher.add_listener(Arc::new(Immediate), listener.clone());

        dispatcher.drm_session_manager_error(Arc::new(Error::KeysExpired));

        assert_eq!(listener.events(), vec!["error"]);
        assert!(matches!(&*listener.errors()[0], Error::KeysExpired));
    }

    #[test]
    fn removed_listener_skips_queued_tasks() {
        let looper = Arc::new(Looper::spawn("events-test").unwrap());
        let dispatcher = EventDispatcher::new();
        let recording = Arc::new(RecordingListener::default());
        let listener: Arc<dyn DrmSessionEventListener> = recording.clone();

        // Block the looper so the events below stay queued.
        let (gate_tx, gate_rx) = kanal::bounded::<()>(0);
        looper.post(Box::new(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
        }));

        dispatcher.add_listener(looper.clone(), listener.clone());
        dispatcher.drm_session_acquired();
        dispatcher.drm_keys_loaded();
        dispatcher.remove_listener(&listener);
        dispatcher.drm_session_released();
        gate_tx.send(()).unwrap();

        match Arc::try_unwrap(looper) {
            Ok(looper) => looper.quit_safely(),
            Err(_) => panic!("looper still shared"),
        }
        assert!(recording.events().is_empty());
        assert_eq!(dispatcher.listener_count(), 0);
    }
}
