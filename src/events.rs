//! Provider events.
//!
//! Providers that can tell when their values change expose an [`EventBus`]. Subscribers register
//! an [`EventHandler`] for one [`ProviderEventKind`] and get back a [`HandlerId`] for removal.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Kinds of events a provider emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderEventKind {
    /// The provider finished initializing.
    Ready,
    /// Flag values may have changed (pushed update or re-identification).
    ConfigurationChanged,
}

/// An event emitted by a provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderEvent {
    /// Event kind.
    pub kind: ProviderEventKind,
    /// Name of the emitting provider.
    pub provider: String,
    /// Keys of flags whose value changed, when the provider knows them.
    pub flags_changed: Vec<String>,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl ProviderEvent {
    /// Create an event of `kind` for `provider`, stamped now.
    pub fn new(kind: ProviderEventKind, provider: impl Into<String>) -> Self {
        ProviderEvent {
            kind,
            provider: provider.into(),
            flags_changed: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the keys of the flags that changed.
    pub fn with_flags_changed(mut self, flags_changed: Vec<String>) -> Self {
        self.flags_changed = flags_changed;
        self
    }
}

/// A subscriber to provider events.
///
/// # Errors
///
/// This method should not panic. A panicking handler is isolated: the panic is logged and
/// dispatch continues with the remaining handlers.
pub trait EventHandler {
    /// Handle `event`.
    fn on_event(&self, event: &ProviderEvent);
}

impl<T: Fn(&ProviderEvent)> EventHandler for T {
    fn on_event(&self, event: &ProviderEvent) {
        self(event);
    }
}

/// Identifies a registered handler for [`EventBus::remove_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type SharedHandler = Arc<dyn EventHandler + Send + Sync>;

/// A minimal publish/subscribe bus for [`ProviderEvent`]s.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(HandlerId, ProviderEventKind, SharedHandler)>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    ///
    /// ```
    /// # use flagswitch::{EventBus, ProviderEvent, ProviderEventKind};
    /// let bus = EventBus::new();
    /// let id = bus.add_handler(ProviderEventKind::Ready, |event: &ProviderEvent| {
    ///     println!("{} is ready", event.provider);
    /// });
    /// assert!(bus.remove_handler(ProviderEventKind::Ready, id));
    /// ```
    pub fn add_handler(
        &self,
        kind: ProviderEventKind,
        handler: impl EventHandler + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push((id, kind, Arc::new(handler)));
        }
        id
    }

    /// Remove a previously registered handler. Returns `false` if it was not registered for `kind`.
    pub fn remove_handler(&self, kind: ProviderEventKind, id: HandlerId) -> bool {
        let Ok(mut handlers) = self.handlers.write() else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, handler_kind, _)| !(*handler_id == id && *handler_kind == kind));
        handlers.len() != before
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: ProviderEventKind) -> usize {
        self.handlers
            .read()
            .map(|handlers| handlers.iter().filter(|(_, k, _)| *k == kind).count())
            .unwrap_or(0)
    }

    /// Deliver `event` to every handler registered for its kind.
    ///
    /// Handlers are snapshotted first, so a handler may add or remove handlers without deadlocking.
    pub fn emit(&self, event: &ProviderEvent) {
        let targets: Vec<SharedHandler> = match self.handlers.read() {
            Ok(handlers) => handlers
                .iter()
                .filter(|(_, kind, _)| *kind == event.kind)
                .map(|(_, _, handler)| Arc::clone(handler))
                .collect(),
            Err(_) => return,
        };

        log::trace!(target: "flagswitch",
                    provider = event.provider.as_str(),
                    handlers = targets.len();
                    "emitting {:?}", event.kind);

        for handler in targets {
            if catch_unwind(AssertUnwindSafe(|| handler.on_event(event))).is_err() {
                log::warn!(target: "flagswitch",
                           provider = event.provider.as_str();
                           "event handler for {:?} panicked, continuing dispatch", event.kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{EventBus, ProviderEvent, ProviderEventKind};

    fn counter(bus: &EventBus, kind: ProviderEventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.add_handler(kind, move |_: &ProviderEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn delivers_only_matching_kind() {
        let bus = EventBus::new();
        let ready = counter(&bus, ProviderEventKind::Ready);
        let changed = counter(&bus, ProviderEventKind::ConfigurationChanged);

        bus.emit(&ProviderEvent::new(ProviderEventKind::ConfigurationChanged, "test"));

        assert_eq!(ready.load(Ordering::SeqCst), 0);
        assert_eq!(changed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_handler_is_not_called() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = bus.add_handler(ProviderEventKind::Ready, move |_: &ProviderEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!bus.remove_handler(ProviderEventKind::ConfigurationChanged, id));
        assert!(bus.remove_handler(ProviderEventKind::Ready, id));
        bus.emit(&ProviderEvent::new(ProviderEventKind::Ready, "test"));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.handler_count(ProviderEventKind::Ready), 0);
    }

    #[test]
    fn panicking_handler_does_not_abort_dispatch() {
        let bus = EventBus::new();
        bus.add_handler(ProviderEventKind::Ready, |_: &ProviderEvent| {
            panic!("handler failure");
        });
        let after = counter(&bus, ProviderEventKind::Ready);

        bus.emit(&ProviderEvent::new(ProviderEventKind::Ready, "test"));

        assert_eq!(after.load(Ordering::SeqCst), 1);
    }
}
