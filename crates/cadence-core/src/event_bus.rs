use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cadence_types::{Event, EventType};

pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Topic-keyed publish/subscribe fan-out.
///
/// Handlers for a topic run serially on the publisher's execution context,
/// in subscription order. A failing handler is logged and never propagated
/// to the publisher or to later handlers. There is no buffering; late
/// subscribers miss earlier events.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<EventType, Vec<EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event_type: EventType, handler: EventHandler) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.entry(event_type).or_default().push(handler);
    }

    /// Remove the first subscription matching this handler. No-op when the
    /// handler was never subscribed.
    pub fn unsubscribe(&self, event_type: EventType, handler: &EventHandler) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handlers) = subscribers.get_mut(&event_type) {
            if let Some(index) = handlers.iter().position(|h| Arc::ptr_eq(h, handler)) {
                handlers.remove(index);
            }
        }
    }

    pub fn publish(&self, event: Event) {
        // Clone the handler list out of the lock so a handler that publishes
        // or (un)subscribes does not deadlock.
        let handlers: Vec<EventHandler> = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers
                .get(&event.event_type)
                .map(|h| h.to_vec())
                .unwrap_or_default()
        };
        for handler in handlers {
            if let Err(error) = handler(&event) {
                tracing::error!(
                    event_type = %event.event_type,
                    error = %error,
                    "event handler failed"
                );
            }
        }
    }
}
