//! Named, synchronous, multi-subscriber event dispatch.
//!
//! Handlers run in registration order on the emitting thread. A handler that
//! returns an error or panics is logged and skipped; the remaining handlers
//! still run. Nothing is buffered: a handler only sees events emitted after
//! it was registered.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::types::{BoxError, Event};

pub const STATUS: &str = "status";
pub const CONNECTING: &str = "connecting";
pub const CONNECTED: &str = "connected";
pub const DISCONNECTED: &str = "disconnected";
pub const DISCONNECT: &str = "disconnect";
pub const SCHEDULE_RECONNECT: &str = "schedule_reconnect";
pub const DATA: &str = "data";

/// System event names. Message topics with these names are never re-dispatched
/// as topic events.
pub const RESERVED_EVENTS: [&str; 7] = [
    STATUS,
    CONNECTING,
    CONNECTED,
    DISCONNECTED,
    DISCONNECT,
    SCHEDULE_RECONNECT,
    DATA,
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_EVENTS.contains(&name)
}

type Handler = Arc<dyn Fn(&Event) -> Result<(), BoxError> + Send + Sync>;

/// Token returned by [`EventBus::on`], used to unregister the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events named `name`.
    pub fn on<F>(&self, name: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(name.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Unregister a handler. Returns `false` if it was not registered under `name`.
    pub fn off(&self, name: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = handlers.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(name);
        }
        removed
    }

    pub fn handler_count(&self, name: &str) -> usize {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.get(name).map_or(0, Vec::len)
    }

    /// Dispatch `event` to every handler registered under its name.
    ///
    /// Returns the number of handlers that failed.
    pub fn emit(&self, event: &Event) -> usize {
        let name = event.name();
        // Snapshot so handlers may call on/off (or emit) without deadlocking.
        let snapshot: Vec<(HandlerId, Handler)> = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.get(name).cloned().unwrap_or_default()
        };

        let mut failures = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(
                        event = name,
                        handler = id.0,
                        error = %e,
                        "event handler failed"
                    );
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!(event = name, handler = id.0, "event handler panicked");
                }
            }
        }
        failures
    }
}
