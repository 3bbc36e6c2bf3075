//! Tunnel Event System
//!
//! [`StateBus`] carries state changes from every component to a single
//! observer. Events may be published from any task; the observer is called
//! on the publishing task and must hand the event to its own context if it
//! needs to (a UI thread, a channel, ...). Ordering is only guaranteed per
//! publishing task.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::state::ConnectionState;

/// Events published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TunnelEvent {
    /// Session state changed
    StateChanged {
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Remote forward registered and accept loop running
    ForwardStarted { remote_port: u16, local_port: u16 },
    /// Accept loop exited and the forward was cancelled
    ForwardStopped { remote_port: u16 },
    /// Remote forward could not be registered
    ForwardFailed { remote_port: u16, error: String },
    /// Supervisor is about to wait before a reconnect attempt
    ReconnectScheduled { attempt: u32, delay_secs: f64 },
}

type Observer = Arc<dyn Fn(&TunnelEvent) + Send + Sync>;

/// Single-observer publish/subscribe point
#[derive(Clone, Default)]
pub struct StateBus {
    observer: Arc<RwLock<Option<Observer>>>,
}

impl StateBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the observer for every event, replacing any previous one
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&TunnelEvent) + Send + Sync + 'static,
    {
        *self.observer.write() = Some(Arc::new(observer));
    }

    /// Register an observer that only sees `(state, error)` pairs.
    /// Replaces any previous observer.
    pub fn subscribe_state<F>(&self, observer: F)
    where
        F: Fn(ConnectionState, Option<&str>) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if let TunnelEvent::StateChanged { state, error } = event {
                observer(*state, error.as_deref());
            }
        });
    }

    pub fn unsubscribe(&self) {
        *self.observer.write() = None;
    }

    pub fn has_observer(&self) -> bool {
        self.observer.read().is_some()
    }

    /// Deliver an event to the observer, if any
    pub fn emit(&self, event: TunnelEvent) {
        // Clone out so the observer runs without the lock held
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer(&event);
        }
    }

    pub fn emit_state(&self, state: ConnectionState, error: Option<String>) {
        self.emit(TunnelEvent::StateChanged { state, error });
    }
}

impl std::fmt::Debug for StateBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateBus")
            .field("has_observer", &self.has_observer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_without_observer() {
        let bus = StateBus::new();
        // Should not panic
        bus.emit_state(ConnectionState::Connecting, None);
        bus.emit(TunnelEvent::ForwardStopped { remote_port: 12000 });
    }

    #[test]
    fn test_state_observer_filters_events() {
        let bus = StateBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_state(move |state, error| {
            sink.lock().push((state, error.map(str::to_string)));
        });

        bus.emit_state(ConnectionState::Connecting, None);
        bus.emit(TunnelEvent::ForwardStarted {
            remote_port: 12000,
            local_port: 80,
        });
        bus.emit_state(ConnectionState::Error, Some("boom".into()));

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                (ConnectionState::Connecting, None),
                (ConnectionState::Error, Some("boom".to_string())),
            ]
        );
    }

    #[test]
    fn test_subscribe_replaces_observer() {
        let bus = StateBus::new();
        let first = Arc::new(Mutex::new(0));
        let second = Arc::new(Mutex::new(0));

        let f = first.clone();
        bus.subscribe(move |_| *f.lock() += 1);
        let s = second.clone();
        bus.subscribe(move |_| *s.lock() += 1);

        bus.emit_state(ConnectionState::Connected, None);
        assert_eq!(*first.lock(), 0);
        assert_eq!(*second.lock(), 1);

        bus.unsubscribe();
        assert!(!bus.has_observer());
    }

    #[test]
    fn test_observer_can_reenter_bus() {
        let bus = StateBus::new();
        let inner = bus.clone();
        bus.subscribe(move |_| {
            // Re-registering from inside the callback must not deadlock
            assert!(inner.has_observer());
        });
        bus.emit_state(ConnectionState::Connected, None);
    }

    #[test]
    fn test_event_serialization() {
        let event = TunnelEvent::ForwardStarted {
            remote_port: 12000,
            local_port: 80,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("forwardStarted"));
        assert!(json.contains("12000"));

        let state = TunnelEvent::StateChanged {
            state: ConnectionState::Connected,
            error: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("connected"));
        assert!(!json.contains("error"));
    }
}
