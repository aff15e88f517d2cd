//! In-process publish/subscribe for decoded telemetry.
//!
//! Handlers are kept per [`TelemetryKind`] in registration order and are called
//! synchronously, in that order, for every published event. Error handlers receive
//! every non-fatal error the session reports.

use std::collections::HashMap;

use crate::command::TelemetryKind;
use crate::error::BmsError;
use crate::telemetry::TelemetryEvent;

pub type TelemetryHandler = Box<dyn FnMut(&TelemetryEvent) + Send>;
pub type ErrorHandler = Box<dyn FnMut(&BmsError) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    subscribers: HashMap<TelemetryKind, Vec<(SubscriptionId, TelemetryHandler)>>,
    error_handlers: Vec<(SubscriptionId, ErrorHandler)>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, kind: TelemetryKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&TelemetryEvent) + Send + 'static,
    {
        let id = self.next_id();
        self.subscribers
            .entry(kind)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    pub fn on_error<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&BmsError) + Send + 'static,
    {
        let id = self.next_id();
        self.error_handlers.push((id, Box::new(handler)));
        id
    }

    /// Remove a telemetry or error handler. Returns false if the id is not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for handlers in self.subscribers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(h, _)| *h != id);
            if handlers.len() != before {
                return true;
            }
        }
        let before = self.error_handlers.len();
        self.error_handlers.retain(|(h, _)| *h != id);
        self.error_handlers.len() != before
    }

    /// Deliver an event to every handler of its kind. Returns how many handlers saw it.
    pub fn publish(&mut self, event: &TelemetryEvent) -> usize {
        let Some(handlers) = self.subscribers.get_mut(&event.kind()) else {
            return 0;
        };
        for (_, handler) in handlers.iter_mut() {
            handler(event);
        }
        handlers.len()
    }

    pub fn report(&mut self, error: &BmsError) {
        for (_, handler) in self.error_handlers.iter_mut() {
            handler(error);
        }
    }

    pub fn subscriber_count(&self, kind: TelemetryKind) -> usize {
        self.subscribers.get(&kind).map_or(0, Vec::len)
    }

    pub fn clear(&mut self) {
        self.subscribers.clear();
        self.error_handlers.clear();
    }

    fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut counts: Vec<_> = self
            .subscribers
            .iter()
            .map(|(kind, handlers)| (kind.as_str(), handlers.len()))
            .collect();
        counts.sort();
        f.debug_struct("EventBus")
            .field("subscribers", &counts)
            .field("error_handlers", &self.error_handlers.len())
            .finish()
    }
}

#[cfg(test)]
fn soc_event() -> TelemetryEvent {
    use crate::telemetry::{SocSample, Telemetry};
    TelemetryEvent {
        command: 0x90,
        telemetry: Telemetry::Soc(SocSample { voltage: 52.8, current: 1.0, soc: 80.0 }),
        received_at: std::time::SystemTime::now(),
    }
}

#[cfg(test)]
fn pack_event() -> TelemetryEvent {
    use crate::telemetry::{PackStatus, Telemetry};
    TelemetryEvent {
        command: 0x94,
        telemetry: Telemetry::PackStatus(PackStatus {
            num_cells: 16,
            num_temps: 2,
            charger_running: false,
            load_running: true,
            num_cycles: 12,
        }),
        received_at: std::time::SystemTime::now(),
    }
}

#[test]
fn test_delivers_in_registration_order() {
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut bus = EventBus::new();
    for name in ["first", "second", "third"] {
        let seen = seen.clone();
        bus.subscribe(TelemetryKind::Soc, move |_| seen.lock().unwrap().push(name));
    }

    assert_eq!(bus.publish(&soc_event()), 3);
    assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn test_delivers_only_to_matching_kind() {
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut bus = EventBus::new();
    let soc_seen = seen.clone();
    bus.subscribe(TelemetryKind::Soc, move |e| soc_seen.lock().unwrap().push(e.command));

    assert_eq!(bus.publish(&pack_event()), 0);
    assert_eq!(bus.publish(&soc_event()), 1);
    assert_eq!(*seen.lock().unwrap(), vec![0x90]);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let count = std::sync::Arc::new(std::sync::Mutex::new(0));
    let mut bus = EventBus::new();
    let counter = count.clone();
    let id = bus.subscribe(TelemetryKind::PackStatus, move |_| *counter.lock().unwrap() += 1);

    bus.publish(&pack_event());
    assert!(bus.unsubscribe(id));
    assert!(!bus.unsubscribe(id));
    bus.publish(&pack_event());

    assert_eq!(*count.lock().unwrap(), 1);
    assert_eq!(bus.subscriber_count(TelemetryKind::PackStatus), 0);
}

#[test]
fn test_unsubscribe_keeps_the_other_handlers_in_order() {
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut bus = EventBus::new();
    let ids: Vec<SubscriptionId> = ["first", "second", "third"]
        .into_iter()
        .map(|name| {
            let seen = seen.clone();
            bus.subscribe(TelemetryKind::Soc, move |_| seen.lock().unwrap().push(name))
        })
        .collect();

    assert!(bus.unsubscribe(ids[1]));
    bus.publish(&soc_event());

    assert_eq!(*seen.lock().unwrap(), vec!["first", "third"]);
    assert_eq!(bus.subscriber_count(TelemetryKind::Soc), 2);
}

#[test]
fn test_reports_errors_to_error_handlers() {
    let errors = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut bus = EventBus::new();
    let sink = errors.clone();
    let id = bus.on_error(move |e| sink.lock().unwrap().push(e.clone()));

    bus.report(&BmsError::UnknownCommand(0x10));
    assert!(bus.unsubscribe(id));
    assert!(!bus.unsubscribe(id));
    bus.report(&BmsError::UnknownCommand(0x11));

    assert_eq!(*errors.lock().unwrap(), vec![BmsError::UnknownCommand(0x10)]);
}
