//! Publish/subscribe used to decouple the controller from the button
//! component and from the observability sinks.
//!
//! The bus is constructed with (and owned by) its controller rather than
//! living as a process-wide broadcast point, so tests and multiple
//! controller instances stay isolated. Dispatch is synchronous and in
//! registration order; signals are fire-and-forget with no persistence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use revenue_sdk::EntitlementsSummary;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::debug;

use crate::lock;

/// Namespace prefix attached to dispatch logs.
const NAMESPACE: &str = "revenue-bridge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Track,
    Error,
    SubscribeReturn,
    InitialEntitlements,
}

impl Topic {
    pub fn action(&self) -> &'static str {
        match self {
            Topic::Track => "track",
            Topic::Error => "onError",
            Topic::SubscribeReturn => "onSubscribeReturn",
            Topic::InitialEntitlements => "onInitialEntitlements",
        }
    }
}

/// A tracking request travelling from a component to the controller.
#[derive(Debug, Clone, Default)]
pub struct TrackRequest {
    pub action: String,
    pub context: Map<String, Value>,
    pub journey_start: bool,
}

/// An error travelling to the controller's error handler.
#[derive(Debug, Clone, Default)]
pub struct ErrorSignal {
    pub message: String,
    pub info: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub enum Signal {
    Track(TrackRequest),
    Error(ErrorSignal),
    SubscribeReturn(Value),
    InitialEntitlements(EntitlementsSummary),
}

impl Signal {
    pub fn topic(&self) -> Topic {
        match self {
            Signal::Track(_) => Topic::Track,
            Signal::Error(_) => Topic::Error,
            Signal::SubscribeReturn(_) => Topic::SubscribeReturn,
            Signal::InitialEntitlements(_) => Topic::InitialEntitlements,
        }
    }
}

type Listener = Arc<dyn Fn(&Signal) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<Topic, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen<F>(&self, topic: Topic, callback: F)
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        lock(&self.listeners)
            .entry(topic)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Broadcast to every listener currently registered for the signal's
    /// topic, in registration order, on the caller's thread. Listeners are
    /// invoked outside the registry lock, so a listener may touch the bus
    /// again.
    pub fn signal(&self, signal: Signal) {
        let topic = signal.topic();
        debug!(
            namespace = NAMESPACE,
            action = topic.action(),
            "bus: dispatch"
        );
        let current = lock(&self.listeners)
            .get(&topic)
            .cloned()
            .unwrap_or_default();
        for listener in current {
            listener(&signal);
        }
    }

    /// Canonical error broadcast.
    pub fn signal_error(&self, message: impl Into<String>, info: Map<String, Value>) {
        self.signal(Signal::Error(ErrorSignal {
            message: message.into(),
            info,
        }));
    }

    /// Resolve with the next signal on `topic`; later signals are ignored.
    pub fn once(&self, topic: Topic) -> oneshot::Receiver<Signal> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        self.listen(topic, move |signal| {
            if let Some(tx) = lock(&slot).take() {
                let _ = tx.send(signal.clone());
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.listen(Topic::Track, move |_| lock(&seen).push(tag));
        }

        bus.signal(Signal::Track(TrackRequest::default()));
        assert_eq!(*lock(&seen), vec!["first", "second", "third"]);
    }

    #[test]
    fn listeners_only_see_their_topic() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0u32));
        {
            let hits = Arc::clone(&hits);
            bus.listen(Topic::Error, move |_| *lock(&hits) += 1);
        }

        bus.signal(Signal::Track(TrackRequest::default()));
        assert_eq!(*lock(&hits), 0);

        bus.signal_error("boom", Map::new());
        assert_eq!(*lock(&hits), 1);
    }

    #[tokio::test]
    async fn once_resolves_with_the_first_signal_only() {
        let bus = EventBus::new();
        let rx = bus.once(Topic::SubscribeReturn);

        bus.signal(Signal::SubscribeReturn(Value::from("first")));
        bus.signal(Signal::SubscribeReturn(Value::from("second")));

        match rx.await {
            Ok(Signal::SubscribeReturn(value)) => assert_eq!(value, Value::from("first")),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn a_listener_may_signal_the_bus_again() {
        let bus = Arc::new(EventBus::new());
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = Arc::clone(&errors);
            bus.listen(Topic::Error, move |signal| {
                if let Signal::Error(report) = signal {
                    lock(&errors).push(report.message.clone());
                }
            });
        }
        {
            let inner = Arc::clone(&bus);
            bus.listen(Topic::Track, move |_| {
                inner.signal_error("from listener", Map::new());
            });
        }

        bus.signal(Signal::Track(TrackRequest::default()));
        assert_eq!(*lock(&errors), vec!["from listener"]);
    }
}
