//! Event bus with typed pub/sub
//!
//! The central broker of the hub. The state machine fires `state_changed`
//! through it, the config entry manager fires `config_entry_reauth`, and any
//! component can subscribe to the types it cares about without knowing who
//! produces them.

use dashmap::DashMap;
use hs_core::{Context, Event, EventData, EventType};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Buffered events per subscription before lagging subscribers drop messages
const CHANNEL_CAPACITY: usize = 1024;

/// Publish/subscribe broker backed by one broadcast channel per event type
pub struct EventBus {
    /// Per-event-type senders, created lazily on first subscribe or fire
    channels: DashMap<EventType, broadcast::Sender<Event<serde_json::Value>>>,
    /// Sender reaching subscribers of every event type
    match_all: broadcast::Sender<Event<serde_json::Value>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all, _) = broadcast::channel(capacity);
        Self {
            channels: DashMap::new(),
            match_all,
            capacity,
        }
    }

    /// Subscribe to one event type (or all of them via `EventType::match_all`)
    pub fn subscribe(
        &self,
        event_type: impl Into<EventType>,
    ) -> broadcast::Receiver<Event<serde_json::Value>> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "new subscription");

        if event_type.is_match_all() {
            return self.match_all.subscribe();
        }

        self.channels
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to a payload type, receiving deserialized events
    pub fn subscribe_typed<T: EventData + serde::de::DeserializeOwned>(
        &self,
    ) -> TypedReceiver<T> {
        TypedReceiver::new(self.subscribe(T::event_type()))
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event<serde_json::Value>> {
        self.match_all.subscribe()
    }

    /// Deliver an event to type subscribers and match-all subscribers
    ///
    /// Send failures mean no active receivers and are ignored.
    pub fn fire(&self, event: Event<serde_json::Value>) {
        debug!(event_type = %event.event_type, "firing event");

        if let Some(sender) = self.channels.get(&event.event_type) {
            let _ = sender.send(event.clone());
        }
        let _ = self.match_all.send(event);
    }

    /// Serialize a typed payload and fire it under its [`EventData`] type
    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        let payload = serde_json::to_value(&data).unwrap_or_default();
        self.fire(Event::new(T::event_type(), payload, context));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle shared across components
pub type SharedEventBus = Arc<EventBus>;

/// Receiver that deserializes event payloads into `T`
pub struct TypedReceiver<T> {
    rx: broadcast::Receiver<Event<serde_json::Value>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> TypedReceiver<T> {
    fn new(rx: broadcast::Receiver<Event<serde_json::Value>>) -> Self {
        Self {
            rx,
            _marker: std::marker::PhantomData,
        }
    }

    /// Receive the next event whose payload parses as `T`
    ///
    /// Events with an unparsable payload are skipped.
    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Ok(data) = serde_json::from_value::<T>(event.data.clone()) {
                return Ok(Event {
                    event_type: event.event_type,
                    data,
                    origin: event.origin,
                    time_fired: event.time_fired,
                    context: event.context,
                });
            }
        }
    }
}
