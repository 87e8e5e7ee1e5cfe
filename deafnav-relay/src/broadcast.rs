/**
 * FAN-OUT BROADCASTER - Typed push events to connected UI subscribers
 *
 * ROLE :
 * Registry of open push channels (SSE streams) with an optional room each.
 * Delivery is at-most-once with no replay: a subscriber only sees events
 * emitted while it is registered.
 *
 * OPERATION :
 * - subscribe : registers a bounded mpsc sender, returns its SubscriberId
 * - broadcast : room-scoped reaches that room only, global reaches everyone
 * - full queue : event dropped for that subscriber only (slow client)
 * - closed queue : subscriber pruned on the next broadcast
 *
 * Sends happen under the registry lock, so every subscriber observes events
 * in emission order.
 */

use crate::board::Announcement;
use crate::error::BroadcastError;
use crate::models::{AlertEvent, TelemetryRecord};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub type SubscriberId = u64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryUpdate {
    pub pulse: Option<i64>,
    pub distance: Option<f64>,
    pub device_id: String,
    pub battery: Option<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl From<&TelemetryRecord> for TelemetryUpdate {
    fn from(rec: &TelemetryRecord) -> Self {
        Self {
            pulse: rec.pulse,
            distance: rec.distance,
            device_id: rec.device_id.clone(),
            battery: rec.battery,
            timestamp: rec.received_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitUpdate {
    pub announcements: Vec<Announcement>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Accessibility {
    Clear,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrivalUpdate {
    pub station: String,
    pub line: String,
    pub direction: String,
    pub eta_minutes: Option<f64>,
    pub distance: Option<f64>,
    pub accessibility: Accessibility,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub room: String,
    pub content: String,
    pub sender_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Everything the relay pushes to UI clients.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    TelemetryUpdate(TelemetryUpdate),
    TransitUpdate(TransitUpdate),
    ArrivalUpdate(ArrivalUpdate),
    Alert(AlertEvent),
    ReceiveMessage(ChatMessage),
    EmergencyBroadcast(serde_json::Value),
}

impl PushEvent {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::TelemetryUpdate(_) => "telemetry_update",
            PushEvent::TransitUpdate(_) => "transit_update",
            PushEvent::ArrivalUpdate(_) => "arrival_update",
            PushEvent::Alert(_) => "alert",
            PushEvent::ReceiveMessage(_) => "receive_message",
            PushEvent::EmergencyBroadcast(_) => "emergency_broadcast",
        }
    }

    pub fn payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            PushEvent::TelemetryUpdate(p) => serde_json::to_value(p),
            PushEvent::TransitUpdate(p) => serde_json::to_value(p),
            PushEvent::ArrivalUpdate(p) => serde_json::to_value(p),
            PushEvent::Alert(p) => serde_json::to_value(p),
            PushEvent::ReceiveMessage(p) => serde_json::to_value(p),
            PushEvent::EmergencyBroadcast(p) => Ok(p.clone()),
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<PushEvent>,
    room: Option<String>,
}

pub struct Broadcaster {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Broadcaster {
    /// `buffer` is the queue length handed out by [`Broadcaster::open_channel`].
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self, handle: mpsc::Sender<PushEvent>, room: Option<String>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let room = room.filter(|r| !r.trim().is_empty());
        debug!("[push] subscriber {id} connected (room: {room:?})");
        self.subscribers.lock().insert(id, Subscriber { tx: handle, room });
        id
    }

    /// Creates a queue of the configured size and registers its sender.
    pub fn open_channel(&self, room: Option<String>) -> (SubscriberId, mpsc::Receiver<PushEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        (self.subscribe(tx, room), rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.lock().remove(&id).is_some();
        if removed {
            debug!("[push] subscriber {id} disconnected");
        }
        removed
    }

    /// Returns how many subscribers got the event.
    pub fn broadcast(&self, event: PushEvent, room: Option<&str>) -> Result<usize, BroadcastError> {
        let mut subscribers = self.subscribers.lock();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, sub) in subscribers.iter() {
            if let Some(room) = room {
                if sub.room.as_deref() != Some(room) {
                    continue;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("[push] subscriber {id} is lagging, dropped {}", event.name());
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            subscribers.remove(&id);
            debug!("[push] pruned closed subscriber {id}");
        }

        if delivered == 0 {
            Err(BroadcastError::NoSubscribers)
        } else {
            Ok(delivered)
        }
    }

    /// Broadcast where "nobody listening" is just a debug line.
    pub fn emit(&self, event: PushEvent, room: Option<&str>) -> usize {
        let name = event.name();
        match self.broadcast(event, room) {
            Ok(n) => n,
            Err(BroadcastError::NoSubscribers) => {
                debug!("[push] no subscriber for {name}");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
