use crate::metrics::{EVENTS_PUBLISHED_TOTAL, OBSERVERS_CONNECTED, OBSERVERS_DROPPED_TOTAL};
use crate::model::UpdateEvent;
use axum::extract::ws::Message;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

/// What an observer wants to see: everything, or one device's updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    All,
    Device(String),
}

impl Subscription {
    pub fn matches(&self, device_id: &str) -> bool {
        match self {
            Subscription::All => true,
            Subscription::Device(id) => id == device_id,
        }
    }
}

struct Observer {
    sender: mpsc::UnboundedSender<Message>,
    subscription: Subscription,
}

/// Fan-out hub for real-time update delivery.
///
/// Each observer gets its own unbounded channel; `publish` never awaits a
/// slow client, so a stalled observer cannot stall ingestion. An observer
/// whose channel is gone is dropped from the set on the next publish.
pub struct FanoutHub {
    observers: RwLock<HashMap<Uuid, Observer>>,
}

impl FanoutHub {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
        }
    }

    /// Register an observer, subscribed to all devices until it narrows the
    /// filter. Returns the receiver half for the connection's send path.
    pub async fn add(&self, conn_id: Uuid) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Observer {
            sender: tx,
            subscription: Subscription::All,
        };
        let mut observers = self.observers.write().await;
        observers.insert(conn_id, observer);
        OBSERVERS_CONNECTED.set(observers.len() as f64);
        rx
    }

    pub async fn remove(&self, conn_id: Uuid) {
        let mut observers = self.observers.write().await;
        observers.remove(&conn_id);
        OBSERVERS_CONNECTED.set(observers.len() as f64);
    }

    /// Retarget an observer's filter. Unknown ids are a no-op (the
    /// connection already disconnected).
    pub async fn set_subscription(&self, conn_id: Uuid, subscription: Subscription) {
        if let Some(observer) = self.observers.write().await.get_mut(&conn_id) {
            observer.subscription = subscription;
        }
    }

    /// Deliver an event to every matching observer. Delivery is
    /// fire-and-forget per observer: a failed send drops that observer and
    /// nothing else.
    pub async fn publish(&self, event: &UpdateEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize update event: {}", e);
                return;
            }
        };

        let mut dead = Vec::new();
        {
            let observers = self.observers.read().await;
            for (conn_id, observer) in observers.iter() {
                if !observer.subscription.matches(event.device_id()) {
                    continue;
                }
                if observer.sender.send(Message::Text(payload.clone())).is_err() {
                    dead.push(*conn_id);
                }
            }
        }

        for conn_id in dead {
            warn!(conn_id = %conn_id, "Dropping unreachable observer");
            OBSERVERS_DROPPED_TOTAL.inc();
            self.remove(conn_id).await;
        }

        EVENTS_PUBLISHED_TOTAL.inc();
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Send a Close frame to every observer and clear the set. Used during
    /// graceful shutdown.
    pub async fn shutdown_all(&self) {
        let mut observers = self.observers.write().await;
        let count = observers.len();
        for observer in observers.values() {
            let _ = observer.sender.send(Message::Close(None));
        }
        observers.clear();
        OBSERVERS_CONNECTED.set(0.0);
        info!(count, "Closed all observer connections");
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new()
    }
}
