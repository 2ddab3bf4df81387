//! InvalidationEvent and the bus that fans it out to every local cache.
//!
//! Delivery is best-effort and at-most-once: an event published while nobody
//! is subscribed is gone. Events from one publisher reach each subscriber in
//! publish order.
//!
//! Cross-process transports carry the JSON wire form. Locally published
//! events are also offered to [`InvalidationBus::spawn_relay`]; events that
//! arrive through [`InvalidationBus::relay_inbound`] are delivered locally
//! only, so they never echo back out.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Personality,
    User,
    Channel,
}

/// Tells caches which cached config/personality data is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum InvalidationEvent {
    /// One entity changed.
    Entity { kind: EntityKind, id: String },
    /// Something shared by everyone changed; drop everything.
    All,
}

impl InvalidationEvent {
    pub fn entity(kind: EntityKind, id: impl Into<String>) -> Self {
        InvalidationEvent::Entity {
            kind,
            id: id.into(),
        }
    }

    /// Serialize to the JSON form relayed between processes:
    /// `{"scope": "entity", "kind": "...", "id": "..."}` or `{"scope": "all"}`
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"scope":"all"}"#.to_string())
    }

    pub fn from_wire(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// In-process fan-out of invalidation events. Cheap to clone.
#[derive(Clone)]
pub struct InvalidationBus {
    tx: broadcast::Sender<InvalidationEvent>,
    outbound: broadcast::Sender<InvalidationEvent>,
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        let (outbound, _) = broadcast::channel(capacity);
        Self { tx, outbound }
    }

    /// Publish a locally originated event to local subscribers and to any
    /// outbound relay. Returns how many local subscribers it reached.
    pub fn publish(&self, event: InvalidationEvent) -> usize {
        // No relay attached just means a single-process deployment.
        let _ = self.outbound.send(event.clone());
        self.deliver_local(event)
    }

    fn deliver_local(&self, event: InvalidationEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                debug!(?event, "invalidation published with no subscribers");
                0
            }
        }
    }

    /// Publish invalidations for a bulk write. More than `threshold` distinct
    /// entities collapse into a single `All` event.
    pub fn publish_bulk(&self, mut entities: Vec<(EntityKind, String)>, threshold: usize) -> usize {
        entities.sort();
        entities.dedup();
        if entities.len() > threshold {
            debug!(entities = entities.len(), threshold, "bulk invalidation collapsed to all");
            return self.publish(InvalidationEvent::All);
        }
        entities
            .into_iter()
            .map(|(kind, id)| self.publish(InvalidationEvent::entity(kind, id)))
            .max()
            .unwrap_or(0)
    }

    /// Feed a payload received from another process into the local bus.
    pub fn relay_inbound(&self, payload: &str) -> Result<usize> {
        let event = InvalidationEvent::from_wire(payload)?;
        Ok(self.deliver_local(event))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.tx.subscribe()
    }

    /// Run `handler` for every event until `shutdown` fires.
    ///
    /// The receiver is registered before this returns, so nothing published
    /// afterwards is missed. A subscriber that falls behind and loses events
    /// is handed an `All` event instead.
    pub fn spawn_handler<F>(&self, handler: F, shutdown: CancellationToken) -> JoinHandle<()>
    where
        F: Fn(&InvalidationEvent) + Send + 'static,
    {
        drain(self.subscribe(), handler, shutdown)
    }

    /// Hand the wire form of every locally published event to `sink`, for a
    /// transport that forwards it to other processes.
    pub fn spawn_relay<F>(&self, sink: F, shutdown: CancellationToken) -> JoinHandle<()>
    where
        F: Fn(String) + Send + 'static,
    {
        drain(
            self.outbound.subscribe(),
            move |event| sink(event.to_wire()),
            shutdown,
        )
    }
}

fn drain<F>(
    mut rx: broadcast::Receiver<InvalidationEvent>,
    handler: F,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    F: Fn(&InvalidationEvent) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = rx.recv() => received,
            };
            match received {
                Ok(event) => handler(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "invalidation subscriber lagged, invalidating all");
                    handler(&InvalidationEvent::All);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
