//! Realtime notifications for document changes.
//!
//! Every write of a file or directory emits a `RealtimeEvent` on the instance's
//! `EventBus`. The normal indexer emits them as a side effect of its writes; the
//! forced indexer bypasses that path and emits them itself.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// A change to a document, as seen by local subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RealtimeEvent {
    /// Document created.
    Created {
        doctype: String,
        id: String,
        /// New state, including its computed `path`.
        doc: Value,
        /// Milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// Document updated.
    Updated {
        doctype: String,
        id: String,
        doc: Value,
        /// Previous state, when the writer had it.
        #[serde(skip_serializing_if = "Option::is_none")]
        old: Option<Value>,
        timestamp: f64,
    },
    /// Document deleted.
    Deleted {
        doctype: String,
        id: String,
        timestamp: f64,
    },
}

impl RealtimeEvent {
    pub fn created(doctype: &str, id: &str, doc: Value) -> Self {
        Self::Created {
            doctype: doctype.to_string(),
            id: id.to_string(),
            doc,
            timestamp: now_millis(),
        }
    }

    pub fn updated(doctype: &str, id: &str, doc: Value, old: Option<Value>) -> Self {
        Self::Updated {
            doctype: doctype.to_string(),
            id: id.to_string(),
            doc,
            old,
            timestamp: now_millis(),
        }
    }

    pub fn deleted(doctype: &str, id: &str) -> Self {
        Self::Deleted {
            doctype: doctype.to_string(),
            id: id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Created { id, .. } | Self::Updated { id, .. } | Self::Deleted { id, .. } => id,
        }
    }

    pub fn doctype(&self) -> &str {
        match self {
            Self::Created { doctype, .. }
            | Self::Updated { doctype, .. }
            | Self::Deleted { doctype, .. } => doctype,
        }
    }

    /// `"created"`, `"updated"` or `"deleted"`.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Updated { .. } => "updated",
            Self::Deleted { .. } => "deleted",
        }
    }
}

fn now_millis() -> f64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

type Handler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

struct Subscriber {
    /// `None` receives every doctype
    doctype: Option<String>,
    handler: Handler,
}

/// Local fan-out of document changes.
///
/// Handlers run synchronously in `emit`, after the subscriber list is
/// released, so a handler may subscribe or drop a `Subscription`.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<BTreeMap<u64, Subscriber>>,
    next_key: AtomicU64,
}

/// Keeps a handler registered until dropped.
#[must_use = "the handler is removed as soon as the subscription is dropped"]
pub struct Subscription {
    bus: Weak<EventBus>,
    key: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.key);
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event.
    pub fn subscribe(
        self: &Arc<Self>,
        handler: impl Fn(&RealtimeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(None, Arc::new(handler))
    }

    /// Receive the events of one doctype.
    pub fn subscribe_doctype(
        self: &Arc<Self>,
        doctype: &str,
        handler: impl Fn(&RealtimeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(Some(doctype.to_string()), Arc::new(handler))
    }

    fn register(self: &Arc<Self>, doctype: Option<String>, handler: Handler) -> Subscription {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Subscriber { doctype, handler });
        Subscription {
            bus: Arc::downgrade(self),
            key,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn emit(&self, event: RealtimeEvent) {
        let handlers: Vec<Handler> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.doctype.as_deref().is_none_or(|d| d == event.doctype()))
            .map(|s| Arc::clone(&s.handler))
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }

    /// Keep a copy of every event in a shared list.
    pub fn record(self: &Arc<Self>) -> (Subscription, Arc<Mutex<Vec<RealtimeEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = self.subscribe(move |event| {
            sink.lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event.clone());
        });
        (subscription, events)
    }
}
