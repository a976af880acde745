//! Registry of in-flight requests.
//!
//! Every unary call, stream and subscription gets one entry keyed by its
//! caller-generated request id. The entry holds the cleanup closure that runs
//! when the exchange ends, a little metadata for teardown and debugging, and
//! the push function used to reach the caller.

use crate::error::DeliveryError;
use crate::rpc::contract::{ResponseEnvelope, Topic};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Delivers one message to the caller of a request.
pub type PushFn =
    Arc<dyn Fn(ResponseEnvelope) -> Result<(), DeliveryError> + Send + Sync + 'static>;

/// Runs once when a request entry is removed.
pub type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// Build a [`PushFn`] that forwards messages into an unbounded channel.
///
/// A closed receiver surfaces as [`DeliveryError::ChannelClosed`].
#[must_use]
pub fn channel_push_fn(tx: mpsc::UnboundedSender<ResponseEnvelope>) -> PushFn {
    Arc::new(move |envelope: ResponseEnvelope| {
        let request_id = envelope.request_id.clone();
        tx.send(envelope)
            .map_err(|_| DeliveryError::ChannelClosed(request_id))
    })
}

/// Build a [`PushFn`] over a bounded channel. Never waits: a full buffer is a
/// delivery failure like a closed one.
#[must_use]
pub fn bounded_push_fn(tx: mpsc::Sender<ResponseEnvelope>) -> PushFn {
    Arc::new(move |envelope: ResponseEnvelope| {
        let request_id = envelope.request_id.clone();
        tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full(request_id),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::ChannelClosed(request_id),
        })
    })
}

/// Cleanup closure that does nothing.
#[must_use]
pub fn noop_cleanup() -> Cleanup {
    Box::new(|| {})
}

/// Lightweight metadata kept alongside each entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMetadata {
    /// UI instance that owns the request; teardown of that instance
    /// unregisters every entry it owns.
    pub owner: Option<String>,
    /// Topic for subscription entries.
    pub topic: Option<Topic>,
    /// Free-form debugging tag (usually the command name).
    pub tag: Option<String>,
}

impl RequestMetadata {
    #[must_use]
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

struct RequestEntry {
    cleanup: Cleanup,
    metadata: RequestMetadata,
    push: Option<PushFn>,
}

/// Shared handle to the request table.
///
/// Cloning is cheap; all clones see the same table.
#[derive(Clone, Default)]
pub struct RequestRegistry {
    entries: Arc<Mutex<HashMap<String, RequestEntry>>>,
}

impl std::fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("live", &self.len())
            .finish()
    }
}

impl RequestRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RequestEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request.
    ///
    /// An existing entry under the same id is replaced without running its
    /// cleanup; callers are responsible for id uniqueness.
    pub fn register(
        &self,
        request_id: impl Into<String>,
        cleanup: Cleanup,
        metadata: RequestMetadata,
        push: Option<PushFn>,
    ) {
        let request_id = request_id.into();
        let replaced = self.lock().insert(
            request_id.clone(),
            RequestEntry {
                cleanup,
                metadata,
                push,
            },
        );
        if replaced.is_some() {
            debug!(request_id = %request_id, "request id re-registered; previous entry replaced");
        }
    }

    /// Look up the push function for a live request.
    #[must_use]
    pub fn resolve(&self, request_id: &str) -> Option<PushFn> {
        self.lock()
            .get(request_id)
            .and_then(|entry| entry.push.clone())
    }

    /// Whether a live entry exists for `request_id`.
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    #[must_use]
    pub fn metadata(&self, request_id: &str) -> Option<RequestMetadata> {
        self.lock()
            .get(request_id)
            .map(|entry| entry.metadata.clone())
    }

    /// Remove an entry and run its cleanup.
    ///
    /// Idempotent: returns `false` when nothing was registered. The cleanup
    /// runs outside the table lock, so it may call back into the registry.
    /// A panicking cleanup is logged and swallowed.
    pub fn unregister(&self, request_id: &str) -> bool {
        let removed = self.lock().remove(request_id);
        match removed {
            Some(entry) => {
                run_cleanup(request_id, entry.cleanup);
                true
            }
            None => false,
        }
    }

    /// Unregister every entry owned by `owner`; returns how many were removed.
    pub fn unregister_owner(&self, owner: &str) -> usize {
        let removed: Vec<(String, RequestEntry)> = {
            let mut entries = self.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.metadata.owner.as_deref() == Some(owner))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = removed.len();
        for (request_id, entry) in removed {
            run_cleanup(&request_id, entry.cleanup);
        }
        if count > 0 {
            debug!(owner, count, "unregistered requests for owner");
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of live request ids, in no particular order.
    #[must_use]
    pub fn request_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

fn run_cleanup(request_id: &str, cleanup: Cleanup) {
    if std::panic::catch_unwind(AssertUnwindSafe(cleanup)).is_err() {
        error!(request_id = %request_id, "request cleanup panicked; ignoring");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_cleanup(counter: &Arc<AtomicUsize>) -> Cleanup {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn unregister_runs_cleanup_exactly_once() {
        let registry = RequestRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(
            "req-1",
            counting_cleanup(&calls),
            RequestMetadata::default(),
            None,
        );

        assert!(registry.unregister("req-1"));
        assert!(!registry.unregister("req-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!registry.contains("req-1"));
    }

    #[test]
    fn re_registration_replaces_entry() {
        let registry = RequestRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        registry.register("dup", counting_cleanup(&first), RequestMetadata::default(), None);
        registry.register(
            "dup",
            counting_cleanup(&second),
            RequestMetadata::default().with_tag("second"),
            None,
        );

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.metadata("dup").and_then(|m| m.tag),
            Some("second".to_owned())
        );
        registry.unregister("dup");
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resolve_returns_push_only_for_streaming_entries() {
        let registry = RequestRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(
            "stream",
            noop_cleanup(),
            RequestMetadata::default(),
            Some(channel_push_fn(tx)),
        );
        registry.register("unary", noop_cleanup(), RequestMetadata::default(), None);

        let push = registry.resolve("stream").expect("stream has push fn");
        push(ResponseEnvelope::chunk("stream", serde_json::json!(1))).unwrap();
        assert_eq!(rx.try_recv().unwrap().payload, serde_json::json!(1));

        assert!(registry.resolve("unary").is_none());
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn panicking_cleanup_is_contained() {
        let registry = RequestRegistry::new();
        registry.register(
            "bad",
            Box::new(|| panic!("cleanup exploded")),
            RequestMetadata::default(),
            None,
        );
        assert!(registry.unregister("bad"));
        assert!(registry.is_empty());
    }

    #[test]
    fn cleanup_may_reenter_registry() {
        let registry = RequestRegistry::new();
        let inner = registry.clone();
        registry.register(
            "outer",
            Box::new(move || {
                inner.unregister("other");
            }),
            RequestMetadata::default(),
            None,
        );
        registry.register("other", noop_cleanup(), RequestMetadata::default(), None);

        registry.unregister("outer");
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_owner_only_touches_owned_entries() {
        let registry = RequestRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register("a1", counting_cleanup(&calls), RequestMetadata::owned_by("a"), None);
        registry.register("a2", counting_cleanup(&calls), RequestMetadata::owned_by("a"), None);
        registry.register("b1", counting_cleanup(&calls), RequestMetadata::owned_by("b"), None);

        assert_eq!(registry.unregister_owner("a"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.request_ids(), vec!["b1".to_owned()]);
        assert_eq!(registry.unregister_owner("a"), 0);
    }

    #[test]
    fn closed_channel_reports_delivery_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let push = channel_push_fn(tx);
        let err = push(ResponseEnvelope::ok("gone", serde_json::json!({}))).unwrap_err();
        assert_eq!(err, DeliveryError::ChannelClosed("gone".to_owned()));
    }

    #[test]
    fn full_bounded_channel_reports_delivery_error() {
        let (tx, _rx) = mpsc::channel(1);
        let push = bounded_push_fn(tx);
        push(ResponseEnvelope::chunk("s", serde_json::json!(1))).unwrap();
        let err = push(ResponseEnvelope::chunk("s", serde_json::json!(2))).unwrap_err();
        assert_eq!(err, DeliveryError::Full("s".to_owned()));
    }
}
