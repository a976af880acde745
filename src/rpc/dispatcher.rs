//! Streaming dispatcher: last-message semantics on top of the request registry.

use crate::error::DeliveryError;
use crate::rpc::contract::ResponseEnvelope;
use crate::rpc::registry::RequestRegistry;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a forwarded stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The producer finished and the terminal message was delivered.
    Completed,
    /// The caller went away (cancelled, disconnected or delivery failed).
    Cancelled,
    /// The producer failed; an error message was sent to the caller.
    Failed(String),
}

/// Pushes messages to registered requests.
///
/// A terminal push (`is_last = true`), an error push, or any delivery failure
/// unregisters the request, so nothing further reaches that id.
#[derive(Debug, Clone)]
pub struct StreamingDispatcher {
    registry: RequestRegistry,
}

impl StreamingDispatcher {
    #[must_use]
    pub fn new(registry: RequestRegistry) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    /// Deliver `payload` to `request_id`.
    pub fn push(
        &self,
        request_id: &str,
        payload: serde_json::Value,
        is_last: bool,
    ) -> Result<(), DeliveryError> {
        let envelope = if is_last {
            ResponseEnvelope::ok(request_id, payload)
        } else {
            ResponseEnvelope::chunk(request_id, payload)
        };
        self.deliver(request_id, envelope)
    }

    /// Deliver a terminal error message to `request_id`.
    pub fn push_error(
        &self,
        request_id: &str,
        message: impl Into<String>,
    ) -> Result<(), DeliveryError> {
        self.deliver(request_id, ResponseEnvelope::error(request_id, message))
    }

    fn deliver(&self, request_id: &str, envelope: ResponseEnvelope) -> Result<(), DeliveryError> {
        let Some(push) = self.registry.resolve(request_id) else {
            debug!(request_id = %request_id, "push to unknown request id; skipping");
            return Err(DeliveryError::NotRegistered(request_id.to_owned()));
        };

        let terminal = envelope.is_last;
        match push(envelope) {
            Ok(()) => {
                if terminal {
                    self.registry.unregister(request_id);
                }
                Ok(())
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "delivery failed; dropping request");
                self.registry.unregister(request_id);
                Err(e)
            }
        }
    }

    /// Handle bound to a single request id, for producers.
    #[must_use]
    pub fn responder(&self, request_id: impl Into<String>) -> StreamResponder {
        StreamResponder {
            request_id: request_id.into(),
            dispatcher: self.clone(),
        }
    }

    /// Drive `stream` into `request_id` until it ends, fails or is cancelled.
    ///
    /// Liveness is checked before every push; when the request has been
    /// unregistered (or `cancel` fires) the producer is dropped without
    /// sending anything further.
    pub async fn forward<S, E>(
        &self,
        request_id: &str,
        stream: S,
        cancel: &CancellationToken,
    ) -> ForwardOutcome
    where
        S: Stream<Item = Result<serde_json::Value, E>>,
        E: std::fmt::Display,
    {
        let mut stream = std::pin::pin!(stream);
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(request_id = %request_id, "stream cancelled by caller");
                    return ForwardOutcome::Cancelled;
                }
                next = stream.next() => next,
            };

            if !self.registry.contains(request_id) {
                debug!(request_id = %request_id, "request no longer registered; stopping producer");
                return ForwardOutcome::Cancelled;
            }

            match next {
                Some(Ok(payload)) => {
                    if self.push(request_id, payload, false).is_err() {
                        return ForwardOutcome::Cancelled;
                    }
                }
                Some(Err(e)) => {
                    let message = e.to_string();
                    let _ = self.push_error(request_id, message.clone());
                    return ForwardOutcome::Failed(message);
                }
                None => break,
            }
        }

        match self.push(request_id, serde_json::json!({"done": true}), true) {
            Ok(()) => ForwardOutcome::Completed,
            Err(_) => ForwardOutcome::Cancelled,
        }
    }
}

/// Producer-side handle for one request.
#[derive(Debug, Clone)]
pub struct StreamResponder {
    request_id: String,
    dispatcher: StreamingDispatcher,
}

impl StreamResponder {
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Whether the caller is still listening.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.dispatcher.registry.contains(&self.request_id)
    }

    /// Send a non-terminal message.
    pub fn send(&self, payload: serde_json::Value) -> Result<(), DeliveryError> {
        self.dispatcher.push(&self.request_id, payload, false)
    }

    /// Send the terminal message.
    pub fn finish(&self, payload: serde_json::Value) -> Result<(), DeliveryError> {
        self.dispatcher.push(&self.request_id, payload, true)
    }

    /// Terminate the exchange with an error.
    pub fn fail(&self, message: impl Into<String>) -> Result<(), DeliveryError> {
        self.dispatcher.push_error(&self.request_id, message)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::rpc::registry::{RequestMetadata, channel_push_fn, noop_cleanup};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn registered(
        request_id: &str,
    ) -> (
        StreamingDispatcher,
        mpsc::UnboundedReceiver<ResponseEnvelope>,
    ) {
        let registry = RequestRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(
            request_id,
            noop_cleanup(),
            RequestMetadata::default(),
            Some(channel_push_fn(tx)),
        );
        (StreamingDispatcher::new(registry), rx)
    }

    #[test]
    fn terminal_push_is_last_and_closes_request() {
        let (dispatcher, mut rx) = registered("s1");
        dispatcher.push("s1", serde_json::json!(1), false).unwrap();
        dispatcher.push("s1", serde_json::json!(2), false).unwrap();
        dispatcher.push("s1", serde_json::json!(3), true).unwrap();

        let err = dispatcher.push("s1", serde_json::json!(4), false).unwrap_err();
        assert_eq!(err, DeliveryError::NotRegistered("s1".to_owned()));

        let received: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let payloads: Vec<_> = received.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(payloads, vec![serde_json::json!(1), serde_json::json!(2), serde_json::json!(3)]);
        assert_eq!(
            received.iter().map(|m| m.is_last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
    }

    #[test]
    fn error_push_terminates_exchange() {
        let (dispatcher, mut rx) = registered("e1");
        dispatcher.push_error("e1", "provider exploded").unwrap();
        let msg = rx.try_recv().unwrap();
        assert!(!msg.ok);
        assert!(msg.is_last);
        assert!(!dispatcher.registry().contains("e1"));
    }

    #[test]
    fn delivery_failure_unregisters_and_runs_cleanup() {
        let registry = RequestRegistry::new();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleanups);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        registry.register(
            "dead",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            RequestMetadata::default(),
            Some(channel_push_fn(tx)),
        );
        let dispatcher = StreamingDispatcher::new(registry);

        let err = dispatcher.push("dead", serde_json::json!({}), false).unwrap_err();
        assert_eq!(err, DeliveryError::ChannelClosed("dead".to_owned()));
        assert!(!dispatcher.registry().contains("dead"));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn push_to_unknown_id_is_a_miss() {
        let dispatcher = StreamingDispatcher::new(RequestRegistry::new());
        assert_eq!(
            dispatcher.push("ghost", serde_json::json!({}), true),
            Err(DeliveryError::NotRegistered("ghost".to_owned()))
        );
    }

    #[tokio::test]
    async fn forward_sends_chunks_then_done() {
        let (dispatcher, mut rx) = registered("f1");
        let items = futures_util::stream::iter(vec![
            Ok::<_, String>(serde_json::json!({"text": "a"})),
            Ok(serde_json::json!({"text": "b"})),
        ]);
        let outcome = dispatcher
            .forward("f1", items, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ForwardOutcome::Completed);

        let received: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(received.len(), 3);
        assert_eq!(received[2].payload, serde_json::json!({"done": true}));
        assert!(received[2].is_last);
    }

    #[tokio::test]
    async fn forward_reports_producer_failure() {
        let (dispatcher, mut rx) = registered("f2");
        let items = futures_util::stream::iter(vec![
            Ok(serde_json::json!({"text": "a"})),
            Err("upstream reset".to_owned()),
        ]);
        let outcome = dispatcher
            .forward("f2", items, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ForwardOutcome::Failed("upstream reset".to_owned()));

        let _first = rx.try_recv().unwrap();
        let err = rx.try_recv().unwrap();
        assert_eq!(err.error.as_deref(), Some("upstream reset"));
        assert!(err.is_last);
    }

    #[tokio::test]
    async fn forward_stops_when_request_unregistered() {
        let (dispatcher, mut rx) = registered("f3");
        let registry = dispatcher.registry().clone();
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let items = futures_util::stream::iter(0..10).map(move |n| {
            if n == 2 {
                registry.unregister("f3");
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(serde_json::json!(n))
        });

        let outcome = dispatcher
            .forward("f3", items, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ForwardOutcome::Cancelled);
        assert_eq!(pulled.load(Ordering::SeqCst), 3);

        let received: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(received.len(), 2);
        assert!(received.iter().all(|m| !m.is_last));
    }

    #[tokio::test]
    async fn forward_honours_cancellation_token() {
        let (dispatcher, _rx) = registered("f4");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = dispatcher
            .forward("f4", futures_util::stream::pending::<Result<serde_json::Value, String>>(), &cancel)
            .await;
        assert_eq!(outcome, ForwardOutcome::Cancelled);
    }

    #[test]
    fn responder_tracks_liveness() {
        let (dispatcher, mut rx) = registered("r1");
        let responder = dispatcher.responder("r1");
        assert!(responder.is_active());
        responder.send(serde_json::json!("x")).unwrap();
        responder.finish(serde_json::json!("y")).unwrap();
        assert!(!responder.is_active());
        assert!(responder.send(serde_json::json!("z")).is_err());
        assert_eq!(rx.try_recv().unwrap().payload, serde_json::json!("x"));
        assert!(rx.try_recv().unwrap().is_last);
    }
}
