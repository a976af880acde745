//! Topic-based fan-out of host events to UI subscribers.
//!
//! A single broker task owns every topic's subscriber set. Subscribe,
//! unsubscribe and publish are messages to that task, so a publish always
//! sees a consistent set and a subscriber that joins after a publish was
//! queued does not receive that event.

use crate::rpc::contract::{EventEnvelope, ResponseEnvelope, Topic};
use crate::rpc::registry::{PushFn, RequestMetadata, RequestRegistry};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

struct Subscriber {
    owner: Option<String>,
    push: PushFn,
}

enum BrokerCommand {
    Subscribe {
        topic: Topic,
        subscription_id: String,
        subscriber: Subscriber,
    },
    Unsubscribe {
        topic: Topic,
        subscription_id: String,
    },
    Publish(EventEnvelope),
    Count {
        topic: Topic,
        reply: oneshot::Sender<usize>,
    },
}

/// Client handle to the broker task. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionBroker {
    command_tx: mpsc::UnboundedSender<BrokerCommand>,
    registry: RequestRegistry,
}

impl std::fmt::Debug for SubscriptionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionBroker")
            .field("closed", &self.command_tx.is_closed())
            .finish()
    }
}

/// The task side of the broker; owns the subscriber sets.
pub struct BrokerTask {
    command_rx: mpsc::UnboundedReceiver<BrokerCommand>,
    registry: RequestRegistry,
    topics: HashMap<Topic, HashMap<String, Subscriber>>,
}

/// Create a broker handle and the task that must be run for it to work.
#[must_use]
pub fn subscription_broker(registry: RequestRegistry) -> (SubscriptionBroker, BrokerTask) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    (
        SubscriptionBroker {
            command_tx,
            registry: registry.clone(),
        },
        BrokerTask {
            command_rx,
            registry,
            topics: HashMap::new(),
        },
    )
}

impl SubscriptionBroker {
    /// Create a broker and spawn its task on the current tokio runtime.
    #[must_use]
    pub fn spawn(registry: RequestRegistry) -> Self {
        let (broker, task) = subscription_broker(registry);
        tokio::spawn(task.run());
        broker
    }

    /// Add `push` to `topic`'s subscriber set.
    ///
    /// With a `request_id` the subscription is also registered in the request
    /// registry, so unregistering that id (cancel, owner teardown) removes the
    /// subscriber. Without one a random id is generated and only a delivery
    /// failure removes it. Returns the subscription id.
    pub fn subscribe(
        &self,
        topic: Topic,
        push: PushFn,
        request_id: Option<String>,
        owner: Option<String>,
    ) -> String {
        let subscription_id = match request_id {
            Some(request_id) => {
                let tx = self.command_tx.clone();
                let cleanup_id = request_id.clone();
                let mut metadata = RequestMetadata::default()
                    .with_topic(topic)
                    .with_tag("subscription");
                metadata.owner.clone_from(&owner);
                self.registry.register(
                    request_id.clone(),
                    Box::new(move || {
                        let _ = tx.send(BrokerCommand::Unsubscribe {
                            topic,
                            subscription_id: cleanup_id,
                        });
                    }),
                    metadata,
                    Some(push.clone()),
                );
                request_id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        self.send(BrokerCommand::Subscribe {
            topic,
            subscription_id: subscription_id.clone(),
            subscriber: Subscriber { owner, push },
        });
        subscription_id
    }

    /// Remove a subscriber. Idempotent.
    pub fn unsubscribe(&self, topic: Topic, subscription_id: &str) {
        self.send(BrokerCommand::Unsubscribe {
            topic,
            subscription_id: subscription_id.to_owned(),
        });
    }

    /// Queue an event for every current subscriber of its topic.
    ///
    /// Fire-and-forget: one delivery attempt per live subscriber, no replay.
    pub fn publish(&self, event: EventEnvelope) {
        self.send(BrokerCommand::Publish(event));
    }

    /// Number of subscribers on `topic` once every earlier command has been
    /// processed.
    pub async fn subscriber_count(&self, topic: Topic) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerCommand::Count { topic, reply });
        rx.await.unwrap_or(0)
    }

    fn send(&self, command: BrokerCommand) {
        if self.command_tx.send(command).is_err() {
            warn!("subscription broker task is gone; dropping command");
        }
    }
}

impl BrokerTask {
    /// Process broker commands until every handle has been dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            match command {
                BrokerCommand::Subscribe {
                    topic,
                    subscription_id,
                    subscriber,
                } => {
                    debug!(topic = topic.as_str(), subscription_id = %subscription_id, "subscriber added");
                    self.topics
                        .entry(topic)
                        .or_default()
                        .insert(subscription_id, subscriber);
                }
                BrokerCommand::Unsubscribe {
                    topic,
                    subscription_id,
                } => {
                    let removed = self
                        .topics
                        .get_mut(&topic)
                        .and_then(|set| set.remove(&subscription_id));
                    if removed.is_some() {
                        debug!(topic = topic.as_str(), subscription_id = %subscription_id, "subscriber removed");
                    }
                }
                BrokerCommand::Publish(event) => self.fan_out(&event),
                BrokerCommand::Count { topic, reply } => {
                    let count = self.topics.get(&topic).map_or(0, HashMap::len);
                    let _ = reply.send(count);
                }
            }
        }
        debug!("subscription broker stopped");
    }

    fn fan_out(&mut self, event: &EventEnvelope) {
        let Some(set) = self.topics.get_mut(&event.topic) else {
            return;
        };

        let mut dead = Vec::new();
        for (subscription_id, subscriber) in set.iter() {
            if !event.is_for(subscriber.owner.as_deref()) {
                continue;
            }
            let envelope = ResponseEnvelope::chunk(subscription_id.clone(), event.payload.clone());
            if let Err(e) = (subscriber.push)(envelope) {
                warn!(
                    topic = event.topic.as_str(),
                    subscription_id = %subscription_id,
                    error = %e,
                    "dropping subscriber after failed delivery"
                );
                dead.push(subscription_id.clone());
            }
        }

        for subscription_id in dead {
            set.remove(&subscription_id);
            // Runs the registry cleanup (if any); its unsubscribe message is
            // a no-op by the time it arrives.
            self.registry.unregister(&subscription_id);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::rpc::registry::channel_push_fn;

    fn event(topic: Topic) -> EventEnvelope {
        EventEnvelope::new(topic, None, serde_json::json!({"n": 1}))
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_of_topic_only() {
        let broker = SubscriptionBroker::spawn(RequestRegistry::new());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        broker.subscribe(Topic::FilePicker, channel_push_fn(tx_a), None, None);
        broker.subscribe(Topic::FocusChatInput, channel_push_fn(tx_b), None, None);

        broker.publish(event(Topic::FilePicker));
        assert_eq!(broker.subscriber_count(Topic::FilePicker).await, 1);

        assert_eq!(rx_a.try_recv().unwrap().payload, serde_json::json!({"n": 1}));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_replay() {
        let broker = SubscriptionBroker::spawn(RequestRegistry::new());
        broker.publish(event(Topic::FocusChatInput));
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe(Topic::FocusChatInput, channel_push_fn(tx), None, None);
        assert_eq!(broker.subscriber_count(Topic::FocusChatInput).await, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let broker = SubscriptionBroker::spawn(RequestRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = broker.subscribe(Topic::State, channel_push_fn(tx), None, None);
        broker.unsubscribe(Topic::State, &id);
        broker.unsubscribe(Topic::State, &id);
        assert_eq!(broker.subscriber_count(Topic::State).await, 0);
    }

    #[tokio::test]
    async fn registered_subscription_is_removed_by_unregister() {
        let registry = RequestRegistry::new();
        let broker = SubscriptionBroker::spawn(registry.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = broker.subscribe(
            Topic::FilePicker,
            channel_push_fn(tx),
            Some("sub-1".to_owned()),
            Some("ui-1".to_owned()),
        );
        assert_eq!(id, "sub-1");
        assert_eq!(
            registry.metadata("sub-1").and_then(|m| m.owner),
            Some("ui-1".to_owned())
        );
        assert_eq!(broker.subscriber_count(Topic::FilePicker).await, 1);

        assert_eq!(registry.unregister_owner("ui-1"), 1);
        assert_eq!(broker.subscriber_count(Topic::FilePicker).await, 0);
    }

    #[tokio::test]
    async fn targeted_event_skips_other_owners() {
        let broker = SubscriptionBroker::spawn(RequestRegistry::new());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        broker.subscribe(Topic::FilePicker, channel_push_fn(tx_a), None, Some("a".to_owned()));
        broker.subscribe(Topic::FilePicker, channel_push_fn(tx_b), None, Some("b".to_owned()));

        broker.publish(EventEnvelope::new(
            Topic::FilePicker,
            Some("b".to_owned()),
            serde_json::json!({}),
        ));
        assert_eq!(broker.subscriber_count(Topic::FilePicker).await, 2);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }
}
