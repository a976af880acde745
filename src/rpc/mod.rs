//! Host <-> UI request/response and publish/subscribe plumbing.

pub mod broker;
pub mod contract;
pub mod dispatcher;
pub mod registry;

pub use broker::{SubscriptionBroker, subscription_broker};
pub use contract::{
    CommandEnvelope, CommandName, DecodeError, EventEnvelope, ResponseEnvelope, Topic,
};
pub use dispatcher::{ForwardOutcome, StreamResponder, StreamingDispatcher};
pub use registry::{
    PushFn, RequestMetadata, RequestRegistry, bounded_push_fn, channel_push_fn, noop_cleanup,
};
