//! Tether: request/response and publish/subscribe bridge between a host
//! process and its UI instances, with a layered configuration store.
//!
//! # Architecture
//!
//! - **Request registry** ([`rpc::registry`]): one entry per in-flight call,
//!   holding the caller's push function and a cleanup closure
//! - **Streaming dispatcher** ([`rpc::dispatcher`]): ordered pushes with
//!   `is_last` semantics and producer cancellation
//! - **Subscription broker** ([`rpc::broker`]): topic fan-out owned by a single
//!   task, dropping subscribers whose delivery fails
//! - **State manager** ([`state`]): secrets, global settings and task
//!   overrides resolved as task > mode > global, persisted in the background
//! - **Controller** ([`controller`]): routes commands, waits for UI
//!   visibility, publishes events
//!
//! The [`transport::stdio`] bridge exposes a controller over newline-delimited
//! JSON.

pub mod config;
pub mod controller;
pub mod dirs;
pub mod error;
pub mod provider;
pub mod rpc;
pub mod state;
pub mod transport;

pub use config::HostConfig;
pub use controller::Controller;
pub use error::{BridgeError, DeliveryError, Result};
pub use state::StateManager;
