//! # pullsub - streaming pull subscriber engine
//!
//! Client side engine for receiving messages from a Pub/Sub style service over
//! streaming pull connections.
//!
//! pullsub keeps message leases alive while user code processes them, batches acks and
//! deadline changes into bounded requests, applies client side flow control, and shuts
//! down either by waiting for processing or by nacking everything outstanding. The wire
//! is abstracted behind [`transport::SubscriberTransport`]; an in-memory implementation
//! ships for tests and local simulation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ack;
pub mod cli;
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod metrics;
pub mod shutdown;
pub mod subscriber;
pub mod transport;
pub mod types;

pub use ack::{AckReply, AckResponse, AckResponseFuture};
pub use config::{ShutdownMode, ShutdownSettings, SubscriberConfig};
pub use error::{Error, Result};
pub use lifecycle::State;
pub use subscriber::{receiver_fn, AckReplyConsumer, MessageReceiver, ReceiverError, Subscriber};
pub use types::PubsubMessage;
