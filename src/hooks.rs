//! Instrumentation hooks called at every step of a message's life.
//!
//! The engine calls every hook unconditionally. Implementations can open and close
//! tracing spans, export events, or record test observations. Every method has an empty
//! default, so an implementation only overrides what it cares about.

use std::fmt;

use crate::ack::AckReply;
use crate::error::Error;
use crate::types::DeliveryMetadata;

/// Kind of control RPC sent by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcKind {
    /// Acknowledge.
    Ack,
    /// Deadline extension.
    Modack,
    /// Modify deadline to zero.
    Nack,
    /// Initial lease for newly received messages.
    ReceiptModack,
}

impl RpcKind {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            RpcKind::Ack => "ack",
            RpcKind::Modack => "modack",
            RpcKind::Nack => "nack",
            RpcKind::ReceiptModack => "receipt_modack",
        }
    }
}

impl fmt::Display for RpcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle hooks for a subscriber.
#[allow(unused_variables)]
pub trait SubscriberHooks: Send + Sync {
    /// A message was received from the stream.
    fn on_subscribe_start(&self, subscription: &str, metadata: &DeliveryMetadata, exactly_once: bool) {}

    /// The message reached its final local state.
    fn on_subscribe_end(&self, metadata: &DeliveryMetadata) {}

    /// The message lease ran out and it was dropped locally.
    fn on_expired(&self, metadata: &DeliveryMetadata) {}

    /// Waiting on flow control started.
    fn on_flow_control_start(&self, metadata: &DeliveryMetadata) {}

    /// Waiting on flow control ended.
    fn on_flow_control_end(&self, metadata: &DeliveryMetadata) {}

    /// The message was handed to the user callback.
    fn on_process_start(&self, metadata: &DeliveryMetadata) {}

    /// The user replied to the message. `action` is `"ack"`, `"nack"` or a failure label.
    fn on_process_end(&self, metadata: &DeliveryMetadata, reply: AckReply, action: &str) {}

    /// A control RPC is about to be sent.
    fn on_rpc_start(&self, subscription: &str, kind: RpcKind, ack_ids: usize, seconds: i32) {}

    /// A control RPC completed successfully.
    fn on_rpc_end(&self, subscription: &str, kind: RpcKind, ack_ids: usize) {}

    /// A control RPC failed.
    fn on_rpc_error(&self, subscription: &str, kind: RpcKind, err: &Error) {}

    /// The user callback returned an error.
    fn on_callback_error(&self, metadata: &DeliveryMetadata, err: &str) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl SubscriberHooks for NoopHooks {}
