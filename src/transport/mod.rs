//! Transport between a subscriber and the Pub/Sub service.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::types::{AckId, StreamingPullRequest, StreamingPullResponse};
use crate::Result;

pub mod memory;

pub use memory::InMemoryTransport;

/// Responses of one streaming pull stream.
///
/// The stream ends normally when the service closes it and yields an `Err` item when it
/// breaks.
pub type PullStream = BoxStream<'static, Result<StreamingPullResponse>>;

/// RPCs a subscriber needs from the service.
#[async_trait]
pub trait SubscriberTransport: Send + Sync {
    /// Open a streaming pull stream, sending `request` as its first message.
    async fn streaming_pull(&self, request: StreamingPullRequest) -> Result<PullStream>;

    /// Acknowledge messages.
    async fn acknowledge(&self, subscription: &str, ack_ids: Vec<AckId>) -> Result<()>;

    /// Set the ack deadline of messages. Zero seconds returns them for redelivery.
    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<AckId>,
        ack_deadline_seconds: i32,
    ) -> Result<()>;

    /// Release background resources. Called once by the subscriber after every
    /// connection stopped.
    async fn shutdown(&self) -> Result<()>;
}
