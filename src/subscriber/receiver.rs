//! User callback invoked for every delivered message.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::dispatcher::AckReplyConsumer;
use crate::types::PubsubMessage;

/// Error a [`MessageReceiver`] may return. The message is then nacked.
pub type ReceiverError = Box<dyn std::error::Error + Send + Sync>;

/// Processes delivered messages.
///
/// Every message must eventually be acked or nacked through its [`AckReplyConsumer`].
/// The consumer may be moved elsewhere and replied to after `receive_message` returns.
/// Dropping it without a reply nacks the message, and so does returning an error.
#[async_trait]
pub trait MessageReceiver: Send + Sync + 'static {
    /// Handle one message.
    async fn receive_message(
        &self,
        message: PubsubMessage,
        consumer: AckReplyConsumer,
    ) -> Result<(), ReceiverError>;
}

/// [`MessageReceiver`] backed by an async closure.
pub struct FnReceiver<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageReceiver for FnReceiver<F>
where
    F: Fn(PubsubMessage, AckReplyConsumer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ReceiverError>> + Send + 'static,
{
    async fn receive_message(
        &self,
        message: PubsubMessage,
        consumer: AckReplyConsumer,
    ) -> Result<(), ReceiverError> {
        (self.f)(message, consumer).await
    }
}

/// Wrap an async closure as a receiver.
pub fn receiver_fn<F, Fut>(f: F) -> Arc<dyn MessageReceiver>
where
    F: Fn(PubsubMessage, AckReplyConsumer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ReceiverError>> + Send + 'static,
{
    Arc::new(FnReceiver { f })
}
