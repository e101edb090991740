//! Ack bookkeeping: outcomes, pending ack requests and their completion handles.
//!
//! Every delivered message is tracked by one [`AckRequestData`]. When the user asked
//! for ack responses, the request carries an [`AckCompletion`] that is resolved at most
//! once with the final [`AckResponse`] of the ack, nack or deadline extension.

pub mod modack;

use std::future::IntoFuture;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::types::{AckId, DeliveryMetadata};

/// Maximum number of ack ids sent in one acknowledge or modify deadline RPC.
pub const MAX_PER_REQUEST_CHANGES: usize = 1000;

/// Terminal result of an ack, nack or deadline extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckResponse {
    /// The service accepted the request.
    Successful,
    /// The ack id was not valid (expired or unknown).
    Invalid,
    /// The caller lacks permission on the subscription.
    PermissionDenied,
    /// The subscription is not in a state that allows the request.
    FailedPrecondition,
    /// Any other failure.
    Other,
    /// The message was acked out of order on an ordered subscription.
    Unordered,
}

impl AckResponse {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            AckResponse::Successful => "successful",
            AckResponse::Invalid => "invalid",
            AckResponse::PermissionDenied => "permission_denied",
            AckResponse::FailedPrecondition => "failed_precondition",
            AckResponse::Other => "other",
            AckResponse::Unordered => "unordered",
        }
    }
}

impl std::fmt::Display for AckResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the user decided to do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReply {
    /// Acknowledge the message.
    Ack,
    /// Return the message for redelivery.
    Nack,
}

/// Single-resolution completion handle for an ack outcome.
///
/// Clones share the same slot. The first call to [`AckCompletion::resolve`] wins; later
/// calls, including concurrent ones, leave the stored outcome untouched.
#[derive(Debug, Clone)]
pub struct AckCompletion {
    slot: Arc<watch::Sender<Option<AckResponse>>>,
}

impl AckCompletion {
    /// Create an unresolved completion.
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Resolve the completion. Returns `true` if this call set the outcome.
    pub fn resolve(&self, response: AckResponse) -> bool {
        self.slot.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(response);
            true
        })
    }

    /// The outcome, if resolved.
    pub fn get(&self) -> Option<AckResponse> {
        *self.slot.borrow()
    }

    /// Whether an outcome has been set.
    pub fn is_resolved(&self) -> bool {
        self.get().is_some()
    }

    /// A future that completes with the outcome.
    pub fn response(&self) -> AckResponseFuture {
        AckResponseFuture {
            receiver: self.slot.subscribe(),
        }
    }
}

impl Default for AckCompletion {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned to users who asked for ack responses.
///
/// Resolves with [`AckResponse::Other`] if every handle to the completion is dropped
/// before it was resolved.
#[derive(Debug)]
pub struct AckResponseFuture {
    receiver: watch::Receiver<Option<AckResponse>>,
}

impl AckResponseFuture {
    /// The outcome, if already resolved.
    pub fn try_get(&self) -> Option<AckResponse> {
        *self.receiver.borrow()
    }
}

impl IntoFuture for AckResponseFuture {
    type Output = AckResponse;
    type IntoFuture = BoxFuture<'static, AckResponse>;

    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move {
            match self.receiver.wait_for(Option::is_some).await {
                Ok(response) => (*response).unwrap_or(AckResponse::Other),
                Err(_) => AckResponse::Other,
            }
        })
    }
}

/// One pending ack, nack or deadline extension for a delivered message.
#[derive(Debug, Clone)]
pub struct AckRequestData {
    ack_id: AckId,
    completion: Option<AckCompletion>,
    metadata: Arc<DeliveryMetadata>,
}

impl AckRequestData {
    /// Create a request without a completion handle.
    pub fn new(ack_id: AckId) -> Self {
        Self {
            ack_id,
            completion: None,
            metadata: Arc::new(DeliveryMetadata::default()),
        }
    }

    /// Attach a completion handle.
    pub fn with_completion(mut self, completion: AckCompletion) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Attach delivery metadata.
    pub fn with_metadata(mut self, metadata: DeliveryMetadata) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    /// The ack id.
    pub fn ack_id(&self) -> &AckId {
        &self.ack_id
    }

    /// Delivery metadata of the message.
    pub fn metadata(&self) -> &DeliveryMetadata {
        &self.metadata
    }

    /// The completion handle, if one was requested.
    pub fn completion(&self) -> Option<&AckCompletion> {
        self.completion.as_ref()
    }

    /// Whether a completion handle was requested.
    pub fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    /// Resolve the completion handle.
    ///
    /// Failures always propagate. [`AckResponse::Successful`] only propagates when
    /// `set_response_on_success` is true, which is the case when the user asked for ack
    /// responses. No-op without a handle or once resolved.
    pub fn set_response(&self, response: AckResponse, set_response_on_success: bool) -> &Self {
        if let Some(completion) = &self.completion {
            if response != AckResponse::Successful || set_response_on_success {
                completion.resolve(response);
            }
        }
        self
    }
}

/// Split ack requests into RPC sized chunks, preserving order.
pub fn partition_acks(requests: Vec<AckRequestData>, batch_size: usize) -> Vec<Vec<AckRequestData>> {
    let batch_size = batch_size.max(1);
    let mut chunks = Vec::with_capacity(requests.len().div_ceil(batch_size));
    let mut iter = requests.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(batch_size).collect());
    }
    chunks
}
