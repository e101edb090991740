//! In-memory transport.
//!
//! Behaves like a single subscription on the service: published messages are delivered
//! round-robin over the open streams, nacked messages are redelivered, and every RPC is
//! recorded so tests and the simulator can inspect what the subscriber sent. Failures can
//! be injected for any RPC.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::Mutex;
use tonic::Code;
use tracing::{debug, info};

use crate::core::status::{ack_id_reasons, SHUTDOWN_NOW_MESSAGE};
use crate::error::{Error, Result};
use crate::transport::{PullStream, SubscriberTransport};
use crate::types::{
    AckId, PubsubMessage, ReceivedMessage, StreamingPullRequest, StreamingPullResponse,
    SubscriptionProperties,
};

const INVALID_ACK_ID_REASON: &str = "PERMANENT_FAILURE_INVALID_ACK_ID";

/// Configuration for the in-memory transport.
#[derive(Debug, Clone)]
pub struct InMemoryTransportConfig {
    /// Redeliver messages that are nacked.
    pub redeliver_on_nack: bool,
    /// Report delivery attempts, as a subscription with a dead letter policy does.
    pub dead_letter_policy: bool,
}

impl Default for InMemoryTransportConfig {
    fn default() -> Self {
        Self {
            redeliver_on_nack: true,
            dead_letter_policy: false,
        }
    }
}

/// One recorded modify ack deadline call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModackCall {
    /// Ack ids in the request.
    pub ack_ids: Vec<AckId>,
    /// Requested deadline.
    pub seconds: i32,
}

type StreamSender = mpsc::UnboundedSender<Result<StreamingPullResponse>>;

struct Pending {
    message: PubsubMessage,
    delivery_attempt: i32,
}

#[derive(Default)]
struct TransportState {
    streams: Vec<StreamSender>,
    next_stream: usize,
    next_ack_id: u64,
    next_message_id: u64,
    backlog: VecDeque<Pending>,
    outstanding: HashMap<AckId, Pending>,
    properties: SubscriptionProperties,
    shut_down: bool,

    pull_failures: VecDeque<Error>,
    ack_failures: VecDeque<Error>,
    modack_failures: VecDeque<Error>,

    requests: Vec<StreamingPullRequest>,
    acked: Vec<AckId>,
    acknowledge_calls: usize,
    modacks: Vec<ModackCall>,
}

impl TransportState {
    fn deliver(&mut self, pending: Pending) {
        while !self.streams.is_empty() {
            let index = self.next_stream % self.streams.len();
            self.next_stream = self.next_stream.wrapping_add(1);

            self.next_ack_id += 1;
            let ack_id = AckId::new(format!("ack-{}", self.next_ack_id));
            let response = StreamingPullResponse {
                received_messages: vec![ReceivedMessage {
                    ack_id: ack_id.clone(),
                    message: pending.message.clone(),
                    delivery_attempt: pending.delivery_attempt,
                }],
                subscription_properties: self.properties,
            };

            if self.streams[index].unbounded_send(Ok(response)).is_ok() {
                self.outstanding.insert(ack_id, pending);
                return;
            }
            // Receiver dropped; forget the stream and try the next one.
            self.streams.swap_remove(index);
        }
        self.backlog.push_back(pending);
    }

    fn check_alive(&self) -> Result<()> {
        if self.shut_down {
            return Err(Error::rpc(Code::Unavailable, SHUTDOWN_NOW_MESSAGE));
        }
        Ok(())
    }

    // Unknown ack ids are only reported when the subscription has exactly once delivery.
    fn invalid_ids(&self, ack_ids: &[AckId]) -> HashMap<String, String> {
        if !self.properties.exactly_once_delivery_enabled {
            return HashMap::new();
        }
        ack_id_reasons(
            ack_ids
                .iter()
                .filter(|id| !self.outstanding.contains_key(*id))
                .map(|id| (id.to_string(), INVALID_ACK_ID_REASON)),
        )
    }
}

/// In-memory [`SubscriberTransport`].
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<InMemoryTransportInner>,
}

struct InMemoryTransportInner {
    state: Mutex<TransportState>,
    config: InMemoryTransportConfig,
}

impl InMemoryTransport {
    /// Create a transport with default configuration.
    pub fn new() -> Self {
        Self::with_config(InMemoryTransportConfig::default())
    }

    /// Create a transport with custom configuration.
    pub fn with_config(config: InMemoryTransportConfig) -> Self {
        info!(
            redeliver_on_nack = config.redeliver_on_nack,
            dead_letter_policy = config.dead_letter_policy,
            "Initializing in-memory transport"
        );
        Self {
            inner: Arc::new(InMemoryTransportInner {
                state: Mutex::new(TransportState::default()),
                config,
            }),
        }
    }

    /// Publish a message. Returns the assigned message id.
    pub async fn publish(&self, mut message: PubsubMessage) -> String {
        let mut state = self.inner.state.lock().await;
        state.next_message_id += 1;
        if message.message_id.is_empty() {
            message.message_id = format!("msg-{}", state.next_message_id);
        }
        let message_id = message.message_id.clone();
        let delivery_attempt = if self.inner.config.dead_letter_policy { 1 } else { 0 };
        state.deliver(Pending {
            message,
            delivery_attempt,
        });
        message_id
    }

    /// Set the subscription properties reported on every response.
    pub async fn set_subscription_properties(&self, properties: SubscriptionProperties) {
        self.inner.state.lock().await.properties = properties;
    }

    /// Fail the next streaming pull call with `err`.
    pub async fn fail_next_streaming_pull(&self, err: Error) {
        self.inner.state.lock().await.pull_failures.push_back(err);
    }

    /// Fail the next acknowledge call with `err`.
    pub async fn fail_next_acknowledge(&self, err: Error) {
        self.inner.state.lock().await.ack_failures.push_back(err);
    }

    /// Fail the next modify ack deadline call with `err`.
    pub async fn fail_next_modify_ack_deadline(&self, err: Error) {
        self.inner.state.lock().await.modack_failures.push_back(err);
    }

    /// Break every open stream with `err`.
    pub async fn break_streams(&self, err: Error) {
        let mut state = self.inner.state.lock().await;
        for stream in state.streams.drain(..) {
            let copy = match &err {
                Error::Rpc { code, message, metadata } => {
                    Error::rpc_with_metadata(*code, message.clone(), metadata.clone())
                }
                Error::Transport(message) => Error::Transport(message.clone()),
                other => Error::Internal(other.to_string()),
            };
            let _ = stream.unbounded_send(Err(copy));
        }
        debug!(error = %err, "Broke all in-memory streams");
    }

    /// End every open stream normally.
    pub async fn close_streams(&self) {
        self.inner.state.lock().await.streams.clear();
    }

    /// Initial requests of every stream opened so far.
    pub async fn streaming_pull_requests(&self) -> Vec<StreamingPullRequest> {
        self.inner.state.lock().await.requests.clone()
    }

    /// Number of streams currently open.
    pub async fn open_stream_count(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        state.streams.retain(|s| !s.is_closed());
        state.streams.len()
    }

    /// Ack ids accepted by acknowledge calls, in order.
    pub async fn acked_ids(&self) -> Vec<AckId> {
        self.inner.state.lock().await.acked.clone()
    }

    /// Number of acknowledge calls, including failed ones.
    pub async fn acknowledge_call_count(&self) -> usize {
        self.inner.state.lock().await.acknowledge_calls
    }

    /// Every modify ack deadline call, including failed ones.
    pub async fn modack_calls(&self) -> Vec<ModackCall> {
        self.inner.state.lock().await.modacks.clone()
    }

    /// Ack ids sent with a zero deadline.
    pub async fn nacked_ids(&self) -> Vec<AckId> {
        self.modack_calls()
            .await
            .into_iter()
            .filter(|call| call.seconds == 0)
            .flat_map(|call| call.ack_ids)
            .collect()
    }

    /// Messages delivered and neither acked nor nacked.
    pub async fn outstanding_count(&self) -> usize {
        self.inner.state.lock().await.outstanding.len()
    }

    /// Whether [`SubscriberTransport::shutdown`] was called.
    pub async fn is_shut_down(&self) -> bool {
        self.inner.state.lock().await.shut_down
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriberTransport for InMemoryTransport {
    async fn streaming_pull(&self, request: StreamingPullRequest) -> Result<PullStream> {
        let mut state = self.inner.state.lock().await;
        state.check_alive()?;
        if let Some(err) = state.pull_failures.pop_front() {
            return Err(err);
        }

        debug!(
            subscription = %request.subscription,
            client_id = %request.client_id,
            stream_ack_deadline_seconds = request.stream_ack_deadline_seconds,
            "Opening in-memory stream"
        );
        state.requests.push(request);

        let (sender, receiver) = mpsc::unbounded();
        state.streams.push(sender);
        while let Some(pending) = state.backlog.pop_front() {
            state.deliver(pending);
        }
        Ok(receiver.boxed())
    }

    async fn acknowledge(&self, _subscription: &str, ack_ids: Vec<AckId>) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.acknowledge_calls += 1;
        state.check_alive()?;
        if let Some(err) = state.ack_failures.pop_front() {
            return Err(err);
        }

        let invalid = state.invalid_ids(&ack_ids);
        for ack_id in ack_ids {
            if state.outstanding.remove(&ack_id).is_some() || invalid.is_empty() {
                state.acked.push(ack_id);
            }
        }

        if invalid.is_empty() {
            Ok(())
        } else {
            Err(Error::rpc_with_metadata(
                Code::InvalidArgument,
                "Some acknowledgement ids in the request were invalid",
                invalid,
            ))
        }
    }

    async fn modify_ack_deadline(
        &self,
        _subscription: &str,
        ack_ids: Vec<AckId>,
        ack_deadline_seconds: i32,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.modacks.push(ModackCall {
            ack_ids: ack_ids.clone(),
            seconds: ack_deadline_seconds,
        });
        state.check_alive()?;
        if let Some(err) = state.modack_failures.pop_front() {
            return Err(err);
        }

        let invalid = state.invalid_ids(&ack_ids);
        if ack_deadline_seconds == 0 {
            let unique: HashSet<AckId> = ack_ids.into_iter().collect();
            for ack_id in unique {
                let Some(mut pending) = state.outstanding.remove(&ack_id) else {
                    continue;
                };
                if self.inner.config.redeliver_on_nack {
                    if pending.delivery_attempt > 0 {
                        pending.delivery_attempt += 1;
                    }
                    state.deliver(pending);
                }
            }
        }

        if invalid.is_empty() {
            Ok(())
        } else {
            Err(Error::rpc_with_metadata(
                Code::InvalidArgument,
                "Some acknowledgement ids in the request were invalid",
                invalid,
            ))
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.shut_down {
            return Ok(());
        }
        state.shut_down = true;
        for stream in state.streams.drain(..) {
            let _ = stream.unbounded_send(Err(Error::rpc(Code::Unavailable, SHUTDOWN_NOW_MESSAGE)));
        }
        info!("In-memory transport shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StreamingPullRequest {
        StreamingPullRequest {
            subscription: "projects/p/subscriptions/s".to_string(),
            stream_ack_deadline_seconds: 60,
            client_id: "client".to_string(),
            ..Default::default()
        }
    }

    async fn next_ack_id(stream: &mut PullStream) -> AckId {
        let response = stream.next().await.unwrap().unwrap();
        response.received_messages[0].ack_id.clone()
    }

    #[tokio::test]
    async fn test_backlog_flushed_on_open() {
        let transport = InMemoryTransport::new();
        transport.publish(PubsubMessage::new("a")).await;
        transport.publish(PubsubMessage::new("b")).await;

        let mut stream = transport.streaming_pull(request()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();

        assert_eq!(first.received_messages[0].message.data, b"a");
        assert_eq!(second.received_messages[0].message.data, b"b");
        assert_eq!(transport.outstanding_count().await, 2);
        assert_eq!(transport.streaming_pull_requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ack_removes_outstanding() {
        let transport = InMemoryTransport::new();
        let mut stream = transport.streaming_pull(request()).await.unwrap();
        transport.publish(PubsubMessage::new("a")).await;

        let ack_id = next_ack_id(&mut stream).await;
        transport
            .acknowledge("projects/p/subscriptions/s", vec![ack_id.clone()])
            .await
            .unwrap();

        assert_eq!(transport.acked_ids().await, vec![ack_id]);
        assert_eq!(transport.outstanding_count().await, 0);
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_next_attempt() {
        let transport = InMemoryTransport::with_config(InMemoryTransportConfig {
            redeliver_on_nack: true,
            dead_letter_policy: true,
        });
        let mut stream = transport.streaming_pull(request()).await.unwrap();
        transport.publish(PubsubMessage::new("a")).await;

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.received_messages[0].delivery_attempt, 1);

        transport
            .modify_ack_deadline("s", vec![first.received_messages[0].ack_id.clone()], 0)
            .await
            .unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.received_messages[0].delivery_attempt, 2);
        assert_ne!(second.received_messages[0].ack_id, first.received_messages[0].ack_id);
        assert_eq!(transport.nacked_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_used_once() {
        let transport = InMemoryTransport::new();
        transport
            .fail_next_acknowledge(Error::rpc(Code::Internal, "boom"))
            .await;

        assert!(transport.acknowledge("s", vec![AckId::new("x")]).await.is_err());
        assert!(transport.acknowledge("s", vec![AckId::new("x")]).await.is_ok());
        assert_eq!(transport.acknowledge_call_count().await, 2);
    }

    #[tokio::test]
    async fn test_exactly_once_reports_invalid_ack_ids() {
        let transport = InMemoryTransport::new();
        transport
            .set_subscription_properties(SubscriptionProperties {
                exactly_once_delivery_enabled: true,
                message_ordering_enabled: false,
            })
            .await;

        let err = transport
            .acknowledge("s", vec![AckId::new("unknown")])
            .await
            .unwrap_err();
        match err {
            Error::Rpc { metadata, .. } => {
                assert_eq!(metadata.get("unknown").map(String::as_str), Some(INVALID_ACK_ID_REASON));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_breaks_streams_and_rejects_rpcs() {
        let transport = InMemoryTransport::new();
        let mut stream = transport.streaming_pull(request()).await.unwrap();

        transport.shutdown().await.unwrap();

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains(SHUTDOWN_NOW_MESSAGE));
        assert!(stream.next().await.is_none());
        assert!(transport.streaming_pull(request()).await.is_err());
        assert!(transport.is_shut_down().await);
    }
}
