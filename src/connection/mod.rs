//! Streaming pull connections.
//!
//! A [`StreamingSubscriberConnection`] owns one streaming pull stream, reconnecting it
//! with exponential backoff while errors are retryable, and one [`MessageDispatcher`]
//! that manages the messages the stream delivers. Acks and deadline changes produced by
//! the dispatcher go out as unary RPCs through the connection's ack sender.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::ack::modack::ModackRequestData;
use crate::ack::{partition_acks, AckRequestData, AckResponse, MAX_PER_REQUEST_CHANGES};
use crate::config::{
    RetrySettings, SubscriberConfig, DEFAULT_STREAM_ACK_DEADLINE, FINAL_NACK_TIMEOUT,
    MAX_STREAM_ACK_DEADLINE, MIN_STREAM_ACK_DEADLINE,
};
use crate::core::flow_control::FlowControlSettings;
use crate::core::status::{classify_ack_failures, failed_ack_response, is_retryable};
use crate::core::{Distribution, FlowController, Waiter};
use crate::error::{Error, Result};
use crate::hooks::{RpcKind, SubscriberHooks};
use crate::lifecycle::{Lifecycle, State};
use crate::metrics::{get_metrics, Metrics};
use crate::shutdown::ShutdownSignal;
use crate::subscriber::receiver::MessageReceiver;
use crate::transport::{PullStream, SubscriberTransport};
use crate::types::{StreamingPullRequest, StreamingPullResponse};

pub mod dispatcher;
pub(crate) mod ordering;

pub use dispatcher::{AckProcessor, AckReplyConsumer, DispatcherSettings, MessageDispatcher};

/// Backoff before the first reconnect of a broken stream.
pub const INITIAL_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
/// Upper bound of the reconnect backoff.
pub const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stream ack deadline sent when opening a stream.
///
/// The configured per extension maximum, clamped to what the service accepts, or
/// [`DEFAULT_STREAM_ACK_DEADLINE`] without one.
pub fn stream_ack_deadline(max_duration_per_ack_extension: Option<Duration>) -> Duration {
    match max_duration_per_ack_extension {
        Some(max) => max.clamp(MIN_STREAM_ACK_DEADLINE, MAX_STREAM_ACK_DEADLINE),
        None => DEFAULT_STREAM_ACK_DEADLINE,
    }
}

/// Settings of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Settings of the connection's dispatcher.
    pub dispatcher: DispatcherSettings,
    /// Client id shared by every connection of a subscriber.
    pub client_id: String,
    /// Index of the connection within its subscriber.
    pub channel_affinity: usize,
    /// Flow control limits, reported to the service unless legacy flow control is on.
    pub flow_control: FlowControlSettings,
    /// Keep flow control limits out of the stream request.
    pub use_legacy_flow_control: bool,
    /// Retry policy for acks and deadline changes.
    pub retry: RetrySettings,
}

impl ConnectionSettings {
    /// Derive connection settings from a subscriber configuration.
    pub fn from_config(config: &SubscriberConfig, client_id: String, channel_affinity: usize) -> Self {
        Self {
            dispatcher: DispatcherSettings::from_config(config),
            client_id,
            channel_affinity,
            flow_control: config.flow_control.clone(),
            use_legacy_flow_control: config.use_legacy_flow_control,
            retry: config.retry,
        }
    }

    fn subscription(&self) -> &str {
        &self.dispatcher.subscription
    }
}

/// One streaming pull connection and the messages it delivered.
pub struct StreamingSubscriberConnection {
    settings: ConnectionSettings,
    lifecycle: Arc<Lifecycle>,
    dispatcher: Arc<MessageDispatcher>,
    ack_sender: Arc<AckSender>,
    transport: Arc<dyn SubscriberTransport>,
    metrics: Arc<Metrics>,
    shutdown: ShutdownSignal,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<StreamingSubscriberConnection>,
}

impl StreamingSubscriberConnection {
    /// Create a connection. Nothing is opened until [`start`](Self::start).
    pub fn new(
        settings: ConnectionSettings,
        transport: Arc<dyn SubscriberTransport>,
        receiver: Arc<dyn MessageReceiver>,
        flow_controller: Arc<FlowController>,
        ack_latency_distribution: Arc<Distribution>,
        hooks: Arc<dyn SubscriberHooks>,
    ) -> Arc<Self> {
        let lifecycle = Arc::new(Lifecycle::new(format!(
            "connection-{}",
            settings.channel_affinity
        )));
        let ack_sender = AckSender::new(
            settings.subscription().to_string(),
            transport.clone(),
            lifecycle.clone(),
            settings.retry,
            settings.dispatcher.ack_response_enabled,
            hooks.clone(),
        );
        let dispatcher = {
            let ack_sender = ack_sender.clone();
            MessageDispatcher::new(
                settings.dispatcher.clone(),
                receiver,
                flow_controller,
                ack_latency_distribution,
                hooks,
                move |weak| {
                    let _ = ack_sender.dispatcher.set(weak);
                    ack_sender as Arc<dyn AckProcessor>
                },
            )
        };

        Arc::new_cyclic(|self_ref| Self {
            settings,
            lifecycle,
            dispatcher,
            ack_sender,
            transport,
            metrics: get_metrics(),
            shutdown: ShutdownSignal::new(),
            stream_task: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Lifecycle of this connection.
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// The dispatcher managing this connection's messages.
    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// First request sent on every stream this connection opens.
    pub fn initial_request(&self) -> StreamingPullRequest {
        let (max_messages, max_bytes) = if self.settings.use_legacy_flow_control {
            (0, 0)
        } else {
            let flow = &self.settings.flow_control;
            (
                flow.max_outstanding_element_count.map_or(0, |v| v as i64),
                flow.max_outstanding_request_bytes.map_or(0, |v| v as i64),
            )
        };

        StreamingPullRequest {
            subscription: self.settings.subscription().to_string(),
            stream_ack_deadline_seconds: stream_ack_deadline(
                self.settings.dispatcher.max_duration_per_ack_extension,
            )
            .as_secs() as i32,
            client_id: self.settings.client_id.clone(),
            max_outstanding_messages: max_messages,
            max_outstanding_bytes: max_bytes,
        }
    }

    /// Start the dispatcher and the stream.
    pub fn start(&self) -> Result<()> {
        self.lifecycle.notify_starting()?;
        let this = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::IllegalState("connection dropped while starting".to_string()))?;

        self.dispatcher.start();
        *lock(&self.stream_task) = Some(tokio::spawn(this.run_stream()));
        self.lifecycle.notify_started();
        info!(
            subscription = %self.settings.subscription(),
            channel = self.settings.channel_affinity,
            "Streaming connection started"
        );
        Ok(())
    }

    /// Stop the connection.
    ///
    /// Closes the stream, stops the dispatcher under the configured shutdown mode, and
    /// waits for in flight acks and deadline changes. Returns the failure cause when the
    /// connection had already failed.
    pub async fn stop(&self) -> Result<()> {
        if self.lifecycle.notify_stopping().is_none() {
            return match self.lifecycle.state() {
                State::New => {
                    self.lifecycle.notify_stopped();
                    Ok(())
                }
                _ => self.lifecycle.await_terminated().await,
            };
        }

        self.run_shutdown().await;
        let task = lock(&self.stream_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Stream task ended abnormally");
            }
        }
        self.lifecycle.notify_stopped();
        info!(
            subscription = %self.settings.subscription(),
            channel = self.settings.channel_affinity,
            "Streaming connection stopped"
        );
        Ok(())
    }

    async fn run_shutdown(&self) {
        self.shutdown.trigger();
        let started = Instant::now();
        self.dispatcher.stop().await;

        match self.settings.dispatcher.shutdown.timeout() {
            None => self.ack_sender.pending.wait_complete_async().await,
            Some(timeout) => {
                let remaining = timeout
                    .saturating_sub(started.elapsed())
                    .max(FINAL_NACK_TIMEOUT);
                if !self.ack_sender.pending.try_wait_async(remaining).await {
                    warn!(
                        subscription = %self.settings.subscription(),
                        in_flight = self.ack_sender.pending.pending_count(),
                        "Timed out waiting for ack operations to complete"
                    );
                }
            }
        }
    }

    async fn run_stream(self: Arc<Self>) {
        let mut backoff = INITIAL_RECONNECT_BACKOFF;

        loop {
            if self.shutdown.is_triggered() {
                return;
            }

            let opened = tokio::select! {
                _ = self.shutdown.wait() => return,
                opened = self.transport.streaming_pull(self.initial_request()) => opened,
            };
            let stream = match opened {
                Ok(stream) => stream,
                Err(err) => {
                    if self.handle_stream_error(err, &mut backoff).await {
                        continue;
                    }
                    return;
                }
            };

            match self.consume(stream, &mut backoff).await {
                StreamEnd::Reconnect => continue,
                StreamEnd::Stop => return,
            }
        }
    }

    async fn consume(&self, mut stream: PullStream, backoff: &mut Duration) -> StreamEnd {
        loop {
            let item = tokio::select! {
                _ = self.shutdown.wait() => return StreamEnd::Stop,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(response)) => {
                    *backoff = INITIAL_RECONNECT_BACKOFF;
                    self.on_response(response).await;
                }
                Some(Err(err)) => {
                    return if self.handle_stream_error(err, backoff).await {
                        StreamEnd::Reconnect
                    } else {
                        StreamEnd::Stop
                    };
                }
                None => {
                    debug!(
                        subscription = %self.settings.subscription(),
                        "Stream closed by the service, reconnecting"
                    );
                    return StreamEnd::Reconnect;
                }
            }
        }
    }

    async fn on_response(&self, response: StreamingPullResponse) {
        let properties = response.subscription_properties;
        self.dispatcher
            .set_exactly_once_delivery_enabled(properties.exactly_once_delivery_enabled);
        self.dispatcher
            .set_message_ordering_enabled(properties.message_ordering_enabled);
        self.dispatcher
            .process_received_messages(response.received_messages)
            .await;
    }

    // Returns true when the stream should be reopened.
    async fn handle_stream_error(&self, err: Error, backoff: &mut Duration) -> bool {
        if !self.lifecycle.is_alive() || self.shutdown.is_triggered() {
            debug!(error = %err, "Stream ended during shutdown");
            return false;
        }

        if !is_retryable(&err) {
            error!(
                subscription = %self.settings.subscription(),
                channel = self.settings.channel_affinity,
                error = %err,
                "Streaming pull failed permanently"
            );
            self.run_shutdown().await;
            self.lifecycle.notify_failed(Arc::new(err));
            return false;
        }

        warn!(
            subscription = %self.settings.subscription(),
            error = %err,
            backoff_ms = backoff.as_millis() as u64,
            "Streaming pull failed, reconnecting"
        );
        self.metrics
            .stream_reconnects_total
            .with_label_values(&[self.settings.subscription()])
            .inc();

        tokio::select! {
            _ = self.shutdown.wait() => return false,
            _ = tokio::time::sleep(*backoff) => {}
        }
        *backoff = (*backoff * 2).min(MAX_RECONNECT_BACKOFF);
        true
    }
}

enum StreamEnd {
    Reconnect,
    Stop,
}

/// Sends acks and deadline changes as unary RPCs, one task per request.
struct AckSender {
    subscription: String,
    transport: Arc<dyn SubscriberTransport>,
    lifecycle: Arc<Lifecycle>,
    dispatcher: OnceLock<Weak<MessageDispatcher>>,
    retry: RetrySettings,
    ack_response_enabled: bool,
    hooks: Arc<dyn SubscriberHooks>,
    metrics: Arc<Metrics>,
    // RPCs in flight.
    pending: Waiter,
    self_ref: Weak<AckSender>,
}

impl AckSender {
    fn new(
        subscription: String,
        transport: Arc<dyn SubscriberTransport>,
        lifecycle: Arc<Lifecycle>,
        retry: RetrySettings,
        ack_response_enabled: bool,
        hooks: Arc<dyn SubscriberHooks>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            subscription,
            transport,
            lifecycle,
            dispatcher: OnceLock::new(),
            retry,
            ack_response_enabled,
            hooks,
            metrics: get_metrics(),
            pending: Waiter::new(),
            self_ref: self_ref.clone(),
        })
    }

    fn dispatcher(&self) -> Option<Arc<MessageDispatcher>> {
        self.dispatcher.get().and_then(Weak::upgrade)
    }

    fn spawn_send(&self, kind: RpcKind, seconds: i32, requests: Vec<AckRequestData>) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        self.pending.increment_pending_count(1);
        tokio::spawn(async move {
            this.send(kind, seconds, requests).await;
            this.pending.increment_pending_count(-1);
        });
    }

    async fn send(&self, kind: RpcKind, seconds: i32, mut requests: Vec<AckRequestData>) {
        let mut attempt = 0;

        loop {
            let ack_ids: Vec<_> = requests.iter().map(|r| r.ack_id().clone()).collect();
            let count = ack_ids.len();

            self.hooks
                .on_rpc_start(&self.subscription, kind, count, seconds);
            self.metrics
                .ack_ids_sent_total
                .with_label_values(&[&self.subscription, kind.as_str()])
                .inc_by(count as u64);

            let result = match kind {
                RpcKind::Ack => self.transport.acknowledge(&self.subscription, ack_ids).await,
                _ => {
                    self.transport
                        .modify_ack_deadline(&self.subscription, ack_ids, seconds)
                        .await
                }
            };
            self.hooks.on_rpc_end(&self.subscription, kind, count);

            let err = match result {
                Ok(()) => {
                    self.on_succeeded(kind, requests).await;
                    return;
                }
                Err(err) => err,
            };

            self.hooks.on_rpc_error(&self.subscription, kind, &err);
            if self.lifecycle.is_alive() {
                warn!(
                    subscription = %self.subscription,
                    kind = %kind,
                    ack_ids = count,
                    error = %err,
                    "Ack operation failed"
                );
            } else {
                debug!(kind = %kind, error = %err, "Ack operation failed during shutdown");
            }

            let failures = classify_ack_failures(&err, requests);
            self.on_succeeded(kind, failures.succeeded).await;
            for (request, response) in failures.failed {
                self.on_failed(&request, response);
            }
            if failures.retry.is_empty() {
                return;
            }

            attempt += 1;
            if attempt >= self.retry.max_attempts {
                let response = failed_ack_response(&err);
                for request in failures.retry {
                    self.on_failed(&request, response);
                }
                return;
            }

            tokio::time::sleep(self.retry.backoff(attempt - 1)).await;
            requests = failures.retry;
        }
    }

    async fn on_succeeded(&self, kind: RpcKind, requests: Vec<AckRequestData>) {
        match kind {
            RpcKind::Ack | RpcKind::Nack => {
                for request in &requests {
                    request.set_response(AckResponse::Successful, self.ack_response_enabled);
                }
            }
            RpcKind::ReceiptModack => {
                let Some(dispatcher) = self.dispatcher() else {
                    return;
                };
                if dispatcher.exactly_once_delivery_enabled() {
                    for request in &requests {
                        dispatcher.notify_ack_success(request).await;
                    }
                }
            }
            RpcKind::Modack => {}
        }
    }

    fn on_failed(&self, request: &AckRequestData, response: AckResponse) {
        request.set_response(response, false);
        self.metrics
            .ack_failures_total
            .with_label_values(&[&self.subscription, response.as_str()])
            .inc();

        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.notify_ack_failed(request);
        }
    }
}

impl AckProcessor for AckSender {
    fn send_ack_operations(&self, acks: Vec<AckRequestData>) {
        for chunk in partition_acks(acks, MAX_PER_REQUEST_CHANGES) {
            self.spawn_send(RpcKind::Ack, 0, chunk);
        }
    }

    fn send_modack_operations(&self, modacks: Vec<ModackRequestData>) {
        for modack in ModackRequestData::partition_all(&modacks, MAX_PER_REQUEST_CHANGES) {
            let kind = if modack.is_nack() {
                RpcKind::Nack
            } else if modack.is_receipt_modack() {
                RpcKind::ReceiptModack
            } else {
                RpcKind::Modack
            };
            let seconds = modack.deadline_extension_seconds();
            self.spawn_send(kind, seconds, modack.into_ack_requests());
        }
    }
}
