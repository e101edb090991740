//! Per connection lease management and ack batching.
//!
//! The dispatcher owns every message a connection received until it is acked, nacked or
//! expired. It hands messages to the receiver under flow control, keeps their leases
//! alive, and batches acks, nacks and receipts for the [`AckProcessor`] every
//! [`PENDING_ACKS_SEND_DELAY`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::ack::modack::ModackRequestData;
use crate::ack::{AckCompletion, AckReply, AckRequestData, AckResponse, AckResponseFuture};
use crate::config::{
    ShutdownMode, ShutdownSettings, SubscriberConfig, ACK_EXPIRATION_PADDING,
    DEFAULT_MIN_ACK_DEADLINE_EXTENSION_EXACTLY_ONCE, FINAL_NACK_TIMEOUT, MAX_STREAM_ACK_DEADLINE,
    MIN_STREAM_ACK_DEADLINE, PENDING_ACKS_SEND_DELAY,
};
use crate::connection::ordering::OrderedExecutor;
use crate::core::{Distribution, FlowController, Waiter};
use crate::error::{Error, Result};
use crate::hooks::SubscriberHooks;
use crate::metrics::{get_metrics, Metrics};
use crate::subscriber::receiver::MessageReceiver;
use crate::types::{
    AckId, DeliveryMetadata, PubsubMessage, ReceivedMessage, DELIVERY_ATTEMPT_ATTRIBUTE,
};

/// Percentile of ack latency used as the lease extension.
pub const PERCENTILE_FOR_ACK_DEADLINE_UPDATES: f64 = 99.9;
/// Acks slower than this percentile are logged.
pub const SLOW_ACK_PERCENTILE: f64 = 99.0;

// Stands in for lease budgets too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn whole_seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

fn instant_after(start: Instant, duration: Duration) -> Instant {
    start
        .checked_add(duration)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Sends batched ack operations on behalf of a dispatcher.
pub trait AckProcessor: Send + Sync {
    /// Send acks. Must not block.
    fn send_ack_operations(&self, acks: Vec<AckRequestData>);

    /// Send deadline modifications, nacks included. Must not block.
    fn send_modack_operations(&self, modacks: Vec<ModackRequestData>);
}

/// Dispatcher settings derived from the subscriber configuration.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Full subscription name.
    pub subscription: String,
    /// Total time a lease is extended for.
    pub max_ack_extension_period: Duration,
    /// Configured lower bound of one extension.
    pub min_duration_per_ack_extension: Option<Duration>,
    /// Configured upper bound of one extension.
    pub max_duration_per_ack_extension: Option<Duration>,
    /// Whether receivers get ack response futures.
    pub ack_response_enabled: bool,
    /// Shutdown behavior.
    pub shutdown: ShutdownSettings,
}

impl DispatcherSettings {
    /// Extract the dispatcher settings of a subscriber configuration.
    pub fn from_config(config: &SubscriberConfig) -> Self {
        Self {
            subscription: config.subscription.clone(),
            max_ack_extension_period: config.max_ack_extension_period(),
            min_duration_per_ack_extension: config.min_duration_per_ack_extension(),
            max_duration_per_ack_extension: config.max_duration_per_ack_extension(),
            ack_response_enabled: config.ack_response_enabled,
            shutdown: config.shutdown,
        }
    }
}

#[derive(Debug, Default)]
struct HandlerState {
    reserved: bool,
    forgotten: bool,
}

/// Lease bookkeeping of one received message.
struct AckHandler {
    request: AckRequestData,
    message: Mutex<Option<PubsubMessage>>,
    delivery_attempt: i32,
    outstanding_bytes: u64,
    received_at: Instant,
    total_expiration: Instant,
    state: Mutex<HandlerState>,
}

impl AckHandler {
    fn ack_id(&self) -> &AckId {
        self.request.ack_id()
    }

    fn metadata(&self) -> &DeliveryMetadata {
        self.request.metadata()
    }

    fn ordering_key(&self) -> String {
        self.metadata().ordering_key.clone()
    }
}

struct ReceiptEntry {
    handler: Arc<AckHandler>,
    complete: bool,
}

#[derive(Default)]
struct PendingOperations {
    acks: Vec<AckRequestData>,
    nacks: Vec<AckRequestData>,
    receipts: Vec<AckRequestData>,
}

/// Message dispatcher of one streaming connection.
pub struct MessageDispatcher {
    settings: DispatcherSettings,
    receiver: Arc<dyn MessageReceiver>,
    ack_processor: Arc<dyn AckProcessor>,
    flow_controller: Arc<FlowController>,
    ack_latency_distribution: Arc<Distribution>,
    hooks: Arc<dyn SubscriberHooks>,
    metrics: Arc<Metrics>,

    pending_messages: Mutex<HashMap<AckId, Arc<AckHandler>>>,
    outstanding_receipts: Mutex<VecDeque<ReceiptEntry>>,
    pending: Mutex<PendingOperations>,
    messages_waiter: Waiter,

    message_deadline_seconds: AtomicI32,
    min_duration_per_ack_extension_seconds: AtomicI32,
    exactly_once_delivery_enabled: AtomicBool,
    message_ordering_enabled: AtomicBool,
    nack_immediately_shutdown_in_progress: AtomicBool,
    stopped: AtomicBool,

    background_job: Mutex<Option<JoinHandle<()>>>,
    ordered: OrderedExecutor,
    self_ref: Weak<MessageDispatcher>,
}

impl MessageDispatcher {
    /// Create a dispatcher.
    ///
    /// `make_processor` receives a weak handle to the new dispatcher so the processor can
    /// report RPC outcomes back.
    pub fn new<F>(
        settings: DispatcherSettings,
        receiver: Arc<dyn MessageReceiver>,
        flow_controller: Arc<FlowController>,
        ack_latency_distribution: Arc<Distribution>,
        hooks: Arc<dyn SubscriberHooks>,
        make_processor: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Weak<MessageDispatcher>) -> Arc<dyn AckProcessor>,
    {
        let min_seconds = settings
            .min_duration_per_ack_extension
            .map_or(0, whole_seconds);
        // Messages arriving before the first extension get the shortest lease.
        let initial_deadline = match settings.min_duration_per_ack_extension {
            Some(_) => min_seconds,
            None => MIN_STREAM_ACK_DEADLINE.as_secs() as i32,
        };

        Arc::new_cyclic(|self_ref| Self {
            ack_processor: make_processor(self_ref.clone()),
            settings,
            receiver,
            flow_controller,
            ack_latency_distribution,
            hooks,
            metrics: get_metrics(),
            pending_messages: Mutex::new(HashMap::new()),
            outstanding_receipts: Mutex::new(VecDeque::new()),
            pending: Mutex::new(PendingOperations::default()),
            messages_waiter: Waiter::new(),
            message_deadline_seconds: AtomicI32::new(initial_deadline),
            min_duration_per_ack_extension_seconds: AtomicI32::new(min_seconds),
            exactly_once_delivery_enabled: AtomicBool::new(false),
            message_ordering_enabled: AtomicBool::new(false),
            nack_immediately_shutdown_in_progress: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            background_job: Mutex::new(None),
            ordered: OrderedExecutor::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Start the periodic extension and flush job.
    pub fn start(&self) {
        let weak = self.self_ref.clone();
        let job = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                Instant::now() + PENDING_ACKS_SEND_DELAY,
                PENDING_ACKS_SEND_DELAY,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut next_extension = Instant::now();

            loop {
                ticker.tick().await;
                let Some(dispatcher) = weak.upgrade() else {
                    return;
                };
                if Instant::now() >= next_extension {
                    let deadline_seconds = dispatcher.compute_deadline_seconds();
                    dispatcher
                        .message_deadline_seconds
                        .store(deadline_seconds, Ordering::SeqCst);
                    dispatcher.extend_deadlines();
                    next_extension = Instant::now()
                        + Duration::from_secs(deadline_seconds as u64)
                            .saturating_sub(ACK_EXPIRATION_PADDING);
                }
                dispatcher.process_outstanding_operations();
            }
        });
        *lock(&self.background_job) = Some(job);
    }

    /// Stop the dispatcher according to the shutdown settings.
    ///
    /// Returns once outstanding messages are drained (or nacked) and the final batch was
    /// handed to the ack processor. Later calls return immediately.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.settings.shutdown.mode {
            ShutdownMode::WaitForProcessing => {
                debug!(
                    subscription = %self.settings.subscription,
                    "Waiting for outstanding messages to complete processing"
                );
                match self.settings.shutdown.timeout() {
                    None => self.messages_waiter.wait_complete_async().await,
                    Some(timeout) => {
                        let grace = timeout.saturating_sub(FINAL_NACK_TIMEOUT);
                        if !self.messages_waiter.try_wait_async(grace).await {
                            warn!(
                                subscription = %self.settings.subscription,
                                outstanding = self.messages_waiter.pending_count(),
                                "Grace period expired for wait-for-processing shutdown, nacking remaining messages"
                            );
                            self.nack_all_outstanding_messages();
                        }
                    }
                }
                self.cancel_background_job();
                self.process_outstanding_operations();
            }
            ShutdownMode::NackImmediately => {
                debug!(
                    subscription = %self.settings.subscription,
                    "Nacking all outstanding messages"
                );
                self.cancel_background_job();
                self.nack_all_outstanding_messages();
                self.process_outstanding_operations();
            }
        }
    }

    fn cancel_background_job(&self) {
        if let Some(job) = lock(&self.background_job).take() {
            job.abort();
        }
    }

    fn nack_all_outstanding_messages(&self) {
        self.nack_immediately_shutdown_in_progress
            .store(true, Ordering::SeqCst);
        let handlers: Vec<Arc<AckHandler>> =
            lock(&self.pending_messages).values().cloned().collect();
        for handler in handlers {
            lock(&self.pending).nacks.push(handler.request.clone());
            self.forget(&handler);
        }

        // Messages still waiting on their receipt were never delivered.
        let held: Vec<ReceiptEntry> = lock(&self.outstanding_receipts).drain(..).collect();
        let mut pending = lock(&self.pending);
        for entry in held {
            entry.handler.request.set_response(AckResponse::Other, false);
            pending.nacks.push(entry.handler.request.clone());
        }
    }

    /// Current lease, in seconds, given to received and extended messages.
    pub fn message_deadline_seconds(&self) -> i32 {
        self.message_deadline_seconds.load(Ordering::SeqCst)
    }

    /// Whether the subscription has exactly once delivery.
    pub fn exactly_once_delivery_enabled(&self) -> bool {
        self.exactly_once_delivery_enabled.load(Ordering::SeqCst)
    }

    /// Record the exactly once setting reported by the service.
    ///
    /// Unless a minimum extension was configured, enabling exactly once raises the
    /// minimum to [`DEFAULT_MIN_ACK_DEADLINE_EXTENSION_EXACTLY_ONCE`], capped by a
    /// configured maximum.
    pub fn set_exactly_once_delivery_enabled(&self, enabled: bool) {
        if self.exactly_once_delivery_enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        if self.settings.min_duration_per_ack_extension.is_some() {
            return;
        }

        let candidate = if enabled {
            DEFAULT_MIN_ACK_DEADLINE_EXTENSION_EXACTLY_ONCE.as_secs() as i32
        } else {
            0
        };
        let min_seconds = match self.settings.max_duration_per_ack_extension {
            Some(max) if candidate > whole_seconds(max) => whole_seconds(max),
            _ => candidate,
        };
        self.min_duration_per_ack_extension_seconds
            .store(min_seconds, Ordering::SeqCst);
    }

    /// Record the ordering setting reported by the service.
    pub fn set_message_ordering_enabled(&self, enabled: bool) {
        self.message_ordering_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether a nack-immediately shutdown is running.
    pub fn nack_immediately_shutdown_in_progress(&self) -> bool {
        self.nack_immediately_shutdown_in_progress
            .load(Ordering::SeqCst)
    }

    /// Number of messages under lease management.
    pub fn pending_message_count(&self) -> usize {
        lock(&self.pending_messages).len()
    }

    /// Compute the next lease from observed ack latency.
    ///
    /// The percentile is bounded by the per extension limits, then by the limits the
    /// service accepts.
    pub fn compute_deadline_seconds(&self) -> i32 {
        let mut seconds = self
            .ack_latency_distribution
            .percentile(PERCENTILE_FOR_ACK_DEADLINE_UPDATES) as i32;
        let min_seconds = self
            .min_duration_per_ack_extension_seconds
            .load(Ordering::SeqCst);

        match self.settings.max_duration_per_ack_extension {
            Some(max) if seconds > whole_seconds(max) => seconds = whole_seconds(max),
            _ if seconds < min_seconds => seconds = min_seconds,
            _ => {}
        }

        seconds.clamp(
            MIN_STREAM_ACK_DEADLINE.as_secs() as i32,
            MAX_STREAM_ACK_DEADLINE.as_secs() as i32,
        )
    }

    /// Take ownership of messages received from the stream and deliver them.
    ///
    /// Waits on flow control, so this only returns once every message of the batch was
    /// admitted (or dropped by a concurrent shutdown).
    pub async fn process_received_messages(&self, messages: Vec<ReceivedMessage>) {
        let now = Instant::now();
        let total_expiration = instant_after(now, self.settings.max_ack_extension_period);
        let exactly_once = self.exactly_once_delivery_enabled();
        let mut batch = Vec::with_capacity(messages.len());

        self.metrics
            .messages_received_total
            .with_label_values(&[&self.settings.subscription])
            .inc_by(messages.len() as u64);

        for received in messages {
            let metadata = DeliveryMetadata::from_received(&received);
            let mut request = AckRequestData::new(received.ack_id).with_metadata(metadata);
            if self.settings.ack_response_enabled {
                request = request.with_completion(AckCompletion::new());
            }
            self.hooks
                .on_subscribe_start(&self.settings.subscription, request.metadata(), exactly_once);

            let handler = Arc::new(AckHandler {
                outstanding_bytes: received.message.serialized_size() as u64,
                message: Mutex::new(Some(received.message)),
                delivery_attempt: received.delivery_attempt,
                received_at: now,
                total_expiration,
                state: Mutex::new(HandlerState::default()),
                request,
            });

            if exactly_once {
                // Delivered only once the receipt modack succeeds.
                lock(&self.outstanding_receipts).push_back(ReceiptEntry {
                    handler: handler.clone(),
                    complete: false,
                });
            } else {
                let mut pending = lock(&self.pending_messages);
                if pending.contains_key(handler.ack_id()) {
                    // Duplicate delivery; the copy we hold keeps its lease.
                    continue;
                }
                pending.insert(handler.ack_id().clone(), handler.clone());
                self.messages_waiter.increment_pending_count(1);
                batch.push(handler.clone());
            }
            lock(&self.pending).receipts.push(handler.request.clone());
        }

        self.process_batch(batch).await;
    }

    // Every handler of the batch is already counted by `messages_waiter`.
    async fn process_batch(&self, batch: Vec<Arc<AckHandler>>) {
        for handler in batch {
            self.hooks.on_flow_control_start(handler.metadata());
            trace!(ack_id = %handler.ack_id(), "Flow controller is blocking");
            self.flow_controller
                .reserve(1, handler.outstanding_bytes)
                .await;
            trace!(ack_id = %handler.ack_id(), "Flow controller is done blocking");
            self.hooks.on_flow_control_end(handler.metadata());

            if !self.mark_reserved(&handler) {
                continue;
            }
            self.publish_flow_control_gauges();
            self.process_outstanding_message(handler);
        }
    }

    // Returns false when the handler was forgotten while waiting on flow control; the
    // reservation is returned right away in that case.
    fn mark_reserved(&self, handler: &AckHandler) -> bool {
        let mut state = lock(&handler.state);
        state.reserved = true;
        if state.forgotten {
            drop(state);
            self.flow_controller.release(1, handler.outstanding_bytes);
            return false;
        }
        true
    }

    fn process_outstanding_message(&self, handler: Arc<AckHandler>) {
        let Some(dispatcher) = self.self_ref.upgrade() else {
            return;
        };
        let ordering_key = handler.ordering_key();
        let task = async move { dispatcher.deliver(handler).await };

        if self.message_ordering_enabled.load(Ordering::SeqCst) && !ordering_key.is_empty() {
            self.ordered.submit(&ordering_key, Box::pin(task));
        } else {
            tokio::spawn(task);
        }
    }

    async fn deliver(self: Arc<Self>, handler: Arc<AckHandler>) {
        let deadline = Duration::from_secs(self.message_deadline_seconds().max(0) as u64);
        if instant_after(handler.total_expiration, deadline) < Instant::now() {
            // Lease ran out while waiting; the service has redelivered it elsewhere, so
            // neither deliver nor nack.
            self.forget(&handler);
            self.report_expired(&handler);
            return;
        }

        if self.stopped.load(Ordering::SeqCst) {
            // The final flush may already have run, so the nack goes out on its own.
            self.forget(&handler);
            self.ack_processor
                .send_modack_operations(vec![ModackRequestData::with_requests(
                    0,
                    vec![handler.request.clone()],
                )]);
            return;
        }

        let Some(mut message) = lock(&handler.message).take() else {
            return;
        };
        if handler.delivery_attempt > 0 {
            message.attributes.insert(
                DELIVERY_ATTEMPT_ATTRIBUTE.to_string(),
                handler.delivery_attempt.to_string(),
            );
        }

        self.hooks.on_process_start(handler.metadata());
        debug!(
            subscription = %self.settings.subscription,
            ack_id = %handler.ack_id(),
            message_id = %handler.metadata().message_id,
            "Message delivered"
        );

        let slot = Arc::new(ReplySlot::new());
        let consumer = AckReplyConsumer {
            handler: handler.clone(),
            dispatcher: Arc::downgrade(&self),
            slot: slot.clone(),
        };

        let result = AssertUnwindSafe(self.receiver.receive_message(message, consumer))
            .catch_unwind()
            .await;
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some("receiver panicked".to_string()),
        };

        match slot.callback_returned(failure.is_some()) {
            Some(AfterCallback::Fail) => {
                self.on_callback_error(&handler, failure.as_deref().unwrap_or_default())
            }
            Some(AfterCallback::Nack) => self.on_reply(&handler, AckReply::Nack),
            None => {
                if let Some(err) = failure {
                    debug!(ack_id = %handler.ack_id(), error = %err, "Receiver failed after replying");
                }
            }
        }
    }

    fn report_expired(&self, handler: &AckHandler) {
        self.hooks.on_expired(handler.metadata());
        self.metrics
            .messages_expired_total
            .with_label_values(&[&self.settings.subscription])
            .inc();
        debug!(
            subscription = %self.settings.subscription,
            ack_id = %handler.ack_id(),
            "Message expired"
        );
    }

    fn on_callback_error(&self, handler: &AckHandler, err: &str) {
        warn!(
            subscription = %self.settings.subscription,
            ack_id = %handler.ack_id(),
            error = %err,
            "MessageReceiver failed, nacking message"
        );
        self.hooks.on_callback_error(handler.metadata(), err);
        handler.request.set_response(AckResponse::Other, false);
        lock(&self.pending).nacks.push(handler.request.clone());
        self.hooks
            .on_process_end(handler.metadata(), AckReply::Nack, "nack");
        self.forget(handler);
    }

    fn on_reply(&self, handler: &AckHandler, reply: AckReply) {
        let elapsed = handler.received_at.elapsed();
        let latency = elapsed.as_secs_f64().ceil() as u32;
        if latency
            >= self
                .ack_latency_distribution
                .percentile(SLOW_ACK_PERCENTILE)
        {
            debug!(
                ack_id = %handler.ack_id(),
                latency_secs = latency,
                "Message ack duration is higher than the p99 ack duration"
            );
        }

        match reply {
            AckReply::Ack => {
                if self.nack_immediately_shutdown_in_progress() && self.exactly_once_delivery_enabled() {
                    handler.request.set_response(AckResponse::Other, true);
                    self.hooks.on_process_end(
                        handler.metadata(),
                        reply,
                        "ack failed_with_nack_immediately",
                    );
                } else {
                    lock(&self.pending).acks.push(handler.request.clone());
                    self.ack_latency_distribution.record(latency);
                    self.metrics
                        .ack_latency_seconds
                        .with_label_values(&[&self.settings.subscription])
                        .observe(elapsed.as_secs_f64());
                    self.hooks.on_process_end(handler.metadata(), reply, "ack");
                }
                trace!(ack_id = %handler.ack_id(), "Ack called on message");
            }
            AckReply::Nack => {
                lock(&self.pending).nacks.push(handler.request.clone());
                self.hooks.on_process_end(handler.metadata(), reply, "nack");
                trace!(ack_id = %handler.ack_id(), "Nack called on message");
            }
        }
        self.forget(handler);
    }

    // Stops extending the lease and frees flow control. Only the first call counts.
    fn forget(&self, handler: &AckHandler) {
        let reserved = {
            let mut state = lock(&handler.state);
            if state.forgotten {
                return;
            }
            state.forgotten = true;
            state.reserved
        };

        {
            let mut pending = lock(&self.pending_messages);
            if pending
                .get(handler.ack_id())
                .is_some_and(|h| std::ptr::eq(Arc::as_ptr(h), handler))
            {
                pending.remove(handler.ack_id());
            }
        }

        if reserved {
            self.flow_controller.release(1, handler.outstanding_bytes);
            self.publish_flow_control_gauges();
        }
        self.hooks.on_subscribe_end(handler.metadata());
        self.messages_waiter.increment_pending_count(-1);
    }

    fn publish_flow_control_gauges(&self) {
        self.metrics.set_outstanding(
            &self.settings.subscription,
            self.flow_controller.outstanding_element_count(),
            self.flow_controller.outstanding_bytes(),
        );
    }

    /// A receipt modack succeeded.
    ///
    /// With exactly once delivery, held messages are released for delivery in receipt
    /// order as soon as every earlier receipt has completed too.
    pub async fn notify_ack_success(&self, request: &AckRequestData) {
        let released: Vec<Arc<AckHandler>> = {
            let mut receipts = lock(&self.outstanding_receipts);
            let Some(entry) = receipts
                .iter_mut()
                .find(|e| e.handler.ack_id() == request.ack_id())
            else {
                return;
            };
            entry.complete = true;

            let mut released = Vec::new();
            while receipts.front().is_some_and(|e| e.complete) {
                if let Some(entry) = receipts.pop_front() {
                    released.push(entry.handler);
                }
            }
            released
        };

        if self.stopped.load(Ordering::SeqCst) {
            // Shutdown began: nothing new reaches the receiver, and the final flush may
            // already have run.
            let nacks: Vec<AckRequestData> = released
                .iter()
                .map(|handler| {
                    handler.request.set_response(AckResponse::Other, false);
                    handler.request.clone()
                })
                .collect();
            if !nacks.is_empty() {
                debug!(
                    subscription = %self.settings.subscription,
                    count = nacks.len(),
                    "Nacking messages whose receipt completed during shutdown"
                );
                self.ack_processor
                    .send_modack_operations(vec![ModackRequestData::with_requests(0, nacks)]);
            }
            return;
        }

        let mut batch = Vec::with_capacity(released.len());
        {
            let mut pending = lock(&self.pending_messages);
            for handler in released {
                if !pending.contains_key(handler.ack_id()) {
                    pending.insert(handler.ack_id().clone(), handler.clone());
                    self.messages_waiter.increment_pending_count(1);
                    batch.push(handler);
                }
            }
        }
        self.process_batch(batch).await;
    }

    /// An ack, nack or modack failed for good. Stop managing the message.
    pub fn notify_ack_failed(&self, request: &AckRequestData) {
        lock(&self.outstanding_receipts).retain(|e| e.handler.ack_id() != request.ack_id());

        let handler = lock(&self.pending_messages).get(request.ack_id()).cloned();
        if let Some(handler) = handler {
            self.forget(&handler);
        }
    }

    /// Extend the lease of every managed message by the current deadline.
    ///
    /// Messages whose total extension budget ends before the new deadline are forgotten
    /// and get a last extension for the time they have left.
    pub fn extend_deadlines(&self) {
        let extend_seconds = self.message_deadline_seconds();
        let now = Instant::now();
        let extend_to = now + Duration::from_secs(extend_seconds.max(0) as u64);

        let handlers: Vec<Arc<AckHandler>> =
            lock(&self.pending_messages).values().cloned().collect();
        let mut modacks: BTreeMap<i32, ModackRequestData> = BTreeMap::new();
        let mut count = 0;

        for handler in handlers {
            if handler.total_expiration > extend_to {
                modacks
                    .entry(extend_seconds)
                    .or_insert_with(|| ModackRequestData::new(extend_seconds))
                    .add_ack_request(handler.request.clone());
                count += 1;
                continue;
            }

            self.forget(&handler);
            self.report_expired(&handler);
            if handler.total_expiration > now {
                let seconds = whole_seconds(handler.total_expiration - now).max(1);
                modacks
                    .entry(seconds)
                    .or_insert_with(|| ModackRequestData::new(seconds))
                    .add_ack_request(handler.request.clone());
                count += 1;
            }
        }

        if count > 0 {
            trace!(count, extend_seconds, "Sending lease extensions");
            self.ack_processor
                .send_modack_operations(modacks.into_values().collect());
        }
    }

    /// Flush pending nacks, receipts and acks to the ack processor.
    pub fn process_outstanding_operations(&self) {
        let PendingOperations {
            acks,
            nacks,
            receipts,
        } = std::mem::take(&mut *lock(&self.pending));
        let (ack_count, nack_count, receipt_count) = (acks.len(), nacks.len(), receipts.len());

        let mut modacks = Vec::new();
        if !nacks.is_empty() {
            modacks.push(ModackRequestData::with_requests(0, nacks));
        }
        if !receipts.is_empty() && !self.nack_immediately_shutdown_in_progress() {
            modacks.push(
                ModackRequestData::with_requests(self.message_deadline_seconds(), receipts)
                    .receipt(),
            );
        }

        if ack_count + nack_count + receipt_count > 0 {
            debug!(
                subscription = %self.settings.subscription,
                acks = ack_count,
                nacks = nack_count,
                receipts = receipt_count,
                exactly_once = self.exactly_once_delivery_enabled(),
                "Sending ack operations"
            );
        }

        self.ack_processor.send_modack_operations(modacks);
        self.ack_processor.send_ack_operations(acks);
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        self.cancel_background_job();
    }
}

enum ReplyState {
    InCallback { dropped: bool },
    Detached,
    Replied,
}

enum AfterCallback {
    Fail,
    Nack,
}

// Shared between a consumer and the task that called the receiver, so that exactly one
// of ack, nack, drop or callback failure decides the message.
struct ReplySlot {
    state: Mutex<ReplyState>,
}

impl ReplySlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(ReplyState::InCallback { dropped: false }),
        }
    }

    fn claim(&self) -> bool {
        let mut state = lock(&self.state);
        if matches!(*state, ReplyState::Replied) {
            return false;
        }
        *state = ReplyState::Replied;
        true
    }

    // Returns true when the dropped consumer must nack itself.
    fn on_drop(&self) -> bool {
        let mut state = lock(&self.state);
        match *state {
            ReplyState::InCallback { .. } => {
                *state = ReplyState::InCallback { dropped: true };
                false
            }
            ReplyState::Detached => {
                *state = ReplyState::Replied;
                true
            }
            ReplyState::Replied => false,
        }
    }

    fn callback_returned(&self, failed: bool) -> Option<AfterCallback> {
        let mut state = lock(&self.state);
        match *state {
            ReplyState::InCallback { dropped } => {
                if failed {
                    *state = ReplyState::Replied;
                    Some(AfterCallback::Fail)
                } else if dropped {
                    *state = ReplyState::Replied;
                    Some(AfterCallback::Nack)
                } else {
                    *state = ReplyState::Detached;
                    None
                }
            }
            ReplyState::Detached | ReplyState::Replied => None,
        }
    }
}

/// Handle through which a receiver acks or nacks one message.
///
/// The first reply wins. Dropping the consumer without replying nacks the message.
pub struct AckReplyConsumer {
    handler: Arc<AckHandler>,
    dispatcher: Weak<MessageDispatcher>,
    slot: Arc<ReplySlot>,
}

impl AckReplyConsumer {
    /// Ack id of the delivered message.
    pub fn ack_id(&self) -> &AckId {
        self.handler.ack_id()
    }

    /// Delivery attempt, when the subscription reports one.
    pub fn delivery_attempt(&self) -> Option<i32> {
        self.handler.metadata().delivery_attempt
    }

    /// Acknowledge the message.
    pub fn ack(self) {
        self.reply(AckReply::Ack);
    }

    /// Return the message for redelivery.
    pub fn nack(self) {
        self.reply(AckReply::Nack);
    }

    /// Acknowledge the message and get a future for the outcome.
    ///
    /// Fails when the subscriber was built without ack responses; the ack is still sent.
    pub fn ack_with_response(self) -> Result<AckResponseFuture> {
        self.reply_with_response(AckReply::Ack)
    }

    /// Nack the message and get a future for the outcome.
    ///
    /// Fails when the subscriber was built without ack responses; the nack is still sent.
    pub fn nack_with_response(self) -> Result<AckResponseFuture> {
        self.reply_with_response(AckReply::Nack)
    }

    fn reply_with_response(self, reply: AckReply) -> Result<AckResponseFuture> {
        let future = self
            .handler
            .request
            .completion()
            .map(AckCompletion::response);
        self.reply(reply);
        future.ok_or_else(|| Error::IllegalState("ack responses are not enabled".to_string()))
    }

    fn reply(&self, reply: AckReply) {
        if !self.slot.claim() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.on_reply(&self.handler, reply);
        }
    }
}

impl Drop for AckReplyConsumer {
    fn drop(&mut self) {
        if self.slot.on_drop() {
            if let Some(dispatcher) = self.dispatcher.upgrade() {
                dispatcher.on_reply(&self.handler, AckReply::Nack);
            }
        }
    }
}

impl std::fmt::Debug for AckReplyConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckReplyConsumer")
            .field("ack_id", self.handler.ack_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flow_control::{FlowControlSettings, LimitExceededBehavior};
    use crate::hooks::NoopHooks;
    use crate::subscriber::receiver::{receiver_fn, ReceiverError};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingProcessor {
        acks: Mutex<Vec<AckId>>,
        modacks: Mutex<Vec<(i32, bool, Vec<AckId>)>>,
    }

    impl AckProcessor for RecordingProcessor {
        fn send_ack_operations(&self, acks: Vec<AckRequestData>) {
            lock(&self.acks).extend(acks.iter().map(|r| r.ack_id().clone()));
        }

        fn send_modack_operations(&self, modacks: Vec<ModackRequestData>) {
            let mut recorded = lock(&self.modacks);
            for modack in modacks {
                recorded.push((
                    modack.deadline_extension_seconds(),
                    modack.is_receipt_modack(),
                    modack.ack_requests().iter().map(|r| r.ack_id().clone()).collect(),
                ));
            }
        }
    }

    impl RecordingProcessor {
        fn nacked(&self) -> Vec<AckId> {
            lock(&self.modacks)
                .iter()
                .filter(|(seconds, _, _)| *seconds == 0)
                .flat_map(|(_, _, ids)| ids.clone())
                .collect()
        }
    }

    struct Fixture {
        dispatcher: Arc<MessageDispatcher>,
        processor: Arc<RecordingProcessor>,
        flow_controller: Arc<FlowController>,
        consumers: mpsc::UnboundedReceiver<AckReplyConsumer>,
    }

    fn settings(shutdown: ShutdownSettings) -> DispatcherSettings {
        DispatcherSettings {
            subscription: "projects/p/subscriptions/s".to_string(),
            max_ack_extension_period: Duration::from_secs(3600),
            min_duration_per_ack_extension: None,
            max_duration_per_ack_extension: None,
            ack_response_enabled: true,
            shutdown,
        }
    }

    // Receiver that parks every consumer in a channel for the test to reply to.
    fn fixture(settings: DispatcherSettings, max_messages: u64) -> Fixture {
        let (tx, consumers) = mpsc::unbounded_channel();
        let receiver = receiver_fn(move |_message, consumer| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(consumer);
                Ok::<(), ReceiverError>(())
            }
        });
        let flow_controller = Arc::new(FlowController::new(FlowControlSettings {
            max_outstanding_element_count: Some(max_messages),
            max_outstanding_request_bytes: None,
            limit_exceeded_behavior: LimitExceededBehavior::Block,
        }));
        let distribution = Arc::new(Distribution::new(601).unwrap());
        distribution.record(10);
        let processor = Arc::new(RecordingProcessor::default());

        let dispatcher = {
            let processor = processor.clone();
            MessageDispatcher::new(
                settings,
                receiver,
                flow_controller.clone(),
                distribution,
                Arc::new(NoopHooks),
                move |_| processor as Arc<dyn AckProcessor>,
            )
        };

        Fixture {
            dispatcher,
            processor,
            flow_controller,
            consumers,
        }
    }

    fn received(id: &str, data: &str) -> ReceivedMessage {
        let mut message = PubsubMessage::new(data);
        message.message_id = format!("m-{}", id);
        ReceivedMessage {
            ack_id: AckId::new(id),
            message,
            delivery_attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_ack_flushes_and_releases_flow_control() {
        let mut f = fixture(settings(ShutdownSettings::default()), 10);
        f.dispatcher
            .process_received_messages(vec![received("a", "hello")])
            .await;

        let consumer = f.consumers.recv().await.unwrap();
        assert_eq!(f.flow_controller.outstanding_element_count(), 1);

        consumer.ack();
        assert_eq!(f.flow_controller.outstanding_element_count(), 0);

        f.dispatcher.process_outstanding_operations();
        assert_eq!(*lock(&f.processor.acks), vec![AckId::new("a")]);

        let modacks = lock(&f.processor.modacks).clone();
        assert_eq!(modacks, vec![(10, true, vec![AckId::new("a")])]);
    }

    #[tokio::test]
    async fn test_dropped_consumer_nacks() {
        let mut f = fixture(settings(ShutdownSettings::default()), 10);
        f.dispatcher
            .process_received_messages(vec![received("a", "x")])
            .await;

        drop(f.consumers.recv().await.unwrap());
        f.dispatcher.process_outstanding_operations();

        assert_eq!(f.processor.nacked(), vec![AckId::new("a")]);
        assert_eq!(f.dispatcher.pending_message_count(), 0);
    }

    #[tokio::test]
    async fn test_callback_error_nacks_and_resolves_other() {
        let (tx, mut completions) = mpsc::unbounded_channel();
        let receiver = receiver_fn(move |_message, consumer: AckReplyConsumer| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(consumer.handler.request.completion().cloned());
                Err::<(), ReceiverError>("boom".into())
            }
        });
        let processor = Arc::new(RecordingProcessor::default());
        let dispatcher = {
            let processor = processor.clone();
            MessageDispatcher::new(
                settings(ShutdownSettings::default()),
                receiver,
                Arc::new(FlowController::new(FlowControlSettings::default())),
                Arc::new(Distribution::new(601).unwrap()),
                Arc::new(NoopHooks),
                move |_| processor as Arc<dyn AckProcessor>,
            )
        };

        dispatcher
            .process_received_messages(vec![received("a", "x")])
            .await;
        let completion = completions.recv().await.unwrap().unwrap();
        assert_eq!(completion.response().await, AckResponse::Other);

        dispatcher.process_outstanding_operations();
        assert_eq!(processor.nacked(), vec![AckId::new("a")]);
    }

    #[tokio::test]
    async fn test_duplicate_ack_ids_are_ignored() {
        let mut f = fixture(settings(ShutdownSettings::default()), 10);
        f.dispatcher
            .process_received_messages(vec![received("a", "x"), received("a", "x")])
            .await;

        let _consumer = f.consumers.recv().await.unwrap();
        assert_eq!(f.dispatcher.pending_message_count(), 1);
        assert_eq!(f.flow_controller.outstanding_element_count(), 1);
    }

    #[tokio::test]
    async fn test_first_deadline_from_seeded_distribution() {
        let f = fixture(settings(ShutdownSettings::default()), 10);
        assert_eq!(f.dispatcher.message_deadline_seconds(), 10);
        assert_eq!(f.dispatcher.compute_deadline_seconds(), 10);
    }

    #[tokio::test]
    async fn test_deadline_respects_extension_bounds() {
        let mut s = settings(ShutdownSettings::default());
        s.max_duration_per_ack_extension = Some(Duration::from_secs(30));
        let f = fixture(s, 10);
        for _ in 0..100 {
            f.dispatcher.ack_latency_distribution.record(200);
        }
        assert_eq!(f.dispatcher.compute_deadline_seconds(), 30);

        // Exactly once raises the minimum, capped by the configured maximum.
        let f = fixture(settings(ShutdownSettings::default()), 10);
        f.dispatcher.set_exactly_once_delivery_enabled(true);
        assert_eq!(f.dispatcher.compute_deadline_seconds(), 60);
        f.dispatcher.set_exactly_once_delivery_enabled(false);
        assert_eq!(f.dispatcher.compute_deadline_seconds(), 10);
    }

    #[tokio::test]
    async fn test_extend_deadlines_expires_exhausted_messages() {
        let mut s = settings(ShutdownSettings::default());
        s.max_ack_extension_period = Duration::from_secs(3);
        let mut f = fixture(s, 10);
        f.dispatcher
            .process_received_messages(vec![received("a", "x")])
            .await;
        let _consumer = f.consumers.recv().await.unwrap();

        f.dispatcher.extend_deadlines();

        let modacks = lock(&f.processor.modacks).clone();
        assert_eq!(modacks.len(), 1);
        let (seconds, receipt, ids) = &modacks[0];
        assert!((1..=3).contains(seconds));
        assert!(!receipt);
        assert_eq!(ids, &vec![AckId::new("a")]);
        assert_eq!(f.dispatcher.pending_message_count(), 0);
        assert_eq!(f.flow_controller.outstanding_element_count(), 0);
    }

    #[tokio::test]
    async fn test_nack_immediately_stop() {
        let mut f = fixture(settings(ShutdownSettings::nack_immediately(Duration::ZERO)), 10);
        f.dispatcher.start();
        f.dispatcher
            .process_received_messages(vec![received("a", "x"), received("b", "y")])
            .await;
        let first = f.consumers.recv().await.unwrap();
        let second = f.consumers.recv().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), f.dispatcher.stop())
            .await
            .expect("nack immediately stop must not wait for processing");

        let mut nacked = f.processor.nacked();
        nacked.sort();
        assert_eq!(nacked, vec![AckId::new("a"), AckId::new("b")]);
        assert_eq!(f.flow_controller.outstanding_element_count(), 0);

        // Late replies are ignored by the flow controller.
        first.ack();
        second.nack();
        assert_eq!(f.flow_controller.outstanding_element_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_processing_stop_waits_for_acks() {
        let mut f = fixture(settings(ShutdownSettings::wait_for_processing(None)), 10);
        f.dispatcher
            .process_received_messages(vec![received("a", "x")])
            .await;
        let consumer = f.consumers.recv().await.unwrap();

        let dispatcher = f.dispatcher.clone();
        let stop = tokio::spawn(async move { dispatcher.stop().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stop.is_finished());

        consumer.ack();
        tokio::time::timeout(Duration::from_secs(5), stop)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*lock(&f.processor.acks), vec![AckId::new("a")]);
    }

    #[tokio::test]
    async fn test_bounded_wait_falls_back_to_nack() {
        let mut f = fixture(
            settings(ShutdownSettings::wait_for_processing(Some(Duration::from_millis(1200)))),
            10,
        );
        f.dispatcher
            .process_received_messages(vec![received("a", "x")])
            .await;
        let _consumer = f.consumers.recv().await.unwrap();

        f.dispatcher.stop().await;
        assert!(f.dispatcher.nack_immediately_shutdown_in_progress());
        assert_eq!(f.processor.nacked(), vec![AckId::new("a")]);
    }

    #[tokio::test]
    async fn test_exactly_once_holds_messages_until_receipt() {
        let mut f = fixture(settings(ShutdownSettings::default()), 10);
        f.dispatcher.set_exactly_once_delivery_enabled(true);
        f.dispatcher
            .process_received_messages(vec![received("a", "x"), received("b", "y")])
            .await;
        assert_eq!(f.dispatcher.pending_message_count(), 0);

        // Second receipt completing first releases nothing.
        let b = AckRequestData::new(AckId::new("b"));
        f.dispatcher.notify_ack_success(&b).await;
        assert!(f.consumers.try_recv().is_err());

        let a = AckRequestData::new(AckId::new("a"));
        f.dispatcher.notify_ack_success(&a).await;
        let first = f.consumers.recv().await.unwrap();
        let second = f.consumers.recv().await.unwrap();
        let mut ids = vec![first.ack_id().clone(), second.ack_id().clone()];
        ids.sort();
        assert_eq!(ids, vec![AckId::new("a"), AckId::new("b")]);
    }

    #[tokio::test]
    async fn test_flow_control_blocks_second_message() {
        let mut f = fixture(settings(ShutdownSettings::default()), 1);
        let dispatcher = f.dispatcher.clone();
        let processing = tokio::spawn(async move {
            dispatcher
                .process_received_messages(vec![received("a", "x"), received("b", "y")])
                .await
        });

        let first = f.consumers.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.consumers.try_recv().is_err());

        first.ack();
        let second = f.consumers.recv().await.unwrap();
        assert_eq!(second.ack_id(), &AckId::new("b"));
        processing.await.unwrap();
    }

    #[tokio::test]
    async fn test_receipt_completing_after_stop_nacks_instead_of_delivering() {
        let mut f = fixture(settings(ShutdownSettings::wait_for_processing(None)), 10);
        f.dispatcher.set_exactly_once_delivery_enabled(true);
        f.dispatcher
            .process_received_messages(vec![received("a", "x")])
            .await;

        // Nothing was delivered yet, so a wait-for-processing stop returns right away.
        tokio::time::timeout(Duration::from_secs(1), f.dispatcher.stop())
            .await
            .unwrap();

        let request = AckRequestData::new(AckId::new("a"));
        f.dispatcher.notify_ack_success(&request).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(f.consumers.try_recv().is_err());
        assert_eq!(f.processor.nacked(), vec![AckId::new("a")]);
        assert_eq!(f.dispatcher.pending_message_count(), 0);
        assert_eq!(f.flow_controller.outstanding_element_count(), 0);
    }

    #[tokio::test]
    async fn test_unbounded_extension_period_keeps_delivering() {
        let mut s = settings(ShutdownSettings::default());
        s.max_ack_extension_period = Duration::MAX;
        let mut f = fixture(s, 10);
        f.dispatcher
            .process_received_messages(vec![received("a", "x")])
            .await;

        let consumer = f.consumers.recv().await.unwrap();
        f.dispatcher.extend_deadlines();
        assert_eq!(f.dispatcher.pending_message_count(), 1);

        consumer.ack();
        f.dispatcher.process_outstanding_operations();
        assert_eq!(*lock(&f.processor.acks), vec![AckId::new("a")]);

        let modacks = lock(&f.processor.modacks).clone();
        assert!(modacks.contains(&(10, false, vec![AckId::new("a")])));
    }

    #[tokio::test]
    async fn test_oversized_extension_bounds_do_not_wrap() {
        let mut s = settings(ShutdownSettings::default());
        s.max_duration_per_ack_extension = Some(Duration::from_secs(u64::MAX));
        let f = fixture(s, 10);
        for _ in 0..100 {
            f.dispatcher.ack_latency_distribution.record(200);
        }
        assert_eq!(f.dispatcher.compute_deadline_seconds(), 200);

        f.dispatcher.set_exactly_once_delivery_enabled(true);
        assert_eq!(f.dispatcher.compute_deadline_seconds(), 200);
    }

    #[tokio::test]
    async fn test_ordered_messages_are_delivered_one_at_a_time() {
        let (tx, mut started) = mpsc::unbounded_channel();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let receiver = {
            let gate = gate.clone();
            receiver_fn(move |message: PubsubMessage, consumer: AckReplyConsumer| {
                let tx = tx.clone();
                let gate = gate.clone();
                async move {
                    let _ = tx.send(message.message_id.clone());
                    gate.acquire().await.unwrap().forget();
                    consumer.ack();
                    Ok::<(), ReceiverError>(())
                }
            })
        };
        let processor = Arc::new(RecordingProcessor::default());
        let dispatcher = {
            let processor = processor.clone();
            MessageDispatcher::new(
                settings(ShutdownSettings::default()),
                receiver,
                Arc::new(FlowController::new(FlowControlSettings::default())),
                Arc::new(Distribution::new(601).unwrap()),
                Arc::new(NoopHooks),
                move |_| processor as Arc<dyn AckProcessor>,
            )
        };
        dispatcher.set_message_ordering_enabled(true);

        let keyed = |id: &str| {
            let mut message = received(id, "x");
            message.message.ordering_key = "key".to_string();
            message
        };
        dispatcher
            .process_received_messages(vec![keyed("a"), keyed("b")])
            .await;

        assert_eq!(started.recv().await.unwrap(), "m-a");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.try_recv().is_err());

        gate.add_permits(1);
        assert_eq!(started.recv().await.unwrap(), "m-b");
        gate.add_permits(1);

        tokio::time::timeout(Duration::from_secs(1), async {
            while dispatcher.pending_message_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        dispatcher.process_outstanding_operations();
        assert_eq!(*lock(&processor.acks), vec![AckId::new("a"), AckId::new("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_expired_while_waiting_is_dropped() {
        let mut s = settings(ShutdownSettings::default());
        s.max_ack_extension_period = Duration::from_secs(1);
        let mut f = fixture(s, 1);
        let dispatcher = f.dispatcher.clone();
        let processing = tokio::spawn(async move {
            dispatcher
                .process_received_messages(vec![received("a", "x"), received("b", "y")])
                .await
        });

        let first = f.consumers.recv().await.unwrap();
        // Budget of 1 s plus the 10 s lease runs out while "b" waits on flow control.
        tokio::time::advance(Duration::from_secs(20)).await;
        first.ack();
        processing.await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while f.dispatcher.pending_message_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(f.consumers.try_recv().is_err());
        assert_eq!(f.flow_controller.outstanding_element_count(), 0);
        f.dispatcher.process_outstanding_operations();
        assert!(f.processor.nacked().is_empty());
        assert_eq!(*lock(&f.processor.acks), vec![AckId::new("a")]);
    }

    #[tokio::test]
    async fn test_ack_with_response_without_completion() {
        let mut s = settings(ShutdownSettings::default());
        s.ack_response_enabled = false;
        let mut f = fixture(s, 10);
        f.dispatcher
            .process_received_messages(vec![received("a", "x")])
            .await;

        let consumer = f.consumers.recv().await.unwrap();
        assert!(consumer.ack_with_response().is_err());
        f.dispatcher.process_outstanding_operations();
        assert_eq!(*lock(&f.processor.acks), vec![AckId::new("a")]);
    }
}
