//! The subscriber service.
//!
//! A [`Subscriber`] opens `parallel_pull_count` streaming connections to one
//! subscription and delivers every received message to a [`MessageReceiver`]. The
//! connections share one flow controller and one ack latency distribution.
//!
//! ```text
//! New -> Starting -> Running -> Stopping -> Terminated
//!           |           |          |
//!           +-----------+----------+-----> Failed
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{SubscriberConfig, MAX_STREAM_ACK_DEADLINE, MIN_STREAM_ACK_DEADLINE};
use crate::connection::{ConnectionSettings, StreamingSubscriberConnection};
use crate::core::flow_control::{FlowControlSettings, LimitExceededBehavior};
use crate::core::{Distribution, FlowController};
use crate::error::{Error, Result};
use crate::hooks::{NoopHooks, SubscriberHooks};
use crate::lifecycle::{Lifecycle, State};
use crate::transport::SubscriberTransport;
use crate::types::PubsubMessage;

pub mod receiver;

pub use crate::connection::AckReplyConsumer;
pub use receiver::{receiver_fn, MessageReceiver, ReceiverError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Streaming pull subscriber.
///
/// Cheap to clone; clones share the same service.
///
/// Do not call [`stop`](Self::stop) from inside a [`MessageReceiver`] callback while
/// waiting for processing: the stop waits for that very callback to reply.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

struct SubscriberInner {
    config: SubscriberConfig,
    transport: Arc<dyn SubscriberTransport>,
    receiver: Arc<dyn MessageReceiver>,
    hooks: Arc<dyn SubscriberHooks>,
    flow_controller: Arc<FlowController>,
    ack_latency_distribution: Arc<Distribution>,
    lifecycle: Arc<Lifecycle>,
    connections: Mutex<Vec<Arc<StreamingSubscriberConnection>>>,
}

impl Subscriber {
    /// Create a subscriber. Validates `config`.
    pub fn new(
        config: SubscriberConfig,
        transport: Arc<dyn SubscriberTransport>,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<Self> {
        Self::with_hooks(config, transport, receiver, Arc::new(NoopHooks))
    }

    /// Create a subscriber that reports every step to `hooks`.
    pub fn with_hooks(
        config: SubscriberConfig,
        transport: Arc<dyn SubscriberTransport>,
        receiver: Arc<dyn MessageReceiver>,
        hooks: Arc<dyn SubscriberHooks>,
    ) -> Result<Self> {
        config.validate()?;

        // Local flow control always blocks; the limits are enforced, not just reported.
        let flow_controller = Arc::new(FlowController::new(FlowControlSettings {
            limit_exceeded_behavior: LimitExceededBehavior::Block,
            ..config.flow_control.clone()
        }));

        // Seeded with the shortest deadline so the first extension has data to go on.
        let ack_latency_distribution =
            Arc::new(Distribution::new(MAX_STREAM_ACK_DEADLINE.as_secs() as usize + 1)?);
        ack_latency_distribution.record(MIN_STREAM_ACK_DEADLINE.as_secs() as u32);

        Ok(Self {
            inner: Arc::new(SubscriberInner {
                lifecycle: Arc::new(Lifecycle::new(format!(
                    "subscriber({})",
                    config.subscription
                ))),
                config,
                transport,
                receiver,
                hooks,
                flow_controller,
                ack_latency_distribution,
                connections: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Subscription this subscriber pulls from.
    pub fn subscription(&self) -> &str {
        &self.inner.config.subscription
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.inner.lifecycle.state()
    }

    /// Receiver of state changes.
    pub fn state_changes(&self) -> watch::Receiver<State> {
        self.inner.lifecycle.subscribe()
    }

    /// Why the subscriber failed, once it has.
    pub fn failure_cause(&self) -> Option<Arc<Error>> {
        self.inner.lifecycle.failure_cause()
    }

    /// The flow controller shared by every connection.
    pub fn flow_controller(&self) -> &Arc<FlowController> {
        &self.inner.flow_controller
    }

    /// Delivery attempt of a message delivered by this library, if the subscription
    /// reports one.
    pub fn delivery_attempt(message: &PubsubMessage) -> Option<i32> {
        message.delivery_attempt()
    }

    /// Start the subscriber.
    ///
    /// Returns once startup began; use [`await_running`](Self::await_running) to wait
    /// for every connection to be up.
    pub fn start(&self) -> Result<()> {
        self.inner.lifecycle.notify_starting()?;
        info!(
            subscription = %self.inner.config.subscription,
            connections = self.inner.config.parallel_pull_count,
            "Starting subscriber"
        );

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run_startup().await });
        Ok(())
    }

    /// Wait until the subscriber is running. Fails if it failed or stopped first.
    pub async fn await_running(&self) -> Result<()> {
        self.inner.lifecycle.await_running().await
    }

    /// Wait until the subscriber terminated. Fails with the cause if it failed.
    pub async fn await_terminated(&self) -> Result<()> {
        self.inner.lifecycle.await_terminated().await
    }

    /// Stop the subscriber and wait until it terminated.
    ///
    /// Every connection stops under the configured shutdown mode. Calling `stop` again,
    /// or concurrently, waits for the same shutdown.
    pub async fn stop(&self) -> Result<()> {
        let lifecycle = &self.inner.lifecycle;
        loop {
            match lifecycle.state() {
                State::New => {
                    if lifecycle.notify_stopped() {
                        return Ok(());
                    }
                }
                State::Starting => {
                    // Startup either reaches Running or fails; both are handled below.
                    let _ = lifecycle.await_running().await;
                }
                State::Running => {
                    if lifecycle.notify_stopping().is_some() {
                        return self.inner.run_shutdown().await;
                    }
                }
                State::Stopping | State::Terminated | State::Failed => {
                    return lifecycle.await_terminated().await;
                }
            }
        }
    }
}

impl SubscriberInner {
    fn create_connections(&self) -> Vec<Arc<StreamingSubscriberConnection>> {
        let client_id = Uuid::new_v4().to_string();
        (0..self.config.parallel_pull_count)
            .map(|channel| {
                StreamingSubscriberConnection::new(
                    ConnectionSettings::from_config(&self.config, client_id.clone(), channel),
                    self.transport.clone(),
                    self.receiver.clone(),
                    self.flow_controller.clone(),
                    self.ack_latency_distribution.clone(),
                    self.hooks.clone(),
                )
            })
            .collect()
    }

    async fn run_startup(self: Arc<Self>) {
        let connections = self.create_connections();
        *lock(&self.connections) = connections.clone();

        let mut started = Vec::with_capacity(connections.len());
        for connection in &connections {
            if let Err(err) = connection.start() {
                error!(error = %err, "Failed to start connection");
                join_all(started.iter().map(|c: &Arc<StreamingSubscriberConnection>| c.stop())).await;
                self.lifecycle.notify_failed(Arc::new(err));
                return;
            }
            started.push(connection.clone());
        }

        for connection in connections {
            let inner = self.clone();
            tokio::spawn(async move { inner.watch_connection(connection).await });
        }

        if self.lifecycle.notify_started() {
            info!(subscription = %self.config.subscription, "Subscriber running");
        }
    }

    // Fails the whole subscriber when one connection fails on its own.
    async fn watch_connection(self: Arc<Self>, connection: Arc<StreamingSubscriberConnection>) {
        let Err(err) = connection.lifecycle().await_terminated().await else {
            return;
        };
        if matches!(self.lifecycle.state(), State::Stopping | State::Terminated) {
            return;
        }

        let cause = match err {
            Error::SubscriberFailed(cause) => cause,
            other => Arc::new(other),
        };
        error!(
            subscription = %self.config.subscription,
            error = %cause,
            "Connection failed, stopping subscriber"
        );

        let others: Vec<_> = lock(&self.connections)
            .iter()
            .filter(|c| !Arc::ptr_eq(c, &connection))
            .cloned()
            .collect();
        for result in join_all(others.iter().map(|c| c.stop())).await {
            if let Err(e) = result {
                warn!(error = %e, "Connection failed during shutdown");
            }
        }
        if let Err(e) = self.transport.shutdown().await {
            warn!(error = %e, "Transport shutdown failed");
        }
        self.lifecycle.notify_failed(cause);
    }

    async fn run_shutdown(&self) -> Result<()> {
        info!(subscription = %self.config.subscription, "Stopping subscriber");
        let connections = lock(&self.connections).clone();

        for result in join_all(connections.iter().map(|c| c.stop())).await {
            if let Err(e) = result {
                warn!(error = %e, "Connection had failed before shutdown");
            }
        }
        if let Err(e) = self.transport.shutdown().await {
            warn!(error = %e, "Transport shutdown failed");
        }

        if self.lifecycle.notify_stopped() {
            info!(subscription = %self.config.subscription, "Subscriber terminated");
            return Ok(());
        }
        // A connection failure raced with the stop.
        self.lifecycle.await_terminated().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use crate::types::DELIVERY_ATTEMPT_ATTRIBUTE;
    use std::time::Duration;

    fn subscriber(transport: &InMemoryTransport) -> Subscriber {
        let receiver = receiver_fn(|_message, consumer: AckReplyConsumer| async move {
            consumer.ack();
            Ok::<(), ReceiverError>(())
        });
        Subscriber::new(
            SubscriberConfig::new("projects/p/subscriptions/sub"),
            Arc::new(transport.clone()),
            receiver,
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let receiver = receiver_fn(|_message, consumer: AckReplyConsumer| async move {
            consumer.ack();
            Ok::<(), ReceiverError>(())
        });
        let result = Subscriber::new(
            SubscriberConfig::new("bad"),
            Arc::new(InMemoryTransport::new()),
            receiver,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_delivery_attempt_attribute() {
        let mut message = PubsubMessage::new("x");
        assert_eq!(Subscriber::delivery_attempt(&message), None);
        message
            .attributes
            .insert(DELIVERY_ATTEMPT_ATTRIBUTE.to_string(), "3".to_string());
        assert_eq!(Subscriber::delivery_attempt(&message), Some(3));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let transport = InMemoryTransport::new();
        let subscriber = subscriber(&transport);
        assert_eq!(subscriber.state(), State::New);

        subscriber.start().unwrap();
        tokio::time::timeout(Duration::from_secs(5), subscriber.await_running())
            .await
            .unwrap()
            .unwrap();

        subscriber.stop().await.unwrap();
        assert_eq!(subscriber.state(), State::Terminated);
        assert!(transport.is_shut_down().await);

        // Second stop is a no-op.
        subscriber.stop().await.unwrap();
        assert!(subscriber.start().is_err());
    }

    #[tokio::test]
    async fn test_stop_new_subscriber() {
        let transport = InMemoryTransport::new();
        let subscriber = subscriber(&transport);
        subscriber.stop().await.unwrap();
        assert_eq!(subscriber.state(), State::Terminated);
        assert!(subscriber.await_running().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_while_starting() {
        let transport = InMemoryTransport::new();
        let subscriber = subscriber(&transport);
        subscriber.start().unwrap();
        subscriber.stop().await.unwrap();
        assert_eq!(subscriber.state(), State::Terminated);
    }
}
