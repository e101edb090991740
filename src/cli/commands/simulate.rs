// Simulate command implementation
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use tabled::Tabled;
use tracing::info;

use crate::cli::commands::load_config;
use crate::cli::output::*;
use crate::cli::SimulateArgs;
use crate::config::{ShutdownMode, SubscriberConfig};
use crate::shutdown::wait_for_signal;
use crate::subscriber::{receiver_fn, AckReplyConsumer, ReceiverError, Subscriber};
use crate::transport::memory::InMemoryTransportConfig;
use crate::transport::InMemoryTransport;
use crate::types::{PubsubMessage, SubscriptionProperties};

/// Result of one simulation run
#[derive(Debug, Serialize, Tabled)]
struct SimulationSummary {
    subscription: String,
    published: usize,
    deliveries: u64,
    redeliveries: u64,
    acked: usize,
    nacked: usize,
    elapsed_ms: u128,
    final_state: String,
}

fn apply_overrides(config: &mut SubscriberConfig, args: &SimulateArgs) -> anyhow::Result<()> {
    if let Some(count) = args.parallel_pull_count {
        config.parallel_pull_count = count;
    }
    if let Some(max) = args.max_outstanding_messages {
        config.flow_control.max_outstanding_element_count = Some(max);
    }
    if let Some(mode) = &args.shutdown_mode {
        config.shutdown.mode = match mode.to_lowercase().as_str() {
            "wait" | "wait_for_processing" => ShutdownMode::WaitForProcessing,
            "nack" | "nack_immediately" => ShutdownMode::NackImmediately,
            other => anyhow::bail!("Unknown shutdown mode '{}'", other),
        };
    }
    if let Some(timeout) = args.shutdown_timeout_ms {
        config.shutdown.timeout_ms = timeout;
    }
    if args.exactly_once {
        config.ack_response_enabled = true;
    }
    Ok(())
}

/// Run a subscriber against an in-memory service until every message was acked
pub async fn execute(args: SimulateArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_ref(), &args.subscription)?;
    apply_overrides(&mut config, &args)?;

    let transport = InMemoryTransport::with_config(InMemoryTransportConfig {
        redeliver_on_nack: true,
        dead_letter_policy: args.dead_letter_policy,
    });
    transport
        .set_subscription_properties(SubscriptionProperties {
            exactly_once_delivery_enabled: args.exactly_once,
            message_ordering_enabled: false,
        })
        .await;

    let deliveries = Arc::new(AtomicU64::new(0));
    let redeliveries = Arc::new(AtomicU64::new(0));
    let sequence = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(HashSet::<String>::new()));

    let receiver = {
        let deliveries = deliveries.clone();
        let redeliveries = redeliveries.clone();
        let process_time = Duration::from_millis(args.process_ms);
        let nack_every = args.nack_every;

        receiver_fn(move |message: PubsubMessage, consumer: AckReplyConsumer| {
            deliveries.fetch_add(1, Ordering::Relaxed);
            let first_delivery = seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(message.message_id.clone());
            if !first_delivery {
                redeliveries.fetch_add(1, Ordering::Relaxed);
            }
            let nth = sequence.fetch_add(1, Ordering::Relaxed) + 1;
            let nack = first_delivery && nack_every > 0 && nth % nack_every == 0;

            async move {
                tokio::time::sleep(process_time).await;
                if nack {
                    consumer.nack();
                } else {
                    consumer.ack();
                }
                Ok::<(), ReceiverError>(())
            }
        })
    };

    let subscriber = Subscriber::new(config, Arc::new(transport.clone()), receiver)
        .context("Failed to create subscriber")?;
    let started = Instant::now();
    subscriber.start()?;
    subscriber
        .await_running()
        .await
        .context("Subscriber failed to start")?;

    for i in 0..args.messages {
        transport
            .publish(PubsubMessage::new(format!("message {}", i)))
            .await;
    }
    print_info(&format!(
        "Published {} messages to {}",
        args.messages,
        subscriber.subscription()
    ));

    let all_acked = async {
        loop {
            let unique: HashSet<_> = transport.acked_ids().await.into_iter().collect();
            if transport.outstanding_count().await == 0 && unique.len() >= args.messages {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };

    let completed = tokio::select! {
        _ = all_acked => true,
        _ = wait_for_signal() => false,
        _ = tokio::time::sleep(Duration::from_secs(args.max_runtime_secs)) => false,
    };
    if !completed {
        print_warning("Stopping before every message was acked");
    }

    info!("Stopping subscriber");
    let stop_result = subscriber.stop().await;
    let elapsed = started.elapsed();

    let summary = SimulationSummary {
        subscription: subscriber.subscription().to_string(),
        published: args.messages,
        deliveries: deliveries.load(Ordering::Relaxed),
        redeliveries: redeliveries.load(Ordering::Relaxed),
        acked: transport.acked_ids().await.len(),
        nacked: transport.nacked_ids().await.len(),
        elapsed_ms: elapsed.as_millis(),
        final_state: subscriber.state().to_string(),
    };
    print_output(&summary, OutputFormat::parse(&args.format))?;

    stop_result.context("Subscriber failed")?;
    if completed {
        print_success("All messages acked");
    }
    Ok(())
}
