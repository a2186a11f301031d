use std::time::Duration;

use courier::{
    ConsumerLoop, DeliveryConfig, DeliveryOutcome, Envelope, InMemoryBroker,
    InMemoryDeadLetterSink, Publisher,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Order {
    number: u64,
    sku: String,
}

impl Order {
    fn new(number: u64) -> Self {
        Self {
            number,
            sku: format!("SKU-{}", number % 4),
        }
    }
}

/// Every fifth order fails once, every seventh is poison.
async fn ship(envelope: Envelope) -> DeliveryOutcome {
    let order: Order = match envelope.json() {
        Ok(order) => order,
        Err(err) => return DeliveryOutcome::fatal(format!("undecodable order: {err}")),
    };

    if order.number % 7 == 0 {
        return DeliveryOutcome::fatal(format!("unknown sku {}", order.sku));
    }
    if order.number % 5 == 0 && envelope.attempt() == 0 {
        return DeliveryOutcome::retry("warehouse busy");
    }

    tracing::info!(number = order.number, attempt = envelope.attempt(), "Order shipped");
    DeliveryOutcome::Success
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let config = DeliveryConfig::default()
        .with_prefetch(4)
        .with_backoff(Duration::from_millis(200), Duration::from_secs(2));
    let sink = InMemoryDeadLetterSink::default();
    let broker = InMemoryBroker::new(sink.clone());

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let publisher = Publisher::new(broker.clone(), &config);
    let cancel_publisher = cancel.clone();
    let publisher_handle = tokio::spawn(async move {
        let mut number = 1;
        while !cancel_publisher.is_cancelled() {
            if let Err(err) = publisher.publish_json(&Order::new(number), None).await {
                tracing::error!(%err, "Failed to publish order");
            }
            number += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let consumer = ConsumerLoop::new(broker, ship, &config);
    let consumer_handle = tokio::spawn(consumer.run(cancel));

    tokio::try_join!(cancel_handle, publisher_handle, consumer_handle).unwrap();

    for record in sink.records().await {
        tracing::info!(id = %record.envelope().id(), reason = %record.reason(), "Dead letter");
    }
}
