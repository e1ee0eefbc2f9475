//! Order injection utility
//!
//! Publishes one order to the main channel with a fresh correlation id.
//!
//! ## Usage
//!
//! ```bash
//! # Publish against a local broker
//! inject-order --order-id order-1 --product keyboard --quantity 2
//!
//! # Use the service configuration file for broker and channel settings
//! inject-order -c config/orderguard.toml --order-id order-2 --product desk --quantity 1
//!
//! # A non-positive quantity is published as-is and ends up on the dead-letter channel
//! inject-order --order-id order-3 --product lamp --quantity 0
//! ```

use clap::Parser;
use orderguard::config::RelayConfig;
use orderguard::observability::init_default_logging;
use orderguard::producer::OrderProducer;
use orderguard::protocol::OrderRequest;
use orderguard::transport::{mqtt::MqttClient, Transport};
use orderguard::RelayResult;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "inject-order",
    about = "Publish an order to the main order channel",
    version
)]
struct Args {
    /// Configuration file; broker flags are ignored when given
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL
    #[arg(long, env = "ORDERGUARD_BROKER_URL", default_value = "mqtt://localhost:1883")]
    broker_url: String,

    /// Consumer group the order is intended for
    #[arg(long, default_value = "order-group")]
    group: String,

    /// Order identifier
    #[arg(long)]
    order_id: String,

    /// Product name
    #[arg(long)]
    product: String,

    /// Ordered quantity
    #[arg(long, allow_negative_numbers = true)]
    quantity: i64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_default_logging();

    if let Err(e) = run(args).await {
        error!("Failed to inject order: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> RelayResult<()> {
    let config = match &args.config {
        Some(path) => RelayConfig::load_from_file(path)?,
        None => RelayConfig::new(args.broker_url.clone(), args.group.clone()),
    };
    config.validate()?;

    let client_id = format!("{}-producer-{}", config.broker.group, Uuid::new_v4().simple());
    let mut transport = MqttClient::new(&client_id, config.broker.clone(), config.consumer.partitions)?;
    transport.connect().await?;

    let transport = Arc::new(transport);
    let producer = OrderProducer::new(transport.clone(), config.channels.main.clone())?;

    let order = OrderRequest::new(args.order_id, args.product, args.quantity);
    let correlation_id = Uuid::new_v4().to_string();
    let result = producer.send(&order, &correlation_id).await;

    transport.disconnect().await?;
    result?;

    info!(correlation_id = %correlation_id, "Order injected");
    println!("{correlation_id}");
    Ok(())
}
