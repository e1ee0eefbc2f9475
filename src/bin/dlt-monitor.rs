//! Dead-letter channel monitor
//!
//! Reads the dead-letter channel in its own consumer group and logs every
//! abandoned order with its diagnostics.
//!
//! ## Usage
//!
//! ```bash
//! dlt-monitor -c config/orderguard.toml
//! LOG_FORMAT=pretty dlt-monitor --broker-url mqtt://localhost:1883 --group order-group
//! ```

use clap::Parser;
use orderguard::config::RelayConfig;
use orderguard::observability::init_default_logging;
use orderguard::protocol::{DeadLetterRecord, Delivery};
use orderguard::transport::{mqtt::MqttClient, Transport};
use orderguard::RelayResult;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "dlt-monitor",
    about = "Log records arriving on the dead-letter channel",
    version
)]
struct Args {
    /// Configuration file; broker flags are ignored when given
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL
    #[arg(long, env = "ORDERGUARD_BROKER_URL", default_value = "mqtt://localhost:1883")]
    broker_url: String,

    /// Consumer group of the order service; the monitor joins `{group}-dlt`
    #[arg(long, default_value = "order-group")]
    group: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_default_logging();

    if let Err(e) = run(args).await {
        error!("Dead-letter monitor failed: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> RelayResult<()> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::load_from_file(path)?,
        None => RelayConfig::new(args.broker_url.clone(), args.group.clone()),
    };
    config.validate()?;

    let group = format!("{}-dlt", config.broker.group);
    config.broker.group = group.clone();
    config.broker.client_id = Some(format!("{group}-monitor"));

    let mut transport = MqttClient::new(&config.client_id(), config.broker.clone(), 1)?;
    transport.connect().await?;

    let (delivery_tx, mut delivery_rx) = mpsc::channel(config.consumer.queue_capacity.max(1));
    transport.set_delivery_sender(delivery_tx);
    transport.subscribe(&config.channels.dead_letter).await?;

    info!(
        group = %group,
        channel = %config.channels.dead_letter,
        "Monitoring dead-letter channel"
    );

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received interrupt, stopping monitor");
                break;
            }
            next = delivery_rx.recv() => {
                let Some(delivery) = next else {
                    warn!("Delivery stream closed");
                    break;
                };
                report(&delivery);
                if let Err(e) = transport.commit(&delivery.position).await {
                    warn!(position = %delivery.position, error = %e, "Failed to commit dead-letter record");
                }
            }
        }

        if transport.is_permanently_disconnected() {
            error!("Broker connection permanently lost");
            break;
        }
    }

    transport.disconnect().await?;
    Ok(())
}

fn report(delivery: &Delivery) {
    match DeadLetterRecord::from_delivery(delivery) {
        Ok(record) => error!(
            payload = %record.payload_text(),
            failure_message = %record.failure_message,
            original_topic = %record.original_channel,
            original_partition = record.original_partition,
            original_offset = record.original_offset,
            attempts = record.attempt_count,
            reason = record.reason.as_str(),
            correlation_id = %record.correlation_id,
            dead_lettered_at = %record.timestamp.to_rfc3339(),
            "Order dead-lettered"
        ),
        Err(e) => warn!(
            position = %delivery.position,
            error = %e,
            payload = %String::from_utf8_lossy(&delivery.payload),
            "Record on dead-letter channel is missing diagnostics"
        ),
    }
}
