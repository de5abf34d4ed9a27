use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use locker_broker::logging::{init_logging, LoggingMode};
use locker_broker::{BrokerConfig, ConsumerId, DeviceId, LockerBroker};

/// Smart locker device broker
///
/// Connects to the MQTT broker, tracks device state and writes access-log
/// records and security alerts to the log until interrupted.
#[derive(Parser, Debug)]
#[command(name = "locker-brokerd")]
#[command(about = "Smart locker command/event broker")]
#[command(version)]
struct Args {
    /// MQTT broker host (overrides MQTT_BROKER)
    #[arg(long)]
    host: Option<String>,

    /// MQTT broker port (overrides MQTT_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Topic prefix for device topics
    #[arg(long)]
    topic_prefix: Option<String>,

    /// Command acknowledgment timeout in seconds
    #[arg(long)]
    command_timeout: Option<u64>,

    /// Seconds without a heartbeat before a device is marked offline
    #[arg(long)]
    stale_after: Option<u64>,

    /// Devices to register at startup, comma separated
    #[arg(long, value_delimiter = ',')]
    devices: Vec<String>,

    /// Seconds between health reports
    #[arg(long, default_value = "60")]
    health_interval: u64,

    /// Log output: silent, development, debug or json
    #[arg(long, env = "LOCKER_LOG_MODE", default_value = "development")]
    log_mode: LoggingMode,
}

impl Args {
    fn validate(&self) -> Result<()> {
        if self.command_timeout == Some(0) {
            return Err(anyhow::anyhow!("Command timeout must be positive"));
        }

        if self.stale_after == Some(0) {
            return Err(anyhow::anyhow!("Stale-after must be positive"));
        }

        if self.health_interval == 0 {
            return Err(anyhow::anyhow!("Health interval must be positive"));
        }

        Ok(())
    }

    fn broker_config(&self) -> Result<BrokerConfig> {
        let mut config = BrokerConfig::from_env().context("Invalid broker environment")?;

        if let Some(host) = &self.host {
            config.transport.host = host.clone();
        }
        if let Some(port) = self.port {
            config.transport.port = port;
        }
        if let Some(prefix) = &self.topic_prefix {
            config = config.with_topic_prefix(prefix.clone());
        }
        if let Some(secs) = self.command_timeout {
            config = config.with_command_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.stale_after {
            let check_interval = config.liveness_check_interval.min(Duration::from_secs(secs));
            config = config.with_liveness(Duration::from_secs(secs), check_interval);
        }

        config.validate().context("Invalid broker configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.validate()?;
    init_logging(args.log_mode).context("Failed to initialize logging")?;

    let config = args.broker_config()?;
    info!(
        "Connecting to {}:{} as {}",
        config.transport.host,
        config.transport.port,
        config.transport.effective_client_id()
    );

    let broker = LockerBroker::connect(config)
        .await
        .context("Failed to start broker")?;

    for device in &args.devices {
        broker.register_device(&DeviceId::new(device.trim()), None);
    }

    serve(
        &broker,
        Duration::from_secs(args.health_interval),
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        },
    )
    .await?;

    broker.shutdown().await.context("Broker shutdown failed")?;
    Ok(())
}

/// Log access records, alerts and periodic health until `shutdown` completes.
async fn serve(
    broker: &LockerBroker,
    health_interval: Duration,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let mut access_log = broker.access_log_stream()?;
    let consumer = ConsumerId::new("locker-brokerd");
    let mut alerts = broker.subscribe_alerts(consumer.clone());
    let mut health = tokio::time::interval(health_interval);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupted, shutting down");
                break;
            }
            Some(record) = access_log.recv() => {
                match serde_json::to_string(&record) {
                    Ok(line) => info!(target: "access_log", "{}", line),
                    Err(e) => error!("Failed to serialize access log record: {}", e),
                }
            }
            Some(event) = alerts.recv() => match event {
                Ok(event) if event.kind.is_alert() => {
                    warn!("Security alert on {}: {}", event.device_id, event.kind.name());
                }
                Ok(event) => info!("{} {}", event.device_id, event.kind.name()),
                Err(e) => warn!("{}", e),
            },
            _ = health.tick() => info!("Health: {}", broker.health()),
        }
    }

    broker.unsubscribe_alerts(&consumer);
    Ok(())
}
