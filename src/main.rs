use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use stream_consumer::consumer::{
    create_consumer, ConsumerConfig, LoggingHandler, RedisBrokerFactory, ShutdownCoordinator,
    ShutdownState,
};
use stream_consumer::telemetry::{init_logging, LogFormat, LoggingConfig};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "stream-consumer")]
#[command(about = "Drain a Redis stream through a consumer group", long_about = None)]
struct Cli {
    /// Redis host
    #[arg(long, env = "REDIS_HOST")]
    host: Option<String>,

    /// Redis port
    #[arg(long, env = "REDIS_PORT")]
    port: Option<u16>,

    /// Stream to consume
    #[arg(long)]
    stream: Option<String>,

    /// Consumer group name
    #[arg(long)]
    group: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format (text or json)
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    fn consumer_config(&self) -> ConsumerConfig {
        let mut config = ConsumerConfig::default();
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(stream) = &self.stream {
            config.stream = stream.clone();
        }
        if let Some(group) = &self.group {
            config.group = group.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
    };
    if let Err(e) = init_logging(&logging) {
        eprintln!("Failed to initialise logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli.consumer_config()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Consumer failed to start: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ConsumerConfig) -> anyhow::Result<()> {
    let shutdown = Arc::new(ShutdownState::new());
    let coordinator = ShutdownCoordinator::new(shutdown.clone());
    coordinator.install_signal_handler();

    let handler = LoggingHandler::new(config.required_fields.clone(), config.processing_delay);
    let factory = RedisBrokerFactory::new(&config).context("invalid broker address")?;

    let consumer = match create_consumer(factory, handler, config, shutdown.clone()).await {
        Ok(consumer) => consumer,
        Err(e) if e.is_shutdown() => {
            info!("Shutdown requested during startup, exiting");
            return Ok(());
        }
        Err(e) => return Err(e).context("startup failed"),
    };

    let summary = consumer.run().await;
    info!(
        processed = summary.processed,
        acknowledged = summary.acknowledged,
        failed = summary.failed,
        left_pending = summary.left_pending,
        "Shutting down subscriber"
    );
    Ok(())
}
