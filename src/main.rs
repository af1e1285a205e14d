use clap::{Parser, Subcommand};
use futures::StreamExt;
use kafka_channels::ack::KafkaConsumerChannel;
use kafka_channels::kafka::{HandlerRegistry, KafkaProducerFactory};
use kafka_channels::observe::Observers;
use kafka_channels::{Config, Error, OutgoingRecord, ProducerManager, Result};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "kafka-channels")]
#[command(about = "Send to and consume from Kafka channels", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send each line of stdin to an outgoing channel
    Produce { channel: String },
    /// Print and acknowledge the messages of an incoming channel
    Consume {
        channel: String,

        #[arg(long, value_name = "TEXT", help = "Nack messages whose payload contains TEXT")]
        fail_on: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Loading configuration from {:?}", args.config);
    let config = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };
    info!(kafka_brokers = ?config.kafka.bootstrap_servers, "Configuration loaded");

    let observers = Observers::default().with_failure(|e| error!(error = %e, "Channel failure"));

    match args.command {
        Command::Produce { channel } => produce(&config, &channel, observers).await,
        Command::Consume { channel, fail_on } => {
            consume(&config, &channel, fail_on, observers).await
        }
    }
}

async fn produce(config: &Config, channel: &str, observers: Observers) -> Result<()> {
    let outgoing = config.outgoing_channel(channel)?;
    let topic = outgoing.topic.clone().unwrap_or_else(|| channel.to_string());
    let options = config.producer_options(channel)?;
    let producer =
        ProducerManager::new(options, KafkaProducerFactory, &HandlerRegistry::new(), observers)?;

    let mut pending = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let record = OutgoingRecord::to(topic.clone())
            .payload(line)
            .timestamp(chrono::Utc::now().timestamp_millis());
        pending.push(producer.send(record));
    }

    let mut failed = 0;
    for result in futures::future::join_all(pending).await {
        match result {
            Ok(metadata) => info!(
                topic = %metadata.topic,
                partition = metadata.partition,
                offset = metadata.offset,
                "Sent"
            ),
            Err(_) => failed += 1,
        }
    }

    producer.flush().await?;
    producer.close_async().await;

    if failed > 0 {
        warn!(channel = %channel, failed, "Some records were not written");
    }
    Ok(())
}

async fn consume(
    config: &Config,
    channel: &str,
    fail_on: Option<String>,
    observers: Observers,
) -> Result<()> {
    let consumer = KafkaConsumerChannel::from_config(channel, config, observers)?;
    let mut messages = Box::pin(consumer.messages());

    loop {
        let message = tokio::select! {
            message = messages.next() => message,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                None
            }
        };
        let Some(message) = message else { break };

        let payload = message.payload_str().unwrap_or_default().to_string();
        let rejected = fail_on.as_deref().filter(|text| payload.contains(text));

        let outcome = if let Some(text) = rejected {
            message.nack(format!("payload contains '{}'", text)).await
        } else {
            println!("{}", payload);
            message.ack().await
        };

        match outcome {
            Ok(()) => {}
            Err(e @ Error::Halted { .. }) | Err(e @ Error::DeadLetter { .. }) => {
                error!(error = %e, "Stopping");
                break;
            }
            Err(e) => warn!(error = %e, "Acknowledgment failed"),
        }
    }

    consumer.close().await;
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("kafka_channels=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("kafka_channels=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
