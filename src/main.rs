use anyhow::Context;
use clap::{Parser, Subcommand};
use pv_simulator::{
    Broker, CsvRecordSink, LocalPipeline, MalformedPolicy, ManagementApiBroker, MeterProducer,
    PvConsumer, QueueClient, RabbitMqBroker, SimulationConfig, SimulationMode,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pv_simulator", version, about = "Household meter and photovoltaic simulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// How the roles reach RabbitMQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Transport {
    /// AMQP with acknowledgements after each handled message
    Amqp,
    /// Management HTTP API; messages are settled when fetched (at-most-once)
    Management,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish synthetic meter readings onto the queue
    Meter {
        /// The kind of simulation that should be run
        #[arg(short, long, value_enum, default_value_t = SimulationMode::OneDay)]
        mode: SimulationMode,
        /// Seconds between two readings
        #[arg(short, long, default_value_t = 1)]
        timestep: u64,
        /// Optional INI configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Protocol used to talk to the broker
        #[arg(long, value_enum, default_value_t = Transport::Amqp)]
        transport: Transport,
    },
    /// Consume meter readings and write combined PV values to a CSV file
    Pv {
        /// The file the output will be appended to
        #[arg(short, long, default_value = "output.csv")]
        output: PathBuf,
        /// Seconds to idle between queue accesses
        #[arg(short, long = "idle-time", default_value_t = 0.0)]
        idle_time: f64,
        /// Optional INI configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Stop on malformed messages instead of skipping them
        #[arg(long)]
        strict: bool,
        /// Protocol used to talk to the broker
        #[arg(long, value_enum, default_value_t = Transport::Amqp)]
        transport: Transport,
    },
    /// Run meter and PV simulator for one day in this process, without a broker
    Simulate {
        /// Seconds between two readings
        #[arg(short, long, default_value_t = 1)]
        timestep: u64,
        /// The file the output will be appended to
        #[arg(short, long, default_value = "output.csv")]
        output: PathBuf,
        /// Seconds to idle between queue accesses
        #[arg(short, long = "idle-time", default_value_t = 0.0)]
        idle_time: f64,
        /// Optional INI configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Execution was cancelled by user");
            trigger.cancel();
        }
    });
    token
}

fn idle_interval(idle_time: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(idle_time)
        .with_context(|| format!("Invalid idle time {idle_time}"))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Meter {
            mode,
            timestep,
            config,
            transport,
        } => {
            let config = SimulationConfig::load(config.as_deref());
            let timestep = Duration::from_secs(timestep);
            match transport {
                Transport::Amqp => {
                    run_meter(RabbitMqBroker::new(&config), mode, timestep, &config).await
                }
                Transport::Management => {
                    run_meter(ManagementApiBroker::new(&config), mode, timestep, &config).await
                }
            }
        }
        Commands::Pv {
            output,
            idle_time,
            config,
            strict,
            transport,
        } => {
            let config = SimulationConfig::load(config.as_deref());
            let idle_interval = idle_interval(idle_time)?;
            let policy = if strict {
                MalformedPolicy::Fail
            } else {
                MalformedPolicy::Skip
            };
            match transport {
                Transport::Amqp => {
                    run_pv(RabbitMqBroker::new(&config), output, idle_interval, policy, &config)
                        .await
                }
                Transport::Management => {
                    let broker = ManagementApiBroker::new(&config);
                    run_pv(broker, output, idle_interval, policy, &config).await
                }
            }
        }
        Commands::Simulate {
            timestep,
            output,
            idle_time,
            config,
        } => {
            let config = SimulationConfig::load(config.as_deref());
            let pipeline = LocalPipeline::new(&config)
                .with_timestep(Duration::from_secs(timestep))
                .with_idle_interval(idle_interval(idle_time)?);
            let cancel = shutdown_token();
            tokio::select! {
                summary = pipeline.run_one_day(CsvRecordSink::new(output)) => {
                    summary?;
                }
                _ = cancel.cancelled() => {}
            }
            Ok(())
        }
    }
}

async fn run_meter<B: Broker>(
    broker: B,
    mode: SimulationMode,
    timestep: Duration,
    config: &SimulationConfig,
) -> anyhow::Result<()> {
    let mut meter = MeterProducer::new(QueueClient::new(config, broker), timestep);
    let cancel = shutdown_token();

    match mode {
        SimulationMode::OneDay => meter.run_one_day_until(&cancel).await?,
        SimulationMode::Endless => meter.run_endless(&cancel).await?,
    };

    meter.client().close().await?;
    Ok(())
}

async fn run_pv<B: Broker>(
    broker: B,
    output: PathBuf,
    idle_interval: Duration,
    policy: MalformedPolicy,
    config: &SimulationConfig,
) -> anyhow::Result<()> {
    let client = QueueClient::new(config, broker).with_idle_interval(idle_interval);
    let consumer = PvConsumer::new(client).with_policy(policy);
    let cancel = shutdown_token();

    info!("Writing combined values to {}", output.display());
    consumer
        .run_until(CsvRecordSink::new(output), &cancel)
        .await?;

    consumer.client().close().await?;
    Ok(())
}
