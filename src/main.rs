use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use task_events::config::{create_default_config_file, CONFIG_FILE_NAME};
use task_events::env::load_settings;
use task_events::message::TaskRecord;
use task_events::rabbitmq::{AmqpTransport, ConsumerLoop, Publisher};
use task_events::{Settings, TaskEventPublisher};

/// Task event listener and producer for RabbitMQ
#[derive(Parser)]
#[command(name = "task-events")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TASK_EVENTS_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume task events until Ctrl-C
    Listen,
    /// Publish a single task event
    Publish {
        #[arg(value_enum)]
        event: EventKind,
        /// Task id
        #[arg(long)]
        id: i32,
        /// Task title for created/updated events
        #[arg(long, default_value = "Untitled task")]
        title: String,
    },
    /// Write a default configuration file
    InitConfig {
        #[arg(default_value = CONFIG_FILE_NAME)]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EventKind {
    Created,
    Updated,
    Deleted,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::InitConfig { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists, pass --force to overwrite", path.display());
            }
            create_default_config_file(&path)
        }
        Commands::Listen => {
            let settings = load_settings(cli.config.as_deref())?;
            listen(&settings).await
        }
        Commands::Publish { event, id, title } => {
            let settings = load_settings(cli.config.as_deref())?;
            publish(&settings, event, id, title).await
        }
    }
}

async fn listen(settings: &Settings) -> Result<()> {
    let endpoint = settings.endpoint().context("Invalid RabbitMQ settings")?;
    let stop = CancellationToken::new();

    let listener = ConsumerLoop::new(
        endpoint,
        Arc::new(AmqpTransport::new()),
        settings.listener_retry_policy(),
        &stop,
    )
    .with_health_check_interval(settings.health_check_interval());

    let signal_stop = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, stopping"),
        }
        signal_stop.cancel();
    });

    listener.run().await;
    info!("Listener stopped");
    Ok(())
}

async fn publish(settings: &Settings, event: EventKind, id: i32, title: String) -> Result<()> {
    let endpoint = settings.endpoint().context("Invalid RabbitMQ settings")?;
    let stop = CancellationToken::new();

    let publisher = Publisher::new(
        endpoint,
        Arc::new(AmqpTransport::new()),
        settings.publisher_retry_policy(),
        &stop,
    )
    .await;
    let events = TaskEventPublisher::new(publisher);

    let published = match event {
        EventKind::Created => events.task_created(&TaskRecord::new(id, title)).await,
        EventKind::Updated => events.task_updated(&TaskRecord::new(id, title)).await,
        EventKind::Deleted => events.task_deleted(id).await,
    };
    events.producer().close().await;

    if !published {
        bail!("task event for id {id} was not published");
    }
    Ok(())
}
