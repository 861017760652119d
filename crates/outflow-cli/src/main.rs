use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use outflow_core::app::{ProjectionApplier, Relay, replay_dead_letter};
use outflow_core::impls::{SqliteProjectionStore, SqliteStore};
use outflow_core::ports::{CustomerStore, OutboxStore, ProjectionStore, SharedClock, SystemClock};
use outflow_core::{CustomerId, CustomerUpdate, EventId, EventStatus, NewCustomer, RelayConfig};

/// Customer store with a transactional outbox relay.
#[derive(Debug, Parser)]
#[command(name = "outflow", version, about)]
struct Cli {
    /// Customer + outbox database.
    #[arg(long, env = "OUTFLOW_DATABASE", default_value = "outflow.db", global = true)]
    database: PathBuf,

    /// Projection database.
    #[arg(
        long,
        env = "OUTFLOW_PROJECTION_DATABASE",
        default_value = "projection.db",
        global = true
    )]
    projection_database: PathBuf,

    /// Log filter, e.g. `info` or `outflow_core=debug`.
    #[arg(long, env = "RUST_LOG", default_value = "info", global = true)]
    log_level: String,

    #[command(flatten)]
    relay: RelayArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct RelayArgs {
    #[arg(long, env = "OUTFLOW_POLL_INTERVAL_MS", global = true)]
    poll_interval_ms: Option<u64>,

    #[arg(long, env = "OUTFLOW_LOCK_TIMEOUT_SECS", global = true)]
    lock_timeout_secs: Option<u64>,

    #[arg(long, env = "OUTFLOW_RETRY_INTERVAL_SECS", global = true)]
    retry_interval_secs: Option<u64>,

    #[arg(long, env = "OUTFLOW_RETRY_COOLDOWN_SECS", global = true)]
    retry_cooldown_secs: Option<u64>,

    #[arg(long, env = "OUTFLOW_MAX_RETRIES", global = true)]
    max_retries: Option<u32>,

    #[arg(long, env = "OUTFLOW_QUEUE_CAPACITY", global = true)]
    queue_capacity: Option<usize>,
}

impl RelayArgs {
    fn to_config(&self) -> Result<RelayConfig> {
        let mut builder = RelayConfig::builder();
        if let Some(ms) = self.poll_interval_ms {
            builder = builder.poll_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = self.lock_timeout_secs {
            builder = builder.lock_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.retry_interval_secs {
            builder = builder.retry_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = self.retry_cooldown_secs {
            builder = builder.retry_cooldown(Duration::from_secs(secs));
        }
        if let Some(n) = self.max_retries {
            builder = builder.max_retries(n);
        }
        if let Some(n) = self.queue_capacity {
            builder = builder.queue_capacity(n);
        }
        builder.build().context("invalid relay configuration")
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay until Ctrl-C.
    Run,
    /// Create a customer.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
    /// Replace a customer's name and email.
    Update {
        #[arg(long)]
        id: CustomerId,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
    /// Soft-delete a customer.
    Delete {
        #[arg(long)]
        id: CustomerId,
    },
    /// Show one customer.
    Show {
        #[arg(long)]
        id: CustomerId,
        #[arg(long)]
        include_deleted: bool,
    },
    /// Outbox counts per state and the current watermark.
    Status,
    /// List outbox events.
    Events {
        /// Only events in this state.
        #[arg(long)]
        status: Option<EventStatus>,
        /// Only dead letters.
        #[arg(long, conflicts_with = "status")]
        dead: bool,
    },
    /// List the projection.
    Projection,
    /// Put a dead letter back on the queue.
    Replay {
        #[arg(long)]
        id: EventId,
    },
}

#[derive(Serialize)]
struct StatusView {
    #[serde(flatten)]
    counts: outflow_core::OutboxCounts,
    watermark: Option<chrono::DateTime<chrono::Utc>>,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = cli.relay.to_config()?;
    let clock: SharedClock = Arc::new(SystemClock);
    let store = Arc::new(
        SqliteStore::open(&cli.database, clock.clone())
            .with_context(|| format!("opening {}", cli.database.display()))?,
    );

    match cli.command {
        Command::Run => {
            let projection = Arc::new(
                SqliteProjectionStore::open(&cli.projection_database).with_context(|| {
                    format!("opening {}", cli.projection_database.display())
                })?,
            );
            let relay = Relay::spawn(
                store,
                Arc::new(ProjectionApplier::new(projection)),
                clock,
                config,
            )?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            info!("shutdown requested");
            relay.shutdown_and_join().await;
        }
        Command::Create { name, email } => {
            let customer = store.create(NewCustomer::new(name, email)).await?;
            print_json(&customer)?;
        }
        Command::Update { id, name, email } => {
            let customer = store.update(CustomerUpdate::new(id, name, email)).await?;
            print_json(&customer)?;
        }
        Command::Delete { id } => {
            let customer = store.soft_delete(id).await?;
            print_json(&customer)?;
        }
        Command::Show {
            id,
            include_deleted,
        } => match store.find_by_id(id, include_deleted).await? {
            Some(customer) => print_json(&customer)?,
            None => anyhow::bail!("customer {id} not found"),
        },
        Command::Status => {
            let view = StatusView {
                counts: store.counts(config.max_retries).await?,
                watermark: store.watermark().await?,
            };
            print_json(&view)?;
        }
        Command::Events { status, dead } => {
            let events = if dead {
                store.dead_letters(config.max_retries).await?
            } else {
                let mut events = store.list_events().await?;
                if let Some(status) = status {
                    events.retain(|e| e.status == status);
                }
                events
            };
            print_json(&events)?;
        }
        Command::Projection => {
            let projection = SqliteProjectionStore::open(&cli.projection_database)
                .with_context(|| format!("opening {}", cli.projection_database.display()))?;
            print_json(&projection.list().await?)?;
        }
        Command::Replay { id } => {
            let event =
                replay_dead_letter(store.as_ref(), clock.as_ref(), id, config.max_retries).await?;
            print_json(&event)?;
        }
    }
    Ok(())
}
