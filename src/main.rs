use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use receipt_sync::cache::SqliteStorage;
use receipt_sync::config::Config;
use receipt_sync::remote::HttpRemoteClient;
use receipt_sync::{CustomerAggregate, GroupKey, Receipt, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "receipt-sync")]
#[command(about = "Mirror a remote receipt collection and summarize it per customer and store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/receipt-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Print results as JSON
  #[arg(long, global = true)]
  json: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show customer aggregates, syncing first if needed
  Aggregates,
  /// Discard sync state and refetch everything
  Refresh,
  /// Show what the local cache holds
  Status,
  /// List cached receipts of one customer at one store
  History {
    #[arg(long)]
    customer: String,
    #[arg(long)]
    store: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let db_path = config.cache.resolve_path()?;

  let _guard = init_logging(&db_path)?;

  let storage = SqliteStorage::open(&db_path)
    .map_err(|e| eyre!("Failed to open cache at {}: {}", db_path.display(), e))?;
  let remote = HttpRemoteClient::new(&config.remote)?;
  let engine = SyncEngine::new(storage, remote, config.sync.clone());

  let result = run(&engine, args.command, args.json).await;
  engine.shutdown();
  result
}

async fn run(
  engine: &SyncEngine<SqliteStorage, HttpRemoteClient>,
  command: Command,
  json: bool,
) -> Result<()> {
  let progress = |message: &str, count: usize| eprintln!("[{:>6}] {}", count, message);

  match command {
    Command::Aggregates => {
      let aggregates = engine.get_customer_aggregates(&progress).await?;
      print_aggregates(&aggregates, json)?;
    }
    Command::Refresh => {
      let aggregates = engine.force_refresh(&progress).await?;
      print_aggregates(&aggregates, json)?;
    }
    Command::Status => {
      let status = engine.status().await?;
      if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
      } else {
        println!("receipts:        {}", status.records);
        println!("aggregates:      {}", status.aggregates);
        println!(
          "last synced:     {}",
          status
            .watermark
            .last_synced_timestamp
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
        );
        println!(
          "last refresh:    {}",
          status
            .watermark
            .last_refresh_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
        );
        println!("refresh needed:  {}", status.refresh_needed);
      }
    }
    Command::History { customer, store } => {
      let receipts = engine
        .get_receipt_history(&GroupKey::new(customer, store))
        .await?;
      print_receipts(&receipts, json)?;
    }
  }

  Ok(())
}

fn print_aggregates(aggregates: &[CustomerAggregate], json: bool) -> Result<()> {
  if json {
    println!("{}", serde_json::to_string_pretty(aggregates)?);
    return Ok(());
  }

  println!("{:<30} {:<30} {:>8} {:>12}", "STORE", "CUSTOMER", "COUNT", "TOTAL");
  for a in aggregates {
    println!(
      "{:<30} {:<30} {:>8} {:>12.2}",
      a.key.store, a.key.customer, a.count, a.total
    );
  }
  Ok(())
}

fn print_receipts(receipts: &[Receipt], json: bool) -> Result<()> {
  if json {
    println!("{}", serde_json::to_string_pretty(receipts)?);
    return Ok(());
  }

  for r in receipts {
    println!(
      "{}  {:<40} {:>12.2}",
      r.created_at.to_rfc3339(),
      r.key(),
      r.amount()
    );
  }
  Ok(())
}

/// Log to a daily file next to the cache database so stderr stays readable.
fn init_logging(db_path: &Path) -> Result<WorkerGuard> {
  let log_dir = db_path
    .parent()
    .map(|p| p.join("logs"))
    .ok_or_else(|| eyre!("Could not determine log directory"))?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "receipt-sync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("receipt_sync=info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
