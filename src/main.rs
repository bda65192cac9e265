mod cache;
mod config;
mod connectivity;
mod db;
mod error;
mod logging;
mod net;
mod queue;
mod router;
mod sequence;
mod session;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use url::Url;

use crate::net::HttpRequest;
use crate::queue::{OperationKind, QueueItem};
use crate::sequence::{DocumentFamily, PartitionKey};
use crate::session::OfflineSession;

#[derive(Parser, Debug)]
#[command(name = "fleetdesk")]
#[command(about = "Offline-first cache, write queue and document numbering for the fleet back office")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./fleetdesk.yaml, then $XDG_CONFIG_HOME/fleetdesk/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Path to the offline database (default: $XDG_DATA_HOME/fleetdesk/offline.db)
  #[arg(long, global = true)]
  db: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Route one request through the offline layer
  Fetch {
    /// Absolute URL or application path
    url: String,

    /// Treat the request as a top-level navigation
    #[arg(long)]
    navigate: bool,
  },

  /// Install a cache generation from the precache list
  Install {
    /// Generation id (default: cache.generation from the config)
    generation: Option<String>,

    /// Leave the generation installed without activating it
    #[arg(long)]
    wait: bool,
  },

  /// Activate an installed cache generation now
  Activate { generation: String },

  /// List cache generations
  Generations,

  /// Inspect and manage the write queue
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },

  /// Allocate a document id and queue the document's creation
  Create {
    #[arg(value_enum)]
    family: DocumentFamily,

    /// Document fields as a JSON object
    #[arg(long)]
    payload: Option<String>,
  },

  /// Show the next free document identifier
  NextId {
    #[arg(value_enum)]
    family: DocumentFamily,

    /// Partition key, e.g. 2025 or 202503 (default: current)
    #[arg(long)]
    partition: Option<String>,
  },

  /// Keep the session running, replaying on reconnect, until Ctrl-C
  Run,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Queue a mutation
  Submit {
    #[arg(value_enum)]
    operation: OperationKind,

    /// Resource path relative to the API base, e.g. work-orders/OT-2025-011
    target: String,

    /// JSON body
    #[arg(long)]
    payload: Option<String>,
  },
  /// List unsettled items in replay order
  List,
  /// Withdraw a pending item
  Cancel { id: String },
  /// Drop a failed item
  Dismiss { id: String },
  /// Put a failed item back in line
  Retry { id: String },
  /// Replay now
  Replay,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let mut session = OfflineSession::open(config, args.db.as_deref())?;

  match args.command {
    Command::Fetch { url, navigate } => {
      session
        .router()
        .start()
        .map_err(|e| eyre!("Failed to prepare cache: {}", e))?;
      let url = resolve_url(&session, &url)?;
      let request = if navigate {
        HttpRequest::navigate(url)
      } else {
        HttpRequest::get(url)
      };

      let routed = session.router().fetch(&request).await;
      eprintln!("{} ({:?})", routed.response.status, routed.source);
      println!("{}", routed.response.text());
    }

    Command::Install { generation, wait } => {
      let generation = generation.unwrap_or_else(|| session.config().cache.generation.clone());
      let urls = session.precache_urls()?;
      // A connected client holds the serving generation in place
      let _holder = wait.then(|| session.router().connect_client());
      session.router().install(&generation, &urls).await?;
      println!("{} {}", generation, lifecycle_label(&session));
    }

    Command::Activate { generation } => {
      let changed = session
        .router()
        .cache()
        .activate(&generation)
        .map_err(|e| eyre!("Failed to activate {}: {}", generation, e))?;
      println!(
        "{} {}",
        generation,
        if changed { "activated" } else { "already active" }
      );
    }

    Command::Generations => {
      let generations = session
        .router()
        .cache()
        .generations()
        .map_err(|e| eyre!("Failed to list generations: {}", e))?;
      for info in generations {
        println!("{}\t{}\t{}", info.generation, info.state.as_str(), info.entries);
      }
    }

    Command::Queue { command } => run_queue_command(&session, command).await?,

    Command::Create { family, payload } => {
      let payload = parse_payload(payload.as_deref())?;
      let (id, item_id) = session.create_document(family, payload).await?;
      println!("{}\t{}", id, item_id);
    }

    Command::NextId { family, partition } => {
      let partition = match partition {
        Some(p) => PartitionKey::parse(family, &p)
          .ok_or_else(|| eyre!("'{}' is not a {} partition key", p, family))?,
        None => PartitionKey::current(family),
      };
      let id = session.allocator().next_id(family, partition).await?;
      println!("{}", id);
    }

    Command::Run => {
      session.start().await?;
      let mut failures = session.subscribe_failures();
      loop {
        tokio::select! {
          failure = failures.recv() => match failure {
            Ok(f) => eprintln!(
              "Replay failed: {} {} ({} attempts): {}. Dismiss or retry with `fleetdesk queue`.",
              f.operation.as_str(), f.target, f.attempts, f.error
            ),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
          },
          signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
            break;
          }
        }
      }
      session.shutdown().await;
    }
  }

  Ok(())
}

async fn run_queue_command(session: &OfflineSession, command: QueueCommand) -> Result<()> {
  let queue = session.queue();
  match command {
    QueueCommand::Submit {
      operation,
      target,
      payload,
    } => {
      let payload = parse_payload(payload.as_deref())?;
      println!("{}", queue.submit(operation, &target, payload)?);
    }
    QueueCommand::List => {
      for item in queue.list()? {
        print_item(&item);
      }
    }
    QueueCommand::Cancel { id } => print_outcome("cancelled", queue.cancel(&id)?, "not pending"),
    QueueCommand::Dismiss { id } => print_outcome("dismissed", queue.dismiss(&id)?, "not failed"),
    QueueCommand::Retry { id } => print_outcome("requeued", queue.retry(&id)?, "not failed"),
    QueueCommand::Replay => {
      let report = session.replay_now().await;
      println!("{} applied, {:?}", report.applied, report.outcome);
    }
  }
  Ok(())
}

fn print_item(item: &QueueItem) {
  println!(
    "{}\t{}\t{}\t{}\t{}\t{}",
    item.id,
    item.status.as_str(),
    item.operation.as_str(),
    item.target,
    item.attempts,
    item.last_error.as_deref().unwrap_or("-")
  );
}

fn print_outcome(done: &str, changed: bool, skipped: &str) {
  println!("{}", if changed { done } else { skipped });
}

fn parse_payload(raw: Option<&str>) -> Result<Value> {
  match raw {
    Some(s) => serde_json::from_str(s).map_err(|e| eyre!("Invalid JSON payload: {}", e)),
    None => Ok(Value::Null),
  }
}

fn resolve_url(session: &OfflineSession, raw: &str) -> Result<Url> {
  match Url::parse(raw) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => session
      .router()
      .cache()
      .policy()
      .resolve(raw)
      .ok_or_else(|| eyre!("Invalid path '{}'", raw)),
    Err(e) => Err(eyre!("Invalid URL '{}': {}", raw, e)),
  }
}

fn lifecycle_label(session: &OfflineSession) -> String {
  match session.router().state() {
    router::LifecycleState::Active(g) => format!("active ({})", g),
    router::LifecycleState::Installed(_) => "installed, waiting for clients".to_string(),
    router::LifecycleState::Installing(_) => "installing".to_string(),
    router::LifecycleState::Uninstalled => "not installed".to_string(),
  }
}
