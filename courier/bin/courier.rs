//! Command-line front end for the courier delivery service
//!
//! - `serve` runs the service until SIGINT/SIGTERM
//! - `send` delivers one message, plain or templated, and waits for the outcome
//! - `failed list` / `failed replay` inspect and requeue stored failures
//!
//! Results are printed as JSON on stdout; logs go to stderr.

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{collections::HashSet, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use courier::Courier;
use courier_common::{Message, logging};
use courier_delivery::{JobEvent, JobId, Priority, SendOptions, SendOutcome};
use serde_json::json;
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Fault-tolerant outbound mail delivery", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to `COURIER_CONFIG`, then the standard locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the delivery service until interrupted
    Serve,
    /// Send a single message
    Send(SendArgs),
    /// Inspect or replay stored failures
    Failed {
        #[command(subcommand)]
        action: FailedAction,
    },
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Recipient (repeat for several)
    #[arg(long, required = true)]
    to: Vec<String>,

    #[arg(long, conflicts_with = "template")]
    cc: Vec<String>,

    #[arg(long)]
    from: Option<String>,

    #[arg(long)]
    subject: String,

    #[arg(long, conflicts_with = "template")]
    html: Option<String>,

    #[arg(long, conflicts_with = "template")]
    text: Option<String>,

    /// Render this template instead of passing a body; one message per recipient
    #[arg(long)]
    template: Option<String>,

    /// Template data as a JSON object
    #[arg(long, default_value = "{}")]
    data: String,

    #[arg(long, value_enum, default_value = "normal")]
    priority: PriorityArg,

    /// Deliver right away instead of through the queue
    #[arg(long)]
    now: bool,

    /// Seconds to wait for queued deliveries before shutting down
    #[arg(long, default_value = "60")]
    wait: u64,
}

#[derive(Subcommand, Debug)]
enum FailedAction {
    /// List stored failures
    List {
        /// Maximum number of records to show
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Move stored failures back onto the queue and deliver them
    Replay {
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Seconds to wait for the replayed deliveries
        #[arg(long, default_value = "60")]
        wait: u64,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum PriorityArg {
    High,
    Normal,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(priority: PriorityArg) -> Self {
        match priority {
            PriorityArg::High => Self::High,
            PriorityArg::Normal => Self::Normal,
            PriorityArg::Low => Self::Low,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let courier = Courier::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => courier.run().await,
        Commands::Send(args) => {
            logging::init();
            cmd_send(courier, args).await
        }
        Commands::Failed { action } => {
            logging::init();
            match action {
                FailedAction::List { limit } => cmd_failed_list(courier, limit).await,
                FailedAction::Replay { limit, wait } => {
                    cmd_failed_replay(courier, limit, wait).await
                }
            }
        }
    }
}

fn print(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_send(courier: Courier, args: SendArgs) -> anyhow::Result<()> {
    let service = courier.build()?;
    service.start();
    let mut events = service.subscribe();

    let mut options = SendOptions::default().priority(args.priority.into());
    if args.now {
        options = options.skip_queue();
    }

    let mut outcomes = Vec::new();
    match &args.template {
        Some(template) => {
            let data: serde_json::Value = serde_json::from_str(&args.data)?;
            for recipient in &args.to {
                let outcome = service
                    .send_templated(recipient, template, &args.subject, data.clone(), options)
                    .await
                    .map_err(|e| e.to_string());
                outcomes.push(outcome);
            }
        }
        None => {
            let mut message = Message::new().subject(&args.subject);
            message.to.clone_from(&args.to);
            message.cc.clone_from(&args.cc);
            message.from.clone_from(&args.from);
            message.html.clone_from(&args.html);
            message.text.clone_from(&args.text);

            outcomes.push(service.send(message, options).await.map_err(|e| e.to_string()));
        }
    }

    let pending: HashSet<JobId> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            Ok(SendOutcome::Queued { job_id }) => Some(*job_id),
            _ => None,
        })
        .collect();
    let finished = wait_for(&mut events, pending, Duration::from_secs(args.wait)).await;
    let shutdown = service.shutdown().await;

    let outcomes: Vec<_> = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            Ok(outcome) => json!({ "ok": outcome }),
            Err(error) => json!({ "error": error }),
        })
        .collect();

    print(&json!({
        "outcomes": outcomes,
        "events": finished,
        "shutdown": shutdown,
    }))
}

async fn cmd_failed_list(courier: Courier, limit: Option<usize>) -> anyhow::Result<()> {
    let spool = courier.spool.into_spool()?;
    let records = match limit {
        Some(limit) => spool.list_limited(limit).await?,
        None => spool.list().await?,
    };

    print(&serde_json::to_value(records)?)
}

async fn cmd_failed_replay(courier: Courier, limit: usize, wait: u64) -> anyhow::Result<()> {
    let service = courier.build()?;
    service.start();
    let mut events = service.subscribe();

    let report = service.retry_failed(limit).await?;
    let finished = wait_for_count(&mut events, report.retried, Duration::from_secs(wait)).await;
    let shutdown = service.shutdown().await;

    print(&json!({
        "replay": report,
        "events": finished,
        "shutdown": shutdown,
    }))
}

/// Collect terminal events for `pending` until all have finished or `timeout` elapses
async fn wait_for(
    events: &mut broadcast::Receiver<JobEvent>,
    mut pending: HashSet<JobId>,
    timeout: Duration,
) -> Vec<JobEvent> {
    let mut finished = Vec::new();

    let _ = tokio::time::timeout(timeout, async {
        while !pending.is_empty() {
            match events.recv().await {
                Ok(event) if event.is_terminal() && pending.remove(&event.job_id()) => {
                    finished.push(event);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;

    finished
}

/// Collect terminal events until `expected` jobs have finished or `timeout` elapses
async fn wait_for_count(
    events: &mut broadcast::Receiver<JobEvent>,
    expected: usize,
    timeout: Duration,
) -> Vec<JobEvent> {
    let mut finished = Vec::new();

    let _ = tokio::time::timeout(timeout, async {
        while finished.len() < expected {
            match events.recv().await {
                Ok(event) if event.is_terminal() => finished.push(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;

    finished
}
