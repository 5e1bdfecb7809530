//! One-shot command-line client for an Orderly broker.
//!
//! Each invocation opens a connection, runs a single command and exits.
//! `consume` keeps printing items until Ctrl-C or `--count` items arrived.

use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use orderly::logging::init_logging;
use orderly::{Client, ClientConfig, ClientError};

/// Command-line interface for Orderly.
#[derive(Debug, Parser)]
#[command(
    name = "orderly-cli",
    version,
    about = "Orderly CLI: len/push/pop/drain/consume against a running broker"
)]
pub struct Cli {
    /// Address of the broker (e.g. 127.0.0.1:8765)
    #[arg(short, long, default_value = "127.0.0.1:8765")]
    pub addr: String,

    /// Per-request timeout in milliseconds
    #[arg(short, long, default_value_t = 3000)]
    pub timeout_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the number of queued items
    Len,
    /// Append an item to the tail of the queue
    Push {
        /// Item payload (enclose in quotes for spaces)
        item: String,
    },
    /// Remove and print the head item
    Pop,
    /// Remove every item
    Drain,
    /// Print items as they are delivered
    Consume {
        /// Stop after this many items
        #[arg(short, long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("warn");

    let cli = Cli::parse();
    let config =
        ClientConfig::new(cli.addr.clone()).with_send_timeout(Duration::from_millis(cli.timeout_ms));
    let client = Client::connect(config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", cli.addr, e))?;

    let outcome = execute(&client, cli.command).await;
    client.close().await?;
    outcome
}

async fn execute(client: &Client, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Len => println!("{}", client.len().await?),
        Command::Push { item } => {
            client.push(item).await?;
            println!("ok");
        }
        Command::Pop => match client.pop().await {
            Ok(item) => println!("{item}"),
            Err(ClientError::QueueEmpty) => {
                eprintln!("queue is empty");
                std::process::exit(2);
            }
            Err(e) => return Err(e.into()),
        },
        Command::Drain => {
            client.drain().await?;
            println!("ok");
        }
        Command::Consume { count } => {
            let cancel = CancellationToken::new();
            let mut stream = client.consume(cancel.clone()).await?;
            info!(id = stream.id(), "consuming");

            let mut received = 0usize;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = client.done() => {
                        debug!("broker closed the connection");
                        break;
                    }
                    item = stream.recv() => match item {
                        Some(item) => {
                            println!("{item}");
                            received += 1;
                            if count.is_some_and(|limit| received >= limit) {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            cancel.cancel();
        }
    }
    Ok(())
}
