//! orderly – one binary that can start the broker *or* act as an
//! interactive client shell.
//
//  $ orderly start --config orderly.toml
//  $ orderly connect 127.0.0.1:8765
//  > push hello
//  ok
//  > consume
//  consuming; `stop` to end
//  [consume] hello
use orderly::config::config_path;
use orderly::logging::init_logging;
use orderly::{load_config, run, Client, ClientConfig, ClientError, Config};

use clap::{Parser, Subcommand};
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "orderly", version, about = "Orderly queue broker & shell")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the broker daemon.
    Start {
        /// Path to config TOML (env ORDERLY_CONFIG is used when omitted)
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Connect to a running broker in interactive mode.
    Connect {
        /// Broker address (host:port)
        addr: String,
        /// Per-request timeout in milliseconds
        #[arg(short, long, default_value_t = 3000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Start { config } => {
            let path = config_path(config.as_deref());
            let cfg: Config = load_config(&path)?;
            init_logging(&cfg.log_level);
            tracing::info!(config = %path, bind = %cfg.server.bind_addr, "starting broker");
            run(cfg).await?;
        }
        Command::Connect { addr, timeout_ms } => {
            init_logging("warn");
            let config =
                ClientConfig::new(addr).with_send_timeout(Duration::from_millis(timeout_ms));
            repl(config).await?;
        }
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────
// Interactive REPL shell
// ───────────────────────────────────────────────────────────
async fn repl(config: ClientConfig) -> anyhow::Result<()> {
    let mut rl: Editor<(), DefaultHistory> = DefaultEditor::new()?;
    let endpoint = config.endpoint.clone();
    let client = Client::connect(config).await?;

    println!("Connected to {endpoint}. Type `help` for commands.");

    let mut consumer: Option<(CancellationToken, JoinHandle<()>)> = None;

    loop {
        let Ok(line) = rl.readline("> ") else { break };
        let _ = rl.add_history_entry(line.as_str());

        match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            [] => {}
            ["help"] => {
                println!("len | push <item> | pop | drain | consume | stop | exit")
            }
            ["exit" | "quit"] => break,

            ["len"] => report(client.len().await),
            ["push", rest @ ..] if !rest.is_empty() => report(
                client
                    .push(rest.join(" "))
                    .await
                    .map(|()| "ok".to_string()),
            ),
            ["pop"] => match client.pop().await {
                Err(ClientError::QueueEmpty) => println!("(empty)"),
                other => report(other),
            },
            ["drain"] => report(client.drain().await.map(|()| "ok".to_string())),

            ["consume"] => {
                if consumer.is_some() {
                    println!("already consuming; `stop` first");
                    continue;
                }
                let cancel = CancellationToken::new();
                match client.consume(cancel.clone()).await {
                    Ok(mut stream) => {
                        println!("consuming; `stop` to end");
                        let printer = tokio::spawn(async move {
                            while let Some(item) = stream.recv().await {
                                println!("[consume] {item}");
                            }
                        });
                        consumer = Some((cancel, printer));
                    }
                    Err(e) => println!("error: {e}"),
                }
            }
            ["stop"] => match consumer.take() {
                Some((cancel, printer)) => {
                    cancel.cancel();
                    let _ = printer.await;
                    println!("stopped");
                }
                None => println!("no active consumer"),
            },

            _ => println!("unknown command; type `help`"),
        }

        if client.is_closed() {
            println!("connection closed by broker");
            break;
        }
    }

    if let Some((cancel, printer)) = consumer.take() {
        cancel.cancel();
        let _ = printer.await;
    }
    client.close().await?;
    Ok(())
}

fn report<T: std::fmt::Display>(result: Result<T, ClientError>) {
    match result {
        Ok(value) => println!("{value}"),
        Err(e) => println!("error: {e}"),
    }
}
