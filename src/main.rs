// FazAI - local command daemon
// Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use fazai::client::{self, Endpoint, OutgoingRequest};
use fazai::config::{load_config, Config};
use fazai::daemon::{self, DaemonLifecycle};
use fazai::protocol::{Event, EventType};

#[derive(Parser)]
#[command(name = "fazai")]
#[command(version, about = "Local command daemon with hierarchical model escalation", long_about = None)]
struct Cli {
    /// Config file (defaults: $FAZAI_CONFIG, /etc/fazai/fazai.toml, ~/.fazai/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Daemon,

    /// Stop a running daemon (SIGTERM, then SIGKILL after 5s)
    Stop,

    /// Send one request and print its events
    Send {
        /// Action or pseudo-action: ask, shell, observe, plan, research, commitkb, status, ...
        action: String,

        /// Request input (words are joined with spaces)
        input: Vec<String>,

        /// Connect over TCP instead of the Unix socket
        #[arg(long)]
        tcp: Option<String>,

        #[arg(long)]
        session: Option<String>,

        /// Action id to stop (cancel)
        #[arg(long)]
        target: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// Extra params as a JSON object
        #[arg(long)]
        params: Option<String>,

        /// Print raw event lines instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Daemon => {
            fazai::logging::init(&config.logging)?;
            daemon::run_until_signal(Arc::new(config)).await
        }
        Commands::Stop => {
            fazai::logging::init_with("info", None)?;
            DaemonLifecycle::new(config.server.pid_file.as_deref())?.stop_daemon()
        }
        Commands::Send {
            action,
            input,
            tcp,
            session,
            target,
            model,
            params,
            json,
        } => {
            let mut request = OutgoingRequest::new(action, input.join(" "));
            request.session_id = session;
            request.target = target;
            request.model_hint = model;
            if let Some(raw) = params {
                request.params = parse_params(&raw)?;
            }
            let endpoint = endpoint_for(&config, tcp);
            send(&endpoint, &request, json).await
        }
    }
}

fn endpoint_for(config: &Config, tcp: Option<String>) -> Endpoint {
    match tcp {
        Some(addr) => Endpoint::Tcp(addr),
        None => Endpoint::Unix(config.server.unix_socket.clone()),
    }
}

fn parse_params(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("--params is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("--params must be a JSON object"),
    }
}

async fn send(endpoint: &Endpoint, request: &OutgoingRequest, raw: bool) -> Result<()> {
    let terminal = client::send(endpoint, request, |event| print_event(event, raw)).await?;
    if terminal.event_type == EventType::Error {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &Event, raw: bool) {
    if raw {
        println!("{}", event.to_line());
        return;
    }
    match event.event_type {
        EventType::Partial => {
            if let Some(text) = &event.result {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
        }
        EventType::Result => {
            // Shell output was already streamed as partials
            if event.exit_code.is_none() {
                if let Some(text) = &event.result {
                    println!("{}", text);
                }
            }
            if let Some(steps) = &event.steps {
                for (i, step) in steps.iter().enumerate() {
                    println!("{}. {}", i + 1, step);
                }
            }
            if let Some(stderr) = &event.stderr {
                eprint!("{}", stderr);
            }
            if let Some(tier) = &event.tier_used {
                eprintln!("[tier {}]", tier);
            }
        }
        EventType::Error => {
            eprintln!(
                "error ({}): {}",
                event.kind.as_deref().unwrap_or("Unknown"),
                event.error.as_deref().unwrap_or("")
            );
        }
        EventType::Stop => eprintln!("[stopped]"),
        EventType::Done => eprintln!("[done]"),
    }
}
