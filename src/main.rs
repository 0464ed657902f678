use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use eventer::config::{NodeAddr, NodeConfig};
use eventer::network::client;
use eventer::protocol::{Event, EventArgs, Message, Payload};
use eventer::shutdown::install_shutdown_handler;
use eventer::Eventer;

#[derive(Parser, Debug)]
#[command(name = "eventer")]
#[command(version)]
#[command(about = "Peer-to-peer event bus with master election")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a node
    Server(ServerArgs),

    /// Send one event to a node
    Emit(EmitArgs),

    /// Ask a node whether it is master
    Status(StatusArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Host peers use to reach this node
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "9090")]
    port: u16,

    /// Peer addresses, comma-separated ("host:port,host:port")
    #[arg(long, default_value = "")]
    peers: String,

    /// Directory holding the event log
    #[arg(long, default_value = "./eventer-data")]
    data_dir: PathBuf,

    /// Maximum number of events kept in the log
    #[arg(long, default_value = "1000")]
    max_log_size: usize,

    /// Lower bound of the election delay
    #[arg(long, default_value = "0")]
    delay_min_ms: u64,

    /// Upper bound (exclusive) of the election delay
    #[arg(long, default_value = "2000")]
    delay_max_ms: u64,

    /// Skip unreachable peers during election rounds instead of failing them
    #[arg(long)]
    tolerate_unreachable: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct EmitArgs {
    /// Node address
    #[arg(long, short = 'a', default_value = "127.0.0.1:9090")]
    addr: String,

    /// Event name
    #[arg(long, short = 'n')]
    name: String,

    /// Event argument as key=value; values that parse as JSON keep their type
    #[arg(long = "arg", value_name = "KEY=VALUE")]
    args: Vec<String>,

    /// Sender id recorded as the event origin
    #[arg(long, default_value = "eventer-cli")]
    origin: String,

    /// Timeout in milliseconds
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,
}

#[derive(Parser, Debug)]
struct StatusArgs {
    /// Node address
    #[arg(long, short = 'a', default_value = "127.0.0.1:9090")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Timeout in milliseconds
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct StatusOutput {
    node_id: String,
    is_master: bool,
    delay_secs: f64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_event_args(raw: &[String]) -> Result<EventArgs, String> {
    raw.iter()
        .map(|item| {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| format!("expected key=value, got {item:?}"))?;
            let value = serde_json::from_str::<Value>(value)
                .unwrap_or_else(|_| Value::String(value.to_string()));
            Ok((key.to_string(), value))
        })
        .collect()
}

// =============================================================================
// Commands
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = NodeConfig::new(NodeAddr::new(args.host, args.port))
        .with_data_dir(args.data_dir)
        .with_election_delay(args.delay_min_ms, args.delay_max_ms);
    config.peers = NodeConfig::parse_peers(&args.peers)?;
    config.max_log_size = args.max_log_size;
    config.tolerate_unreachable_peers = args.tolerate_unreachable;

    let shutdown = install_shutdown_handler()?;
    let node = Arc::new(Eventer::new(config)?);
    node.start().await?;

    shutdown.cancelled().await;
    node.shutdown();
    tracing::info!(node = %node.id(), "Node stopped");
    Ok(())
}

async fn run_emit(args: EmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let addr: NodeAddr = args.addr.parse()?;
    let event = Event::new(args.name, parse_event_args(&args.args)?);
    let frame = Message::new(args.origin, Payload::Event(event)).encode()?;
    client::deliver(&addr, &frame, Duration::from_millis(args.timeout_ms)).await?;
    println!("Event sent to {addr}");
    Ok(())
}

async fn run_status(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let addr: NodeAddr = args.addr.parse()?;
    let frame = Message::new("eventer-cli", Payload::NodeInfo).encode()?;
    let reply = client::request_message(&addr, &frame, Duration::from_millis(args.timeout_ms)).await?;

    let kind = reply.kind();
    let Payload::NodeInfoResponse(info) = reply.payload else {
        return Err(format!("unexpected {kind} reply").into());
    };

    let output = StatusOutput {
        node_id: reply.node_id,
        is_master: info.is_master,
        delay_secs: info.delay,
    };
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => {
            println!("{:<24} {:<8} {:>10}", "NODE", "MASTER", "DELAY(s)");
            println!(
                "{:<24} {:<8} {:>10.3}",
                output.node_id, output.is_master, output.delay_secs
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Server(server) => run_server(server).await,
        Commands::Emit(emit) => run_emit(emit).await,
        Commands::Status(status) => run_status(status).await,
    }
}
