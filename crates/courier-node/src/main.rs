//! Courier node - runs a gateway or performs a routed call against peers.
//!
//! `serve` hosts the built-in demo services and prints the bound port;
//! `call` registers the given peers with a client, routes one call and prints
//! the reply values as JSON.

mod services;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use courier_core::{
    create_server, CallOptions, Client, ClientConfig, ClientOptions, Namespace, RouteStrategy,
    RpcMessage, ServerConfig, ServerInfo, ServerOptions, WireFormat,
};
use serde_json::Value;
use services::DemoLoader;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "courier-node")]
#[command(about = "RPC transport node: gateway and client")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Use the binary wire format (both ends must agree)
    #[arg(long, global = true)]
    binary: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a gateway hosting the built-in services
    Serve(ServeArgs),
    /// Route one call to a set of peers and print the reply
    Call(CallArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Server config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Node id reported by sysRemote.whoami
    #[arg(long, default_value = "courier-node")]
    id: String,

    /// Buffer replies and flush them on an interval
    #[arg(long)]
    buffer: bool,

    /// Seconds between catalog reloads when reloadRemotes is set
    #[arg(long, default_value = "30")]
    reload_secs: u64,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Client config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peer as ID=HOST:PORT, repeatable
    #[arg(long = "peer", value_parser = parse_peer, required = true)]
    peers: Vec<(String, String, u16)>,

    /// Server type shared by every peer
    #[arg(long, default_value = "demo")]
    server_type: String,

    /// Routing strategy (rd, rr, wrr, la, ch)
    #[arg(long)]
    router: Option<RouteStrategy>,

    /// Value handed to the router
    #[arg(long, default_value = "null")]
    route_param: String,

    /// Namespace of the service (sys or user)
    #[arg(long, default_value = "user")]
    namespace: Namespace,

    /// Service name, e.g. echoRemote
    service: String,

    /// Method name, e.g. echo
    method: String,

    /// Call arguments, each parsed as JSON (bare words become strings)
    args: Vec<String>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn parse_peer(s: &str) -> std::result::Result<(String, String, u16), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=HOST:PORT, got '{}'", s))?;
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got '{}'", addr))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("bad port '{}': {}", port, e))?;
    if id.is_empty() || host.is_empty() {
        return Err(format!("empty id or host in '{}'", s));
    }
    Ok((id.to_string(), host.to_string(), port))
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match cli.command {
        Command::Serve(args) => serve(args, cli.binary).await,
        Command::Call(args) => call(args, cli.binary).await,
    }
}

async fn serve(args: ServeArgs, binary: bool) -> Result<()> {
    let loader = DemoLoader::new(&args.id);

    let mut opts = match &args.config {
        Some(path) => ServerConfig::load(path)
            .and_then(ServerConfig::into_options)
            .with_context(|| format!("loading server config {}", path.display()))?,
        None => ServerOptions::default(),
    };
    opts.host = args.host;
    if let Some(port) = args.port {
        opts.port = port;
    }
    if opts.paths.is_empty() {
        opts.paths = services::default_paths();
    }
    opts.buffer_msg |= args.buffer;
    if binary {
        opts.wire_format = WireFormat::binary(loader.full_catalog().service_table()?);
    }
    let reload_remotes = opts.reload_remotes;

    info!("Starting courier node {}", args.id);
    let gateway = create_server(opts, &loader)?;
    let addr = gateway.start().await?;

    // Print port for parent processes to read (intentional stdout)
    println!("RPC_PORT={}", addr.port());
    info!("Gateway running on {}", addr);

    let mut reload = tokio::time::interval(Duration::from_secs(args.reload_secs.max(1)));
    reload.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = reload.tick(), if reload_remotes => {
                if let Err(e) = gateway.reload(&loader) {
                    warn!("Reload failed, keeping current services: {}", e);
                }
            }
        }
    }

    info!("Shutdown signal received, exiting");
    gateway.stop()?;
    Ok(())
}

async fn call(args: CallArgs, binary: bool) -> Result<()> {
    let mut opts = match &args.config {
        Some(path) => ClientConfig::load(path)
            .and_then(ClientConfig::into_options)
            .with_context(|| format!("loading client config {}", path.display()))?,
        None => ClientOptions::new(),
    };
    if let Some(strategy) = args.router {
        opts = opts.with_router_type(strategy);
    }
    if binary {
        let table = DemoLoader::new("").full_catalog().service_table()?;
        opts = opts.with_wire_format(WireFormat::binary(table));
    }

    let client = Client::new(opts)?;
    client.add_servers(
        args.peers
            .iter()
            .map(|(id, host, port)| ServerInfo::new(id, host, *port, &args.server_type))
            .collect(),
    );
    client.start().await?;

    let call_args: Vec<Value> = args.args.iter().map(|raw| parse_arg(raw)).collect();
    let msg = RpcMessage::new(args.namespace, &args.server_type, &args.service, &args.method)
        .with_args(call_args);
    let route_param = parse_arg(&args.route_param);

    let server_id = client.route(&route_param, &msg)?;
    info!("Routing {} to {}", msg.route(), server_id);

    let mut call_opts = CallOptions::new();
    if let Some(ms) = args.timeout_ms {
        call_opts = call_opts.with_timeout(Duration::from_millis(ms));
    }
    let result = client.rpc_invoke(server_id, msg, call_opts).await;
    client.stop(true)?;

    match result {
        Ok(values) => {
            println!("{}", serde_json::to_string(&values)?);
            Ok(())
        }
        Err(e) => bail!("call failed: {}", e),
    }
}
