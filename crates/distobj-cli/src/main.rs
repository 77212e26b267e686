//! # Distobj CLI Entry Point
//!
//! Main binary for the distobj distributed-objects system.
//!
//! ## Usage
//!
//! ```bash
//! # Export the demo calculator
//! distobj serve -b 127.0.0.1:7400
//!
//! # Invoke a selector on the root object (outputs raw JSON)
//! distobj call add:to: -a 40 -a 2 -s 127.0.0.1:7400
//!
//! # Invoke a selector on the object a call returned
//! distobj call counter --then increment
//!
//! # Print a method type string
//! distobj describe add:to:
//! ```
//!
//! `call` and `describe` fall back to the `DISTOBJ_ADDR` environment variable
//! when `-s` is not given.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use distobj_cli::demo::Calculator;
use distobj_cli::values::{parse_argument, reply_to_json};
use distobj_connection::{connect, Connection, ConnectionConfig, ConnectionRegistry, Payload, Server};

/// Address used when neither `-s` nor `DISTOBJ_ADDR` is set.
const DEFAULT_ADDR: &str = "127.0.0.1:7400";

/// How long a client command waits for its shutdown notice to be written.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(FromArgs)]
/// distobj - call methods on objects in another process
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
///
/// - **Serve**: Export the demo calculator over TCP
/// - **Call**: Invoke one selector (unix-friendly JSON output)
/// - **Describe**: Ask for a selector's method type string
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Describe(DescribeArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// export the demo calculator as the root object
struct ServeArgs {
    /// address to listen on
    #[argh(option, short = 'b', default = "DEFAULT_ADDR.into()")]
    bind: String,

    /// how long a request waits for its reply, in milliseconds
    #[argh(option, long = "timeout-ms", default = "30000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// invoke a selector on a server's root object
struct CallArgs {
    /// selector to invoke, e.g. add:to:
    #[argh(positional)]
    selector: String,

    /// argument value; repeat for several (integers, floats, true/false, or strings)
    #[argh(option, short = 'a', long = "arg")]
    args: Vec<String>,

    /// selector to invoke on the object the first call returns
    #[argh(option, long = "then")]
    then: Option<String>,

    /// server address (defaults to $DISTOBJ_ADDR, then 127.0.0.1:7400)
    #[argh(option, short = 's')]
    server: Option<String>,

    /// how long to wait for each reply, in milliseconds
    #[argh(option, long = "timeout-ms", default = "30000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "describe")]
/// print the method type string the root object publishes for a selector
struct DescribeArgs {
    /// selector to look up
    #[argh(positional)]
    selector: String,

    /// server address (defaults to $DISTOBJ_ADDR, then 127.0.0.1:7400)
    #[argh(option, short = 's')]
    server: Option<String>,
}

fn server_address(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("DISTOBJ_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

fn config_with_timeout(timeout_ms: u64) -> ConnectionConfig {
    ConnectionConfig::default().with_reply_timeout(Duration::from_millis(timeout_ms))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Initialize tracing only for serve
    // - call/describe: keep stdout clean for unix tool usage (piping to jq, etc.)
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Describe(args) => run_describe(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = config_with_timeout(args.timeout_ms);
    let registry = ConnectionRegistry::new();
    let server = Server::bind(&args.bind, registry, config, Arc::new(Calculator::new()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", args.bind, e))?;

    tracing::info!("Serving demo calculator on {}", server.local_addr()?);
    server.run().await?;
    Ok(())
}

async fn open(server: Option<String>, config: ConnectionConfig) -> Result<Connection> {
    let addr = server_address(server);
    let registry = ConnectionRegistry::new();
    connect(&addr, &registry, config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", addr, e))
}

/// Shuts `connection` down and gives the writer a moment to flush the notice.
async fn close(connection: &Connection) {
    connection.shutdown();
    if tokio::time::timeout(CLOSE_GRACE, connection.closed()).await.is_err() {
        tracing::debug!(connection = connection.id(), "shutdown notice not flushed in time");
    }
}

async fn run_call(args: CallArgs) -> Result<()> {
    let connection = open(args.server.clone(), config_with_timeout(args.timeout_ms)).await?;
    let result = call(&connection, &args).await;
    close(&connection).await;
    result
}

async fn call(connection: &Connection, args: &CallArgs) -> Result<()> {
    let root = connection.root_proxy().await?;

    let mut arguments = Payload::new();
    for text in &args.args {
        let value = parse_argument(text, &mut arguments);
        arguments.push(value);
    }
    let reply = root.invoke(&args.selector, arguments).await?;

    let output = match &args.then {
        Some(next) => {
            let proxy = reply
                .root(0)
                .and_then(|value| reply.proxy(value))
                .ok_or_else(|| anyhow::anyhow!("{} did not return an object", args.selector))?;
            reply_to_json(&proxy.invoke(next, Payload::new()).await?)
        }
        None => reply_to_json(&reply),
    };

    // Output raw JSON to stdout
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

async fn run_describe(args: DescribeArgs) -> Result<()> {
    let connection = open(args.server, ConnectionConfig::default()).await?;
    let result = describe(&connection, &args.selector).await;
    close(&connection).await;
    result
}

async fn describe(connection: &Connection, selector: &str) -> Result<()> {
    let root = connection.root_proxy().await?;
    match root.method_signature(selector).await? {
        Some(signature) => println!("{}", signature),
        None => println!("unknown"),
    }
    Ok(())
}
