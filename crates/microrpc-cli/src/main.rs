use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use argh::FromArgs;
use microrpc_cli::{routes, serve};
use microrpc_client::{CallOptions, Client, ClientConfig};
use microrpc_common::Context;
use microrpc_resolver::{ResolverConfig, Route};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// microrpc - call services and manage route tables
#[derive(FromArgs, Debug)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Commands {
    Call(CallArgs),
    Routes(RoutesArgs),
    Serve(ServeArgs),
}

/// Call a method on a service and print the JSON response
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "call")]
struct CallArgs {
    /// service name
    #[argh(positional)]
    service: String,

    /// method name
    #[argh(positional)]
    method: String,

    /// JSON request body
    #[argh(option, short = 'a', default = "String::from(\"{}\")")]
    args: String,

    /// client config file (JSON)
    #[argh(option)]
    config: Option<PathBuf>,

    /// comma separated service=address routes, replaces the configured resolver
    #[argh(option, short = 'e')]
    endpoints: Option<String>,

    /// request timeout in milliseconds
    #[argh(option)]
    timeout_ms: Option<u64>,
}

/// Inspect or edit a routes file
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "routes")]
struct RoutesArgs {
    /// routes file
    #[argh(option, short = 'f')]
    file: PathBuf,

    #[argh(subcommand)]
    action: RoutesAction,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum RoutesAction {
    List(ListArgs),
    Add(AddArgs),
    Rm(RmArgs),
}

/// List every route
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "list")]
struct ListArgs {}

/// Add a route
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "add")]
struct AddArgs {
    /// service name
    #[argh(positional)]
    service: String,

    /// host:port
    #[argh(positional)]
    address: String,
}

/// Remove a route
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "rm")]
struct RmArgs {
    /// service name
    #[argh(positional)]
    service: String,

    /// host:port
    #[argh(positional)]
    address: String,
}

/// Run an echo service
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "serve")]
struct ServeArgs {
    /// service name to register under
    #[argh(option, short = 'n')]
    name: String,

    /// bind address
    #[argh(option, short = 'b', default = "String::from(\"127.0.0.1:0\")")]
    bind: String,

    /// routes file to register in
    #[argh(option)]
    routes_file: Option<PathBuf>,

    /// address to register, defaults to the bound address
    #[argh(option)]
    advertise: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // `call` output is meant to be piped, so it stays quiet.
    if !matches!(cli.command, Commands::Call(_)) {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }

    match cli.command {
        Commands::Call(args) => run_call(args).await,
        Commands::Routes(args) => run_routes(args).await,
        Commands::Serve(args) => run_serve(args).await,
    }
}

async fn run_call(args: CallArgs) -> Result<()> {
    let body: Value = serde_json::from_str(&args.args).context("Invalid JSON arguments")?;

    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    }
    .apply_env()?;
    if let Some(endpoints) = args.endpoints {
        config.resolver = ResolverConfig::Static { endpoints };
    }

    let client = Client::from_config(config).await?;

    let mut opts = CallOptions::default();
    if let Some(ms) = args.timeout_ms {
        opts = opts.with_request_timeout(Duration::from_millis(ms));
    }

    let result: Result<Value> = client
        .call(&Context::background(), &args.service, &args.method, &body, opts)
        .await
        .map_err(Into::into);
    client.close().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn run_routes(args: RoutesArgs) -> Result<()> {
    match args.action {
        RoutesAction::List(_) => {
            for route in routes::list(&args.file).await? {
                println!("{}\t{}", route.service, route.address);
            }
        }
        RoutesAction::Add(add) => {
            let route = Route::new(add.service, add.address);
            if !routes::add(&args.file, route.clone()).await? {
                println!("{} already present", route);
            }
        }
        RoutesAction::Rm(rm) => {
            let route = Route::new(rm.service, rm.address);
            if !routes::remove(&args.file, &route).await? {
                anyhow::bail!("no route {}", route);
            }
        }
    }
    Ok(())
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
        }
        signal.cancel();
    });

    let opts = serve::ServeOptions {
        service: args.name,
        bind: args.bind,
        routes_file: args.routes_file,
        advertise: args.advertise,
    };
    serve::run(opts, shutdown, |addr| {
        tracing::info!("Listening on {}", addr);
    })
    .await
}
