//! jupyter-relay CLI entry point.
//!
//! Runs the relay (the default), talks to a running relay's admin API, or
//! hosts notebook rooms for other editors to join.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use jupyter_relay::config::{
    ProviderKind, RelayConfig, RoomRuntime, DEFAULT_PORT, DEFAULT_ROOM_ID, DEFAULT_ROOM_URL,
    DEFAULT_RUNTIME_URL,
};
use jupyter_relay::http_server::start_http_server;
use jupyter_relay::relay::Relay;
use jupyter_relay::room_server::{RoomServer, RoomServerConfig};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "jupyter-relay")]
#[command(about = "Relay notebook tools to a Jupyter kernel and a shared notebook")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    start: StartArgs,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay (default if no command specified)
    Start(StartArgs),

    /// Point a running relay at another runtime and notebook
    Connect {
        #[command(flatten)]
        admin: AdminArgs,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Stop a running relay's kernel and notebook connection
    Stop {
        #[command(flatten)]
        admin: AdminArgs,
    },

    /// Show a running relay's health
    Health {
        #[command(flatten)]
        admin: AdminArgs,
    },

    /// Host notebook rooms over TCP
    ServeRoom {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:4041")]
        addr: SocketAddr,

        /// Token peers must present
        #[arg(long, env = "ROOM_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Directory for room documents (default: ~/.cache/jupyter-relay/room-docs)
        #[arg(long)]
        docs_dir: Option<PathBuf>,

        /// Keep rooms in memory only
        #[arg(long, conflicts_with = "docs_dir")]
        in_memory: bool,
    },
}

/// Which runtime and notebook to use.
#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Where the notebook document lives
    #[arg(long, env = "PROVIDER", value_enum, default_value_t = ProviderKind::Room)]
    provider: ProviderKind,

    /// Jupyter Server hosting the kernel
    #[arg(long, env = "RUNTIME_URL", default_value = DEFAULT_RUNTIME_URL)]
    runtime_url: String,

    /// Attach to this existing kernel
    #[arg(long, env = "RUNTIME_ID")]
    runtime_id: Option<String>,

    #[arg(long, env = "RUNTIME_TOKEN", hide_env_values = true)]
    runtime_token: Option<String>,

    /// Room host for the notebook document
    #[arg(long, env = "ROOM_URL", default_value = DEFAULT_ROOM_URL)]
    room_url: String,

    /// Notebook path, which names the room
    #[arg(long, env = "ROOM_ID", default_value = DEFAULT_ROOM_ID)]
    room_id: String,

    #[arg(long, env = "ROOM_TOKEN", hide_env_values = true)]
    room_token: Option<String>,
}

impl From<TargetArgs> for RoomRuntime {
    fn from(args: TargetArgs) -> Self {
        RoomRuntime {
            provider: args.provider,
            runtime_url: args.runtime_url,
            runtime_id: args.runtime_id,
            runtime_token: args.runtime_token,
            room_url: args.room_url,
            room_id: args.room_id,
            room_token: args.room_token,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct StartArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Start a new kernel even when a runtime ID is configured
    #[arg(long, env = "START_NEW_RUNTIME")]
    start_new_runtime: bool,

    /// Port for the admin API
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory for embedded room documents (default: ~/.cache/jupyter-relay/room-docs)
    #[arg(long)]
    docs_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct AdminArgs {
    /// Admin API of the running relay
    #[arg(long, default_value_t = format!("http://127.0.0.1:{}", DEFAULT_PORT))]
    relay_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        None => run_relay(cli.start).await,
        Some(Commands::Start(args)) => run_relay(args).await,
        Some(Commands::Connect { admin, target }) => {
            let target = RoomRuntime::from(target);
            let client = reqwest::Client::new();
            let request = client
                .put(format!("{}/api/connect", admin.relay_url))
                .json(&target);
            print_response(request).await
        }
        Some(Commands::Stop { admin }) => {
            let client = reqwest::Client::new();
            print_response(client.delete(format!("{}/api/stop", admin.relay_url))).await
        }
        Some(Commands::Health { admin }) => {
            let client = reqwest::Client::new();
            print_response(client.get(format!("{}/api/healthz", admin.relay_url))).await
        }
        Some(Commands::ServeRoom {
            addr,
            token,
            docs_dir,
            in_memory,
        }) => {
            let docs_dir = if in_memory {
                None
            } else {
                Some(docs_dir.unwrap_or_else(jupyter_relay::default_docs_dir))
            };
            serve_room(addr, token, docs_dir).await
        }
    }
}

async fn run_relay(args: StartArgs) -> anyhow::Result<()> {
    info!("jupyter-relay starting...");

    let mut target = RoomRuntime::from(args.target);
    if args.start_new_runtime {
        target.runtime_id = None;
    }
    let config = RelayConfig {
        runtime: target.runtime_endpoint(),
        document: target.document_endpoint(),
        port: args.port,
        docs_dir: args
            .docs_dir
            .unwrap_or_else(jupyter_relay::default_docs_dir),
        ..Default::default()
    };

    info!("Configuration:");
    info!("  Runtime: {}", config.runtime.base_url);
    if let Some(id) = &config.runtime.runtime_id {
        info!("  Kernel: {}", id);
    }
    info!(
        "  Notebook: {} ({} at {})",
        config.document.path, config.document.provider, config.document.base_url
    );
    info!("  Admin port: {}", config.port);

    let relay = Arc::new(Relay::from_config(&config)?);
    if let Err(e) = relay.start().await {
        warn!(
            "Initial connection failed, retrying on first tool call: {}",
            e
        );
    }

    let (_, server) = start_http_server(relay.clone(), SocketAddr::from(([127, 0, 0, 1], config.port)))
        .await
        .with_context(|| format!("binding admin port {}", config.port))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        result = server => {
            if let Err(e) = result {
                warn!("Admin server stopped: {}", e);
            }
        }
    }

    relay.stop().await;
    Ok(())
}

async fn serve_room(
    addr: SocketAddr,
    token: Option<String>,
    docs_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(dir) = &docs_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating room directory {:?}", dir))?;
        info!("Persisting rooms to {:?}", dir);
    }

    let server = RoomServer::new(RoomServerConfig { token, docs_dir });
    let (_, task) = server
        .bind(addr)
        .await
        .with_context(|| format!("binding room host to {}", addr))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        result = task => {
            if let Err(e) = result {
                warn!("Room host stopped: {}", e);
            }
        }
    }
    Ok(())
}

/// Send an admin request and print the JSON reply.
async fn print_response(request: reqwest::RequestBuilder) -> anyhow::Result<()> {
    let response = request
        .send()
        .await
        .context("relay is not reachable")?;
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .context("relay sent a non-JSON reply")?;

    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("relay answered {}", status);
    }
    Ok(())
}
