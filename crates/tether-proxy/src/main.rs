use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tether_bridge::host::spawn_watchdog;
use tether_bridge::{
    BridgeState, FramedServer, HostHealth, HostRunner, HostThread, HttpServer, JobQueue,
    MemoryHost, TetherConfig, TimeoutPolicy, Transport, connect_bridge,
};
use tether_core::{Access, LockManager, SessionManager};
use tracing_subscriber::{EnvFilter, fmt};

mod catalog;
mod server;

use catalog::build_registry;
use server::ToolServer;

#[derive(Parser)]
#[command(
    name = "tether",
    version,
    about = "Tether: schema-checked tool calls bridged to a single-threaded host"
)]
struct Cli {
    /// Path to tether.toml (default: ./tether.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Speak the line protocol on stdio, forwarding host tools over the bridge
    Serve,
    /// Run the in-memory demo host behind a bridge server
    Host {
        /// Listen address (default: bridge host and port from config)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the tool catalog as JSON
    Tools,
}

fn init_logging(format: LogFormat) {
    // Logs go to stderr; stdout carries the protocol.
    let filter = EnvFilter::try_from_env("TETHER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let config = TetherConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => run_serve(config).await,
        Commands::Host { bind } => run_host(config, bind).await,
        Commands::Tools => print_tools(&config),
    }
}

async fn run_serve(config: TetherConfig) -> Result<()> {
    let sessions = Arc::new(SessionManager::new());
    let registry = build_registry(&config, Arc::clone(&sessions), Arc::new(LockManager::new()))?;
    let bridge = connect_bridge(&config.bridge)?;

    tracing::info!(
        transport = ?config.bridge.transport,
        addr = %config.bridge.addr(),
        "Starting tether"
    );

    let server = Arc::new(ToolServer::new(registry, sessions, bridge));
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    server.run(stdin, tokio::io::stdout()).await
}

async fn run_host(config: TetherConfig, bind: Option<String>) -> Result<()> {
    // The catalog decides which host commands get the shorter query wait.
    let registry = build_registry(
        &config,
        Arc::new(SessionManager::new()),
        Arc::new(LockManager::new()),
    )?;
    let queries: Vec<String> = registry
        .forwarded_commands()
        .filter(|(_, access)| *access == Access::Query)
        .map(|(command, _)| command.to_string())
        .collect();
    let policy = TimeoutPolicy::new(config.host.query_timeout(), config.host.mutation_timeout())
        .with_queries(queries);

    let queue = JobQueue::new(config.host.results_capacity);
    let health = HostHealth::new(config.host.exec_timeout());
    let runner = HostRunner::new(MemoryHost::new(), queue.clone(), health.clone());
    let host = HostThread::spawn(runner, config.host.tick(), config.host.max_per_tick)?;
    let watchdog = spawn_watchdog(
        health.clone(),
        (config.host.exec_timeout() / 2).max(Duration::from_millis(100)),
    );

    let state = BridgeState::new(queue, health, policy).with_token(config.bridge.token.as_deref());
    let addr = bind.unwrap_or_else(|| config.bridge.addr());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C; running until killed");
            std::future::pending::<()>().await;
        }
    };

    match config.bridge.transport {
        Transport::Framed => {
            FramedServer::bind(
                &addr,
                state,
                config.bridge.max_frame_bytes,
                config.bridge.handshake_timeout(),
            )
            .await?
            .serve_with_shutdown(shutdown)
            .await?
        }
        Transport::Http => {
            HttpServer::bind(&addr, state)
                .await?
                .serve_with_shutdown(shutdown)
                .await?
        }
    }

    watchdog.abort();
    host.shutdown();
    Ok(())
}

fn print_tools(config: &TetherConfig) -> Result<()> {
    let registry = build_registry(
        config,
        Arc::new(SessionManager::new()),
        Arc::new(LockManager::new()),
    )?;
    println!("{}", serde_json::to_string_pretty(&registry.list())?);
    Ok(())
}
