//! shellkeep - persistent shell sessions over WebSocket
//!
//! Each runspace (a project directory) can host any number of named shells.
//! A shell keeps running when its browser tab goes away; reconnecting with the
//! same name replays the scrollback and resumes the live stream.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shellkeep::{
    api::RouterConfig,
    config::{Config, ConfigError},
    runspace::Runspace,
    server,
};

/// shellkeep - persistent, reattachable shell sessions
#[derive(ClapParser, Debug)]
#[command(name = "shellkeep", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the session server (the default)
    Serve(ServeArgs),
    /// Print the effective configuration as TOML and exit
    Config {
        /// Path to the config file
        #[arg(long, env = "SHELLKEEP_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct ServeArgs {
    /// Address to bind the HTTP/WebSocket server
    #[arg(long, env = "SHELLKEEP_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Path to the config file (default: ~/.config/shellkeep/config.toml)
    #[arg(long, env = "SHELLKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds a detached session survives without a client
    #[arg(long)]
    keepalive_secs: Option<u64>,

    /// Scrollback kept per session, in bytes
    #[arg(long)]
    scrollback_bytes: Option<usize>,

    /// Shell to spawn (overrides config and $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Add a runspace, as ID=DIR. May be repeated.
    #[arg(long = "runspace", value_name = "ID=DIR")]
    runspaces: Vec<Runspace>,
}

#[derive(Debug, Error)]
pub enum ShellkeepError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("failed to encode config: {0}")]
    ConfigEncode(#[from] toml::ser::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), ShellkeepError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Some(Commands::Serve(args)) => run_server(args).await,
        Some(Commands::Config { config }) => print_config(config),
        None => run_server(cli.serve).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "shellkeep=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the config file, or defaults when there is none.
fn load_config(path: Option<PathBuf>) -> Result<Config, ShellkeepError> {
    match path.or_else(Config::default_path) {
        Some(path) => {
            let config = Config::load_or_default(&path)?;
            tracing::debug!(path = %path.display(), "config resolved");
            Ok(config)
        }
        None => Ok(Config::default()),
    }
}

fn print_config(path: Option<PathBuf>) -> Result<(), ShellkeepError> {
    let config = load_config(path)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(args: ServeArgs) -> Result<(), ShellkeepError> {
    tracing::info!("shellkeep starting");

    let mut config = load_config(args.config)?;
    if let Some(secs) = args.keepalive_secs {
        config.keepalive_secs = secs;
    }
    if let Some(bytes) = args.scrollback_bytes {
        config.scrollback_bytes = bytes;
    }
    if let Some(shell) = args.shell {
        config.shell = Some(shell);
    }
    config.validate()?;

    let router_config = RouterConfig {
        bind: args.bind,
        allowed_origins: config.allowed_origins.clone(),
    };
    let state = server::build_state(&config, args.runspaces);
    let shutdown = state.shutdown.clone();

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    let server_handle = tokio::spawn(server::serve(listener, state, router_config));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C");
        }
        _ = shutdown.cancelled() => {}
    }

    // Live connections see the token and send close frames; the server then
    // stops accepting and drains every session.
    shutdown.cancel();

    match server_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::warn!(?e, "server task panicked"),
    }

    tracing::info!("shellkeep exiting");
    Ok(())
}
