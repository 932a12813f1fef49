//! mcpd - MCP integration daemon.
//!
//! Runs the bridging proxy that adopts stdio MCP servers as child
//! processes and exposes them over HTTP/SSE.

use clap::{Parser, Subcommand};
use mcpd_proxy::{ProxyConfig, DEFAULT_BIND};
use mcpd_util::{LogConfig, LogLevel};
use tracing::info;

#[derive(Parser)]
#[command(name = "mcpd")]
#[command(author, version, about = "MCP stdio bridging proxy", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level: trace, debug, info, warn, error. Overrides --verbose.
    #[arg(long, env = "MCPD_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridging proxy (default)
    Serve {
        /// Address to bind to
        #[arg(short, long, default_value = DEFAULT_BIND)]
        address: String,

        /// Require this API key on every route except /health
        #[arg(long, env = "MCPD_API_KEY")]
        api_key: Option<String>,

        /// Origin allowed without an API key; trailing `:` matches any
        /// port. Repeatable. Defaults to localhost origins.
        #[arg(long = "trusted-origin")]
        trusted_origins: Vec<String>,
    },
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_deref() {
        Some(value) => LogLevel::parse(value)
            .ok_or_else(|| anyhow::anyhow!("unknown log level: {value}"))?,
        None if cli.verbose => LogLevel::Debug,
        None => LogLevel::Info,
    };
    mcpd_util::log::init(LogConfig {
        print: true,
        level,
        include_location: cli.verbose,
    });

    match cli.command {
        Some(Commands::Version) => {
            println!("mcpd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Serve {
            address,
            api_key,
            trusted_origins,
        }) => serve(address, api_key, trusted_origins).await,
        None => serve(DEFAULT_BIND.to_string(), None, Vec::new()).await,
    }
}

async fn serve(
    address: String,
    api_key: Option<String>,
    trusted_origins: Vec<String>,
) -> anyhow::Result<()> {
    let mut config = ProxyConfig {
        bind: address,
        api_key,
        ..ProxyConfig::default()
    };
    if !trusted_origins.is_empty() {
        config.trusted_origins = trusted_origins;
    }

    info!(bind = %config.bind, auth = config.api_key.is_some(), "starting mcpd proxy");
    mcpd_proxy::serve(config, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    })
    .await?;
    Ok(())
}
