use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use voxbridge_core::config::{Config, LoggingConfig};
use voxbridge_gateway::server::run_server;
use voxbridge_gateway::state::GatewayState;

#[derive(Parser)]
#[command(
    name = "voxbridge",
    about = "Real-time voice-interaction edge server for embedded audio devices",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (JSON5)
    #[arg(short, long, global = true, default_value = "voxbridge.json5")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the edge server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Validate the configuration and provider setup
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Get a specific config value by dotted path
    Get { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(Path::new(&cli.config))
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", cli.config))?;

    init_tracing(&config.logging, cli.verbose);

    match cli.command {
        Commands::Serve { port, bind } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind = bind;
            }

            let (warnings, errors) = config.validate();
            for warning in &warnings {
                warn!("{warning}");
            }
            if !errors.is_empty() {
                anyhow::bail!("invalid configuration:\n  {}", errors.join("\n  "));
            }

            let state = Arc::new(GatewayState::new(config));
            run_server(state).await
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => {
                    println!("{value}");
                    Ok(())
                }
                None => anyhow::bail!("no such config key: {key}"),
            },
        },

        Commands::Doctor => {
            let (warnings, errors) = config.validate();
            for warning in &warnings {
                println!("warning: {warning}");
            }
            for error in &errors {
                println!("error: {error}");
            }
            if errors.is_empty() {
                println!("configuration OK");
                Ok(())
            } else {
                anyhow::bail!("{} configuration error(s)", errors.len())
            }
        }
    }
}

fn init_tracing(cfg: &LoggingConfig, verbose: bool) {
    let default_level = if verbose {
        "debug"
    } else {
        cfg.level.as_deref().unwrap_or("info")
    };

    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    for directive in &cfg.filters {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("ignoring bad log filter {directive:?}: {e}"),
        }
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
