use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use live_bridge_agent::{GeminiLiveConfig, GeminiLiveConnector};
use live_bridge_core::config::{Config, LoggingConfig};
use live_bridge_gateway::{GatewayState, H264DecoderFactory, WebRtcConnector};

#[derive(Parser)]
#[command(
    name = "live-bridge",
    about = "Real-time media bridge between WebRTC browsers and a live AI agent",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Gateway {
        /// Port to listen on (default: 8080)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show gateway status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".to_string())
    };

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    for directive in &logging.filters {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring log filter {directive:?}: {e}"),
        }
    }

    let writer = if logging.output == "stdout" {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::config_path);

    let config = Config::load(&config_path)?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Gateway { port } => {
            let port = port.unwrap_or_else(|| config.gateway_port());

            let (warnings, errors) = config.validate();
            for w in &warnings {
                tracing::warn!("{w}");
            }
            if !errors.is_empty() {
                for e in &errors {
                    tracing::error!("{e}");
                }
                anyhow::bail!("invalid configuration ({} errors)", errors.len());
            }

            let gemini =
                GeminiLiveConfig::from_agent_config(&config.agent(), config.audio().input_sample_rate)?;
            tracing::info!(model = %gemini.model, "Using Gemini Live agent");
            let agent = Arc::new(GeminiLiveConnector::new(gemini));
            let peers = Arc::new(
                WebRtcConnector::new(&config.ice_servers())
                    .with_video_decoders(Arc::new(H264DecoderFactory)),
            );

            let state = Arc::new(GatewayState::new(Arc::new(config), agent, peers));
            tracing::info!("Starting Live Bridge gateway on port {port}");
            live_bridge_gateway::start_gateway(state, port).await?;
        }
        Commands::Status => {
            println!("Live Bridge v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            let port = config.gateway_port();
            println!("Gateway port: {port}");

            let url = format!("http://127.0.0.1:{port}/health");
            match reqwest::get(&url).await {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await?;
                    println!("Status: running");
                    println!("Sessions: {}", body["sessions"]);
                    println!("Connections: {}", body["connections"]);
                }
                Ok(resp) => println!("Status: unhealthy ({})", resp.status()),
                Err(_) => println!("Status: not running"),
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at {key}"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    std::process::exit(1);
                }
                println!("Config OK");
            }
        },
    }

    Ok(())
}
