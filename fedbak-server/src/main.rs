use clap::{Parser, Subcommand};
use fedbak_core::NodeConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
use server::run_server;

#[derive(Parser)]
#[command(name = "fedbak")]
#[command(about = "Peer-to-peer backup federation node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "fedbak.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fedbak=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting fedbak node with config: {}", config);

            let cfg = match NodeConfig::from_file(&config) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::error!("Failed to load config {}: {}", config, err);
                    std::process::exit(1);
                }
            };

            if let Err(err) = run_server(cfg).await {
                tracing::error!("Server error: {}", err);
                std::process::exit(1);
            }
        }
    }
}
