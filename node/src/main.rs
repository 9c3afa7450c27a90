//! Concordia Node Binary

use clap::{Parser, Subcommand};
use concordia_core::NodeConfig;
use concordia_node::NodeBuilder;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "concordia-node")]
#[command(about = "Concordia - Byzantine-fault-tolerant cross-chain verification")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node
    Run {
        /// Configuration file path (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        
        /// Override the configured log filter
        #[arg(long)]
        log_level: Option<String>,
    },
    
    /// Write the default configuration
    Config {
        /// Output file path; stdout if omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    
    match cli.command {
        Commands::Run { config, log_level } => {
            let mut config = match config {
                Some(path) => NodeConfig::from_json(&std::fs::read_to_string(&path)?)?,
                None => NodeConfig::default(),
            };
            if let Some(level) = log_level {
                config.log_level = level;
            }
            init_logging(&config.log_level);
            
            info!("Starting Concordia node {}...", config.name);
            let node = NodeBuilder::new().config(config).build();
            node.start().await?;
        }
        
        Commands::Config { output } => {
            let json = NodeConfig::default().to_json()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &json)?;
                    println!("Configuration saved to: {}", path.display());
                }
                None => println!("{}", json),
            }
        }
    }
    
    Ok(())
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
