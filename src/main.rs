use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

mod config;
mod error;
mod models;
mod paths;
mod pipeline;
mod record;
mod rpc;
mod server;
mod store;

use config::ConfigStore;
use models::{LanguageModel, OpenRouterClient};
use pipeline::DiagnosePipeline;
use rpc::{ToolBackend, WsToolClient};
use store::{FsProjectStore, ProjectStore};

#[derive(Debug, Parser)]
#[command(name = "frame_triage")]
#[command(about = "Headless GPU frame diagnostics orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Start {
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,
        /// Root for configuration and project sandboxes.
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// host:port of the capture-inspection backend.
        #[arg(long, default_value = "127.0.0.1:8765")]
        tool_backend: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { listen, data_dir, tool_backend } => {
            let addr: SocketAddr = listen.parse()?;
            let data_dir = data_dir.unwrap_or_else(default_data_dir);

            let config = Arc::new(ConfigStore::open(&data_dir.join("config")));
            let store: Arc<dyn ProjectStore> =
                Arc::new(FsProjectStore::new(data_dir.join("projects")));
            let model: Arc<dyn LanguageModel> = Arc::new(OpenRouterClient::new()?);
            let tools: Arc<dyn ToolBackend> = Arc::new(WsToolClient::new(&tool_backend));
            let pipeline = Arc::new(DiagnosePipeline::new(model, tools, store.clone()));

            let state = server::AppState { config, store, pipeline, tool_addr: tool_backend };
            server::serve(addr, state).await?;
        }
    }
    Ok(())
}

fn default_data_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    base.join("frame_triage")
}
