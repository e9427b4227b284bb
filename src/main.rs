use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use clap::{Parser, Subcommand};
use facematch::{assets, config, server, AppState, CompareRequest, Extractor, FaceEmbedder};
use log::info;

#[derive(Parser)]
#[command(name = "facematch")]
#[command(version, about = "Face embedding extraction and nearest-match service")]
struct Cli {
    /// Config file (defaults to the compiled-in path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Address to listen on, overriding the config
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Print the embedding of a local image as JSON
    Extract {
        /// Image file to read
        image: PathBuf,
    },
    /// Match a compare-embedding request body from a JSON file
    Compare {
        /// JSON file with new_embedding, existing_embeddings and optional threshold
        request: PathBuf,
    },
    /// Download any missing model files and exit
    FetchModels,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.bind = bind;
            }
            serve(&cfg).await
        }
        Commands::Extract { image } => extract_file(&cfg, &image).await,
        Commands::Compare { request } => compare_file(&cfg, &request),
        Commands::FetchModels => {
            assets::ensure_models(&cfg.models).await?;
            info!("Detector ready at {}", cfg.models.detector.display());
            info!("Recognizer ready at {}", cfg.models.recognizer.display());
            Ok(())
        }
        Commands::Config => {
            print!("{}", config::to_toml(&cfg)?);
            Ok(())
        }
    }
}

async fn load_embedder(cfg: &config::Config) -> Result<Arc<FaceEmbedder>> {
    assets::ensure_models(&cfg.models).await?;
    info!("Loading detector: {}", cfg.models.detector.display());
    info!("Loading recognizer: {}", cfg.models.recognizer.display());
    Ok(Arc::new(FaceEmbedder::load(&cfg.models)?))
}

async fn serve(cfg: &config::Config) -> Result<()> {
    let embedder = load_embedder(cfg).await?;
    let state = AppState::new(embedder, cfg);
    server::serve(cfg, state).await
}

async fn extract_file(cfg: &config::Config, path: &Path) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let embedder = load_embedder(cfg).await?;

    let embedding = Extractor::new(embedder)
        .extract(Bytes::from(bytes), cfg.extract_timeout())
        .await
        .with_context(|| format!("extracting embedding from {}", path.display()))?;
    info!("Extracted {}-dimensional embedding", embedding.len());

    println!("{}", serde_json::json!({ "embedding": embedding }));
    Ok(())
}

fn compare_file(cfg: &config::Config, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let request: CompareRequest =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    let result = request.evaluate(cfg.threshold)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
