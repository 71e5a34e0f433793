use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use splashgen::app::App;
use splashgen::batch::{BatchResult, StatusClass};
use splashgen::models::GenerationRequest;
use std::path::{Path, PathBuf};
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "splashgen")]
#[command(about = "Content-addressed image uploads and cached splash generation")]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload local image files.
    Upload {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },
    /// Import one image from an http(s) URL.
    Import {
        #[arg(value_name = "URL")]
        url: String,
    },
    /// Generate splash images from a JSON array of requests.
    Generate {
        #[arg(value_name = "REQUESTS_JSON")]
        requests: PathBuf,
    },
    /// Read JSON-lines jobs from stdin and write one result line per job.
    Serve,
}

fn read_requests(path: &Path) -> Result<Vec<GenerationRequest>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid requests in {}", path.display()))
}

fn report(result: &BatchResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    info!(
        "{}/{} item(s) succeeded ({:?})",
        result.succeeded(),
        result.items.len(),
        result.status
    );
    if result.status != StatusClass::Success {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "splashgen=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = CliArgs::parse();
    info!("Starting splashgen");

    let app = match App::new().await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    match args.command {
        Command::Upload { files } => report(&app.upload_files(&files).await),
        Command::Import { url } => report(&app.import_by_url(&url).await),
        Command::Generate { requests } => {
            let requests = read_requests(&requests)?;
            report(&app.generate_batch(requests).await)
        }
        Command::Serve => {
            let sweeper = app.start_eviction();
            let served = app
                .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
                .await;
            sweeper.abort();

            if let Err(e) = served {
                error!("Serve loop failed: {}", e);
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
