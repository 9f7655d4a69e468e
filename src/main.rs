use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use photolift::upload::{QuotaService, UploadApi};
use photolift::utils::{format_bytes, format_duration, format_eta, format_speed};
use photolift::{EngineConfig, FileHandle, HttpUploadApi, LocalFile, QueueSummary, UploadEvent, UploadManager};

#[derive(Parser)]
#[command(name = "photolift")]
#[command(about = "Upload photos with chunking, retries and live progress")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short = 'c', default_value = "config.toml")]
    config: PathBuf,

    /// Seconds between summary lines
    #[arg(long, default_value = "2")]
    summary_interval: u64,

    /// Photos to upload
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        info!(path = %cli.config.display(), "config file not found, using defaults");
        EngineConfig::default()
    };

    let http = Arc::new(HttpUploadApi::new(&config.api_base_url, config.token.clone(), config.request_timeout())?);
    let api: Arc<dyn UploadApi> = http.clone();
    let quota: Arc<dyn QuotaService> = http;

    let handle = match config.push_channel_config()? {
        Some(channel) => UploadManager::with_push_channel(api, Some(quota), config.upload_config(), channel),
        None => {
            info!("no user_id configured, progress will be polled");
            UploadManager::new(api, Some(quota), config.upload_config())
        }
    };
    let manager = handle.manager.clone();
    let mut events = manager.subscribe_events();

    let mut files: Vec<FileHandle> = Vec::with_capacity(cli.files.len());
    for path in &cli.files {
        match LocalFile::open(path).await {
            Ok(file) => files.push(Arc::new(file)),
            Err(err) => warn!(path = %path.display(), "skipping file: {err}"),
        }
    }

    let report = manager.add_files(files).await?;
    for rejected in &report.rejected {
        println!("rejected  {}: {}", rejected.file_name, rejected.reason);
    }
    if report.accepted.is_empty() {
        println!("nothing to upload");
        handle.shutdown().await?;
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.summary_interval.max(1)));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(UploadEvent::StateChanged { upload_id, old_state, new_state }) => {
                    println!("{upload_id}  {old_state} -> {new_state}");
                }
                Ok(UploadEvent::Failed { upload_id, error }) => {
                    println!("{upload_id}  failed: {error}");
                }
                Ok(UploadEvent::AllCompleted { total_tasks, total_bytes, total_duration }) => {
                    println!(
                        "done: {total_tasks} tasks, {} uploaded in {}",
                        format_bytes(total_bytes),
                        format_duration(total_duration)
                    );
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event receiver lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                let summary = manager.summary().await?;
                print_summary(&summary);
                if summary.is_settled() {
                    break;
                }
            }
        }
    }

    print_summary(&manager.summary().await?);
    handle.shutdown().await?;
    Ok(())
}

fn print_summary(summary: &QueueSummary) {
    println!(
        "[{:>5.1}%] {} / {}  {}  eta {}  | uploading {} processing {} pending {} done {} failed {}",
        summary.overall_percentage,
        format_bytes(summary.total_uploaded),
        format_bytes(summary.total_bytes),
        format_speed(summary.overall_speed),
        format_eta(summary.overall_eta),
        summary.uploading,
        summary.processing,
        summary.pending,
        summary.completed,
        summary.failed,
    );
}
