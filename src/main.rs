use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use upload_engine::config::{load_config, load_config_from};
use upload_engine::events::EventLogger;
use upload_engine::logging::init_logging;
use upload_engine::plugins::MockUploader;
use upload_engine::shutdown::ShutdownCoordinator;
use upload_engine::{FileDescriptor, Uploader};

fn parse_args() -> Result<(Option<PathBuf>, Vec<PathBuf>)> {
    let mut config = None;
    let mut files = Vec::new();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => {
                println!("Usage: upload-engine [--config PATH] FILE...");
                std::process::exit(0);
            }
            _ => files.push(PathBuf::from(arg)),
        }
    }

    if files.is_empty() {
        bail!("Usage: upload-engine [--config PATH] FILE...");
    }
    Ok((config, files))
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config_path, paths) = parse_args()?;
    let config = match &config_path {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
    .context("Failed to load configuration")?;

    init_logging(&config.logging).context("Failed to initialize logging")?;

    let uploader = Uploader::new(config.options);
    let shutdown = ShutdownCoordinator::new();
    let event_logger = EventLogger::new(uploader.events().clone(), shutdown.clone()).start();
    uploader
        .use_plugin(Arc::new(MockUploader::default()))
        .context("Failed to install uploader plugin")?;

    for path in &paths {
        let descriptor = FileDescriptor::from_path(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if let Err(e) = uploader.add_file(descriptor) {
            eprintln!("Skipping {}: {}", path.display(), e);
        }
    }

    info!(files = uploader.get_files().len(), "Starting upload");
    let result = uploader.upload().await.context("Upload failed")?;

    for file in &result.successful {
        println!(
            "ok      {} -> {}",
            file.name,
            file.upload_url.as_deref().unwrap_or("-")
        );
    }
    for file in &result.failed {
        println!(
            "failed  {}: {}",
            file.name,
            file.error.as_deref().unwrap_or("unknown error")
        );
    }

    uploader.destroy();
    shutdown.shutdown();
    let _ = event_logger.await;
    if !result.failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
