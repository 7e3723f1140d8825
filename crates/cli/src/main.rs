//! pixstash command line entry point.
//!
//! Logging goes to stderr as JSON; results are printed to stdout, one JSON
//! object per line.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pixstash_client::{FetchConfig, HTTP_CACHE_NAMESPACE, HttpTransport, PipelineConfig, RemoteFetchPipeline};
use pixstash_core::cache::{CompressFormat, DiskKey, TieredCache};
use pixstash_core::dispatch::{
    Delivery, DeliveryReceiver, FetchDispatcher, RequestMode, RequestOutcome, Targets, delivery_channel,
};
use pixstash_core::image::CachedImage;
use pixstash_core::{AppConfig, WorkerPool, paths};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pixstash", version, about = "Two-tier image cache with a deduplicating fetch pipeline")]
struct Cli {
    /// Base directory of the on-disk caches
    #[arg(long, global = true, env = "PIXSTASH_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch images through the cache
    Fetch {
        /// Image URLs
        #[arg(required = true)]
        urls: Vec<String>,

        /// Write each decoded image as PNG into this directory
        #[arg(long)]
        out: Option<PathBuf>,

        /// Run one fetch per URL even when URLs repeat
        #[arg(long)]
        independent: bool,
    },
    /// Remove every cached image and download
    Clear,
    /// Print cache statistics
    Stats,
}

/// One line of `fetch` output.
#[derive(Debug, Serialize)]
struct FetchReport {
    url: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    saved: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip)]
    image: Option<Arc<CachedImage>>,
}

impl FetchReport {
    fn new(url: &str) -> Self {
        Self { url: url.to_string(), ok: false, width: None, height: None, saved: None, error: None, image: None }
    }

    fn record(&mut self, image: Option<Arc<CachedImage>>) {
        self.ok = image.is_some();
        self.width = image.as_ref().map(|i| i.width());
        self.height = image.as_ref().map(|i| i.height());
        self.image = image;
    }
}

struct App {
    dispatcher: FetchDispatcher,
    pipeline: Arc<RemoteFetchPipeline<HttpTransport>>,
    deliveries: DeliveryReceiver,
}

async fn open(config: &AppConfig) -> Result<App> {
    if config.namespace == HTTP_CACHE_NAMESPACE {
        bail!("namespace `{HTTP_CACHE_NAMESPACE}` is reserved for raw downloads");
    }
    let base = config.cache_dir.as_deref();
    let image_dir = paths::cache_dir(base, &config.namespace).context("creating image cache directory")?;
    let http_dir = paths::cache_dir(base, HTTP_CACHE_NAMESPACE).context("creating download cache directory")?;

    let cache = TieredCache::open(config.cache_params(image_dir)?).await?;
    let transport = HttpTransport::new(FetchConfig::from(config))?;
    let pipeline = Arc::new(RemoteFetchPipeline::new(
        transport,
        PipelineConfig::from_app(config, config.disk_tier_enabled.then_some(http_dir)),
    ));
    let pool = WorkerPool::new(config.pool_config())?;

    let (tx, deliveries) = delivery_channel();
    let dispatcher = FetchDispatcher::builder(Arc::new(cache), pool, pipeline.clone(), tx).build();
    if !dispatcher.init_cache()?.wait().await {
        bail!("cache initialization did not finish");
    }

    Ok(App { dispatcher, pipeline, deliveries })
}

async fn fetch(app: &mut App, urls: &[String], out: Option<&Path>, mode: RequestMode) -> Result<()> {
    if let Some(out) = out {
        std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;
    }

    let mut targets = Targets::new();
    let mut order = Vec::with_capacity(urls.len());
    let mut pending = 0usize;

    for url in urls {
        let id = targets.insert(FetchReport::new(url));
        targets.bind(id, url.as_str());
        order.push(id);

        match app.dispatcher.request_with(url, id, mode) {
            Ok(RequestOutcome::Ready(image)) => {
                let delivery = Delivery { target: id, key: url.clone(), image: Some(image) };
                targets.apply(delivery, FetchReport::record);
            }
            Ok(RequestOutcome::Scheduled | RequestOutcome::Joined) => pending += 1,
            Err(e) => {
                if let Some(report) = targets.get_mut(id) {
                    report.error = Some(e.to_string());
                }
            }
        }
    }

    while pending > 0 {
        let Some(delivery) = app.deliveries.recv().await else {
            break;
        };
        targets.apply(delivery, FetchReport::record);
        pending -= 1;
    }

    app.dispatcher.flush_cache()?.wait().await;

    let mut failed = 0;
    for id in order {
        let Some(mut report) = targets.remove(id) else {
            continue;
        };
        if let (Some(out), Some(image)) = (out, report.image.as_ref()) {
            let path = out.join(format!("{}.png", DiskKey::derive(&report.url)));
            let bytes = image.encode(CompressFormat::Png, 100)?;
            std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
            report.saved = Some(path);
        }
        if !report.ok {
            failed += 1;
        }
        println!("{}", serde_json::to_string(&report)?);
    }

    if failed > 0 {
        bail!("{failed} of {} fetches failed", urls.len());
    }
    Ok(())
}

async fn clear(app: &App) -> Result<()> {
    app.dispatcher.clear_cache()?.wait().await;
    tracing::info!("Caches cleared");
    Ok(())
}

async fn stats(app: &App) -> Result<()> {
    let report = serde_json::json!({
        "images": app.dispatcher.cache().stats().await,
        "downloads": {
            "state": app.pipeline.byte_cache().state(),
            "available": app.pipeline.byte_cache().is_available(),
            "bytes": app.pipeline.byte_cache().size_bytes().await,
        },
        "pool": app.dispatcher.pool().stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load()?;
    if cli.cache_dir.is_some() {
        config.cache_dir = cli.cache_dir;
    }

    let mut app = open(&config).await?;
    let result = match cli.command {
        Commands::Fetch { urls, out, independent } => {
            let mode = if independent { RequestMode::Independent } else { RequestMode::Deduplicated };
            fetch(&mut app, &urls, out.as_deref(), mode).await
        }
        Commands::Clear => clear(&app).await,
        Commands::Stats => stats(&app).await,
    };

    app.dispatcher.close_cache()?.wait().await;
    app.dispatcher.pool().shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from(["pixstash", "fetch", "https://a/x.png", "https://a/y.png", "--independent"]).unwrap();
        match cli.command {
            Commands::Fetch { urls, out, independent } => {
                assert_eq!(urls.len(), 2);
                assert!(out.is_none());
                assert!(independent);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_fetch_requires_urls() {
        assert!(Cli::try_parse_from(["pixstash", "fetch"]).is_err());
    }

    #[test]
    fn test_report_records_image() {
        let mut report = FetchReport::new("https://a/x.png");
        report.record(Some(Arc::new(CachedImage::from_rgba(3, 2, vec![0; 24]).unwrap())));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["width"], 3);
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_open_rejects_reserved_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            namespace: HTTP_CACHE_NAMESPACE.into(),
            ..AppConfig::default()
        };
        assert!(open(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_and_stats_on_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig { cache_dir: Some(dir.path().to_path_buf()), ..AppConfig::default() };
        let app = open(&config).await.unwrap();

        clear(&app).await.unwrap();
        stats(&app).await.unwrap();
        assert!(dir.path().join("images").is_dir());
        assert!(dir.path().join(HTTP_CACHE_NAMESPACE).is_dir());
    }
}
