//! Download, cache and decode remote images.
//!
//! Raw downloads are kept in a private byte store (the `http` namespace),
//! separate from the re-encoded images of the tiered cache. A fetch is:
//!
//! 1. parse the key as a URL and derive its disk key
//! 2. byte store hit: decode the stored bytes
//! 3. miss: stream the download into an editor, commit, re-read, decode;
//!    if the commit or the re-read fails, decode the downloaded bytes instead
//! 4. no byte store: download into memory and decode
//!
//! Decoding is sampled towards the configured target size.

use crate::fetch::{Transport, parse_image_url};
use async_trait::async_trait;
use pixstash_core::cache::{DiskKey, Editor, JournalStore, PersistentTier, STORE_VERSION, Snapshot};
use pixstash_core::dispatch::Resolver;
use pixstash_core::image::{CachedImage, DecodeBounds, decode_sampled};
use pixstash_core::{AppConfig, Error};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use url::Url;

/// Namespace of the raw download store.
pub const HTTP_CACHE_NAMESPACE: &str = "http";

/// Default budget of the raw download store (10MB).
pub const DEFAULT_HTTP_CACHE_BUDGET: u64 = 10 * 1024 * 1024;

/// Buffer between the response stream and the sink.
pub const IO_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub bounds: DecodeBounds,
    /// Largest accepted response body.
    pub max_bytes: usize,
    /// Directory of the raw download store; `None` disables it.
    pub http_cache_dir: Option<PathBuf>,
    pub http_cache_budget: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bounds: DecodeBounds::new(100, 100),
            max_bytes: 5 * 1024 * 1024,
            http_cache_dir: None,
            http_cache_budget: DEFAULT_HTTP_CACHE_BUDGET,
        }
    }
}

impl PipelineConfig {
    /// Pipeline settings from the app config, storing downloads in `http_cache_dir`.
    pub fn from_app(config: &AppConfig, http_cache_dir: Option<PathBuf>) -> Self {
        Self {
            bounds: DecodeBounds {
                target_width: config.target_width,
                target_height: config.target_height,
                max_decoded_pixels: config.max_decoded_pixels,
            },
            max_bytes: config.max_bytes,
            http_cache_dir,
            http_cache_budget: config.http_cache_budget_bytes,
        }
    }
}

/// [`Resolver`] that fetches keys over a [`Transport`].
#[derive(Debug)]
pub struct RemoteFetchPipeline<T> {
    transport: T,
    byte_cache: PersistentTier,
    bounds: DecodeBounds,
    max_bytes: usize,
}

impl<T: Transport> RemoteFetchPipeline<T> {
    /// Build the pipeline. The byte store stays closed until [`init`](Self::init).
    pub fn new(transport: T, config: PipelineConfig) -> Self {
        let byte_cache = match config.http_cache_dir {
            Some(dir) => PersistentTier::new(dir, config.http_cache_budget, STORE_VERSION, false),
            None => PersistentTier::disabled(),
        };
        Self { transport, byte_cache, bounds: config.bounds, max_bytes: config.max_bytes }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn byte_cache(&self) -> &PersistentTier {
        &self.byte_cache
    }

    /// Fetch and decode `key`. `None` on any failure.
    pub async fn fetch(&self, key: &str) -> Option<CachedImage> {
        match self.try_fetch(key).await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(key, error = %e, "Fetch failed");
                None
            }
        }
    }

    async fn try_fetch(&self, key: &str) -> Result<Option<CachedImage>, Error> {
        let url = parse_image_url(key).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let disk_key = DiskKey::derive(url.as_str());

        let Some(store) = self.byte_cache.store().await else {
            return self.fetch_uncached(&url).await;
        };

        let snapshot = match store.get(&disk_key).await {
            Ok(Some(snapshot)) => {
                tracing::debug!(%url, %disk_key, "Byte cache hit");
                Some(snapshot)
            }
            Ok(None) => match store.edit(&disk_key)? {
                Some(mut editor) => {
                    if !self.download_to_sink(&url, &mut editor).await {
                        editor.abort();
                        return Ok(None);
                    }
                    let downloaded = editor.bytes().to_vec();
                    match commit_and_reread(&store, &disk_key, editor).await {
                        Ok(Some(snapshot)) => Some(snapshot),
                        Ok(None) => {
                            tracing::debug!(%url, %disk_key, "Committed download not readable, decoding in memory");
                            return self.decode(downloaded).await.map(Some);
                        }
                        Err(e) => {
                            tracing::warn!(%url, %disk_key, error = %e, "Byte cache write failed, decoding in memory");
                            return self.decode(downloaded).await.map(Some);
                        }
                    }
                }
                // someone else is writing this key
                None => return self.fetch_uncached(&url).await,
            },
            Err(e) => {
                tracing::debug!(%url, error = %e, "Byte cache read failed");
                return self.fetch_uncached(&url).await;
            }
        };

        match snapshot {
            Some(snapshot) => self.decode(snapshot.into_bytes()).await.map(Some),
            None => Ok(None),
        }
    }

    async fn fetch_uncached(&self, url: &Url) -> Result<Option<CachedImage>, Error> {
        let mut bytes = Vec::new();
        if !self.download_to_sink(url, &mut bytes).await {
            return Ok(None);
        }
        self.decode(bytes).await.map(Some)
    }

    async fn decode(&self, bytes: Vec<u8>) -> Result<CachedImage, Error> {
        let bounds = self.bounds;
        tokio::task::spawn_blocking(move || decode_sampled(&bytes, bounds))
            .await
            .map_err(|e| Error::Codec(format!("decode task failed: {e}")))?
    }

    /// Stream `url` into `sink`. Returns whether the whole body arrived.
    pub async fn download_to_sink<W: Write + Send>(&self, url: &Url, sink: W) -> bool {
        match self.download(url, sink).await {
            Ok(size) => {
                tracing::debug!(%url, size, "Downloaded");
                true
            }
            Err(e) => {
                tracing::warn!(%url, error = %e, "Download failed");
                false
            }
        }
    }

    async fn download<W: Write + Send>(&self, url: &Url, sink: W) -> Result<usize, Error> {
        let mut body = self.transport.open(url).await?;

        let status = body.status();
        if !(200..300).contains(&status) {
            return Err(Error::HttpStatus(status));
        }
        if let Some(len) = body.content_length()
            && len > self.max_bytes as u64
        {
            return Err(Error::FetchTooLarge(format!("{len} bytes exceeds {}", self.max_bytes)));
        }

        let mut out = BufWriter::with_capacity(IO_BUFFER_SIZE, sink);
        let mut total = 0usize;
        while let Some(chunk) = body.chunk().await? {
            total += chunk.len();
            if total > self.max_bytes {
                return Err(Error::FetchTooLarge(format!("more than {} bytes", self.max_bytes)));
            }
            out.write_all(&chunk)?;
        }
        out.flush()?;
        Ok(total)
    }

    /// Open the byte store.
    pub async fn init(&self) {
        self.byte_cache.init().await;
    }

    /// Drop every stored download.
    pub async fn clear(&self) {
        self.byte_cache.evict().await;
    }

    pub async fn flush(&self) {
        self.byte_cache.flush().await;
    }

    pub async fn close(&self) {
        self.byte_cache.close().await;
    }
}

async fn commit_and_reread(store: &JournalStore, key: &DiskKey, editor: Editor) -> Result<Option<Snapshot>, Error> {
    editor.commit().await?;
    store.get(key).await
}

#[async_trait]
impl<T: Transport> Resolver for RemoteFetchPipeline<T> {
    async fn resolve(&self, key: &str) -> Option<CachedImage> {
        self.fetch(key).await
    }

    async fn init(&self) {
        RemoteFetchPipeline::init(self).await;
    }

    async fn clear(&self) {
        RemoteFetchPipeline::clear(self).await;
    }

    async fn flush(&self) {
        RemoteFetchPipeline::flush(self).await;
    }

    async fn close(&self) {
        RemoteFetchPipeline::close(self).await;
    }
}
