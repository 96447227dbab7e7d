use super::{DimensionCache, DimensionEntry, ProbeError};
use crate::delivery::DeliveryConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::Cursor,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Reads the natural size of an image without keeping its pixels.
#[async_trait]
pub trait DimensionProbe: Send + Sync {
    async fn probe(&self, url: &str) -> Result<(u32, u32), ProbeError>;
    fn name(&self) -> &str;
}

pub type DynDimensionProbe = Arc<dyn DimensionProbe>;

/// Probes images served from the local source directory, e.g. `/photos/2024/a.jpg`.
/// Only the header is decoded.
pub struct FileProbe {
    root: PathBuf,
    url_prefix: String,
}

impl FileProbe {
    pub fn new(root: PathBuf, url_prefix: &str) -> Self {
        Self {
            root,
            url_prefix: format!("/{}", url_prefix.trim_matches('/')),
        }
    }

    fn resolve(&self, url: &str) -> Result<PathBuf, ProbeError> {
        let relative = url
            .strip_prefix(&self.url_prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| ProbeError::Unsupported(url.to_string()))?;
        let relative = relative.split(['?', '#']).next().unwrap_or(relative);
        let decoded = urlencoding::decode(relative)
            .map_err(|_| ProbeError::InvalidPath)?
            .into_owned();

        let relative_path = Path::new(&decoded);
        if relative_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ProbeError::InvalidPath);
        }

        Ok(self.root.join(relative_path))
    }
}

#[async_trait]
impl DimensionProbe for FileProbe {
    async fn probe(&self, url: &str) -> Result<(u32, u32), ProbeError> {
        let path = self.resolve(url)?;

        tokio::task::spawn_blocking(move || image::image_dimensions(&path))
            .await
            .map_err(|e| ProbeError::TaskFailed(e.to_string()))?
            .map_err(ProbeError::from)
    }

    fn name(&self) -> &str {
        "local file probe"
    }
}

/// Probes remote images over HTTP. The prefetcher hands it the smallest CDN rendition,
/// so the body is a few hundred bytes; only the header is decoded.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("folio/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn handles(url: &str) -> bool {
        url.starts_with("https://") || url.starts_with("http://")
    }
}

#[async_trait]
impl DimensionProbe for HttpProbe {
    async fn probe(&self, url: &str) -> Result<(u32, u32), ProbeError> {
        if !Self::handles(url) {
            return Err(ProbeError::Unsupported(url.to_string()));
        }

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "image/*")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProbeError::HttpStatus {
                status: response.status(),
                url: url.to_string(),
            });
        }

        let bytes = response.bytes().await?;
        let dimensions = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .into_dimensions()?;
        Ok(dimensions)
    }

    fn name(&self) -> &str {
        "http probe"
    }
}

/// Sends absolute URLs to the HTTP probe and everything else to the file probe.
pub struct SourceProbe {
    file: FileProbe,
    http: Option<HttpProbe>,
}

impl SourceProbe {
    pub fn new(file: FileProbe, http: Option<HttpProbe>) -> Self {
        Self { file, http }
    }
}

#[async_trait]
impl DimensionProbe for SourceProbe {
    async fn probe(&self, url: &str) -> Result<(u32, u32), ProbeError> {
        match &self.http {
            Some(http) if HttpProbe::handles(url) => http.probe(url).await,
            _ => self.file.probe(url).await,
        }
    }

    fn name(&self) -> &str {
        "source probe"
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    /// Per-request limit for remote probes.
    pub request_timeout_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            batch_size: 6,
            batch_delay_ms: 50,
            request_timeout_ms: 10_000,
        }
    }
}

/// Fills the dimension cache ahead of layout. Batches run one after another with a
/// pause in between; probes inside a batch run concurrently.
#[derive(Clone)]
pub struct Prefetcher {
    cache: DimensionCache,
    probe: DynDimensionProbe,
    delivery: Arc<DeliveryConfig>,
    config: PrefetchConfig,
}

impl Prefetcher {
    pub fn new(
        cache: DimensionCache,
        probe: DynDimensionProbe,
        delivery: Arc<DeliveryConfig>,
        config: PrefetchConfig,
    ) -> Self {
        Self {
            cache,
            probe,
            delivery,
            config,
        }
    }

    pub fn cache(&self) -> &DimensionCache {
        &self.cache
    }

    pub async fn prefetch(&self, urls: &[String]) -> HashMap<String, DimensionEntry> {
        self.prefetch_batch(urls, |_, _| {}).await
    }

    /// Probes every URL not already cached. `on_progress(done, total)` runs after each
    /// URL settles, whether it was cached, probed or failed. Failed probes are left out
    /// of the result and never abort the batch.
    pub async fn prefetch_batch<F>(
        &self,
        urls: &[String],
        mut on_progress: F,
    ) -> HashMap<String, DimensionEntry>
    where
        F: FnMut(usize, usize),
    {
        let total = urls.len();
        let batch_size = self.config.batch_size.max(1);
        let delay = Duration::from_millis(self.config.batch_delay_ms);
        let mut results = HashMap::with_capacity(total);
        let mut settled = 0;
        let mut failed = 0;

        for (batch_index, batch) in urls.chunks(batch_size).enumerate() {
            if batch_index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut probes = JoinSet::new();

            for src in batch {
                if let Some(entry) = self.cache.get(src) {
                    results.insert(src.clone(), entry);
                    settled += 1;
                    on_progress(settled, total);
                    continue;
                }

                let probe = self.probe.clone();
                let probe_url = self.delivery.probe_url(src);
                let src = src.clone();
                probes.spawn(async move {
                    let result = probe.probe(&probe_url).await;
                    (src, result)
                });
            }

            while let Some(joined) = probes.join_next().await {
                settled += 1;
                match joined {
                    Ok((src, Ok((width, height)))) => {
                        if let Some(entry) = self.cache.put(&src, width, height) {
                            results.insert(src, entry);
                        }
                    }
                    Ok((src, Err(e))) => {
                        failed += 1;
                        debug!("Dimension probe for {} failed: {}", src, e);
                    }
                    Err(e) => {
                        failed += 1;
                        warn!("Dimension probe task did not complete: {}", e);
                    }
                }
                on_progress(settled, total);
            }
        }

        info!(
            "Prefetched dimensions with {}: {} known, {} unknown, {} requested",
            self.probe.name(),
            results.len(),
            failed,
            total
        );

        results
    }
}
