// Gallery module - Main entry point
mod cell;
mod controller;
mod dimensions;
mod error;
mod manifest;
mod packer;
mod prefetch;
mod types;
pub mod visibility;

// Re-export public items
pub use cell::{CellPhase, CellState, CellView, ImageCell, LoadKind, LoadRequest};
pub use controller::{
    Breakpoint, GalleryController, GalleryView, GalleryViewState, LightboxKey,
    columns_for_width, default_breakpoints,
};
pub use dimensions::{Clock, DimensionCache, ManualClock, SystemClock};
pub use error::{GalleryError, ProbeError};
pub use manifest::{load_manifest, scan_source_directory};
pub use packer::{
    AspectEstimator, MasonryLayout, MasonryPacker, PackerConfig, PatternEstimator, PlacedImage,
};
pub use prefetch::{
    DimensionProbe, DynDimensionProbe, FileProbe, HttpProbe, PrefetchConfig, Prefetcher, SourceProbe,
};
pub use types::*;
pub use visibility::{Bounds, Observer, ObserverOptions, Viewport, VisibilityTracker, WatchGuard};

use crate::delivery::DeliveryConfig;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

pub type SharedGallery = Arc<Gallery>;

/// The image list and the state shared by every view of it: the dimension cache and
/// the prefetcher that fills it.
pub struct Gallery {
    pub(crate) config: crate::GalleryConfig,
    pub(crate) delivery: Arc<DeliveryConfig>,
    pub(crate) images: Arc<Vec<ImageRecord>>,
    pub(crate) cache: DimensionCache,
    pub(crate) prefetcher: Prefetcher,
}

impl Gallery {
    pub fn new(
        config: crate::GalleryConfig,
        delivery: DeliveryConfig,
        images: Vec<ImageRecord>,
    ) -> Self {
        let file = FileProbe::new(config.source_directory.clone(), &config.url_prefix);
        let timeout = Duration::from_millis(config.prefetch.request_timeout_ms);
        let http = match HttpProbe::new(timeout) {
            Ok(http) => Some(http),
            Err(e) => {
                warn!("Remote dimension probing disabled: {}", e);
                None
            }
        };
        let probe = Arc::new(SourceProbe::new(file, http));
        Self::with_probe(config, delivery, images, probe)
    }

    pub fn with_probe(
        config: crate::GalleryConfig,
        delivery: DeliveryConfig,
        images: Vec<ImageRecord>,
        probe: DynDimensionProbe,
    ) -> Self {
        let cache = DimensionCache::new(Duration::from_secs(
            config.cache_ttl_hours.saturating_mul(60 * 60),
        ));
        let delivery = Arc::new(delivery);
        let prefetcher = Prefetcher::new(
            cache.clone(),
            probe,
            delivery.clone(),
            config.prefetch.clone(),
        );

        Self {
            config,
            delivery,
            images: Arc::new(images),
            cache,
            prefetcher,
        }
    }

    /// Reads the configured manifest, or scans the source directory when none is set.
    pub async fn load(
        config: crate::GalleryConfig,
        delivery: DeliveryConfig,
    ) -> Result<Self, GalleryError> {
        let images = match &config.manifest {
            Some(manifest) => load_manifest(manifest).await?,
            None => scan_source_directory(&config.source_directory, &config.url_prefix).await?,
        };

        info!("Gallery loaded with {} images", images.len());
        Ok(Self::new(config, delivery, images))
    }

    pub fn config(&self) -> &crate::GalleryConfig {
        &self.config
    }

    pub fn delivery(&self) -> &DeliveryConfig {
        &self.delivery
    }

    pub fn images(&self) -> &[ImageRecord] {
        &self.images
    }

    pub fn cache(&self) -> &DimensionCache {
        &self.cache
    }

    /// A fresh controller over this gallery's images, sharing its dimension cache.
    pub fn controller(&self, requested_columns: Option<usize>) -> GalleryController {
        GalleryController::new(
            self.config.clone(),
            self.delivery.clone(),
            self.cache.clone(),
            self.images.to_vec(),
            requested_columns,
        )
    }

    pub async fn prefetch_sources(&self, sources: &[String]) -> HashMap<String, DimensionEntry> {
        self.prefetcher
            .prefetch_batch(sources, |done, total| {
                if done == total || done % 25 == 0 {
                    debug!("Dimension prefetch progress: {}/{}", done, total);
                }
            })
            .await
    }

    pub async fn prefetch_all(&self) -> HashMap<String, DimensionEntry> {
        let sources: Vec<String> = self.images.iter().map(|i| i.src.clone()).collect();
        self.prefetch_sources(&sources).await
    }

    /// Probes every image in the background. Returns how many were scheduled.
    pub fn start_background_prefetch(gallery: SharedGallery) -> usize {
        let scheduled = gallery.images.len();

        tokio::spawn(async move {
            info!("Starting background dimension prefetch");
            let found = gallery.prefetch_all().await;
            info!(
                "Background dimension prefetch finished: {} of {} known",
                found.len(),
                gallery.images.len()
            );
        });

        scheduled
    }
}
