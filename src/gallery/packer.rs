//! Greedy shortest-column masonry packing.
//!
//! Real rendered heights are unknown before images load, so each image contributes
//! its aspect ratio (height / width, i.e. height at unit column width) plus a fixed
//! spacing. Ratios come from the dimension cache, then from the record itself, and
//! finally from a deterministic estimation pattern so unmeasured images still form a
//! varied layout.

use super::{AspectSource, DimensionCache, ImageRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Supplies a stand-in aspect ratio for an image that has not been measured yet.
pub trait AspectEstimator: Send + Sync {
    fn estimate(&self, index: usize) -> f64;
}

/// Cycles through a fixed list of plausible photo ratios, starting at an offset
/// derived from the seed. Same seed, same sequence.
#[derive(Debug, Clone)]
pub struct PatternEstimator {
    pattern: Vec<f64>,
    offset: usize,
}

impl PatternEstimator {
    /// Portrait, landscape and square crops mixed so neighbours rarely match.
    pub const DEFAULT_PATTERN: [f64; 8] = [1.25, 0.75, 1.5, 0.67, 1.0, 1.33, 0.8, 1.2];

    pub fn new(pattern: Vec<f64>) -> Self {
        let pattern = if pattern.is_empty() {
            vec![1.0]
        } else {
            pattern
        };
        Self { pattern, offset: 0 }
    }

    pub fn seeded(seed: u64) -> Self {
        let mut estimator = Self::new(Self::DEFAULT_PATTERN.to_vec());
        estimator.offset = (seed % estimator.pattern.len() as u64) as usize;
        estimator
    }
}

impl Default for PatternEstimator {
    fn default() -> Self {
        Self::seeded(0)
    }
}

impl AspectEstimator for PatternEstimator {
    fn estimate(&self, index: usize) -> f64 {
        self.pattern[(index + self.offset) % self.pattern.len()]
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PackerConfig {
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    /// Added to every image's height, in column-width units.
    pub spacing: f64,
    pub estimate_seed: u64,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            min_aspect_ratio: 0.5,
            max_aspect_ratio: 2.5,
            spacing: 0.1,
            estimate_seed: 0,
        }
    }
}

impl PackerConfig {
    /// Replaces unusable aspect bounds or spacing with the defaults. Bounds must be
    /// finite, positive and ordered for clamping to be defined.
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        let mut config = self;

        let (min, max) = (config.min_aspect_ratio, config.max_aspect_ratio);
        if !(min.is_finite() && max.is_finite() && min > 0.0 && min <= max) {
            warn!(
                "Invalid packer aspect bounds [{}, {}], using [{}, {}]",
                min, max, defaults.min_aspect_ratio, defaults.max_aspect_ratio
            );
            config.min_aspect_ratio = defaults.min_aspect_ratio;
            config.max_aspect_ratio = defaults.max_aspect_ratio;
        }

        if !(config.spacing.is_finite() && config.spacing >= 0.0) {
            warn!(
                "Invalid packer spacing {}, using {}",
                config.spacing, defaults.spacing
            );
            config.spacing = defaults.spacing;
        }

        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedImage {
    /// Position in the source list.
    pub index: usize,
    pub src: String,
    /// Clamped height / width used for packing.
    pub aspect_ratio: f64,
    pub source: AspectSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasonryLayout {
    pub columns: Vec<Vec<PlacedImage>>,
    pub column_heights: Vec<f64>,
}

impl MasonryLayout {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn len(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_lengths(&self) -> Vec<usize> {
        self.columns.iter().map(Vec::len).collect()
    }

    /// Difference between the tallest and shortest running column height.
    pub fn height_spread(&self) -> f64 {
        let max = self.column_heights.iter().copied().fold(f64::MIN, f64::max);
        let min = self.column_heights.iter().copied().fold(f64::MAX, f64::min);
        if self.column_heights.is_empty() {
            0.0
        } else {
            max - min
        }
    }
}

#[derive(Clone)]
pub struct MasonryPacker {
    config: PackerConfig,
    estimator: Arc<dyn AspectEstimator>,
}

impl MasonryPacker {
    pub fn new(config: PackerConfig) -> Self {
        let estimator = Arc::new(PatternEstimator::seeded(config.estimate_seed));
        Self::with_estimator(config, estimator)
    }

    pub fn with_estimator(config: PackerConfig, estimator: Arc<dyn AspectEstimator>) -> Self {
        Self {
            config: config.sanitized(),
            estimator,
        }
    }

    pub fn config(&self) -> &PackerConfig {
        &self.config
    }

    /// Largest height a single image can add to a column.
    pub fn max_contribution(&self) -> f64 {
        self.config.max_aspect_ratio + self.config.spacing
    }

    pub fn aspect_ratio_for(
        &self,
        index: usize,
        image: &ImageRecord,
        cache: &DimensionCache,
    ) -> (f64, AspectSource) {
        let (ratio, source) = if let Some(entry) = cache.get(&image.src) {
            (entry.aspect_ratio, AspectSource::Cache)
        } else if let Some(ratio) = image.known_aspect_ratio() {
            (ratio, AspectSource::Record)
        } else {
            (self.estimator.estimate(index), AspectSource::Estimate)
        };

        (self.clamp(ratio), source)
    }

    /// Places each image, in order, into the column with the lowest running height.
    /// Ties go to the leftmost column. A column count of zero is treated as one.
    pub fn pack(
        &self,
        images: &[ImageRecord],
        column_count: usize,
        cache: &DimensionCache,
    ) -> MasonryLayout {
        let column_count = column_count.max(1);
        let mut columns: Vec<Vec<PlacedImage>> = vec![Vec::new(); column_count];
        let mut heights = vec![0.0_f64; column_count];

        for (index, image) in images.iter().enumerate() {
            let (aspect_ratio, source) = self.aspect_ratio_for(index, image, cache);

            let mut shortest = 0;
            for (column, height) in heights.iter().enumerate().skip(1) {
                if *height < heights[shortest] {
                    shortest = column;
                }
            }

            heights[shortest] += aspect_ratio + self.config.spacing;
            columns[shortest].push(PlacedImage {
                index,
                src: image.src.clone(),
                aspect_ratio,
                source,
            });
        }

        MasonryLayout {
            columns,
            column_heights: heights,
        }
    }

    fn clamp(&self, ratio: f64) -> f64 {
        if !ratio.is_finite() {
            return 1.0_f64.clamp(self.config.min_aspect_ratio, self.config.max_aspect_ratio);
        }
        ratio.clamp(self.config.min_aspect_ratio, self.config.max_aspect_ratio)
    }
}

impl Default for MasonryPacker {
    fn default() -> Self {
        Self::new(PackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn images(count: usize) -> Vec<ImageRecord> {
        (0..count)
            .map(|i| ImageRecord::new(format!("/photos/{:03}.jpg", i), format!("photo {}", i)))
            .collect()
    }

    #[test]
    fn test_pack_is_deterministic() {
        let packer = MasonryPacker::default();
        let cache = DimensionCache::default();
        let list = images(37);
        cache.put(&list[3].src, 400, 1000);
        cache.put(&list[20].src, 1000, 400);

        let first = packer.pack(&list, 4, &cache);
        let second = packer.pack(&list, 4, &cache);
        assert_eq!(first, second);
        assert_eq!(first.len(), 37);
    }

    #[test]
    fn test_pack_stays_balanced() {
        let packer = MasonryPacker::default();
        let cache = DimensionCache::default();
        let list = images(60);

        // Pathological ratios get clamped before they can skew a column
        cache.put(&list[0].src, 10, 1000);
        cache.put(&list[1].src, 1000, 10);
        cache.put(&list[7].src, 100, 5000);

        for columns in 1..=5 {
            for prefix in 0..=list.len() {
                let layout = packer.pack(&list[..prefix], columns, &cache);
                assert!(
                    layout.height_spread() <= packer.max_contribution() + 1e-9,
                    "spread {} too large for {} images in {} columns",
                    layout.height_spread(),
                    prefix,
                    columns
                );
            }
        }
    }

    #[test]
    fn test_ties_go_left() {
        let packer = MasonryPacker::with_estimator(
            PackerConfig::default(),
            Arc::new(PatternEstimator::new(vec![1.0])),
        );
        let layout = packer.pack(&images(3), 3, &DimensionCache::default());

        let indices: Vec<Vec<usize>> = layout
            .columns
            .iter()
            .map(|c| c.iter().map(|p| p.index).collect())
            .collect();
        assert_eq!(indices, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_aspect_ratio_sources() {
        let packer = MasonryPacker::default();
        let cache = DimensionCache::default();
        let record = ImageRecord::new("/a.jpg", "a").with_dimensions(300, 600);

        assert_eq!(
            packer.aspect_ratio_for(0, &record, &cache),
            (2.0, AspectSource::Record)
        );

        cache.put("/a.jpg", 600, 300);
        assert_eq!(
            packer.aspect_ratio_for(0, &record, &cache),
            (0.5, AspectSource::Cache)
        );

        let unknown = ImageRecord::new("/b.jpg", "b");
        assert_eq!(
            packer.aspect_ratio_for(2, &unknown, &cache),
            (1.5, AspectSource::Estimate)
        );
    }

    #[test]
    fn test_clamps_extremes() {
        let packer = MasonryPacker::default();
        let cache = DimensionCache::default();
        cache.put("/tall.jpg", 10, 1000);
        cache.put("/wide.jpg", 1000, 10);

        let tall = ImageRecord::new("/tall.jpg", "");
        let wide = ImageRecord::new("/wide.jpg", "");
        assert_eq!(packer.aspect_ratio_for(0, &tall, &cache).0, 2.5);
        assert_eq!(packer.aspect_ratio_for(0, &wide, &cache).0, 0.5);
    }

    #[test]
    fn test_expired_cache_falls_back_to_estimate() {
        let clock = Arc::new(crate::gallery::ManualClock::default());
        let cache = DimensionCache::with_clock(Duration::from_secs(60), clock.clone());
        let packer = MasonryPacker::default();
        let record = ImageRecord::new("/a.jpg", "a");
        cache.put("/a.jpg", 100, 200);

        assert_eq!(packer.aspect_ratio_for(0, &record, &cache).1, AspectSource::Cache);
        clock.advance(Duration::from_secs(60));
        assert_eq!(
            packer.aspect_ratio_for(0, &record, &cache).1,
            AspectSource::Estimate
        );
    }

    #[test]
    fn test_seeded_estimates_vary() {
        let a = PatternEstimator::seeded(0);
        let b = PatternEstimator::seeded(3);
        let first: Vec<f64> = (0..8).map(|i| a.estimate(i)).collect();
        let shifted: Vec<f64> = (0..8).map(|i| b.estimate(i)).collect();

        assert_ne!(first, shifted);
        assert_eq!(a.estimate(3), b.estimate(0));
        assert!(first.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn test_inverted_bounds_fall_back_to_defaults() {
        let packer = MasonryPacker::new(PackerConfig {
            min_aspect_ratio: 3.0,
            ..Default::default()
        });
        assert_eq!(packer.config().min_aspect_ratio, 0.5);
        assert_eq!(packer.config().max_aspect_ratio, 2.5);

        let cache = DimensionCache::default();
        let list = images(12);
        cache.put(&list[0].src, 100, 1000);
        let layout = packer.pack(&list, 3, &cache);
        assert_eq!(layout.len(), 12);
        assert_eq!(layout.columns[0][0].aspect_ratio, 2.5);

        let packer = MasonryPacker::new(PackerConfig {
            max_aspect_ratio: f64::NAN,
            spacing: -1.0,
            ..Default::default()
        });
        assert_eq!(packer.config().max_aspect_ratio, 2.5);
        assert_eq!(packer.config().spacing, 0.1);
        assert_eq!(packer.pack(&list, 2, &cache).len(), 12);
    }

    #[test]
    fn test_zero_columns_treated_as_one() {
        let layout = MasonryPacker::default().pack(&images(4), 0, &DimensionCache::default());
        assert_eq!(layout.column_lengths(), vec![4]);
    }
}
