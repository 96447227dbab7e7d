use serde::{Deserialize, Serialize};
use url::Url;

const UPLOAD_MARKER: &str = "/upload/";

/// The `sizes` hint shared by every responsive source set.
pub const RESPONSIVE_SIZES: &str =
    "(max-width: 480px) 100vw, (max-width: 768px) 50vw, (max-width: 1200px) 33vw, 25vw";

/// Width ladder used for CDN source sets, paired with the requested quality.
const SRCSET_LADDER: [(u32, u8); 5] = [(240, 85), (400, 85), (800, 85), (1200, 90), (1600, 90)];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Host suffix that identifies the image CDN, e.g. `cloudinary.com`.
    pub cdn_host: String,
    pub quality_floor: u8,
    pub quality_reduction: u8,
    pub placeholder_width: u32,
    pub placeholder_quality: u8,
    pub placeholder_blur: u32,
    pub probe_width: u32,
    pub cell_width: u32,
    pub cell_quality: u8,
    pub lightbox_width: u32,
    pub lightbox_quality: u8,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            cdn_host: "cloudinary.com".to_string(),
            quality_floor: 70,
            quality_reduction: 10,
            placeholder_width: 20,
            placeholder_quality: 20,
            placeholder_blur: 2000,
            probe_width: 10,
            cell_width: 800,
            cell_quality: 85,
            lightbox_width: 1600,
            lightbox_quality: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransformOptions {
    pub width: Option<u32>,
    pub quality: Option<u8>,
    #[serde(default)]
    pub critical: bool,
}

impl TransformOptions {
    pub fn new(width: u32, quality: u8) -> Self {
        Self {
            width: Some(width),
            quality: Some(quality),
            critical: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponsiveSources {
    pub srcset: String,
    pub sizes: String,
}

/// A CDN URL split at its upload marker.
struct CdnParts<'a> {
    /// Everything up to and including `/upload/`.
    base: &'a str,
    /// The versioned path or public id, with any earlier transformations removed.
    asset: String,
}

impl DeliveryConfig {
    /// Returns true when `url` is served by the configured CDN and carries an upload path.
    pub fn is_cdn_url(&self, url: &str) -> bool {
        self.split_cdn_url(url).is_some()
    }

    /// Rewrites a CDN URL with delivery parameters. Anything that is not a CDN URL
    /// (relative paths, other hosts, garbage) is returned unchanged.
    pub fn optimize_url(&self, url: &str, options: &TransformOptions) -> String {
        let Some(parts) = self.split_cdn_url(url) else {
            return url.to_string();
        };

        let mut transformations = vec!["f_auto".to_string(), "fl_progressive".to_string()];

        match options.quality {
            Some(quality) => transformations.push(format!("q_{}", self.clamp_quality(quality))),
            None => transformations.push("q_auto:good".to_string()),
        }

        if let Some(width) = options.width.filter(|w| *w > 0) {
            transformations.push(format!("w_{}", width));
            transformations.push("c_fill".to_string());
        }

        if options.critical {
            transformations.push("fl_immutable_cache".to_string());
        }

        format!("{}{}/{}", parts.base, transformations.join(","), parts.asset)
    }

    /// Tiny blurred rendition shown while the real image loads.
    pub fn placeholder_url(&self, url: &str) -> String {
        let Some(parts) = self.split_cdn_url(url) else {
            return url.to_string();
        };

        format!(
            "{}f_auto,q_{},w_{},h_{},c_fill,e_blur:{}/{}",
            parts.base,
            self.placeholder_quality,
            self.placeholder_width,
            self.placeholder_width,
            self.placeholder_blur,
            parts.asset
        )
    }

    /// Smallest rendition that still reports the natural aspect ratio.
    pub fn probe_url(&self, url: &str) -> String {
        self.optimize_url(
            url,
            &TransformOptions {
                width: Some(self.probe_width),
                quality: None,
                critical: false,
            },
        )
    }

    pub fn cell_url(&self, url: &str) -> String {
        self.optimize_url(url, &TransformOptions::new(self.cell_width, self.cell_quality))
    }

    pub fn lightbox_url(&self, url: &str) -> String {
        self.optimize_url(
            url,
            &TransformOptions::new(self.lightbox_width, self.lightbox_quality).critical(),
        )
    }

    pub fn responsive_srcset(&self, url: &str, critical: bool) -> ResponsiveSources {
        if self.is_cdn_url(url) {
            let srcset = SRCSET_LADDER
                .iter()
                .map(|(width, quality)| {
                    let mut options = TransformOptions::new(*width, *quality);
                    options.critical = critical;
                    format!("{} {}w", self.optimize_url(url, &options), width)
                })
                .collect::<Vec<_>>()
                .join(", ");

            return ResponsiveSources {
                srcset,
                sizes: RESPONSIVE_SIZES.to_string(),
            };
        }

        if url.starts_with('/') || url.starts_with("./") {
            // Local files have a single size, but the browser still benefits from the hint
            return ResponsiveSources {
                srcset: String::new(),
                sizes: RESPONSIVE_SIZES.to_string(),
            };
        }

        ResponsiveSources {
            srcset: String::new(),
            sizes: String::new(),
        }
    }

    pub fn clamp_quality(&self, quality: u8) -> u8 {
        quality
            .saturating_sub(self.quality_reduction)
            .max(self.quality_floor)
    }

    fn split_cdn_url<'a>(&self, url: &'a str) -> Option<CdnParts<'a>> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let cdn_host = self.cdn_host.trim_start_matches('.');

        if cdn_host.is_empty()
            || !(host == cdn_host || host.ends_with(&format!(".{}", cdn_host)))
        {
            return None;
        }

        let split_at = url.find(UPLOAD_MARKER)?;
        let (base, rest) = url.split_at(split_at + UPLOAD_MARKER.len());
        let asset = asset_path(rest)?;

        Some(CdnParts { base, asset })
    }
}

/// Extracts the versioned path (`v123/name.jpg`) or public id from the part of a CDN
/// URL that follows `/upload/`, dropping any transformation segments in front of it.
fn asset_path(after_upload: &str) -> Option<String> {
    let segments: Vec<&str> = after_upload.split('/').collect();

    if let Some(version_at) = segments.iter().rposition(|s| is_version_segment(s))
        && version_at + 1 < segments.len()
    {
        return Some(segments[version_at..].join("/"));
    }

    // The last segment is always the public id, even when it looks like `my_pic`
    let last = segments.len().saturating_sub(1);
    let first_asset = segments[..last]
        .iter()
        .position(|s| !is_transformation_segment(s))
        .unwrap_or(last);
    let asset = segments.get(first_asset..)?.join("/");

    if asset.is_empty() { None } else { Some(asset) }
}

fn is_version_segment(segment: &str) -> bool {
    segment.len() > 1
        && segment.starts_with('v')
        && segment[1..].bytes().all(|b| b.is_ascii_digit())
}

/// A transformation segment is a comma list of `key_value` tokens such as `w_800`,
/// `q_auto:good` or `e_blur:2000`.
fn is_transformation_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.contains('.')
        && segment.split(',').all(|token| match token.split_once('_') {
            Some((key, value)) => {
                (1..=3).contains(&key.len())
                    && key.bytes().all(|b| b.is_ascii_lowercase())
                    && !value.is_empty()
            }
            None => false,
        })
}
