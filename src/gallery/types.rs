use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// One photograph as supplied by the caller. `src` is the identity key used by the
/// dimension cache, the packer and the cells, so it must be unique within a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub src: String,
    #[serde(default)]
    pub alt: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl ImageRecord {
    pub fn new(src: impl Into<String>, alt: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            alt: alt.into(),
            title: None,
            category: None,
            width: None,
            height: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Height over width, when the caller supplied a usable intrinsic size.
    pub fn known_aspect_ratio(&self) -> Option<f64> {
        match (self.width, self.height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => {
                Some(height as f64 / width as f64)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionEntry {
    pub width: u32,
    pub height: u32,
    /// height / width
    pub aspect_ratio: f64,
    pub timestamp: SystemTime,
}

/// Where a layout aspect ratio came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectSource {
    Cache,
    Record,
    Estimate,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LayoutQuery {
    pub width: Option<u32>,
    pub columns: Option<usize>,
    pub chunks: Option<usize>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformQuery {
    pub src: String,
    pub width: Option<u32>,
    pub quality: Option<u8>,
    #[serde(default)]
    pub critical: bool,
}
