use crate::{
    delivery::{DeliveryConfig, ResponsiveSources, TransformOptions},
    gallery::{
        DimensionEntry, Gallery, GalleryView, ImageRecord, LayoutQuery, TransformQuery,
    },
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use std::{collections::BTreeMap, time::UNIX_EPOCH};

/// Chunks revealed per request are capped so one call cannot pack an unbounded list.
const MAX_CHUNKS_PER_REQUEST: usize = 100;

#[derive(Debug, Serialize)]
pub struct GalleryItem {
    pub index: usize,
    pub src: String,
    pub alt: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub url: String,
    pub placeholder: String,
    pub lightbox: String,
    #[serde(flatten)]
    pub sources: ResponsiveSources,
}

#[derive(Debug, Serialize)]
pub struct GalleryLayoutResponse {
    pub empty: bool,
    pub view: GalleryView,
    pub items: Vec<GalleryItem>,
}

#[derive(Debug, Serialize)]
pub struct TransformResponse {
    pub url: String,
    pub placeholder: String,
    pub is_cdn: bool,
    #[serde(flatten)]
    pub sources: ResponsiveSources,
}

#[derive(Debug, Serialize)]
pub struct PrefetchResponse {
    pub scheduled: usize,
}

#[derive(Debug, Serialize)]
pub struct DimensionsResponse {
    pub count: usize,
    pub entries: BTreeMap<String, DimensionInfo>,
}

#[derive(Debug, Serialize)]
pub struct DimensionInfo {
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    /// Seconds since the Unix epoch when the entry was measured.
    pub measured_at: u64,
}

impl From<DimensionEntry> for DimensionInfo {
    fn from(entry: DimensionEntry) -> Self {
        Self {
            width: entry.width,
            height: entry.height,
            aspect_ratio: entry.aspect_ratio,
            measured_at: entry
                .timestamp
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// Packs the first `chunks` chunks of the gallery for a viewport.
pub fn build_layout(gallery: &Gallery, query: &LayoutQuery) -> GalleryLayoutResponse {
    let mut controller = gallery.controller(query.columns);
    if query.category.is_some() {
        controller.set_category(query.category.clone());
    }
    if let Some(width) = query.width {
        controller.apply_viewport_width(width);
    }

    let chunks = query.chunks.unwrap_or(1).clamp(1, MAX_CHUNKS_PER_REQUEST);
    for _ in 1..chunks {
        if !controller.reveal_next_chunk() {
            break;
        }
    }

    let view = controller.view();
    let critical_count = controller.state().column_count;
    let delivery = gallery.delivery();

    let items = controller
        .visible_images()
        .iter()
        .enumerate()
        .map(|(index, image)| {
            let critical = index < critical_count;
            gallery_item(index, image, critical, delivery)
        })
        .collect();

    GalleryLayoutResponse {
        empty: controller.is_empty(),
        view,
        items,
    }
}

fn gallery_item(
    index: usize,
    image: &ImageRecord,
    critical: bool,
    delivery: &DeliveryConfig,
) -> GalleryItem {
    let mut options = TransformOptions::new(delivery.cell_width, delivery.cell_quality);
    options.critical = critical;

    GalleryItem {
        index,
        src: image.src.clone(),
        alt: image.alt.clone(),
        title: image.title.clone(),
        category: image.category.clone(),
        url: delivery.optimize_url(&image.src, &options),
        placeholder: delivery.placeholder_url(&image.src),
        lightbox: delivery.lightbox_url(&image.src),
        sources: delivery.responsive_srcset(&image.src, critical),
    }
}

pub async fn gallery_layout_handler(
    State(app_state): State<crate::AppState>,
    Query(query): Query<LayoutQuery>,
) -> Json<GalleryLayoutResponse> {
    let response = build_layout(&app_state.gallery, &query);
    tracing::debug!(
        "Gallery layout: {} items, empty={}",
        response.items.len(),
        response.empty
    );
    Json(response)
}

pub async fn transform_handler(
    State(app_state): State<crate::AppState>,
    Query(query): Query<TransformQuery>,
) -> Result<Json<TransformResponse>, StatusCode> {
    if query.src.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let delivery = app_state.gallery.delivery();
    let options = TransformOptions {
        width: query.width,
        quality: query.quality,
        critical: query.critical,
    };

    Ok(Json(TransformResponse {
        url: delivery.optimize_url(&query.src, &options),
        placeholder: delivery.placeholder_url(&query.src),
        is_cdn: delivery.is_cdn_url(&query.src),
        sources: delivery.responsive_srcset(&query.src, query.critical),
    }))
}

pub async fn prefetch_handler(State(app_state): State<crate::AppState>) -> impl IntoResponse {
    let scheduled = Gallery::start_background_prefetch(app_state.gallery.clone());
    tracing::info!("Scheduled dimension prefetch for {} images", scheduled);
    (StatusCode::ACCEPTED, Json(PrefetchResponse { scheduled }))
}

pub async fn dimensions_handler(
    State(app_state): State<crate::AppState>,
) -> Json<DimensionsResponse> {
    let entries: BTreeMap<String, DimensionInfo> = app_state
        .gallery
        .cache()
        .snapshot()
        .into_iter()
        .map(|(src, entry)| (src, entry.into()))
        .collect();

    Json(DimensionsResponse {
        count: entries.len(),
        entries,
    })
}
