use super::{
    DimensionCache, ImageCell, ImageRecord, MasonryLayout, MasonryPacker,
    visibility::{Bounds, Observer, VisibilityTracker, WatchGuard},
};
use crate::{GalleryConfig, delivery::DeliveryConfig};
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::debug;

/// Viewports narrower than `max_width` get at most `columns` columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Breakpoint {
    pub max_width: u32,
    pub columns: usize,
}

pub fn default_breakpoints() -> Vec<Breakpoint> {
    [(640, 1), (768, 2), (1024, 3), (1280, 4)]
        .into_iter()
        .map(|(max_width, columns)| Breakpoint { max_width, columns })
        .collect()
}

/// Column count for a viewport width. Breakpoints are checked narrowest first; wide
/// viewports get the requested count, and no breakpoint raises a count above it.
pub fn columns_for_width(
    breakpoints: &[Breakpoint],
    width: u32,
    requested: usize,
    max_columns: usize,
) -> usize {
    let requested = requested.clamp(1, max_columns.max(1));
    let mut sorted = breakpoints.to_vec();
    sorted.sort_by_key(|b| b.max_width);

    sorted
        .iter()
        .find(|b| width < b.max_width)
        .map(|b| b.columns.clamp(1, requested))
        .unwrap_or(requested)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GalleryViewState {
    pub visible_chunk_count: usize,
    pub column_count: usize,
    pub selected_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightboxKey {
    ArrowRight,
    ArrowLeft,
    Escape,
    Other,
}

impl LightboxKey {
    pub fn from_key_name(name: &str) -> Self {
        match name {
            "ArrowRight" => Self::ArrowRight,
            "ArrowLeft" => Self::ArrowLeft,
            "Escape" => Self::Escape,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GalleryView {
    /// The supplied list is empty; render the "no results" state.
    Empty,
    Grid {
        state: GalleryViewState,
        layout: MasonryLayout,
        visible_count: usize,
        total: usize,
        has_more: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LayoutKey {
    generation: u64,
    visible: usize,
    columns: usize,
}

/// Owns the view state of one mounted gallery: which chunks are revealed, how many
/// columns the viewport gets, and which image the lightbox shows.
pub struct GalleryController {
    config: GalleryConfig,
    delivery: Arc<DeliveryConfig>,
    cache: DimensionCache,
    packer: MasonryPacker,
    all_images: Arc<Vec<ImageRecord>>,
    images: Arc<Vec<ImageRecord>>,
    category: Option<String>,
    generation: u64,
    requested_columns: usize,
    state: GalleryViewState,
    scroll_locked: bool,
    pending_resize: Option<(u32, Instant)>,
    pending_reveal: Option<Instant>,
    sentinel: Option<WatchGuard>,
    sentinel_bounds: Option<Bounds>,
    layout: Option<(LayoutKey, Arc<MasonryLayout>)>,
    pack_count: usize,
}

impl GalleryController {
    pub fn new(
        config: GalleryConfig,
        delivery: Arc<DeliveryConfig>,
        cache: DimensionCache,
        images: Vec<ImageRecord>,
        requested_columns: Option<usize>,
    ) -> Self {
        let requested_columns = requested_columns
            .unwrap_or(config.default_columns)
            .clamp(1, config.max_columns.max(1));
        let packer = MasonryPacker::new(config.packer.clone());
        let images = Arc::new(images);

        Self {
            config,
            delivery,
            cache,
            packer,
            all_images: images.clone(),
            images,
            category: None,
            generation: 0,
            requested_columns,
            state: GalleryViewState {
                visible_chunk_count: 1,
                column_count: requested_columns,
                selected_index: None,
            },
            scroll_locked: false,
            pending_resize: None,
            pending_reveal: None,
            sentinel: None,
            sentinel_bounds: None,
            layout: None,
            pack_count: 0,
        }
    }

    pub fn state(&self) -> GalleryViewState {
        self.state
    }

    pub fn images(&self) -> &[ImageRecord] {
        &self.images
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    fn chunk_size(&self) -> usize {
        self.config.chunk_size.max(1)
    }

    pub fn visible_count(&self) -> usize {
        (self.state.visible_chunk_count * self.chunk_size()).min(self.images.len())
    }

    pub fn visible_images(&self) -> &[ImageRecord] {
        &self.images[..self.visible_count()]
    }

    pub fn has_more(&self) -> bool {
        self.state.visible_chunk_count * self.chunk_size() < self.images.len()
    }

    /// Sources of the next unrevealed chunk, for prefetching dimensions ahead of scroll.
    pub fn upcoming_sources(&self) -> Vec<String> {
        let start = self.visible_count();
        let end = (start + self.chunk_size()).min(self.images.len());
        self.images[start..end]
            .iter()
            .map(|image| image.src.clone())
            .collect()
    }

    /// Replaces the image list. Reveal state starts over at one chunk.
    pub fn set_images(&mut self, images: Vec<ImageRecord>) {
        self.all_images = Arc::new(images);
        self.category = None;
        self.replace_visible_list(self.all_images.clone());
    }

    /// Filters the list by category; `None` shows everything. Counts as a list change.
    pub fn set_category(&mut self, category: Option<String>) {
        let filtered = match &category {
            Some(wanted) => Arc::new(
                self.all_images
                    .iter()
                    .filter(|image| image.category.as_deref() == Some(wanted.as_str()))
                    .cloned()
                    .collect(),
            ),
            None => self.all_images.clone(),
        };
        self.category = category;
        self.replace_visible_list(filtered);
    }

    fn replace_visible_list(&mut self, images: Arc<Vec<ImageRecord>>) {
        self.images = images;
        self.generation += 1;
        self.state.visible_chunk_count = 1;
        self.pending_reveal = None;
        self.layout = None;
        if self.state.selected_index.is_some() {
            self.close();
        }
        self.rearm_sentinel();
        debug!(
            "Gallery list replaced: {} images, generation {}",
            self.images.len(),
            self.generation
        );
    }

    /// Watches the element below the last revealed image.
    pub fn attach_sentinel(&mut self, tracker: &VisibilityTracker, bounds: Option<Bounds>) {
        self.sentinel_bounds = bounds;
        self.sentinel = Some(tracker.watch(
            Observer::OneShot,
            self.config.sentinel_observer,
            bounds,
            || {},
        ));
    }

    pub fn set_sentinel_bounds(&mut self, bounds: Bounds) {
        self.sentinel_bounds = Some(bounds);
        if let Some(sentinel) = &self.sentinel {
            sentinel.set_bounds(bounds);
        }
    }

    pub fn detach_sentinel(&mut self) {
        self.sentinel = None;
    }

    fn rearm_sentinel(&mut self) {
        if let Some(sentinel) = self.sentinel.as_mut() {
            sentinel.rearm(self.sentinel_bounds, || {});
        }
    }

    /// Schedules one more chunk after the reveal delay. Returns false when everything
    /// is already revealed or a reveal is pending.
    pub fn request_more(&mut self, now: Instant) -> bool {
        if !self.has_more() || self.pending_reveal.is_some() {
            return false;
        }
        self.pending_reveal = Some(now + Duration::from_millis(self.config.reveal_delay_ms));
        true
    }

    /// Reveals the next chunk immediately.
    pub fn reveal_next_chunk(&mut self) -> bool {
        if !self.has_more() {
            return false;
        }
        self.state.visible_chunk_count += 1;
        if self.has_more() {
            self.rearm_sentinel();
        }
        debug!(
            "Revealed chunk {}: {} of {} images visible",
            self.state.visible_chunk_count,
            self.visible_count(),
            self.images.len()
        );
        true
    }

    /// Records a resize event; the column count follows once events stop for the
    /// debounce interval.
    pub fn resize(&mut self, viewport_width: u32, now: Instant) {
        self.pending_resize = Some((viewport_width, now));
    }

    /// Applies a viewport width immediately. Returns true if the column count changed.
    pub fn apply_viewport_width(&mut self, viewport_width: u32) -> bool {
        let columns = columns_for_width(
            &self.config.breakpoints,
            viewport_width,
            self.requested_columns,
            self.config.max_columns,
        );
        if columns == self.state.column_count {
            return false;
        }
        debug!(
            "Viewport width {} switches gallery from {} to {} columns",
            viewport_width, self.state.column_count, columns
        );
        self.state.column_count = columns;
        true
    }

    /// Runs timers: sentinel-triggered reveals, the reveal delay and the resize
    /// debounce. Returns true if anything visible changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        let mut changed = false;

        if self.sentinel.as_ref().is_some_and(WatchGuard::has_entered) {
            self.request_more(now);
        }

        if let Some(due) = self.pending_reveal
            && now >= due
        {
            self.pending_reveal = None;
            changed |= self.reveal_next_chunk();
        }

        let debounce = Duration::from_millis(self.config.resize_debounce_ms);
        if let Some((width, at)) = self.pending_resize
            && now.saturating_duration_since(at) >= debounce
        {
            self.pending_resize = None;
            changed |= self.apply_viewport_width(width);
        }

        changed
    }

    /// Packed layout of the revealed images. Only recomputed when the list, the number
    /// of revealed images or the column count changes.
    pub fn layout(&mut self) -> Arc<MasonryLayout> {
        let key = LayoutKey {
            generation: self.generation,
            visible: self.visible_count(),
            columns: self.state.column_count,
        };

        if let Some((cached, layout)) = &self.layout
            && *cached == key
        {
            return layout.clone();
        }

        let layout = Arc::new(self.packer.pack(
            self.visible_images(),
            self.state.column_count,
            &self.cache,
        ));
        self.pack_count += 1;
        self.layout = Some((key, layout.clone()));
        layout
    }

    /// How many times the layout has been packed.
    pub fn pack_count(&self) -> usize {
        self.pack_count
    }

    pub fn view(&mut self) -> GalleryView {
        if self.images.is_empty() {
            return GalleryView::Empty;
        }

        GalleryView::Grid {
            state: self.state,
            layout: (*self.layout()).clone(),
            visible_count: self.visible_count(),
            total: self.images.len(),
            has_more: self.has_more(),
        }
    }

    /// Builds the tile for a revealed image.
    pub fn create_cell(&self, index: usize) -> Option<ImageCell> {
        if index >= self.visible_count() {
            return None;
        }
        let image = &self.images[index];
        let (estimate, _) = self.packer.aspect_ratio_for(index, image, &self.cache);

        Some(
            ImageCell::new(
                image.clone(),
                index,
                self.cache.clone(),
                self.delivery.clone(),
                estimate,
            )
            .with_load_timeout(self.config.load_timeout_ms.map(Duration::from_millis)),
        )
    }

    /// Builds the tile for a revealed image and starts watching it with the cell
    /// observer options.
    pub fn mount_cell(
        &self,
        index: usize,
        tracker: &VisibilityTracker,
        bounds: Option<Bounds>,
    ) -> Option<ImageCell> {
        let mut cell = self.create_cell(index)?;
        cell.observe(tracker, self.config.cell_observer, bounds);
        Some(cell)
    }

    pub fn selected_image(&self) -> Option<&ImageRecord> {
        self.state
            .selected_index
            .and_then(|index| self.images.get(index))
    }

    pub fn is_scroll_locked(&self) -> bool {
        self.scroll_locked
    }

    /// Opens the lightbox and returns the neighbour URLs to preload.
    pub fn open(&mut self, index: usize) -> Vec<String> {
        if index >= self.images.len() {
            return Vec::new();
        }
        self.scroll_locked = true;
        self.select(index)
    }

    pub fn close(&mut self) {
        self.state.selected_index = None;
        self.scroll_locked = false;
    }

    pub fn next(&mut self) -> Vec<String> {
        match self.state.selected_index {
            Some(index) if !self.images.is_empty() => {
                self.select((index + 1) % self.images.len())
            }
            _ => Vec::new(),
        }
    }

    pub fn prev(&mut self) -> Vec<String> {
        match self.state.selected_index {
            Some(index) if !self.images.is_empty() => {
                let len = self.images.len();
                self.select((index + len - 1) % len)
            }
            _ => Vec::new(),
        }
    }

    /// Keyboard handling while the lightbox is open; ignored otherwise.
    pub fn handle_key(&mut self, key: LightboxKey) -> Vec<String> {
        if self.state.selected_index.is_none() {
            return Vec::new();
        }
        match key {
            LightboxKey::ArrowRight => self.next(),
            LightboxKey::ArrowLeft => self.prev(),
            LightboxKey::Escape => {
                self.close();
                Vec::new()
            }
            LightboxKey::Other => Vec::new(),
        }
    }

    pub fn lightbox_url(&self) -> Option<String> {
        self.selected_image()
            .map(|image| self.delivery.lightbox_url(&image.src))
    }

    fn select(&mut self, index: usize) -> Vec<String> {
        self.state.selected_index = Some(index);

        let len = self.images.len();
        let mut neighbours = vec![(index + 1) % len, (index + len - 1) % len];
        neighbours.dedup();
        neighbours
            .into_iter()
            .filter(|neighbour| *neighbour != index)
            .map(|neighbour| self.delivery.lightbox_url(&self.images[neighbour].src))
            .collect()
    }
}
