//! A single gallery tile and its load lifecycle.
//!
//! ```text
//! Idle -> Observing -> PlaceholderLoading -> Loaded
//!                   \-> Skipped -----------/
//! ```
//!
//! The host drives the cell: it mounts it against a tracker, calls [`ImageCell::poll`]
//! after scrolling, performs the returned [`LoadRequest`]s and reports each outcome
//! through [`ImageCell::on_load`] / [`ImageCell::on_error`].

use super::{DimensionCache, ImageRecord};
use crate::delivery::DeliveryConfig;
use serde::Serialize;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use super::visibility::{Bounds, Observer, ObserverOptions, VisibilityTracker, WatchGuard};

const SLOW_LOAD: Duration = Duration::from_secs(1);
const SLOW_LOAD_WARNING_INTERVAL: Duration = Duration::from_secs(5);

static LAST_SLOW_LOAD_WARNING: Mutex<Option<Instant>> = Mutex::new(None);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellPhase {
    Idle,
    Observing,
    /// Blurred placeholder and full image requested together.
    PlaceholderLoading,
    /// No smaller rendition exists, so only the full image was requested.
    Skipped,
    Loaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CellState {
    pub has_entered_viewport: bool,
    pub is_fully_loaded: bool,
    pub discovered_aspect_ratio: f64,
}

impl Default for CellState {
    fn default() -> Self {
        Self {
            has_entered_viewport: false,
            is_fully_loaded: false,
            discovered_aspect_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadKind {
    Placeholder,
    Full,
    /// Retry against the untransformed source after the optimized URL failed.
    Original,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadRequest {
    pub url: String,
    pub kind: LoadKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Optimized,
    Original,
    Exhausted,
}

/// Everything a renderer needs to draw the tile.
#[derive(Debug, Clone, Serialize)]
pub struct CellView {
    pub src: String,
    pub alt: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub phase: CellPhase,
    pub image_url: Option<String>,
    pub placeholder_url: Option<String>,
    pub show_placeholder: bool,
    pub aspect_ratio: f64,
    pub interactive: bool,
}

type SelectCallback = Box<dyn Fn(&ImageRecord, usize) + Send>;

pub struct ImageCell {
    record: ImageRecord,
    index: usize,
    cache: DimensionCache,
    delivery: Arc<DeliveryConfig>,
    estimated_aspect_ratio: f64,
    aspect_known: bool,
    phase: CellPhase,
    state: CellState,
    attempt: Attempt,
    full_url: Option<String>,
    placeholder_url: Option<String>,
    placeholder_ready: bool,
    load_started: Option<Instant>,
    load_timeout: Option<Duration>,
    watch: Option<WatchGuard>,
    mounted: bool,
    on_select: Option<SelectCallback>,
}

impl ImageCell {
    /// `estimated_aspect_ratio` reserves layout space until real dimensions are
    /// known; pass the ratio the packer used for this image.
    pub fn new(
        record: ImageRecord,
        index: usize,
        cache: DimensionCache,
        delivery: Arc<DeliveryConfig>,
        estimated_aspect_ratio: f64,
    ) -> Self {
        let mut state = CellState::default();
        let cached = cache.get(&record.src);
        if let Some(entry) = cached {
            state.discovered_aspect_ratio = entry.aspect_ratio;
        }

        Self {
            record,
            index,
            cache,
            delivery,
            estimated_aspect_ratio,
            aspect_known: cached.is_some(),
            phase: CellPhase::Idle,
            state,
            attempt: Attempt::Optimized,
            full_url: None,
            placeholder_url: None,
            placeholder_ready: false,
            load_started: None,
            load_timeout: None,
            watch: None,
            mounted: true,
            on_select: None,
        }
    }

    pub fn with_load_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn on_select<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ImageRecord, usize) + Send + 'static,
    {
        self.on_select = Some(Box::new(callback));
        self
    }

    pub fn record(&self) -> &ImageRecord {
        &self.record
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn phase(&self) -> CellPhase {
        self.phase
    }

    pub fn state(&self) -> CellState {
        self.state
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Ratio used to size the tile: measured when known, estimated otherwise.
    pub fn reserved_aspect_ratio(&self) -> f64 {
        if self.aspect_known {
            self.state.discovered_aspect_ratio
        } else {
            self.estimated_aspect_ratio
        }
    }

    /// Starts a sticky watch on the tile. Only an idle, mounted cell attaches.
    pub fn observe(
        &mut self,
        tracker: &VisibilityTracker,
        options: ObserverOptions,
        bounds: Option<Bounds>,
    ) {
        if !self.mounted || self.phase != CellPhase::Idle {
            return;
        }
        self.watch = Some(tracker.watch(Observer::Sticky, options, bounds, || {}));
        self.phase = CellPhase::Observing;
    }

    pub fn set_bounds(&self, bounds: Bounds) {
        if let Some(watch) = &self.watch {
            watch.set_bounds(bounds);
        }
    }

    /// Advances the cell after the tracker has observed a viewport. Returns the loads
    /// the host should start now.
    pub fn poll(&mut self, now: Instant) -> Vec<LoadRequest> {
        if !self.mounted {
            return Vec::new();
        }

        match self.phase {
            CellPhase::Observing => {
                if self.watch.as_ref().is_some_and(WatchGuard::has_entered) {
                    self.begin_loading(now)
                } else {
                    Vec::new()
                }
            }
            CellPhase::PlaceholderLoading | CellPhase::Skipped => self.check_timeout(now),
            CellPhase::Idle | CellPhase::Loaded => Vec::new(),
        }
    }

    fn begin_loading(&mut self, now: Instant) -> Vec<LoadRequest> {
        self.state.has_entered_viewport = true;
        // Sticky watches detach themselves after firing; the guard has nothing left to do
        self.watch = None;

        let full = self.delivery.cell_url(&self.record.src);
        let placeholder = self.delivery.placeholder_url(&self.record.src);
        self.full_url = Some(full.clone());
        self.load_started = Some(now);

        let mut requests = Vec::with_capacity(2);
        if placeholder != self.record.src && placeholder != full {
            self.phase = CellPhase::PlaceholderLoading;
            self.placeholder_url = Some(placeholder.clone());
            requests.push(LoadRequest {
                url: placeholder,
                kind: LoadKind::Placeholder,
            });
        } else {
            self.phase = CellPhase::Skipped;
        }

        requests.push(LoadRequest {
            url: full,
            kind: LoadKind::Full,
        });

        debug!(
            "Cell {} entered viewport, requesting {} loads",
            self.index,
            requests.len()
        );
        requests
    }

    fn check_timeout(&mut self, now: Instant) -> Vec<LoadRequest> {
        let (Some(timeout), Some(started)) = (self.load_timeout, self.load_started) else {
            return Vec::new();
        };
        if self.attempt == Attempt::Exhausted || now.duration_since(started) < timeout {
            return Vec::new();
        }

        debug!("Load of {} timed out after {:?}", self.record.src, timeout);
        match self.full_url.clone() {
            Some(url) => self.fail_attempt(&url, now),
            None => Vec::new(),
        }
    }

    /// Reports a decoded image. Returns false if the event was ignored.
    pub fn on_load(
        &mut self,
        url: &str,
        natural_width: u32,
        natural_height: u32,
        now: Instant,
    ) -> bool {
        if !self.mounted || self.phase == CellPhase::Loaded {
            return false;
        }

        if self.placeholder_url.as_deref() == Some(url) {
            self.placeholder_ready = true;
            return true;
        }

        if self.full_url.as_deref() != Some(url) {
            return false;
        }

        if let Some(started) = self.load_started {
            track_load_time(url, now.duration_since(started), now);
        }

        self.phase = CellPhase::Loaded;
        self.state.is_fully_loaded = true;
        if let Some(entry) = self.cache.put(&self.record.src, natural_width, natural_height) {
            self.state.discovered_aspect_ratio = entry.aspect_ratio;
            self.aspect_known = true;
        }
        true
    }

    /// Reports a failed load. The first failure of the optimized URL is retried once
    /// against the original source; after that the cell stays on its placeholder.
    pub fn on_error(&mut self, url: &str, now: Instant) -> Vec<LoadRequest> {
        if !self.mounted || self.phase == CellPhase::Loaded {
            return Vec::new();
        }
        if self.placeholder_url.as_deref() == Some(url) {
            debug!("Placeholder for {} failed to load", self.record.src);
            return Vec::new();
        }
        if self.full_url.as_deref() != Some(url) {
            return Vec::new();
        }

        self.fail_attempt(url, now)
    }

    fn fail_attempt(&mut self, url: &str, now: Instant) -> Vec<LoadRequest> {
        match self.attempt {
            Attempt::Optimized if url != self.record.src => {
                debug!(
                    "Optimized load of {} failed, retrying original",
                    self.record.src
                );
                self.attempt = Attempt::Original;
                self.full_url = Some(self.record.src.clone());
                self.load_started = Some(now);
                vec![LoadRequest {
                    url: self.record.src.clone(),
                    kind: LoadKind::Original,
                }]
            }
            Attempt::Exhausted => Vec::new(),
            _ => {
                debug!("Giving up on {}", self.record.src);
                self.attempt = Attempt::Exhausted;
                Vec::new()
            }
        }
    }

    /// Returns true if the selection callback ran. Only loaded tiles are interactive.
    pub fn click(&self) -> bool {
        if !self.mounted || self.phase != CellPhase::Loaded {
            return false;
        }
        match &self.on_select {
            Some(callback) => {
                callback(&self.record, self.index);
                true
            }
            None => false,
        }
    }

    /// Detaches the watch and drops the callbacks. Later load events are ignored.
    pub fn unmount(&mut self) {
        self.watch = None;
        self.on_select = None;
        self.mounted = false;
    }

    pub fn view(&self) -> CellView {
        let loaded = self.phase == CellPhase::Loaded;
        CellView {
            src: self.record.src.clone(),
            alt: self.record.alt.clone(),
            title: self.record.title.clone(),
            category: self.record.category.clone(),
            phase: self.phase,
            image_url: self.full_url.clone(),
            placeholder_url: self
                .placeholder_url
                .clone()
                .filter(|_| self.placeholder_ready),
            show_placeholder: !loaded,
            aspect_ratio: self.reserved_aspect_ratio(),
            interactive: loaded,
        }
    }
}

impl Drop for ImageCell {
    fn drop(&mut self) {
        self.unmount();
    }
}

fn track_load_time(url: &str, elapsed: Duration, now: Instant) {
    if elapsed <= SLOW_LOAD {
        return;
    }

    let mut last = LAST_SLOW_LOAD_WARNING
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if last.is_some_and(|at| now.saturating_duration_since(at) <= SLOW_LOAD_WARNING_INTERVAL) {
        return;
    }
    *last = Some(now);

    let name = url.rsplit('/').next().unwrap_or(url);
    warn!(
        "Slow image load detected: {} took {}ms",
        name,
        elapsed.as_millis()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::Viewport;

    const CDN_SRC: &str = "https://res.cloudinary.com/demo/image/upload/v1/lake.jpg";

    fn cell(src: &str) -> (ImageCell, DimensionCache) {
        let cache = DimensionCache::default();
        let cell = ImageCell::new(
            ImageRecord::new(src, "lake"),
            4,
            cache.clone(),
            Arc::new(DeliveryConfig::default()),
            1.25,
        );
        (cell, cache)
    }

    fn visible(cell: &mut ImageCell, tracker: &VisibilityTracker) -> Vec<LoadRequest> {
        cell.observe(
            tracker,
            ObserverOptions::new(300.0, 0.01),
            Some(Bounds::new(100.0, 200.0)),
        );
        tracker.observe(Viewport::new(0.0, 800.0));
        cell.poll(Instant::now())
    }

    #[test]
    fn test_idle_until_visible() {
        let tracker = VisibilityTracker::new();
        let (mut cell, _cache) = cell(CDN_SRC);
        assert_eq!(cell.phase(), CellPhase::Idle);
        assert_eq!(cell.reserved_aspect_ratio(), 1.25);

        cell.observe(
            &tracker,
            ObserverOptions::new(0.0, 0.01),
            Some(Bounds::new(5000.0, 200.0)),
        );
        assert_eq!(cell.phase(), CellPhase::Observing);

        tracker.observe(Viewport::new(0.0, 800.0));
        assert!(cell.poll(Instant::now()).is_empty());
        assert!(!cell.state().has_entered_viewport);
    }

    #[test]
    fn test_cdn_image_loads_placeholder_and_full() {
        let tracker = VisibilityTracker::new();
        let (mut cell, cache) = cell(CDN_SRC);
        let requests = visible(&mut cell, &tracker);

        assert_eq!(cell.phase(), CellPhase::PlaceholderLoading);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].kind, LoadKind::Placeholder);
        assert!(requests[0].url.contains("e_blur:2000"));
        assert_eq!(requests[1].kind, LoadKind::Full);
        assert!(requests[1].url.contains("w_800"));
        assert!(cell.state().has_entered_viewport);

        assert!(cell.on_load(&requests[0].url, 20, 15, Instant::now()));
        let view = cell.view();
        assert!(view.show_placeholder);
        assert!(view.placeholder_url.is_some());
        assert!(!view.interactive);

        assert!(cell.on_load(&requests[1].url, 1600, 1200, Instant::now()));
        assert_eq!(cell.phase(), CellPhase::Loaded);
        assert!(cell.state().is_fully_loaded);
        assert_eq!(cell.state().discovered_aspect_ratio, 0.75);
        assert_eq!(cache.get(CDN_SRC).unwrap().aspect_ratio, 0.75);
        assert!(!cell.view().show_placeholder);
        assert!(cell.view().interactive);
    }

    #[test]
    fn test_local_image_skips_placeholder() {
        let tracker = VisibilityTracker::new();
        let (mut cell, _cache) = cell("/photos/lake.jpg");
        let requests = visible(&mut cell, &tracker);

        assert_eq!(cell.phase(), CellPhase::Skipped);
        assert_eq!(
            requests,
            vec![LoadRequest {
                url: "/photos/lake.jpg".to_string(),
                kind: LoadKind::Full
            }]
        );
    }

    #[test]
    fn test_retries_original_once() {
        let tracker = VisibilityTracker::new();
        let (mut cell, _cache) = cell(CDN_SRC);
        let requests = visible(&mut cell, &tracker);
        let full = &requests[1].url;

        let retry = cell.on_error(full, Instant::now());
        assert_eq!(
            retry,
            vec![LoadRequest {
                url: CDN_SRC.to_string(),
                kind: LoadKind::Original
            }]
        );

        assert!(cell.on_error(CDN_SRC, Instant::now()).is_empty());
        assert_eq!(cell.phase(), CellPhase::PlaceholderLoading);
        assert!(cell.view().show_placeholder);
        assert!(!cell.click());
    }

    #[test]
    fn test_untransformed_failure_gives_up() {
        let tracker = VisibilityTracker::new();
        let (mut cell, _cache) = cell("/photos/lake.jpg");
        visible(&mut cell, &tracker);

        assert!(cell.on_error("/photos/lake.jpg", Instant::now()).is_empty());
        assert_eq!(cell.phase(), CellPhase::Skipped);
    }

    #[test]
    fn test_load_timeout_counts_as_failure() {
        let tracker = VisibilityTracker::new();
        let (cell, _cache) = cell(CDN_SRC);
        let mut cell = cell.with_load_timeout(Some(Duration::from_secs(10)));
        let start = Instant::now();
        cell.observe(
            &tracker,
            ObserverOptions::new(0.0, 0.0),
            Some(Bounds::new(0.0, 10.0)),
        );
        tracker.observe(Viewport::new(0.0, 100.0));
        assert_eq!(cell.poll(start).len(), 2);

        assert!(cell.poll(start + Duration::from_secs(5)).is_empty());
        let retry = cell.poll(start + Duration::from_secs(10));
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].kind, LoadKind::Original);

        assert!(cell.poll(start + Duration::from_secs(30)).is_empty());
        assert!(cell.poll(start + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_click_only_when_loaded() {
        let tracker = VisibilityTracker::new();
        let selected = Arc::new(Mutex::new(Vec::new()));
        let sink = selected.clone();
        let (cell, _cache) = cell(CDN_SRC);
        let mut cell = cell.on_select(move |record, index| {
            sink.lock().unwrap().push((record.src.clone(), index));
        });

        assert!(!cell.click());
        let requests = visible(&mut cell, &tracker);
        assert!(!cell.click());
        cell.on_load(&requests[1].url, 100, 100, Instant::now());
        assert!(cell.click());

        assert_eq!(*selected.lock().unwrap(), vec![(CDN_SRC.to_string(), 4)]);
    }

    #[test]
    fn test_unmount_ignores_late_events() {
        let tracker = VisibilityTracker::new();
        let (mut cell, cache) = cell(CDN_SRC);
        cell.observe(
            &tracker,
            ObserverOptions::default(),
            Some(Bounds::new(0.0, 100.0)),
        );
        assert_eq!(tracker.active_watches(), 1);

        cell.unmount();
        assert_eq!(tracker.active_watches(), 0);
        assert!(cell.poll(Instant::now()).is_empty());

        let url = DeliveryConfig::default().cell_url(CDN_SRC);
        assert!(!cell.on_load(&url, 100, 100, Instant::now()));
        assert!(cache.get(CDN_SRC).is_none());
    }

    #[test]
    fn test_dropping_cell_detaches_watch() {
        let tracker = VisibilityTracker::new();
        {
            let (mut cell, _cache) = cell(CDN_SRC);
            cell.observe(&tracker, ObserverOptions::default(), None);
            assert_eq!(tracker.active_watches(), 1);
        }
        assert_eq!(tracker.active_watches(), 0);
    }

    #[test]
    fn test_cached_dimensions_reserve_space() {
        let cache = DimensionCache::default();
        cache.put(CDN_SRC, 1000, 1500);
        let cell = ImageCell::new(
            ImageRecord::new(CDN_SRC, ""),
            0,
            cache,
            Arc::new(DeliveryConfig::default()),
            0.8,
        );
        assert_eq!(cell.reserved_aspect_ratio(), 1.5);
    }
}
