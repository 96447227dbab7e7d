//! Viewport intersection tracking.
//!
//! The host reports element geometry and scroll position; the tracker decides when a
//! watched element first comes within `root_margin` of the viewport and fires its
//! callback once. Every watch is owned by a [`WatchGuard`] and is detached when the
//! guard drops, so a component that goes away can never be called back.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

/// How a watch behaves after its first intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observer {
    /// Disconnects after firing; the owner may re-arm it later.
    OneShot,
    /// Marks the element as seen for good. Leaving the viewport never clears it and the
    /// watch cannot be re-armed.
    Sticky,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObserverOptions {
    /// Pixels added above and below the viewport.
    pub root_margin: f64,
    /// Fraction of the element that must be inside the expanded viewport.
    pub threshold: f64,
}

impl ObserverOptions {
    pub fn new(root_margin: f64, threshold: f64) -> Self {
        Self {
            root_margin,
            threshold,
        }
    }
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self::new(300.0, 0.05)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub top: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(top: f64, height: f64) -> Self {
        Self { top, height }
    }
}

/// Vertical extent of an element in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub top: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(top: f64, height: f64) -> Self {
        Self { top, height }
    }

    pub fn intersects(&self, viewport: &Viewport, options: &ObserverOptions) -> bool {
        let low = viewport.top - options.root_margin;
        let high = viewport.top + viewport.height + options.root_margin;

        if self.height <= 0.0 {
            // Zero-height sentinels count as visible when their edge is in range
            return self.top >= low && self.top <= high;
        }

        let overlap = (self.top + self.height).min(high) - self.top.max(low);
        overlap > 0.0 && overlap / self.height >= options.threshold
    }
}

type EnterCallback = Box<dyn FnMut() + Send>;

struct Watch {
    options: ObserverOptions,
    bounds: Option<Bounds>,
    on_enter: EnterCallback,
    entered: Arc<AtomicBool>,
}

#[derive(Default)]
struct TrackerInner {
    next_id: u64,
    watches: HashMap<u64, Watch>,
}

#[derive(Clone, Default)]
pub struct VisibilityTracker {
    inner: Arc<Mutex<TrackerInner>>,
}

impl VisibilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts watching an element. Bounds may be unknown until the element is laid
    /// out; such a watch never fires until [`WatchGuard::set_bounds`] is called.
    pub fn watch<F>(
        &self,
        observer: Observer,
        options: ObserverOptions,
        bounds: Option<Bounds>,
        on_enter: F,
    ) -> WatchGuard
    where
        F: FnMut() + Send + 'static,
    {
        let entered = Arc::new(AtomicBool::new(false));
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.watches.insert(
            id,
            Watch {
                options,
                bounds,
                on_enter: Box::new(on_enter),
                entered: entered.clone(),
            },
        );

        WatchGuard {
            id,
            observer,
            options,
            tracker: Arc::downgrade(&self.inner),
            entered,
        }
    }

    /// Evaluates every watch against the viewport and fires the ones that entered.
    /// Returns how many fired.
    pub fn observe(&self, viewport: Viewport) -> usize {
        let mut fired: Vec<Watch> = {
            let mut inner = self.lock();
            let entering: Vec<u64> = inner
                .watches
                .iter()
                .filter(|(_, watch)| {
                    watch
                        .bounds
                        .is_some_and(|b| b.intersects(&viewport, &watch.options))
                })
                .map(|(id, _)| *id)
                .collect();

            entering
                .into_iter()
                .filter_map(|id| inner.watches.remove(&id))
                .collect()
        };

        // Callbacks run without the lock held so they may watch or re-arm freely
        for watch in fired.iter_mut() {
            watch.entered.store(true, Ordering::SeqCst);
            (watch.on_enter)();
        }

        fired.len()
    }

    /// Number of elements still being observed.
    pub fn active_watches(&self) -> usize {
        self.lock().watches.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped ownership of one watch. Dropping it detaches the element.
pub struct WatchGuard {
    id: u64,
    observer: Observer,
    options: ObserverOptions,
    tracker: Weak<Mutex<TrackerInner>>,
    entered: Arc<AtomicBool>,
}

impl WatchGuard {
    pub fn observer(&self) -> Observer {
        self.observer
    }

    /// True once the element has intersected. For sticky watches this never reverts.
    pub fn has_entered(&self) -> bool {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.tracker
            .upgrade()
            .is_some_and(|inner| lock_inner(&inner).watches.contains_key(&self.id))
    }

    pub fn set_bounds(&self, bounds: Bounds) {
        if let Some(inner) = self.tracker.upgrade()
            && let Some(watch) = lock_inner(&inner).watches.get_mut(&self.id)
        {
            watch.bounds = Some(bounds);
        }
    }

    /// Re-attaches a fired one-shot watch with a fresh callback and clears its
    /// entered flag. Sticky watches, and watches that have not fired, are left alone.
    pub fn rearm<F>(&mut self, bounds: Option<Bounds>, on_enter: F) -> bool
    where
        F: FnMut() + Send + 'static,
    {
        if self.observer == Observer::Sticky || !self.has_entered() {
            return false;
        }
        let Some(inner) = self.tracker.upgrade() else {
            return false;
        };

        self.entered.store(false, Ordering::SeqCst);
        lock_inner(&inner).watches.insert(
            self.id,
            Watch {
                options: self.options,
                bounds,
                on_enter: Box::new(on_enter),
                entered: self.entered.clone(),
            },
        );
        true
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.tracker.upgrade() {
            lock_inner(&inner).watches.remove(&self.id);
        }
    }
}

fn lock_inner(inner: &Mutex<TrackerInner>) -> std::sync::MutexGuard<'_, TrackerInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
