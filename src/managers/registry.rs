//! Per-file processing state shared by all manager instances
//!
//! Tracks, per manager kind and file key, which pages have been processed and
//! which highlight fingerprints have been emitted. State is always keyed by
//! file; resetting one file never touches another.

use crate::events::{EventBus, HighlightEvent};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Minimum time between two resets of the same file's tracking
pub const RESET_THROTTLE: Duration = Duration::from_millis(500);

/// Which manager family a tracker belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerKind {
    Entity,
    Search,
}

#[derive(Debug, Default)]
struct FileTracking {
    processed_pages: BTreeSet<u32>,
    emitted: HashSet<String>,
}

#[derive(Default)]
struct RegistryInner {
    tracking: HashMap<(TrackerKind, String), FileTracking>,
    last_reset: HashMap<(TrackerKind, String), Instant>,
}

impl RegistryInner {
    fn entry(&mut self, kind: TrackerKind, file_key: &str) -> &mut FileTracking {
        self.tracking
            .entry((kind, file_key.to_string()))
            .or_default()
    }

    fn get(&self, kind: TrackerKind, file_key: &str) -> Option<&FileTracking> {
        self.tracking.get(&(kind, file_key.to_string()))
    }
}

/// Injected replacement for class-level "processed" bookkeeping
pub struct ProcessingRegistry {
    inner: Mutex<RegistryInner>,
    reset_throttle: Duration,
    events: Option<EventBus>,
}

impl ProcessingRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            reset_throttle: RESET_THROTTLE,
            events: None,
        }
    }

    pub fn with_reset_throttle(mut self, throttle: Duration) -> Self {
        self.reset_throttle = throttle;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn is_page_processed(&self, kind: TrackerKind, file_key: &str, page: u32) -> bool {
        self.inner
            .lock()
            .get(kind, file_key)
            .is_some_and(|t| t.processed_pages.contains(&page))
    }

    pub fn mark_page_processed(&self, kind: TrackerKind, file_key: &str, page: u32) {
        self.inner
            .lock()
            .entry(kind, file_key)
            .processed_pages
            .insert(page);
    }

    pub fn unmark_page(&self, kind: TrackerKind, file_key: &str, page: u32) {
        if let Some(t) = self
            .inner
            .lock()
            .tracking
            .get_mut(&(kind, file_key.to_string()))
        {
            t.processed_pages.remove(&page);
        }
    }

    /// Processed pages of a file, ascending
    pub fn processed_pages(&self, kind: TrackerKind, file_key: &str) -> Vec<u32> {
        self.inner
            .lock()
            .get(kind, file_key)
            .map(|t| t.processed_pages.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether any page of the file has been processed
    pub fn has_processed(&self, kind: TrackerKind, file_key: &str) -> bool {
        self.inner
            .lock()
            .get(kind, file_key)
            .is_some_and(|t| !t.processed_pages.is_empty())
    }

    /// Record a fingerprint; returns `false` if it was already emitted for this file
    pub fn record_emitted(&self, kind: TrackerKind, file_key: &str, fingerprint: &str) -> bool {
        self.inner
            .lock()
            .entry(kind, file_key)
            .emitted
            .insert(fingerprint.to_string())
    }

    pub fn has_emitted(&self, kind: TrackerKind, file_key: &str, fingerprint: &str) -> bool {
        self.inner
            .lock()
            .get(kind, file_key)
            .is_some_and(|t| t.emitted.contains(fingerprint))
    }

    pub fn emitted_count(&self, kind: TrackerKind, file_key: &str) -> usize {
        self.inner
            .lock()
            .get(kind, file_key)
            .map_or(0, |t| t.emitted.len())
    }

    /// Files with any tracking state for `kind`
    pub fn tracked_files(&self, kind: TrackerKind) -> Vec<String> {
        let mut files: Vec<String> = self
            .inner
            .lock()
            .tracking
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, file)| file.clone())
            .collect();
        files.sort();
        files
    }

    /// Drop a file's tracking for one kind immediately (explicit force)
    pub fn clear_file(&self, kind: TrackerKind, file_key: &str) {
        self.inner
            .lock()
            .tracking
            .remove(&(kind, file_key.to_string()));
    }

    /// Drop everything known about a file (file closed)
    pub fn remove_file(&self, file_key: &str) {
        {
            let mut inner = self.inner.lock();
            inner.tracking.retain(|(_, file), _| file != file_key);
            inner.last_reset.retain(|(_, file), _| file != file_key);
        }
        if let Some(events) = &self.events {
            events.publish(HighlightEvent::FileClosed {
                file_key: file_key.to_string(),
            });
        }
    }

    /// Throttled reset, see [`ProcessingRegistry::reset_file_at`]
    pub fn reset_file(&self, kind: TrackerKind, file_key: &str) -> bool {
        self.reset_file_at(kind, file_key, Instant::now())
    }

    /// Reset a file's tracking unless it was reset within the throttle window.
    ///
    /// Settings changes tend to fire in bursts; only the first reset in a
    /// window clears state and broadcasts [`HighlightEvent::ReprocessRequested`].
    pub fn reset_file_at(&self, kind: TrackerKind, file_key: &str, now: Instant) -> bool {
        {
            let mut inner = self.inner.lock();
            let key = (kind, file_key.to_string());
            if let Some(last) = inner.last_reset.get(&key) {
                if now.saturating_duration_since(*last) < self.reset_throttle {
                    tracing::debug!(file_key, ?kind, "reset throttled");
                    return false;
                }
            }
            inner.tracking.remove(&key);
            inner.last_reset.insert(key, now);
        }

        self.announce_reset(kind, file_key);
        true
    }

    /// Reset a file's tracking regardless of the throttle window.
    ///
    /// Broadcasts [`HighlightEvent::ReprocessRequested`] and restarts the window.
    pub fn force_reset_file(&self, kind: TrackerKind, file_key: &str) {
        {
            let mut inner = self.inner.lock();
            let key = (kind, file_key.to_string());
            inner.tracking.remove(&key);
            inner.last_reset.insert(key, Instant::now());
        }
        self.announce_reset(kind, file_key);
    }

    fn announce_reset(&self, kind: TrackerKind, file_key: &str) {
        tracing::debug!(file_key, ?kind, "tracking reset");
        if let Some(events) = &self.events {
            events.publish(HighlightEvent::ReprocessRequested {
                file_key: file_key.to_string(),
            });
        }
    }
}

impl Default for ProcessingRegistry {
    fn default() -> Self {
        Self::new()
    }
}
