//! Per-page alignment between viewport units and the rendered canvas
//!
//! The tracker keeps the last published [`PageSizeInfo`] per page. Render
//! completion measures right away; window resizes are coalesced with a
//! trailing debounce and flushed by the caller's event loop. A page's size is
//! only republished when it moved by more than the epsilon, so re-measuring
//! never causes a render feedback loop.

use super::{PageSizeInfo, PageViewport, ScreenRect};
use crate::events::{EventBus, HighlightEvent};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Minimum change in CSS pixels before a new size is published
pub const ALIGNMENT_EPSILON: f64 = 1.0;

/// Quiet period after the last resize before pages are re-measured
pub const ALIGNMENT_DEBOUNCE: Duration = Duration::from_millis(100);

/// What the renderer reports for one page when asked to measure it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageMeasurement {
    pub canvas: ScreenRect,
    pub wrapper: ScreenRect,
    pub viewport: PageViewport,
}

/// Page sizes of one file
pub struct AlignmentTracker {
    file_key: String,
    sizes: BTreeMap<u32, PageSizeInfo>,
    /// Time of the most recent unflushed resize
    pending_since: Option<Instant>,
    debounce: Duration,
    epsilon: f64,
    events: Option<EventBus>,
}

impl AlignmentTracker {
    pub fn new(file_key: impl Into<String>) -> Self {
        Self {
            file_key: file_key.into(),
            sizes: BTreeMap::new(),
            pending_since: None,
            debounce: ALIGNMENT_DEBOUNCE,
            epsilon: ALIGNMENT_EPSILON,
            events: None,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon.max(0.0);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn file_key(&self) -> &str {
        &self.file_key
    }

    /// Last published size of `page`
    pub fn page_size(&self, page: u32) -> Option<&PageSizeInfo> {
        self.sizes.get(&page)
    }

    /// Pages with a published size, ascending
    pub fn pages(&self) -> Vec<u32> {
        self.sizes.keys().copied().collect()
    }

    /// Page finished rendering: measure now.
    ///
    /// Returns the new size if it was published.
    pub fn on_page_rendered(
        &mut self,
        page: u32,
        measurement: &PageMeasurement,
    ) -> Option<PageSizeInfo> {
        let size = PageSizeInfo::measure(
            &measurement.canvas,
            &measurement.wrapper,
            &measurement.viewport,
        )?;
        self.apply(page, size).then_some(size)
    }

    /// Window or container resized; re-measure once things settle
    pub fn on_resize(&mut self, now: Instant) {
        self.pending_since = Some(now);
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// When the pending re-measure becomes due, if any
    pub fn due_at(&self) -> Option<Instant> {
        self.pending_since.map(|since| since + self.debounce)
    }

    /// Re-measure every known page if the debounce window has passed.
    ///
    /// `measure` returns `None` for pages that are no longer rendered; those
    /// keep their last size. Returns the pages whose size was republished.
    pub fn flush<F>(&mut self, now: Instant, mut measure: F) -> Vec<u32>
    where
        F: FnMut(u32) -> Option<PageMeasurement>,
    {
        match self.due_at() {
            Some(due) if now >= due => {}
            _ => return Vec::new(),
        }
        self.pending_since = None;

        let mut changed = Vec::new();
        for page in self.pages() {
            let Some(measurement) = measure(page) else {
                continue;
            };
            let Some(size) = PageSizeInfo::measure(
                &measurement.canvas,
                &measurement.wrapper,
                &measurement.viewport,
            ) else {
                continue;
            };
            if self.apply(page, size) {
                changed.push(page);
            }
        }
        tracing::trace!(changed = changed.len(), "alignment flush");
        changed
    }

    /// Page left the DOM (virtualized away or document closed)
    pub fn forget_page(&mut self, page: u32) {
        self.sizes.remove(&page);
    }

    pub fn clear(&mut self) {
        self.sizes.clear();
        self.pending_since = None;
    }

    fn apply(&mut self, page: u32, size: PageSizeInfo) -> bool {
        if let Some(previous) = self.sizes.get(&page) {
            if !size.differs_from(previous, self.epsilon) {
                return false;
            }
        }
        self.sizes.insert(page, size);
        if let Some(events) = &self.events {
            events.publish(HighlightEvent::PageSizeChanged {
                file_key: self.file_key.clone(),
                page,
                size,
            });
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE_A: &str = "a.pdf-123";
    const FILE_B: &str = "b.pdf-456";

    fn measurement(canvas_width: f64, left: f64) -> PageMeasurement {
        PageMeasurement {
            canvas: ScreenRect::new(left, 0.0, canvas_width, canvas_width * 1.5),
            wrapper: ScreenRect::new(0.0, 0.0, 1000.0, 1500.0),
            viewport: PageViewport::new(400.0, 600.0, 1.0),
        }
    }

    #[test]
    fn test_render_publishes_first_measurement() {
        let mut tracker = AlignmentTracker::new(FILE_A);
        let size = tracker.on_page_rendered(1, &measurement(800.0, 0.0)).unwrap();
        assert_eq!(size.scale_x, 2.0);
        assert_eq!(tracker.page_size(1), Some(&size));
    }

    #[test]
    fn test_sub_epsilon_changes_are_ignored() {
        let mut tracker = AlignmentTracker::new(FILE_A);
        tracker.on_page_rendered(1, &measurement(800.0, 0.0));
        assert!(tracker.on_page_rendered(1, &measurement(800.5, 0.4)).is_none());
        assert_eq!(tracker.page_size(1).unwrap().css_width, 800.0);

        assert!(tracker.on_page_rendered(1, &measurement(802.0, 0.0)).is_some());
    }

    #[test]
    fn test_resize_is_debounced() {
        let mut tracker = AlignmentTracker::new(FILE_A);
        tracker.on_page_rendered(1, &measurement(800.0, 0.0));
        tracker.on_page_rendered(2, &measurement(800.0, 0.0));

        let start = Instant::now();
        tracker.on_resize(start);
        tracker.on_resize(start + Duration::from_millis(60));

        let mut calls = 0;
        let early = tracker.flush(start + Duration::from_millis(120), |_| {
            calls += 1;
            Some(measurement(600.0, 0.0))
        });
        assert!(early.is_empty());
        assert_eq!(calls, 0);
        assert!(tracker.is_pending());

        let changed = tracker.flush(start + Duration::from_millis(161), |_| {
            Some(measurement(600.0, 0.0))
        });
        assert_eq!(changed, vec![1, 2]);
        assert!(!tracker.is_pending());
        assert_eq!(tracker.page_size(2).unwrap().scale_x, 1.5);
    }

    #[test]
    fn test_flush_keeps_unmeasurable_pages() {
        let mut tracker = AlignmentTracker::new(FILE_A);
        tracker.on_page_rendered(1, &measurement(800.0, 0.0));
        let now = Instant::now();
        tracker.on_resize(now);

        let changed = tracker.flush(now + ALIGNMENT_DEBOUNCE, |_| None);
        assert!(changed.is_empty());
        assert_eq!(tracker.page_size(1).unwrap().css_width, 800.0);
    }

    #[test]
    fn test_publishes_size_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let mut tracker = AlignmentTracker::new(FILE_A).with_events(bus);

        tracker.on_page_rendered(3, &measurement(800.0, 0.0));
        tracker.on_page_rendered(3, &measurement(800.0, 0.0));

        assert!(matches!(
            rx.try_recv().unwrap(),
            HighlightEvent::PageSizeChanged { page: 3, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_size_events_name_their_file() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let mut first = AlignmentTracker::new(FILE_A).with_events(bus.clone());
        let mut second = AlignmentTracker::new(FILE_B).with_events(bus);

        first.on_page_rendered(1, &measurement(800.0, 0.0));
        second.on_page_rendered(1, &measurement(600.0, 0.0));

        let from_first = rx.try_recv().unwrap();
        let from_second = rx.try_recv().unwrap();
        assert_eq!(from_first.file_key(), FILE_A);
        assert_eq!(from_second.file_key(), FILE_B);
        assert!(matches!(
            from_second,
            HighlightEvent::PageSizeChanged { page: 1, size, .. } if size.css_width == 600.0
        ));
    }
}
