//! Manual highlight manager
//!
//! Builds a highlight from the two corners of a user drag. Every accepted
//! drag is a distinct highlight; there is no content dedup, only a short
//! debounce per manager instance against doubled mouse events.

use super::{AnnotationSink, PageContext};
use crate::highlight::{now_millis, Highlight, HighlightType, MANUAL_COLOR};
use std::time::{Duration, Instant};

/// Smallest accepted width and height, in viewport units
pub const MIN_HIGHLIGHT_SIZE: f64 = 2.0;

/// Minimum time between two highlights from the same instance
pub const MANUAL_DEBOUNCE: Duration = Duration::from_millis(100);

pub struct ManualHighlightManager {
    context: PageContext,
    instance_id: String,
    color: String,
    min_size: f64,
    debounce: Duration,
    last_created: Option<Instant>,
}

impl ManualHighlightManager {
    pub fn new(context: PageContext) -> Self {
        Self {
            context,
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
            color: MANUAL_COLOR.to_string(),
            min_size: MIN_HIGHLIGHT_SIZE,
            debounce: MANUAL_DEBOUNCE,
            last_created: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    /// Color for highlights created from now on
    pub fn set_color(&mut self, color: impl Into<String>) {
        self.color = color.into();
    }

    pub fn with_min_size(mut self, min_size: f64) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn context(&self) -> &PageContext {
        &self.context
    }

    /// See [`ManualHighlightManager::create_rectangle_highlight_at`]
    pub fn create_rectangle_highlight(
        &mut self,
        sink: &mut dyn AnnotationSink,
        start: (f64, f64),
        end: (f64, f64),
    ) -> Option<Highlight> {
        self.create_rectangle_highlight_at(sink, start, end, Instant::now())
    }

    /// Create and store a highlight spanning the drag from `start` to `end`.
    ///
    /// Corners may come in any order. Returns `None` for drags smaller than
    /// the minimum size, calls inside the debounce window, and highlights the
    /// sink rejects.
    pub fn create_rectangle_highlight_at(
        &mut self,
        sink: &mut dyn AnnotationSink,
        start: (f64, f64),
        end: (f64, f64),
        now: Instant,
    ) -> Option<Highlight> {
        let (x0, y0) = start;
        let (x1, y1) = end;
        let w = (x1 - x0).abs();
        let h = (y1 - y0).abs();
        if !(w.is_finite() && h.is_finite()) || w < self.min_size || h < self.min_size {
            tracing::trace!(w, h, "manual drag too small");
            return None;
        }

        if let Some(last) = self.last_created {
            if now.saturating_duration_since(last) < self.debounce {
                tracing::debug!(instance_id = %self.instance_id, "manual highlight debounced");
                return None;
            }
        }

        let Some(file_key) = self.context.resolve_file_key(sink) else {
            tracing::warn!(page = self.context.page_number, "manual highlight without a file key");
            return None;
        };

        let timestamp = now_millis();
        let id = format!(
            "manual-{}-{}-{}",
            uuid::Uuid::new_v4().simple(),
            timestamp,
            self.instance_id
        );
        let mut highlight = Highlight::new(id, HighlightType::Manual, x0.min(x1), y0.min(y1), w, h);
        highlight.color = self.color.clone();
        highlight.opacity = Some(HighlightType::Manual.default_opacity());
        highlight.file_key = Some(file_key.clone());
        highlight.page = self.context.page_number;
        highlight.timestamp = timestamp;
        highlight.instance_id = Some(self.instance_id.clone());

        if !sink.add_annotation(self.context.page_number, highlight.clone(), Some(&file_key)) {
            return None;
        }
        self.last_created = Some(now);
        Some(highlight)
    }
}
