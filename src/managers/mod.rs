//! Highlight managers
//!
//! Managers turn backend payloads (or a user drag) plus page context into
//! highlight records and push them into an [`AnnotationSink`]. Dedup and
//! idempotency state lives in the injected [`ProcessingRegistry`].

pub mod entity;
pub mod manual;
pub mod pipeline;
pub mod registry;
pub mod search;

use crate::highlight::Highlight;
use crate::store::AnnotationStore;
use crate::viewport::PageViewport;
use schemars::JsonSchema;
use serde::Serialize;

pub use entity::{
    process_detection_mapping, EntityHighlightManager, EntityProcessOptions, ENTITY_BATCH_SIZE,
};
pub use manual::{ManualHighlightManager, MANUAL_DEBOUNCE, MIN_HIGHLIGHT_SIZE};
pub use pipeline::{run_detection, run_search};
pub use registry::{ProcessingRegistry, TrackerKind, RESET_THROTTLE};
pub use search::{search_fingerprint, SearchHighlightManager};

/// Where managers deliver highlights
pub trait AnnotationSink {
    /// Next id from the shared counter
    fn next_id(&mut self) -> String;

    /// Add a highlight; `false` if it was rejected (duplicate id, wrong file, ...)
    fn add_annotation(&mut self, page: u32, highlight: Highlight, file_key: Option<&str>) -> bool;

    /// File used when a manager was built without one
    fn active_file(&self) -> Option<String>;

    /// Remove search highlights of `term` (all terms when `None`), returns how many
    fn clear_search_highlights(&mut self, term: Option<&str>, file_key: &str) -> usize;
}

impl AnnotationSink for AnnotationStore {
    fn next_id(&mut self) -> String {
        AnnotationStore::next_id(self)
    }

    fn add_annotation(&mut self, page: u32, highlight: Highlight, file_key: Option<&str>) -> bool {
        self.add(page, highlight, file_key)
    }

    fn active_file(&self) -> Option<String> {
        AnnotationStore::active_file(self).map(str::to_string)
    }

    fn clear_search_highlights(&mut self, term: Option<&str>, file_key: &str) -> usize {
        AnnotationStore::clear_search_highlights(self, term, Some(file_key))
    }
}

/// Immutable page context a manager is constructed with
#[derive(Debug, Clone, PartialEq)]
pub struct PageContext {
    pub page_number: u32,
    pub file_key: Option<String>,
    pub viewport: PageViewport,
}

impl PageContext {
    pub fn new(page_number: u32, file_key: Option<String>, viewport: PageViewport) -> Self {
        Self {
            page_number,
            file_key,
            viewport,
        }
    }

    fn resolve_file_key(&self, sink: &dyn AnnotationSink) -> Option<String> {
        self.file_key.clone().or_else(|| sink.active_file())
    }
}

/// Outcome of one `process_highlights` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, JsonSchema)]
pub struct ProcessReport {
    /// Highlights accepted by the sink
    pub added: usize,
    /// Items dropped (malformed, duplicate, wrong file, rejected by sink)
    pub skipped: usize,
    /// Pages marked processed by this call
    pub pages_processed: Vec<u32>,
    /// True when the call did nothing because the page was already processed
    pub already_processed: bool,
}

impl ProcessReport {
    pub fn merge(&mut self, other: ProcessReport) {
        self.added += other.added;
        self.skipped += other.skipped;
        self.pages_processed.extend(other.pages_processed);
        self.already_processed |= other.already_processed;
    }
}
