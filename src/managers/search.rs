//! Search highlight manager
//!
//! Unlike entity processing, search processing always clears the file's
//! tracking first: results for a file are repainted on every run, and a rerun
//! of the same term replaces that term's previous highlights. Ids are derived
//! from content, so identical matches collapse into one highlight.

use super::registry::{ProcessingRegistry, TrackerKind};
use super::{AnnotationSink, ProcessReport};
use crate::detection::SearchResultItem;
use crate::highlight::{Highlight, HighlightType, SEARCH_COLOR};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct SearchHighlightManager<'a> {
    results: &'a [SearchResultItem],
    file_key: Option<String>,
    search_term: Option<String>,
    registry: Arc<ProcessingRegistry>,
}

impl<'a> SearchHighlightManager<'a> {
    pub fn new(
        results: &'a [SearchResultItem],
        file_key: Option<String>,
        registry: Arc<ProcessingRegistry>,
    ) -> Self {
        Self {
            results,
            file_key,
            search_term: None,
            registry,
        }
    }

    /// Term the results came from; its earlier highlights are replaced
    pub fn with_search_term(mut self, term: impl Into<String>) -> Self {
        self.search_term = Some(term.into());
        self
    }

    pub fn process_highlights(&self, sink: &mut dyn AnnotationSink) -> ProcessReport {
        let mut report = ProcessReport::default();

        let Some(file_key) = self.file_key.clone().or_else(|| sink.active_file()) else {
            tracing::warn!(results = self.results.len(), "search processing skipped: no file key");
            return report;
        };

        self.registry.clear_file(TrackerKind::Search, &file_key);
        if let Some(term) = self.search_term.as_deref() {
            let cleared = sink.clear_search_highlights(Some(term), &file_key);
            if cleared > 0 {
                tracing::debug!(
                    file_key = %file_key,
                    term,
                    cleared,
                    "replaced previous search highlights"
                );
            }
        }

        let mut by_page: BTreeMap<u32, Vec<&SearchResultItem>> = BTreeMap::new();
        for item in self.results {
            if let Some(tagged) = item.file_key.as_deref() {
                if tagged != file_key {
                    tracing::warn!(
                        expected = %file_key,
                        found = %tagged,
                        page = item.page,
                        "dropping search result for another file"
                    );
                    report.skipped += 1;
                    continue;
                }
            }
            if item.page == 0 || !item.is_finite() {
                tracing::warn!(
                    page = item.page,
                    text = %item.text,
                    "dropping malformed search result"
                );
                report.skipped += 1;
                continue;
            }
            by_page.entry(item.page).or_default().push(item);
        }

        for (page, items) in by_page {
            for item in items {
                let fingerprint = search_fingerprint(&file_key, item);
                if !self
                    .registry
                    .record_emitted(TrackerKind::Search, &file_key, &fingerprint)
                {
                    report.skipped += 1;
                    continue;
                }
                let highlight = self.build_highlight(item, &file_key, fingerprint);
                if sink.add_annotation(page, highlight, Some(&file_key)) {
                    report.added += 1;
                } else {
                    report.skipped += 1;
                }
            }
            self.registry
                .mark_page_processed(TrackerKind::Search, &file_key, page);
            report.pages_processed.push(page);
        }

        tracing::debug!(
            file_key = %file_key,
            term = ?self.search_term,
            added = report.added,
            skipped = report.skipped,
            "search highlights processed"
        );
        report
    }

    fn build_highlight(
        &self,
        item: &SearchResultItem,
        file_key: &str,
        fingerprint: String,
    ) -> Highlight {
        let mut highlight = Highlight::new(
            format!("search-{}", fingerprint),
            HighlightType::Search,
            item.x,
            item.y,
            item.w,
            item.h,
        );
        highlight.color = item.color.clone().unwrap_or_else(|| SEARCH_COLOR.to_string());
        highlight.opacity = Some(HighlightType::Search.default_opacity());
        highlight.text = (!item.text.is_empty()).then(|| item.text.clone());
        highlight.search_term = self.search_term.clone();
        highlight.file_key = Some(file_key.to_string());
        highlight.page = item.page;
        highlight
    }
}

/// Content fingerprint with coordinates rounded to one decimal
pub fn search_fingerprint(file_key: &str, item: &SearchResultItem) -> String {
    format!(
        "{}-{}-{}-{:.1}-{:.1}-{:.1}-{:.1}",
        file_key, item.page, item.text, item.x, item.y, item.w, item.h
    )
}
