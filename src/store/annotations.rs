//! Authoritative highlight store
//!
//! Highlights live in a two-level map `file key -> page -> ordered list`.
//! Every mutation goes through this type, bumps [`AnnotationStore::revision`],
//! writes the whole map through to the storage backend and publishes
//! [`HighlightEvent::AnnotationsChanged`].

use crate::error::{Error, Result};
use crate::events::{EventBus, HighlightEvent};
use crate::highlight::{Highlight, HighlightType};
use crate::store::persistence::{MemoryStorage, StorageBackend, DEFAULT_STORAGE_KEY};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Highlights of one file, keyed by 1-based page number
pub type PageMap = BTreeMap<u32, Vec<Highlight>>;

/// Which highlight kinds are painted. Hidden kinds stay stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HighlightVisibility {
    pub search: bool,
    pub entity: bool,
    pub manual: bool,
}

impl HighlightVisibility {
    pub fn is_visible(&self, kind: HighlightType) -> bool {
        match kind {
            HighlightType::Search => self.search,
            HighlightType::Entity => self.entity,
            HighlightType::Manual => self.manual,
        }
    }

    pub fn set(&mut self, kind: HighlightType, visible: bool) {
        match kind {
            HighlightType::Search => self.search = visible,
            HighlightType::Entity => self.entity = visible,
            HighlightType::Manual => self.manual = visible,
        }
    }
}

impl Default for HighlightVisibility {
    fn default() -> Self {
        Self {
            search: true,
            entity: true,
            manual: true,
        }
    }
}

/// Pointer to the currently selected highlight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedHighlight {
    pub file_key: String,
    pub page: u32,
    pub id: String,
    pub kind: HighlightType,
}

/// Number of stored highlights per kind for one file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, JsonSchema)]
pub struct HighlightCounts {
    pub manual: usize,
    pub search: usize,
    pub entity: usize,
}

impl HighlightCounts {
    pub fn total(&self) -> usize {
        self.manual + self.search + self.entity
    }

    fn bump(&mut self, kind: HighlightType) {
        match kind {
            HighlightType::Manual => self.manual += 1,
            HighlightType::Search => self.search += 1,
            HighlightType::Entity => self.entity += 1,
        }
    }
}

/// In-memory highlight store with write-through persistence
pub struct AnnotationStore {
    files: BTreeMap<String, PageMap>,
    /// id -> (file key, page) for every stored highlight
    ids: HashMap<String, (String, u32)>,
    next_id: u64,
    active_file: Option<String>,
    selected: Option<SelectedHighlight>,
    visibility: HighlightVisibility,
    revision: u64,
    storage: Arc<dyn StorageBackend>,
    storage_key: String,
    events: Option<EventBus>,
}

impl AnnotationStore {
    /// Empty store backed by process memory
    pub fn new() -> Self {
        Self::load(Arc::new(MemoryStorage::new()), DEFAULT_STORAGE_KEY)
    }

    /// Create a store and rehydrate it from `storage`.
    ///
    /// Missing or corrupt data yields an empty store; individual malformed
    /// highlights are skipped. The id counter resumes after the largest
    /// numeric id found.
    pub fn load(storage: Arc<dyn StorageBackend>, storage_key: impl Into<String>) -> Self {
        let storage_key = storage_key.into();
        let mut store = Self {
            files: BTreeMap::new(),
            ids: HashMap::new(),
            next_id: 1,
            active_file: None,
            selected: None,
            visibility: HighlightVisibility::default(),
            revision: 0,
            storage,
            storage_key,
            events: None,
        };
        store.rehydrate();
        store
    }

    /// Publish change notifications on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn rehydrate(&mut self) {
        let raw = match self.storage.get_item(&self.storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    key = %self.storage_key,
                    "failed to read stored highlights"
                );
                return;
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "stored highlights are corrupt, starting empty");
                return;
            }
        };
        let Some(files) = value.as_object() else {
            tracing::warn!("stored highlights are not an object, starting empty");
            return;
        };

        let mut loaded = 0usize;
        for (file_key, pages) in files {
            let Some(pages) = pages.as_object() else {
                tracing::warn!(file_key = %file_key, "skipping stored file with malformed pages");
                continue;
            };
            for (page_key, list) in pages {
                let Some(page) = page_key.parse::<u32>().ok().filter(|p| *p >= 1) else {
                    tracing::warn!(
                        file_key = %file_key,
                        page = %page_key,
                        "skipping stored page with invalid number"
                    );
                    continue;
                };
                let Some(list) = list.as_array() else {
                    tracing::warn!(
                        file_key = %file_key,
                        page,
                        "skipping stored page that is not a list"
                    );
                    continue;
                };
                for item in list {
                    let mut highlight: Highlight = match serde_json::from_value(item.clone()) {
                        Ok(h) => h,
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                file_key = %file_key,
                                page,
                                "skipping malformed stored highlight"
                            );
                            continue;
                        }
                    };
                    if !highlight.is_finite() || self.ids.contains_key(&highlight.id) {
                        tracing::warn!(
                            id = %highlight.id,
                            file_key = %file_key,
                            page,
                            "skipping invalid or duplicate stored highlight"
                        );
                        continue;
                    }
                    highlight.file_key = Some(file_key.clone());
                    highlight.page = page;
                    self.insert_unchecked(file_key, page, highlight);
                    loaded += 1;
                }
            }
        }

        self.advance_counter();
        tracing::debug!(loaded, next_id = self.next_id, "rehydrated highlight store");
    }

    fn insert_unchecked(&mut self, file_key: &str, page: u32, highlight: Highlight) {
        self.ids
            .insert(highlight.id.clone(), (file_key.to_string(), page));
        self.files
            .entry(file_key.to_string())
            .or_default()
            .entry(page)
            .or_default()
            .push(highlight);
    }

    /// Move the counter past every numeric id currently stored
    fn advance_counter(&mut self) {
        let max = self.ids.keys().filter_map(|id| id.parse::<u64>().ok()).max();
        if let Some(max) = max {
            self.next_id = self.next_id.max(max.saturating_add(1));
        }
    }

    /// Record a mutation: bump the revision, write through, notify.
    fn commit(&mut self, file_key: &str) {
        self.revision += 1;
        self.persist();
        if let Some(events) = &self.events {
            events.publish(HighlightEvent::AnnotationsChanged {
                file_key: file_key.to_string(),
                revision: self.revision,
            });
        }
    }

    fn persist(&self) {
        let serialized = match serde_json::to_string(&self.files) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize highlights");
                return;
            }
        };
        if let Err(e) = self.storage.set_item(&self.storage_key, &serialized) {
            tracing::warn!(error = %e, key = %self.storage_key, "failed to persist highlights");
        }
    }

    fn resolve_file_key(&self, file_key: Option<&str>) -> Option<String> {
        file_key
            .map(str::to_string)
            .or_else(|| self.active_file.clone())
    }

    /// Currently active file, used whenever a file key is omitted
    pub fn active_file(&self) -> Option<&str> {
        self.active_file.as_deref()
    }

    pub fn set_active_file(&mut self, file_key: Option<String>) {
        self.active_file = file_key;
    }

    /// Monotonic counter bumped on every mutation
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Next id from the store-wide counter, shared by all kinds and files.
    ///
    /// Ids already in the store are skipped; the counter wraps back to 1
    /// after `u64::MAX`.
    pub fn next_id(&mut self) -> String {
        loop {
            let id = self.next_id.to_string();
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.ids.contains_key(&id) {
                return id;
            }
        }
    }

    /// Highlights on `page`, excluding any entry tagged with a different file
    pub fn get(&self, page: u32, file_key: Option<&str>) -> Vec<Highlight> {
        let Some(file_key) = self.resolve_file_key(file_key) else {
            return Vec::new();
        };
        let Some(list) = self.files.get(&file_key).and_then(|pages| pages.get(&page)) else {
            return Vec::new();
        };

        list.iter()
            .filter(|h| {
                let owned = h.belongs_to(&file_key);
                if !owned {
                    tracing::warn!(
                        id = %h.id,
                        file_key = %file_key,
                        page,
                        "dropping highlight tagged with another file"
                    );
                }
                owned
            })
            .cloned()
            .collect()
    }

    /// Append a highlight to `page` of the resolved file.
    ///
    /// Returns `false` without mutating when no file resolves, the highlight is
    /// invalid, tagged for another file, or its id is already stored.
    pub fn add(&mut self, page: u32, mut highlight: Highlight, file_key: Option<&str>) -> bool {
        let Some(file_key) = self.resolve_file_key(file_key) else {
            tracing::warn!(id = %highlight.id, page, "cannot add highlight without a file key");
            return false;
        };
        if page == 0 || !highlight.is_finite() || highlight.id.is_empty() {
            tracing::warn!(id = %highlight.id, page, "rejecting invalid highlight");
            return false;
        }
        if let Some(tagged) = highlight.file_key.as_deref() {
            if tagged != file_key {
                tracing::warn!(
                    id = %highlight.id,
                    expected = %file_key,
                    found = %tagged,
                    "rejecting highlight tagged with another file"
                );
                return false;
            }
        }
        if self.ids.contains_key(&highlight.id) {
            tracing::debug!(
                id = %highlight.id,
                file_key = %file_key,
                page,
                "duplicate highlight id ignored"
            );
            return false;
        }

        highlight.file_key = Some(file_key.clone());
        highlight.page = page;
        self.insert_unchecked(&file_key, page, highlight);
        self.commit(&file_key);
        true
    }

    /// Remove a highlight by id, dropping the page and file entries once empty
    pub fn remove(&mut self, page: u32, id: &str, file_key: Option<&str>) -> bool {
        let Some(file_key) = self.resolve_file_key(file_key) else {
            return false;
        };
        let removed = self.remove_where(&file_key, Some(page), |h| h.id == id);
        if removed == 0 {
            tracing::debug!(id, file_key = %file_key, page, "highlight to remove not found");
            return false;
        }
        true
    }

    /// Replace the stored highlight with the same id on `page`
    pub fn update(&mut self, page: u32, highlight: Highlight, file_key: Option<&str>) -> bool {
        let Some(file_key) = self.resolve_file_key(file_key) else {
            return false;
        };
        if !highlight.is_finite() {
            tracing::warn!(id = %highlight.id, "rejecting update with invalid geometry");
            return false;
        }
        if let Some(tagged) = highlight.file_key.as_deref() {
            if tagged != file_key {
                tracing::warn!(
                    id = %highlight.id,
                    expected = %file_key,
                    found = %tagged,
                    "rejecting update tagged with another file"
                );
                return false;
            }
        }

        let Some(slot) = self
            .files
            .get_mut(&file_key)
            .and_then(|pages| pages.get_mut(&page))
            .and_then(|list| list.iter_mut().find(|h| h.id == highlight.id))
        else {
            tracing::debug!(
                id = %highlight.id,
                file_key = %file_key,
                page,
                "highlight to update not found"
            );
            return false;
        };

        let mut highlight = highlight;
        highlight.file_key = Some(file_key.clone());
        highlight.page = page;
        let id = highlight.id.clone();
        let kind = highlight.kind;
        *slot = highlight;

        if let Some(selected) = self.selected.as_mut() {
            if selected.file_key == file_key && selected.page == page && selected.id == id {
                selected.kind = kind;
            }
        }

        self.commit(&file_key);
        true
    }

    /// Remove every highlight of `kind`, on one page or across the whole file
    pub fn clear_by_type(
        &mut self,
        kind: HighlightType,
        page: Option<u32>,
        file_key: Option<&str>,
    ) -> usize {
        let Some(file_key) = self.resolve_file_key(file_key) else {
            tracing::warn!(%kind, "cannot clear highlights without a file key");
            return 0;
        };
        self.remove_where(&file_key, page, |h| h.kind == kind)
    }

    /// Remove search highlights produced by `term`, or every search highlight when `None`
    pub fn clear_search_highlights(&mut self, term: Option<&str>, file_key: Option<&str>) -> usize {
        let Some(file_key) = self.resolve_file_key(file_key) else {
            return 0;
        };
        self.remove_where(&file_key, None, |h| {
            h.kind == HighlightType::Search
                && term.map_or(true, |t| h.search_term.as_deref() == Some(t))
        })
    }

    fn remove_where<F>(&mut self, file_key: &str, page: Option<u32>, predicate: F) -> usize
    where
        F: Fn(&Highlight) -> bool,
    {
        let Some(pages) = self.files.get_mut(file_key) else {
            return 0;
        };

        let mut removed: Vec<(u32, Highlight)> = Vec::new();
        for (page_num, list) in pages.iter_mut() {
            if page.is_some_and(|p| p != *page_num) {
                continue;
            }
            let (gone, kept): (Vec<Highlight>, Vec<Highlight>) =
                std::mem::take(list).into_iter().partition(|h| predicate(h));
            *list = kept;
            removed.extend(gone.into_iter().map(|h| (*page_num, h)));
        }
        pages.retain(|_, list| !list.is_empty());
        if pages.is_empty() {
            self.files.remove(file_key);
        }

        if removed.is_empty() {
            return 0;
        }

        for (_, h) in &removed {
            self.ids.remove(&h.id);
        }
        if let Some(selected) = &self.selected {
            if selected.file_key == file_key
                && removed
                    .iter()
                    .any(|(p, h)| *p == selected.page && h.id == selected.id)
            {
                self.selected = None;
            }
        }

        self.commit(file_key);
        removed.len()
    }

    /// Drop all data of the resolved file
    pub fn clear_all(&mut self, file_key: Option<&str>) -> bool {
        match self.resolve_file_key(file_key) {
            Some(file_key) => self.clear_for_file(&file_key),
            None => false,
        }
    }

    /// Drop all data of `file_key`
    pub fn clear_for_file(&mut self, file_key: &str) -> bool {
        if self.files.remove(file_key).is_none() {
            return false;
        }
        self.ids.retain(|_, (owner, _)| owner != file_key);
        if self
            .selected
            .as_ref()
            .is_some_and(|s| s.file_key == file_key)
        {
            self.selected = None;
        }
        self.commit(file_key);
        true
    }

    /// Serialize one file's pages as `{ "<page>": [Highlight, ...] }`
    pub fn export_file(&self, file_key: Option<&str>) -> Result<String> {
        let file_key = self.resolve_file_key(file_key).ok_or(Error::NoActiveFile)?;
        let empty = PageMap::new();
        let pages = self.files.get(&file_key).unwrap_or(&empty);
        Ok(serde_json::to_string(pages)?)
    }

    /// Replace one file's pages with previously exported data.
    ///
    /// Highlights are re-stamped with the target file key; ids that collide
    /// with highlights of other files get fresh ids. Returns `false` and leaves
    /// the store untouched on malformed input.
    pub fn import_file(&mut self, data: &str, file_key: Option<&str>) -> bool {
        let Some(file_key) = self.resolve_file_key(file_key) else {
            tracing::warn!("cannot import highlights without a file key");
            return false;
        };

        let parsed: PageMap = match serde_json::from_str(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, file_key = %file_key, "malformed highlight import");
                return false;
            }
        };
        if parsed.keys().any(|page| *page == 0)
            || parsed.values().flatten().any(|h| !h.is_finite())
        {
            tracing::warn!(
                file_key = %file_key,
                "highlight import contains invalid pages or geometry"
            );
            return false;
        }

        if let Some(previous) = self.files.remove(&file_key) {
            for h in previous.values().flatten() {
                self.ids.remove(&h.id);
            }
        }
        if self
            .selected
            .as_ref()
            .is_some_and(|s| s.file_key == file_key)
        {
            self.selected = None;
        }

        // Ids from the import must not push the counter below anything we hand out
        let imported_max = parsed
            .values()
            .flatten()
            .filter_map(Highlight::numeric_id)
            .max();
        if let Some(max) = imported_max {
            self.next_id = self.next_id.max(max.saturating_add(1));
        }

        for (page, list) in parsed {
            for mut highlight in list {
                if highlight.id.is_empty() || self.ids.contains_key(&highlight.id) {
                    let fresh = self.next_id();
                    tracing::debug!(
                        old = %highlight.id,
                        new = %fresh,
                        "re-stamping imported highlight id"
                    );
                    highlight.id = fresh;
                }
                highlight.file_key = Some(file_key.clone());
                highlight.page = page;
                self.insert_unchecked(&file_key, page, highlight);
            }
        }

        self.commit(&file_key);
        true
    }

    pub fn visibility(&self) -> HighlightVisibility {
        self.visibility
    }

    pub fn is_visible(&self, kind: HighlightType) -> bool {
        self.visibility.is_visible(kind)
    }

    pub fn set_visibility(&mut self, kind: HighlightType, visible: bool) {
        self.visibility.set(kind, visible);
    }

    /// Flip visibility of `kind`, returning the new state
    pub fn toggle_visibility(&mut self, kind: HighlightType) -> bool {
        let visible = !self.visibility.is_visible(kind);
        self.visibility.set(kind, visible);
        visible
    }

    /// Select a stored highlight. Returns `false` if it does not exist.
    pub fn select(&mut self, page: u32, id: &str, file_key: Option<&str>) -> bool {
        let Some(file_key) = self.resolve_file_key(file_key) else {
            return false;
        };
        let kind = self
            .files
            .get(&file_key)
            .and_then(|pages| pages.get(&page))
            .and_then(|list| list.iter().find(|h| h.id == id))
            .map(|h| h.kind);

        match kind {
            Some(kind) => {
                self.selected = Some(SelectedHighlight {
                    file_key,
                    page,
                    id: id.to_string(),
                    kind,
                });
                true
            }
            None => false,
        }
    }

    pub fn selection(&self) -> Option<&SelectedHighlight> {
        self.selected.as_ref()
    }

    /// The selected highlight itself
    pub fn selected(&self) -> Option<&Highlight> {
        let selected = self.selected.as_ref()?;
        self.files
            .get(&selected.file_key)?
            .get(&selected.page)?
            .iter()
            .find(|h| h.id == selected.id)
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    /// Files that currently hold highlights
    pub fn file_keys(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    pub fn has_file(&self, file_key: &str) -> bool {
        self.files.contains_key(file_key)
    }

    /// Snapshot of all pages of a file
    pub fn file_pages(&self, file_key: Option<&str>) -> PageMap {
        self.resolve_file_key(file_key)
            .and_then(|key| self.files.get(&key).cloned())
            .unwrap_or_default()
    }

    /// Per-kind totals for a file
    pub fn counts(&self, file_key: Option<&str>) -> HighlightCounts {
        let mut counts = HighlightCounts::default();
        if let Some(pages) = self
            .resolve_file_key(file_key)
            .and_then(|key| self.files.get(&key))
        {
            for h in pages.values().flatten() {
                counts.bump(h.kind);
            }
        }
        counts
    }

    /// Total number of stored highlights across all files
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Default for AnnotationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FILE_A: &str = "a.pdf-123";
    const FILE_B: &str = "b.pdf-456";

    fn highlight(id: &str, kind: HighlightType) -> Highlight {
        Highlight::new(id, kind, 10.0, 20.0, 30.0, 40.0)
    }

    fn store_with_active(file_key: &str) -> AnnotationStore {
        let mut store = AnnotationStore::new();
        store.set_active_file(Some(file_key.to_string()));
        store
    }

    #[test]
    fn test_add_and_get_defaults_to_active_file() {
        let mut store = store_with_active(FILE_A);
        assert!(store.add(1, highlight("h1", HighlightType::Manual), None));

        let page = store.get(1, None);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].file_key.as_deref(), Some(FILE_A));
        assert_eq!(page[0].page, 1);
        assert!(store.get(1, Some(FILE_B)).is_empty());
    }

    #[test]
    fn test_add_without_file_key_is_rejected() {
        let mut store = AnnotationStore::new();
        assert!(!store.add(1, highlight("h1", HighlightType::Manual), None));
        assert!(store.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected_across_files() {
        let mut store = AnnotationStore::new();
        assert!(store.add(1, highlight("dup", HighlightType::Entity), Some(FILE_A)));
        assert!(!store.add(2, highlight("dup", HighlightType::Entity), Some(FILE_B)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_add_rejects_highlight_tagged_for_other_file() {
        let mut store = AnnotationStore::new();
        let mut h = highlight("h1", HighlightType::Search);
        h.file_key = Some(FILE_B.to_string());
        assert!(!store.add(1, h, Some(FILE_A)));
    }

    #[test]
    fn test_get_filters_mismatched_entries() {
        let mut store = AnnotationStore::new();
        store.add(1, highlight("h1", HighlightType::Entity), Some(FILE_A));
        // Simulate a leaked entry written under the wrong file
        let mut leaked = highlight("h2", HighlightType::Entity);
        leaked.file_key = Some(FILE_B.to_string());
        store.files.get_mut(FILE_A).unwrap().get_mut(&1).unwrap().push(leaked);

        let page = store.get(1, Some(FILE_A));
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "h1");
    }

    #[test]
    fn test_remove_cleans_up_empty_entries_and_selection() {
        let mut store = store_with_active(FILE_A);
        store.add(3, highlight("h1", HighlightType::Manual), None);
        assert!(store.select(3, "h1", None));

        assert!(store.remove(3, "h1", None));
        assert!(!store.has_file(FILE_A));
        assert!(store.selection().is_none());
        assert!(!store.remove(3, "h1", None));
    }

    #[test]
    fn test_update_replaces_in_place() {
        let mut store = store_with_active(FILE_A);
        store.add(1, highlight("a", HighlightType::Manual), None);
        store.add(1, highlight("b", HighlightType::Manual), None);

        let mut changed = highlight("a", HighlightType::Manual);
        changed.color = "#123456".to_string();
        changed.w = 99.0;
        assert!(store.update(1, changed, None));

        let page = store.get(1, None);
        assert_eq!(page[0].id, "a");
        assert_eq!(page[0].color, "#123456");
        assert_eq!(page[0].w, 99.0);
        assert_eq!(page[1].id, "b");

        assert!(!store.update(1, highlight("missing", HighlightType::Manual), None));
    }

    #[test]
    fn test_clear_by_type_scoped_to_active_file() {
        let mut store = store_with_active(FILE_A);
        store.add(1, highlight("e1", HighlightType::Entity), None);
        store.add(1, highlight("e2", HighlightType::Entity), None);
        store.add(1, highlight("s1", HighlightType::Search), None);
        store.add(1, highlight("m1", HighlightType::Manual), Some(FILE_B));

        assert_eq!(store.clear_by_type(HighlightType::Search, None, None), 1);

        let counts = store.counts(Some(FILE_A));
        assert_eq!(counts.entity, 2);
        assert_eq!(counts.search, 0);
        assert_eq!(store.counts(Some(FILE_B)).manual, 1);
    }

    #[test]
    fn test_clear_by_type_single_page() {
        let mut store = store_with_active(FILE_A);
        store.add(1, highlight("e1", HighlightType::Entity), None);
        store.add(2, highlight("e2", HighlightType::Entity), None);
        assert!(store.select(1, "e1", None));

        assert_eq!(store.clear_by_type(HighlightType::Entity, Some(1), None), 1);
        assert!(store.get(1, None).is_empty());
        assert_eq!(store.get(2, None).len(), 1);
        assert!(store.selection().is_none());
    }

    #[test]
    fn test_clear_search_highlights_by_term() {
        let mut store = store_with_active(FILE_A);
        let mut foo = highlight("s1", HighlightType::Search);
        foo.search_term = Some("foo".to_string());
        let mut bar = highlight("s2", HighlightType::Search);
        bar.search_term = Some("bar".to_string());
        store.add(1, foo, None);
        store.add(1, bar, None);

        assert_eq!(store.clear_search_highlights(Some("foo"), None), 1);
        assert_eq!(store.get(1, None)[0].id, "s2");
    }

    #[test]
    fn test_clear_for_file() {
        let mut store = AnnotationStore::new();
        store.add(1, highlight("a", HighlightType::Manual), Some(FILE_A));
        store.add(1, highlight("b", HighlightType::Manual), Some(FILE_B));

        assert!(store.clear_for_file(FILE_A));
        assert!(!store.clear_for_file(FILE_A));
        assert_eq!(store.file_keys(), vec![FILE_B.to_string()]);
        // The id is free again once its file is gone
        assert!(store.add(1, highlight("a", HighlightType::Manual), Some(FILE_B)));
    }

    #[test]
    fn test_next_id_is_monotonic() {
        let mut store = AnnotationStore::new();
        assert_eq!(store.next_id(), "1");
        assert_eq!(store.next_id(), "2");
        assert_eq!(store.next_id(), "3");
    }

    #[test]
    fn test_rehydrate_advances_counter() {
        let blob = serde_json::json!({
            FILE_A: {
                "1": [
                    {"id": "3", "x": 0.0, "y": 0.0, "w": 1.0, "h": 1.0},
                    {"id": "7", "x": 0.0, "y": 0.0, "w": 1.0, "h": 1.0, "type": "ENTITY"}
                ],
                "2": [{"id": "2", "x": 0.0, "y": 0.0, "w": 1.0, "h": 1.0, "type": "SEARCH"}]
            }
        });
        let storage = Arc::new(MemoryStorage::with_item(
            DEFAULT_STORAGE_KEY,
            blob.to_string(),
        ));
        let mut store = AnnotationStore::load(storage, DEFAULT_STORAGE_KEY);

        assert_eq!(store.len(), 3);
        assert_eq!(store.next_id(), "8");
        let page = store.get(1, Some(FILE_A));
        assert_eq!(page[0].kind, HighlightType::Manual);
        assert_eq!(page[0].file_key.as_deref(), Some(FILE_A));
    }

    #[test]
    fn test_rehydrate_corrupt_storage_starts_empty() {
        let storage = Arc::new(MemoryStorage::with_item(DEFAULT_STORAGE_KEY, "{not json"));
        let mut store = AnnotationStore::load(storage, DEFAULT_STORAGE_KEY);
        assert!(store.is_empty());
        assert_eq!(store.next_id(), "1");
    }

    #[test]
    fn test_rehydrate_skips_malformed_items() {
        let blob = serde_json::json!({
            FILE_A: {
                "1": [
                    {"id": "1", "x": 0.0, "y": 0.0, "w": 1.0, "h": 1.0},
                    {"id": "2", "x": "left"},
                    "garbage"
                ],
                "zero": [{"id": "9", "x": 0.0, "y": 0.0, "w": 1.0, "h": 1.0}]
            },
            FILE_B: []
        });
        let storage = Arc::new(MemoryStorage::with_item(
            DEFAULT_STORAGE_KEY,
            blob.to_string(),
        ));
        let store = AnnotationStore::load(storage, DEFAULT_STORAGE_KEY);
        assert_eq!(store.len(), 1);
        assert_eq!(store.file_keys(), vec![FILE_A.to_string()]);
    }

    #[test]
    fn test_mutations_write_through() {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = AnnotationStore::load(storage.clone(), DEFAULT_STORAGE_KEY);
        store.add(1, highlight("5", HighlightType::Manual), Some(FILE_A));

        let raw = storage.get_item(DEFAULT_STORAGE_KEY).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value[FILE_A]["1"][0]["id"], "5");

        let mut reloaded = AnnotationStore::load(storage, DEFAULT_STORAGE_KEY);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.next_id(), "6");
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut store = store_with_active(FILE_A);
        let mut entity = highlight("e1", HighlightType::Entity);
        entity.text = Some("John Doe".to_string());
        store.add(1, entity, None);
        store.add(4, highlight("m1", HighlightType::Manual), None);

        let exported = store.export_file(None).unwrap();
        let before = store.file_pages(None);

        assert!(store.clear_for_file(FILE_A));
        assert!(store.import_file(&exported, None));
        assert_eq!(store.file_pages(None), before);
    }

    #[test]
    fn test_import_into_other_file_restamps() {
        let mut store = store_with_active(FILE_A);
        store.add(2, highlight("e1", HighlightType::Entity), None);
        let exported = store.export_file(None).unwrap();

        assert!(store.import_file(&exported, Some(FILE_B)));
        let imported = store.get(2, Some(FILE_B));
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].file_key.as_deref(), Some(FILE_B));
        assert_ne!(imported[0].id, "e1");
        assert_eq!(imported[0].x, 10.0);
        assert_eq!(imported[0].kind, HighlightType::Entity);
        // Original stays untouched
        assert_eq!(store.get(2, Some(FILE_A))[0].id, "e1");
    }

    #[test]
    fn test_import_malformed_returns_false() {
        let mut store = store_with_active(FILE_A);
        store.add(1, highlight("keep", HighlightType::Manual), None);

        assert!(!store.import_file("not json", None));
        assert!(!store.import_file(r#"{"0": []}"#, None));
        assert!(!store.import_file(r#"{"x": []}"#, None));
        assert_eq!(store.get(1, None).len(), 1);
    }

    const MAX_ID: &str = "18446744073709551615";

    #[test]
    fn test_rehydrate_with_largest_numeric_id() {
        let blob = serde_json::json!({
            FILE_A: {"1": [{"id": MAX_ID, "x": 0.0, "y": 0.0, "w": 1.0, "h": 1.0}]}
        });
        let storage = Arc::new(MemoryStorage::with_item(
            DEFAULT_STORAGE_KEY,
            blob.to_string(),
        ));
        let mut store = AnnotationStore::load(storage, DEFAULT_STORAGE_KEY);

        assert_eq!(store.len(), 1);
        assert_eq!(store.next_id(), "1");
        assert_eq!(store.next_id(), "2");
    }

    #[test]
    fn test_import_with_largest_numeric_id() {
        let mut store = store_with_active(FILE_A);
        let data = format!(
            r#"{{"1": [{{"id": "{}", "x": 1.0, "y": 1.0, "w": 5.0, "h": 5.0}}]}}"#,
            MAX_ID
        );

        assert!(store.import_file(&data, None));
        assert_eq!(store.get(1, None)[0].id, MAX_ID);
        let fresh = store.next_id();
        assert_ne!(fresh, MAX_ID);
        assert!(store.add(1, highlight(&fresh, HighlightType::Manual), None));
    }

    /// Storage whose reads and writes always fail
    struct BrokenStorage;

    impl StorageBackend for BrokenStorage {
        fn get_item(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::Storage {
                reason: "read failed".to_string(),
            })
        }

        fn set_item(&self, _key: &str, _value: &str) -> Result<()> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        }

        fn remove_item(&self, _key: &str) -> Result<()> {
            Err(Error::Storage {
                reason: "remove failed".to_string(),
            })
        }
    }

    #[test]
    fn test_storage_failures_keep_store_usable() {
        let mut store = AnnotationStore::load(Arc::new(BrokenStorage), DEFAULT_STORAGE_KEY);
        assert!(store.is_empty());
        assert_eq!(store.next_id(), "1");

        assert!(store.add(1, highlight("h1", HighlightType::Manual), Some(FILE_A)));
        assert!(store.add(2, highlight("h2", HighlightType::Entity), Some(FILE_A)));
        assert!(store.remove(1, "h1", Some(FILE_A)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.revision(), 3);
        assert_eq!(store.get(2, Some(FILE_A))[0].id, "h2");
    }

    #[test]
    fn test_visibility_toggles_do_not_touch_storage() {
        let mut store = store_with_active(FILE_A);
        store.add(1, highlight("s", HighlightType::Search), None);
        let revision = store.revision();

        assert!(!store.toggle_visibility(HighlightType::Search));
        assert!(!store.is_visible(HighlightType::Search));
        assert!(store.is_visible(HighlightType::Entity));
        assert_eq!(store.get(1, None).len(), 1);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn test_mutations_publish_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let mut store = AnnotationStore::new().with_events(bus);

        store.add(1, highlight("h", HighlightType::Manual), Some(FILE_A));
        assert_eq!(
            rx.try_recv().unwrap(),
            HighlightEvent::AnnotationsChanged {
                file_key: FILE_A.to_string(),
                revision: 1,
            }
        );
        // Rejected adds do not publish
        store.add(1, highlight("h", HighlightType::Manual), Some(FILE_A));
        assert!(rx.try_recv().is_err());
    }
}
