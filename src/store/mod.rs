//! Highlight store and its persistence backends

pub mod annotations;
pub mod persistence;

pub use annotations::{
    AnnotationStore, HighlightCounts, HighlightVisibility, PageMap, SelectedHighlight,
};
pub use persistence::{FileStorage, MemoryStorage, StorageBackend, DEFAULT_STORAGE_KEY};
