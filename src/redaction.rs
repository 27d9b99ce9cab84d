//! Redaction export
//!
//! Converts one file's stored highlights into the mapping the redaction
//! backend consumes. Boxes pass through [`correct`] so the redacted area is
//! the area the user saw highlighted, not the padded overlay.

use crate::error::{Error, Result};
use crate::highlight::{correct, BBox, Highlight, HighlightType};
use crate::store::AnnotationStore;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One area to redact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RedactionItem {
    pub bbox: BBox,
    pub entity_type: String,
    pub content: String,
    pub engine: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RedactionPage {
    pub page: u32,
    pub sensitive: Vec<RedactionItem>,
}

/// `{ pages: [ { page, sensitive: [ { bbox, entity_type, content, engine } ] } ] }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RedactionMapping {
    pub pages: Vec<RedactionPage>,
}

impl RedactionMapping {
    pub fn item_count(&self) -> usize {
        self.pages.iter().map(|p| p.sensitive.len()).sum()
    }
}

impl From<&Highlight> for RedactionItem {
    fn from(highlight: &Highlight) -> Self {
        let entity_type = match highlight.kind {
            HighlightType::Entity => highlight
                .entity
                .clone()
                .unwrap_or_else(|| HighlightType::Entity.as_str().to_string()),
            kind => kind.as_str().to_string(),
        };
        let engine = match highlight.kind {
            HighlightType::Entity => highlight.model.clone().unwrap_or_default(),
            kind => kind.as_str().to_ascii_lowercase(),
        };
        RedactionItem {
            bbox: correct(highlight),
            entity_type,
            content: highlight.text.clone().unwrap_or_default(),
            engine,
        }
    }
}

/// Redaction mapping for every highlight of the file, pages ascending.
///
/// Hidden kinds are included; visibility only affects painting.
pub fn build_redaction_mapping(
    store: &AnnotationStore,
    file_key: Option<&str>,
) -> Result<RedactionMapping> {
    let file_key = file_key
        .map(str::to_string)
        .or_else(|| store.active_file().map(str::to_string))
        .ok_or(Error::NoActiveFile)?;

    let pages = store
        .file_pages(Some(&file_key))
        .into_iter()
        .filter_map(|(page, list)| {
            let sensitive: Vec<RedactionItem> = list
                .iter()
                .filter(|h| h.belongs_to(&file_key))
                .map(RedactionItem::from)
                .collect();
            (!sensitive.is_empty()).then_some(RedactionPage { page, sensitive })
        })
        .collect();

    Ok(RedactionMapping { pages })
}
