//! Payloads exchanged with the detection and search backends
//!
//! The backends themselves are external; this module defines the shapes they
//! return, lenient parsing that skips malformed items instead of failing the
//! whole payload, and the async traits the processing pipeline calls.

use crate::error::{Error, Result};
use crate::highlight::{BBox, HighlightType};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;

/// One detected sensitive span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SensitiveEntity {
    pub bbox: BBox,
    #[serde(default)]
    pub entity_type: String,
    /// Engine name: presidio, gliner or gemini
    #[serde(default)]
    pub engine: String,
    /// Detected text
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
}

/// Detections for one page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DetectionPage {
    pub page: u32,
    #[serde(default)]
    pub sensitive: Vec<SensitiveEntity>,
}

/// Detection result for one file: `{ pages: [ { page, sensitive: [...] } ] }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DetectionMapping {
    /// File the backend produced this mapping for, when it says so
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    #[serde(default)]
    pub pages: Vec<DetectionPage>,
}

impl DetectionMapping {
    /// Parse a JSON string, see [`DetectionMapping::from_value`]
    pub fn from_json(data: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(data).map_err(|e| Error::InvalidPayload {
            reason: format!("detection payload is not JSON: {}", e),
        })?;
        Ok(Self::from_value(&value))
    }

    /// Build a mapping from an untyped payload.
    ///
    /// Pages without a valid number and entities without a usable bbox are
    /// skipped with a warning; the rest of the payload is kept. A page with a
    /// missing `sensitive` list is kept with no entities.
    pub fn from_value(value: &Value) -> Self {
        let mut mapping = DetectionMapping {
            file_key: value
                .get("file_key")
                .or_else(|| value.get("fileKey"))
                .and_then(Value::as_str)
                .map(str::to_string),
            pages: Vec::new(),
        };

        let Some(pages) = value.get("pages").and_then(Value::as_array) else {
            tracing::warn!("detection payload has no pages list");
            return mapping;
        };

        for raw_page in pages {
            let Some(page) = raw_page
                .get("page")
                .and_then(Value::as_u64)
                .filter(|p| *p >= 1 && *p <= u32::MAX as u64)
            else {
                tracing::warn!(
                    page = ?raw_page.get("page"),
                    "skipping detection page without a valid number"
                );
                continue;
            };
            let page = page as u32;

            let mut entry = DetectionPage {
                page,
                sensitive: Vec::new(),
            };
            match raw_page.get("sensitive").and_then(Value::as_array) {
                Some(items) => {
                    for item in items {
                        match serde_json::from_value::<SensitiveEntity>(item.clone()) {
                            Ok(entity) if entity.bbox.is_finite() => entry.sensitive.push(entity),
                            Ok(_) => {
                                tracing::warn!(page, "skipping entity with non-finite bbox");
                            }
                            Err(e) => {
                                tracing::warn!(page, error = %e, "skipping malformed entity");
                            }
                        }
                    }
                }
                None => tracing::warn!(page, "detection page has no sensitive list"),
            }
            mapping.pages.push(entry);
        }

        mapping
    }

    /// Entities reported for `page`, across every entry for that page
    pub fn entities_for_page(&self, page: u32) -> impl Iterator<Item = &SensitiveEntity> {
        self.pages
            .iter()
            .filter(move |p| p.page == page)
            .flat_map(|p| p.sensitive.iter())
    }

    /// Distinct page numbers, ascending
    pub fn page_numbers(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.pages.iter().map(|p| p.page).collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }

    pub fn entity_count(&self) -> usize {
        self.pages.iter().map(|p| p.sensitive.len()).sum()
    }
}

/// One search match in the flat shape the search manager consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchResultItem {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl SearchResultItem {
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.w.is_finite() && self.h.is_finite()
    }
}

/// Match bbox as returned by the search backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SearchMatch {
    pub bbox: BBox,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PageSearchMatches {
    pub page: u32,
    #[serde(default)]
    pub matches: Vec<SearchMatch>,
}

/// Search backend response for one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FileSearchResult {
    pub file_key: String,
    #[serde(default)]
    pub pages: Vec<PageSearchMatches>,
}

impl FileSearchResult {
    /// Flatten into search manager input.
    ///
    /// Boxes get the same padding as entity highlights, so the redaction
    /// export can undo both the same way.
    pub fn to_search_items(&self) -> Vec<SearchResultItem> {
        let padding = HighlightType::Search.padding();
        self.pages
            .iter()
            .flat_map(|page| {
                page.matches.iter().map(move |m| {
                    let (x, y, w, h) = padding.expand(&m.bbox);
                    SearchResultItem {
                        page: page.page,
                        x,
                        y,
                        w,
                        h,
                        text: m.text.clone(),
                        file_key: Some(self.file_key.clone()),
                        color: None,
                    }
                })
            })
            .collect()
    }

    pub fn match_count(&self) -> usize {
        self.pages.iter().map(|p| p.matches.len()).sum()
    }
}

/// Entity lists and tuning passed to the detection backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DetectionRequest {
    pub file_keys: Vec<String>,
    #[serde(default)]
    pub presidio_entities: Vec<String>,
    #[serde(default)]
    pub gliner_entities: Vec<String>,
    #[serde(default)]
    pub gemini_entities: Vec<String>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub ban_list: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SearchRequest {
    pub file_keys: Vec<String>,
    pub term: String,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub regex: bool,
}

/// Entity-detection service
pub trait DetectionBackend: Send + Sync {
    /// Detections keyed by file key
    fn detect(
        &self,
        request: &DetectionRequest,
    ) -> impl Future<Output = Result<HashMap<String, DetectionMapping>>> + Send;
}

/// Text search service
pub trait SearchBackend: Send + Sync {
    fn search(
        &self,
        request: &SearchRequest,
    ) -> impl Future<Output = Result<Vec<FileSearchResult>>> + Send;
}
