//! Backend call followed by manager processing
//!
//! The backend is awaited before the store is locked, so a failed or slow
//! call never leaves the store partially updated.

use super::entity::{process_detection_mapping, EntityProcessOptions};
use super::registry::ProcessingRegistry;
use super::search::SearchHighlightManager;
use super::ProcessReport;
use crate::detection::{DetectionBackend, DetectionRequest, SearchBackend, SearchRequest};
use crate::error::Result;
use crate::store::AnnotationStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Detect entities for the requested files and store the resulting highlights
pub async fn run_detection<B: DetectionBackend>(
    backend: &B,
    request: &DetectionRequest,
    store: &RwLock<AnnotationStore>,
    registry: &Arc<ProcessingRegistry>,
    options: &EntityProcessOptions,
) -> Result<BTreeMap<String, ProcessReport>> {
    let mappings = backend.detect(request).await?;

    let mut reports = BTreeMap::new();
    let mut store = store.write().await;
    for (file_key, mapping) in &mappings {
        if !request.file_keys.is_empty() && !request.file_keys.contains(file_key) {
            tracing::warn!(
                file_key = %file_key,
                "detection returned a file that was not requested"
            );
            continue;
        }
        let report = process_detection_mapping(
            mapping,
            Some(file_key.as_str()),
            options,
            registry,
            &mut *store,
        );
        reports.insert(file_key.clone(), report);
    }
    Ok(reports)
}

/// Search the requested files and replace the term's highlights with the matches
pub async fn run_search<B: SearchBackend>(
    backend: &B,
    request: &SearchRequest,
    store: &RwLock<AnnotationStore>,
    registry: &Arc<ProcessingRegistry>,
) -> Result<BTreeMap<String, ProcessReport>> {
    let results = backend.search(request).await?;

    let mut reports = BTreeMap::new();
    let mut store = store.write().await;
    for result in &results {
        let items = result.to_search_items();
        let report =
            SearchHighlightManager::new(&items, Some(result.file_key.clone()), Arc::clone(registry))
                .with_search_term(request.term.clone())
                .process_highlights(&mut *store);
        reports.insert(result.file_key.clone(), report);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{DetectionMapping, FileSearchResult, PageSearchMatches, SearchMatch};
    use crate::error::Error;
    use crate::highlight::BBox;
    use crate::managers::TrackerKind;
    use serde_json::json;
    use std::collections::HashMap;

    const FILE_A: &str = "a.pdf-123";

    struct FakeDetector {
        fail: bool,
    }

    impl DetectionBackend for FakeDetector {
        async fn detect(
            &self,
            _request: &DetectionRequest,
        ) -> Result<HashMap<String, DetectionMapping>> {
            if self.fail {
                return Err(Error::InvalidPayload {
                    reason: "backend unavailable".to_string(),
                });
            }
            let mapping = DetectionMapping::from_value(&json!({
                "pages": [{"page": 1, "sensitive": [{
                    "bbox": {"x0": 100.0, "y0": 200.0, "x1": 150.0, "y1": 230.0},
                    "entity_type": "PERSON",
                    "engine": "presidio",
                    "content": "John Doe"
                }]}]
            }));
            Ok(HashMap::from([(FILE_A.to_string(), mapping)]))
        }
    }

    struct FakeSearch {
        x: f64,
    }

    impl SearchBackend for FakeSearch {
        async fn search(&self, _request: &SearchRequest) -> Result<Vec<FileSearchResult>> {
            Ok(vec![FileSearchResult {
                file_key: FILE_A.to_string(),
                pages: vec![PageSearchMatches {
                    page: 1,
                    matches: vec![SearchMatch {
                        bbox: BBox::new(self.x, 30.0, self.x + 20.0, 40.0),
                        text: "foo".to_string(),
                    }],
                }],
            }])
        }
    }

    fn detection_request() -> DetectionRequest {
        DetectionRequest {
            file_keys: vec![FILE_A.to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_detection_stores_entities() {
        let store = RwLock::new(AnnotationStore::new());
        let registry = Arc::new(ProcessingRegistry::new());

        let reports = run_detection(
            &FakeDetector { fail: false },
            &detection_request(),
            &store,
            &registry,
            &EntityProcessOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(reports[FILE_A].added, 1);
        assert_eq!(store.read().await.counts(Some(FILE_A)).entity, 1);
        assert!(registry.is_page_processed(TrackerKind::Entity, FILE_A, 1));
    }

    #[tokio::test]
    async fn test_run_detection_failure_leaves_store_untouched() {
        let store = RwLock::new(AnnotationStore::new());
        let registry = Arc::new(ProcessingRegistry::new());

        let result = run_detection(
            &FakeDetector { fail: true },
            &detection_request(),
            &store,
            &registry,
            &EntityProcessOptions::default(),
        )
        .await;

        assert!(result.is_err());
        assert!(store.read().await.is_empty());
        assert!(!registry.has_processed(TrackerKind::Entity, FILE_A));
    }

    #[tokio::test]
    async fn test_run_detection_skips_unrequested_files() {
        let store = RwLock::new(AnnotationStore::new());
        let registry = Arc::new(ProcessingRegistry::new());
        let request = DetectionRequest {
            file_keys: vec!["other.pdf-1".to_string()],
            ..Default::default()
        };

        let reports = run_detection(
            &FakeDetector { fail: false },
            &request,
            &store,
            &registry,
            &EntityProcessOptions::default(),
        )
        .await
        .unwrap();
        assert!(reports.is_empty());
        assert!(store.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_search_replaces_term() {
        let store = RwLock::new(AnnotationStore::new());
        let registry = Arc::new(ProcessingRegistry::new());
        let request = SearchRequest {
            file_keys: vec![FILE_A.to_string()],
            term: "foo".to_string(),
            ..Default::default()
        };

        run_search(&FakeSearch { x: 20.0 }, &request, &store, &registry)
            .await
            .unwrap();
        run_search(&FakeSearch { x: 80.0 }, &request, &store, &registry)
            .await
            .unwrap();

        let stored = store.read().await.get(1, Some(FILE_A));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].x, 75.0);
    }
}
