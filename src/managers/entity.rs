//! Entity highlight manager
//!
//! Turns one page of a detection payload into padded entity highlights.
//! Processing is idempotent per (file, page): once a page is marked processed
//! in the registry, later calls skip it unless `force_reprocess` is set. Ids
//! carry a random component, so identical detections from two forced passes
//! are stored twice.

use super::registry::{ProcessingRegistry, TrackerKind};
use super::{AnnotationSink, PageContext, ProcessReport};
use crate::detection::{DetectionMapping, SensitiveEntity};
use crate::highlight::{now_millis, EntityModel, Highlight, HighlightType};
use crate::viewport::{PageViewport, TextContent};
use std::sync::Arc;

/// Entities handed to the sink per batch
pub const ENTITY_BATCH_SIZE: usize = 10;

pub struct EntityHighlightManager<'a> {
    context: PageContext,
    detection_mapping: &'a DetectionMapping,
    text_content: Option<&'a TextContent>,
    force_reprocess: bool,
    batch_size: usize,
    registry: Arc<ProcessingRegistry>,
    instance_id: String,
}

impl<'a> EntityHighlightManager<'a> {
    pub fn new(
        context: PageContext,
        detection_mapping: &'a DetectionMapping,
        registry: Arc<ProcessingRegistry>,
    ) -> Self {
        Self {
            context,
            detection_mapping,
            text_content: None,
            force_reprocess: false,
            batch_size: ENTITY_BATCH_SIZE,
            registry,
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Text layer used to fill in entity text the backend left empty
    pub fn with_text_content(mut self, text_content: &'a TextContent) -> Self {
        self.text_content = Some(text_content);
        self
    }

    pub fn force_reprocess(mut self, force: bool) -> Self {
        self.force_reprocess = force;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Emit highlights for the context page.
    ///
    /// The page is marked processed only after every entity of this call has
    /// been handed to the sink, including when there were none.
    pub fn process_highlights(&self, sink: &mut dyn AnnotationSink) -> ProcessReport {
        let page = self.context.page_number;
        let mut report = ProcessReport::default();

        let Some(file_key) = self.context.resolve_file_key(sink) else {
            tracing::warn!(page, "entity processing skipped: no file key");
            return report;
        };

        if let Some(tagged) = self.detection_mapping.file_key.as_deref() {
            if tagged != file_key {
                report.skipped = self.detection_mapping.entities_for_page(page).count();
                tracing::warn!(
                    expected = %file_key,
                    found = %tagged,
                    page,
                    "detection payload belongs to another file"
                );
                return report;
            }
        }

        if self.force_reprocess {
            self.registry
                .unmark_page(TrackerKind::Entity, &file_key, page);
        } else if self
            .registry
            .is_page_processed(TrackerKind::Entity, &file_key, page)
        {
            tracing::debug!(file_key = %file_key, page, "page already processed, skipping");
            report.already_processed = true;
            return report;
        }

        let entities: Vec<&SensitiveEntity> =
            self.detection_mapping.entities_for_page(page).collect();

        for (batch_index, batch) in entities.chunks(self.batch_size).enumerate() {
            for entity in batch {
                let highlight = self.build_highlight(entity, &file_key, sink);
                if sink.add_annotation(page, highlight, Some(&file_key)) {
                    report.added += 1;
                } else {
                    report.skipped += 1;
                }
            }
            tracing::trace!(
                file_key = %file_key,
                page,
                batch_index,
                size = batch.len(),
                "entity batch emitted"
            );
        }

        self.registry
            .mark_page_processed(TrackerKind::Entity, &file_key, page);
        report.pages_processed.push(page);
        tracing::debug!(
            file_key = %file_key,
            page,
            added = report.added,
            "entity highlights processed"
        );
        report
    }

    fn build_highlight(
        &self,
        entity: &SensitiveEntity,
        file_key: &str,
        sink: &mut dyn AnnotationSink,
    ) -> Highlight {
        let page = self.context.page_number;
        if !self.context.viewport.overlaps(&entity.bbox) {
            tracing::debug!(
                page,
                entity_type = %entity.entity_type,
                "entity bbox lies outside the page viewport"
            );
        }

        let (x, y, w, h) = HighlightType::Entity.padding().expand(&entity.bbox);
        let model = EntityModel::parse(&entity.engine);
        let sequence = sink.next_id();
        let id = entity_highlight_id(file_key, page, &entity.entity_type, &sequence);

        let text = if entity.content.is_empty() {
            self.text_content
                .and_then(|content| content.text_within(&entity.bbox))
        } else {
            Some(entity.content.clone())
        };

        let mut highlight = Highlight::new(id, HighlightType::Entity, x, y, w, h);
        highlight.color = model.color().to_string();
        highlight.opacity = Some(HighlightType::Entity.default_opacity());
        highlight.entity = Some(entity.entity_type.clone());
        highlight.model = Some(model.as_str().to_string());
        highlight.text = text;
        highlight.score = entity.score;
        highlight.file_key = Some(file_key.to_string());
        highlight.page = page;
        highlight.instance_id = Some(self.instance_id.clone());
        highlight
    }
}

/// Id unique by construction: file, page, type, counter value, random part and time
fn entity_highlight_id(file_key: &str, page: u32, entity_type: &str, sequence: &str) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "entity-{}-{}-{}-{}-{}-{}",
        file_key,
        page,
        entity_type,
        sequence,
        &random[..8],
        now_millis()
    )
}

/// Options for [`process_detection_mapping`]
#[derive(Debug, Clone)]
pub struct EntityProcessOptions {
    pub viewport: PageViewport,
    pub force_reprocess: bool,
    pub batch_size: usize,
}

impl Default for EntityProcessOptions {
    fn default() -> Self {
        Self {
            viewport: PageViewport::default(),
            force_reprocess: false,
            batch_size: ENTITY_BATCH_SIZE,
        }
    }
}

/// Run the entity manager over every page of a payload, pages in ascending order
pub fn process_detection_mapping(
    mapping: &DetectionMapping,
    file_key: Option<&str>,
    options: &EntityProcessOptions,
    registry: &Arc<ProcessingRegistry>,
    sink: &mut dyn AnnotationSink,
) -> ProcessReport {
    let mut report = ProcessReport::default();
    for page in mapping.page_numbers() {
        let context = PageContext::new(page, file_key.map(str::to_string), options.viewport);
        let page_report = EntityHighlightManager::new(context, mapping, Arc::clone(registry))
            .force_reprocess(options.force_reprocess)
            .with_batch_size(options.batch_size)
            .process_highlights(sink);
        report.merge(page_report);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::highlight::{BBox, PRESIDIO_COLOR};
    use crate::managers::test_support::RecordingSink;
    use crate::store::AnnotationStore;
    use crate::viewport::TextItem;
    use serde_json::json;

    const FILE_A: &str = "a.pdf-123";

    fn mapping() -> DetectionMapping {
        DetectionMapping::from_value(&json!({
            "pages": [{
                "page": 1,
                "sensitive": [
                    {
                        "bbox": {"x0": 100.0, "y0": 200.0, "x1": 150.0, "y1": 230.0},
                        "entity_type": "PERSON",
                        "engine": "presidio",
                        "content": "John Doe",
                        "score": 0.85
                    },
                    {
                        "bbox": {"x0": 10.0, "y0": 10.0, "x1": 60.0, "y1": 22.0},
                        "entity_type": "EMAIL",
                        "engine": "gliner",
                        "content": "j@d.com"
                    }
                ]
            }, {
                "page": 2,
                "sensitive": []
            }]
        }))
    }

    fn manager<'a>(
        page: u32,
        mapping: &'a DetectionMapping,
        registry: &Arc<ProcessingRegistry>,
    ) -> EntityHighlightManager<'a> {
        EntityHighlightManager::new(
            PageContext::new(page, Some(FILE_A.to_string()), PageViewport::default()),
            mapping,
            Arc::clone(registry),
        )
    }

    #[test]
    fn test_padding_and_color() {
        let mapping = mapping();
        let registry = Arc::new(ProcessingRegistry::new());
        let mut sink = RecordingSink::default();

        let report = manager(1, &mapping, &registry).process_highlights(&mut sink);
        assert_eq!(report.added, 2);

        let (page, first, file_key) = &sink.added[0];
        assert_eq!(*page, 1);
        assert_eq!(file_key.as_deref(), Some(FILE_A));
        assert_eq!((first.x, first.y, first.w, first.h), (95.0, 195.0, 54.0, 34.0));
        assert_eq!(first.color, PRESIDIO_COLOR);
        assert_eq!(first.kind, HighlightType::Entity);
        assert_eq!(first.entity.as_deref(), Some("PERSON"));
        assert_eq!(first.model.as_deref(), Some("presidio"));
        assert_eq!(first.text.as_deref(), Some("John Doe"));
        assert_eq!(first.score, Some(0.85));
        assert!(first.id.starts_with("entity-a.pdf-123-1-PERSON-1-"));
    }

    #[test]
    fn test_second_pass_is_skipped() {
        let mapping = mapping();
        let registry = Arc::new(ProcessingRegistry::new());
        let mut store = AnnotationStore::new();

        manager(1, &mapping, &registry).process_highlights(&mut store);
        let report = manager(1, &mapping, &registry).process_highlights(&mut store);

        assert!(report.already_processed);
        assert_eq!(report.added, 0);
        assert_eq!(store.get(1, Some(FILE_A)).len(), 2);
    }

    #[test]
    fn test_force_reprocess_adds_again() {
        let mapping = mapping();
        let registry = Arc::new(ProcessingRegistry::new());
        let mut store = AnnotationStore::new();

        manager(1, &mapping, &registry).process_highlights(&mut store);
        let report = manager(1, &mapping, &registry)
            .force_reprocess(true)
            .process_highlights(&mut store);

        assert_eq!(report.added, 2);
        assert_eq!(store.get(1, Some(FILE_A)).len(), 4);
        assert!(registry.is_page_processed(TrackerKind::Entity, FILE_A, 1));
        // Only pages are tracked for entities, not individual ids
        assert_eq!(registry.emitted_count(TrackerKind::Entity, FILE_A), 0);
    }

    #[test]
    fn test_empty_page_is_marked_processed() {
        let mapping = mapping();
        let registry = Arc::new(ProcessingRegistry::new());
        let mut sink = RecordingSink::default();

        let report = manager(2, &mapping, &registry).process_highlights(&mut sink);
        assert_eq!(report.added, 0);
        assert_eq!(report.pages_processed, vec![2]);
        assert!(registry.is_page_processed(TrackerKind::Entity, FILE_A, 2));
    }

    #[test]
    fn test_payload_for_other_file_is_dropped() {
        let mut mapping = mapping();
        mapping.file_key = Some("b.pdf-456".to_string());
        let registry = Arc::new(ProcessingRegistry::new());
        let mut sink = RecordingSink::default();

        let report = manager(1, &mapping, &registry).process_highlights(&mut sink);
        assert_eq!(report.skipped, 2);
        assert!(sink.added.is_empty());
        assert!(!registry.has_processed(TrackerKind::Entity, FILE_A));
    }

    #[test]
    fn test_uses_active_file_when_context_has_none() {
        let mapping = mapping();
        let registry = Arc::new(ProcessingRegistry::new());
        let mut sink = RecordingSink {
            active: Some(FILE_A.to_string()),
            ..Default::default()
        };

        let report = EntityHighlightManager::new(
            PageContext::new(1, None, PageViewport::default()),
            &mapping,
            registry,
        )
        .process_highlights(&mut sink);
        assert_eq!(report.added, 2);
        assert_eq!(sink.added[1].2.as_deref(), Some(FILE_A));
    }

    #[test]
    fn test_batches_preserve_input_order() {
        let sensitive: Vec<_> = (0..25)
            .map(|i| {
                json!({
                    "bbox": {"x0": i as f64, "y0": 0.0, "x1": i as f64 + 1.0, "y1": 1.0},
                    "entity_type": "ID",
                    "engine": "gemini"
                })
            })
            .collect();
        let mapping =
            DetectionMapping::from_value(&json!({"pages": [{"page": 1, "sensitive": sensitive}]}));
        let registry = Arc::new(ProcessingRegistry::new());
        let mut store = AnnotationStore::new();

        let report = manager(1, &mapping, &registry)
            .with_batch_size(10)
            .process_highlights(&mut store);
        assert_eq!(report.added, 25);

        let xs: Vec<f64> = store.get(1, Some(FILE_A)).iter().map(|h| h.x + 5.0).collect();
        let expected: Vec<f64> = (0..25).map(|i| i as f64).collect();
        assert_eq!(xs, expected);
    }

    #[test]
    fn test_text_content_backfills_empty_content() {
        let mapping = DetectionMapping {
            file_key: None,
            pages: vec![crate::detection::DetectionPage {
                page: 1,
                sensitive: vec![SensitiveEntity {
                    bbox: BBox::new(100.0, 200.0, 150.0, 230.0),
                    entity_type: "PERSON".to_string(),
                    engine: "gemini".to_string(),
                    content: String::new(),
                    score: None,
                }],
            }],
        };
        let text = TextContent {
            items: vec![TextItem {
                text: "Alice".to_string(),
                x: 101.0,
                y: 201.0,
                width: 30.0,
                height: 10.0,
            }],
        };
        let registry = Arc::new(ProcessingRegistry::new());
        let mut sink = RecordingSink::default();

        manager(1, &mapping, &registry)
            .with_text_content(&text)
            .process_highlights(&mut sink);
        assert_eq!(sink.added[0].1.text.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_process_detection_mapping_covers_all_pages() {
        let mapping = mapping();
        let registry = Arc::new(ProcessingRegistry::new());
        let mut store = AnnotationStore::new();

        let report = process_detection_mapping(
            &mapping,
            Some(FILE_A),
            &EntityProcessOptions::default(),
            &registry,
            &mut store,
        );
        assert_eq!(report.added, 2);
        assert_eq!(report.pages_processed, vec![1, 2]);
        assert_eq!(
            registry.processed_pages(TrackerKind::Entity, FILE_A),
            vec![1, 2]
        );
    }
}
