//! MCP Server implementation using rmcp

use crate::detection::{DetectionMapping, SearchResultItem};
use crate::error::Error;
use crate::events::EventBus;
use crate::highlight::{Highlight, HighlightType, MANUAL_COLOR};
use crate::managers::{
    process_detection_mapping, EntityHighlightManager, EntityProcessOptions,
    ManualHighlightManager, PageContext, ProcessReport, ProcessingRegistry,
    SearchHighlightManager, TrackerKind, ENTITY_BATCH_SIZE, MANUAL_DEBOUNCE, MIN_HIGHLIGHT_SIZE,
    RESET_THROTTLE,
};
use crate::redaction::{build_redaction_mapping, RedactionMapping};
use crate::store::{
    AnnotationStore, FileStorage, HighlightCounts, HighlightVisibility, MemoryStorage, PageMap,
    StorageBackend, DEFAULT_STORAGE_KEY,
};
use crate::viewport::{
    overlay_container, overlay_rects, AlignmentTracker, OverlayRect, PageMeasurement,
    PageSizeInfo, PageViewport, ScreenRect, TextContent,
};
use anyhow::Result;
use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters, model::*,
    schemars::JsonSchema, tool, tool_handler, tool_router, ServerHandler, ServiceExt,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Storage and processing configuration for the highlight server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory for persisted highlights (default: in-memory only)
    pub storage_dir: Option<PathBuf>,
    /// Key the highlight map is stored under (default: "pdf-annotations")
    pub storage_key: String,
    /// Entities handed to the store per batch (default: 10)
    pub entity_batch_size: usize,
    /// Minimum time between two entity tracking resets of one file (default: 500ms)
    pub reset_throttle: Duration,
    /// Minimum time between two manual highlights on one page (default: 100ms)
    pub manual_debounce: Duration,
    /// Smallest manual highlight width/height in viewport units (default: 2.0)
    pub min_manual_size: f64,
    /// Undelivered events kept per subscriber (default: 256)
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            entity_batch_size: ENTITY_BATCH_SIZE,
            reset_throttle: RESET_THROTTLE,
            manual_debounce: MANUAL_DEBOUNCE,
            min_manual_size: MIN_HIGHLIGHT_SIZE,
            event_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PDF_HIGHLIGHT_*` environment variables.
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("PDF_HIGHLIGHT_STORAGE_DIR").filter(|v| !v.is_empty()) {
            config.storage_dir = Some(PathBuf::from(dir));
        }
        if let Some(key) = lookup("PDF_HIGHLIGHT_STORAGE_KEY").filter(|v| !v.is_empty()) {
            config.storage_key = key;
        }
        if let Some(raw) = lookup("PDF_HIGHLIGHT_ENTITY_BATCH") {
            match raw.parse::<usize>() {
                Ok(size) if size > 0 => config.entity_batch_size = size,
                _ => tracing::warn!(value = %raw, "ignoring invalid PDF_HIGHLIGHT_ENTITY_BATCH"),
            }
        }
        if let Some(raw) = lookup("PDF_HIGHLIGHT_RESET_THROTTLE_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => config.reset_throttle = Duration::from_millis(ms),
                Err(_) => {
                    tracing::warn!(value = %raw, "ignoring invalid PDF_HIGHLIGHT_RESET_THROTTLE_MS")
                }
            }
        }

        config
    }
}

/// PDF Highlight Server
#[derive(Clone)]
pub struct HighlightServer {
    store: Arc<RwLock<AnnotationStore>>,
    registry: Arc<ProcessingRegistry>,
    /// One manual manager per (file, page) so the debounce spans calls
    manual: Arc<parking_lot::Mutex<HashMap<(String, u32), ManualHighlightManager>>>,
    /// One alignment tracker per file
    alignment: Arc<parking_lot::Mutex<HashMap<String, AlignmentTracker>>>,
    events: EventBus,
    tool_router: ToolRouter<Self>,
    /// Server configuration
    config: Arc<ServerConfig>,
}

// ============================================================================
// Request/Response types for set_active_file
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SetActiveFileParams {
    /// File key to activate (omit to clear the active file)
    #[serde(default)]
    pub file_key: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct SetActiveFileResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_file: Option<String>,
    /// Stored highlights of the active file per type
    pub counts: HighlightCounts,
}

// ============================================================================
// Request/Response types for get_annotations
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetAnnotationsParams {
    /// File key (default: active file)
    #[serde(default)]
    pub file_key: Option<String>,
    /// Only this 1-based page (default: all pages)
    #[serde(default)]
    pub page: Option<u32>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct GetAnnotationsResult {
    pub file_key: String,
    /// Store revision the snapshot was taken at
    pub revision: u64,
    pub counts: HighlightCounts,
    /// Highlights keyed by page number
    pub pages: PageMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Request/Response types for add_manual_highlight
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
pub struct PointParam {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddManualHighlightParams {
    /// File key (default: active file)
    #[serde(default)]
    pub file_key: Option<String>,
    /// 1-based page number
    pub page: u32,
    /// Drag start in page viewport units
    pub start: PointParam,
    /// Drag end in page viewport units
    pub end: PointParam,
    /// CSS color (default: green)
    #[serde(default)]
    pub color: Option<String>,
    /// Page viewport at the current zoom
    #[serde(default)]
    pub viewport: Option<PageViewport>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct AddManualHighlightResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight: Option<Highlight>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Request/Response types for remove_annotation / update_annotation
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RemoveAnnotationParams {
    /// File key (default: active file)
    #[serde(default)]
    pub file_key: Option<String>,
    /// 1-based page number
    pub page: u32,
    /// Highlight id
    pub id: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct RemoveAnnotationResult {
    pub removed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateAnnotationParams {
    /// File key (default: active file)
    #[serde(default)]
    pub file_key: Option<String>,
    /// 1-based page number
    pub page: u32,
    /// Replacement highlight, matched by id
    pub highlight: Highlight,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct UpdateAnnotationResult {
    pub updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Request/Response types for clear_annotations
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ClearAnnotationsParams {
    /// File key (default: active file)
    #[serde(default)]
    pub file_key: Option<String>,
    /// Only this type: MANUAL, SEARCH or ENTITY (default: every type)
    #[serde(default)]
    pub kind: Option<HighlightType>,
    /// Only this page (default: every page)
    #[serde(default)]
    pub page: Option<u32>,
    /// Only search highlights of this term
    #[serde(default)]
    pub search_term: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ClearAnnotationsResult {
    /// Number of highlights removed
    pub removed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Request/Response types for process_entities / process_search
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProcessEntitiesParams {
    /// File key (default: active file)
    #[serde(default)]
    pub file_key: Option<String>,
    /// Detection payload:
    /// {"pages": [{"page", "sensitive": [{"bbox", "entity_type", "engine", "content", "score"}]}]}
    pub mapping: serde_json::Value,
    /// Only this page (default: every page in the payload)
    #[serde(default)]
    pub page: Option<u32>,
    /// Process pages even if already processed (default: false)
    #[serde(default)]
    pub force_reprocess: bool,
    /// Page viewport at the current zoom
    #[serde(default)]
    pub viewport: Option<PageViewport>,
    /// Text layer of the page, used to fill in missing entity text
    #[serde(default)]
    pub text_content: Option<TextContent>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProcessSearchParams {
    /// File key (default: active file)
    #[serde(default)]
    pub file_key: Option<String>,
    /// Search term; previous highlights of the same term are replaced
    #[serde(default)]
    pub term: Option<String>,
    /// Search results: [{"page", "x", "y", "w", "h", "text"}]
    pub results: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ProcessResult {
    pub file_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ProcessReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Request/Response types for export_annotations / import_annotations
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExportAnnotationsParams {
    /// File key (default: active file)
    #[serde(default)]
    pub file_key: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ExportAnnotationsResult {
    pub file_key: String,
    /// JSON object of page number to highlight list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ImportAnnotationsParams {
    /// File key (default: active file)
    #[serde(default)]
    pub file_key: Option<String>,
    /// Data previously returned by export_annotations
    pub data: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ImportAnnotationsResult {
    pub imported: bool,
    pub counts: HighlightCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Request/Response types for set_highlight_visibility
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SetVisibilityParams {
    /// MANUAL, SEARCH or ENTITY
    pub kind: HighlightType,
    /// New state (default: toggle)
    #[serde(default)]
    pub visible: Option<bool>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct SetVisibilityResult {
    pub visibility: HighlightVisibility,
}

// ============================================================================
// Request/Response types for build_redaction_mapping
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RedactionParams {
    /// File key (default: active file)
    #[serde(default)]
    pub file_key: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct RedactionResult {
    pub file_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<RedactionMapping>,
    pub item_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Request/Response types for reset_entity_tracking / close_file
// ============================================================================

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ResetEntityTrackingParams {
    /// File key (default: active file)
    #[serde(default)]
    pub file_key: Option<String>,
    /// Skip the reset throttle (default: false)
    #[serde(default)]
    pub force: bool,
    /// Also remove the file's entity highlights (default: true)
    #[serde(default = "default_true")]
    pub clear_highlights: bool,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ResetEntityTrackingResult {
    pub file_key: String,
    /// False when the reset was throttled
    pub reset: bool,
    /// Entity highlights removed
    pub removed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CloseFileParams {
    pub file_key: String,
    /// Also delete the file's stored highlights (default: false)
    #[serde(default)]
    pub clear_annotations: bool,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct CloseFileResult {
    pub file_key: String,
    pub annotations_cleared: bool,
}

// ============================================================================
// Request/Response types for get_page_overlays
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetPageOverlaysParams {
    /// File key (default: active file)
    #[serde(default)]
    pub file_key: Option<String>,
    /// 1-based page number
    pub page: u32,
    /// Measured canvas box in CSS pixels
    pub canvas: ScreenRect,
    /// Measured page wrapper box in CSS pixels
    pub wrapper: ScreenRect,
    /// Page viewport at the current zoom
    pub viewport: PageViewport,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct GetPageOverlaysResult {
    pub page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<PageSizeInfo>,
    /// Overlay container box inside the wrapper
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ScreenRect>,
    /// Rectangles relative to the container, search then entity then manual
    pub rects: Vec<OverlayRect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Tool implementations
// ============================================================================

#[tool_router]
impl HighlightServer {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Create a new HighlightServer with full configuration
    pub fn with_config(config: ServerConfig) -> Self {
        let storage: Arc<dyn StorageBackend> = match &config.storage_dir {
            Some(dir) => Arc::new(FileStorage::new(dir)),
            None => Arc::new(MemoryStorage::new()),
        };
        Self::with_storage(config, storage)
    }

    /// Create a new HighlightServer persisting to `storage`
    pub fn with_storage(config: ServerConfig, storage: Arc<dyn StorageBackend>) -> Self {
        let events = EventBus::new(config.event_capacity);
        let store = AnnotationStore::load(storage, config.storage_key.clone())
            .with_events(events.clone());
        let registry = ProcessingRegistry::new()
            .with_reset_throttle(config.reset_throttle)
            .with_events(events.clone());

        Self {
            store: Arc::new(RwLock::new(store)),
            registry: Arc::new(registry),
            manual: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            alignment: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            events,
            tool_router: Self::tool_router(),
            config: Arc::new(config),
        }
    }

    /// Set the file that operations without a file key apply to
    #[tool(
        description = "Set the active file. Operations called without file_key apply to the active file. Omit file_key to clear it."
    )]
    async fn set_active_file(&self, Parameters(params): Parameters<SetActiveFileParams>) -> String {
        let mut store = self.store.write().await;
        store.set_active_file(params.file_key);
        let result = SetActiveFileResult {
            active_file: store.active_file().map(str::to_string),
            counts: store.counts(None),
        };
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// List stored highlights of a file
    #[tool(
        description = "Get stored highlights of a file, keyed by page number, with per-type counts. Pass page to get a single page."
    )]
    async fn get_annotations(
        &self,
        Parameters(params): Parameters<GetAnnotationsParams>,
    ) -> String {
        let result = self.process_get_annotations(&params).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "get_annotations failed");
            GetAnnotationsResult {
                file_key: params.file_key.clone().unwrap_or_default(),
                revision: 0,
                counts: HighlightCounts::default(),
                pages: PageMap::new(),
                error: Some(e.client_message()),
            }
        });
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Create a manual highlight from a drag
    #[tool(
        description = "Create a manual highlight from the two corners of a drag, in page viewport units. Drags smaller than 2 units and repeats within 100ms on the same page are rejected."
    )]
    async fn add_manual_highlight(
        &self,
        Parameters(params): Parameters<AddManualHighlightParams>,
    ) -> String {
        let result = self
            .process_add_manual_highlight(&params)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "add_manual_highlight failed");
                AddManualHighlightResult {
                    highlight: None,
                    error: Some(e.client_message()),
                }
            });
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Remove one highlight
    #[tool(description = "Remove a highlight by page and id.")]
    async fn remove_annotation(
        &self,
        Parameters(params): Parameters<RemoveAnnotationParams>,
    ) -> String {
        let result = match self.process_remove_annotation(&params).await {
            Ok(()) => RemoveAnnotationResult {
                removed: true,
                error: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, "remove_annotation failed");
                RemoveAnnotationResult {
                    removed: false,
                    error: Some(e.client_message()),
                }
            }
        };
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Replace one highlight
    #[tool(
        description = "Replace a stored highlight (matched by id on the given page), e.g. to change its color or geometry."
    )]
    async fn update_annotation(
        &self,
        Parameters(params): Parameters<UpdateAnnotationParams>,
    ) -> String {
        let result = match self.process_update_annotation(params).await {
            Ok(()) => UpdateAnnotationResult {
                updated: true,
                error: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, "update_annotation failed");
                UpdateAnnotationResult {
                    updated: false,
                    error: Some(e.client_message()),
                }
            }
        };
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Remove highlights in bulk
    #[tool(
        description = "Remove highlights of a file: every highlight, every highlight of one page, all of one type (optionally on one page), or the search highlights of one term."
    )]
    async fn clear_annotations(
        &self,
        Parameters(params): Parameters<ClearAnnotationsParams>,
    ) -> String {
        let result = self
            .process_clear_annotations(&params)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "clear_annotations failed");
                ClearAnnotationsResult {
                    removed: 0,
                    error: Some(e.client_message()),
                }
            });
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Turn a detection payload into entity highlights
    #[tool(
        description = "Create entity highlights from a detection payload. Pages already processed for the file are skipped unless force_reprocess is set. Boxes are padded by 5 units and colored by engine (presidio, gliner, gemini)."
    )]
    async fn process_entities(
        &self,
        Parameters(params): Parameters<ProcessEntitiesParams>,
    ) -> String {
        let result = self.run_process_entities(&params).await;
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Turn search results into search highlights
    #[tool(
        description = "Create search highlights from search results. Previous highlights of the same term on the file are replaced; identical matches collapse into one highlight."
    )]
    async fn process_search(&self, Parameters(params): Parameters<ProcessSearchParams>) -> String {
        let result = self.run_process_search(&params).await;
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Serialize one file's highlights
    #[tool(description = "Export a file's highlights as a JSON string that import_annotations accepts.")]
    async fn export_annotations(
        &self,
        Parameters(params): Parameters<ExportAnnotationsParams>,
    ) -> String {
        let store = self.store.read().await;
        let file_key = params
            .file_key
            .clone()
            .or_else(|| store.active_file().map(str::to_string))
            .unwrap_or_default();
        let result = match store.export_file(params.file_key.as_deref()) {
            Ok(data) => ExportAnnotationsResult {
                file_key,
                data: Some(data),
                error: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, "export_annotations failed");
                ExportAnnotationsResult {
                    file_key,
                    data: None,
                    error: Some(e.client_message()),
                }
            }
        };
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Replace one file's highlights with exported data
    #[tool(
        description = "Replace a file's highlights with data from export_annotations. Malformed data leaves the file unchanged."
    )]
    async fn import_annotations(
        &self,
        Parameters(params): Parameters<ImportAnnotationsParams>,
    ) -> String {
        let mut store = self.store.write().await;
        let imported = store.import_file(&params.data, params.file_key.as_deref());
        let result = ImportAnnotationsResult {
            imported,
            counts: store.counts(params.file_key.as_deref()),
            error: (!imported).then(|| "Import data is malformed or no file is active".to_string()),
        };
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Show or hide one highlight type
    #[tool(
        description = "Show or hide one highlight type (MANUAL, SEARCH, ENTITY). Hidden highlights stay stored. Omit visible to toggle."
    )]
    async fn set_highlight_visibility(
        &self,
        Parameters(params): Parameters<SetVisibilityParams>,
    ) -> String {
        let mut store = self.store.write().await;
        match params.visible {
            Some(visible) => store.set_visibility(params.kind, visible),
            None => {
                store.toggle_visibility(params.kind);
            }
        }
        let result = SetVisibilityResult {
            visibility: store.visibility(),
        };
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Redaction input for a file
    #[tool(
        description = "Build the redaction mapping for a file: every stored highlight with padding removed, as {pages: [{page, sensitive: [{bbox, entity_type, content, engine}]}]}."
    )]
    async fn build_redaction_mapping(
        &self,
        Parameters(params): Parameters<RedactionParams>,
    ) -> String {
        let store = self.store.read().await;
        let file_key = params
            .file_key
            .clone()
            .or_else(|| store.active_file().map(str::to_string))
            .unwrap_or_default();
        let result = match build_redaction_mapping(&store, params.file_key.as_deref()) {
            Ok(mapping) => RedactionResult {
                file_key,
                item_count: mapping.item_count(),
                mapping: Some(mapping),
                error: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, "build_redaction_mapping failed");
                RedactionResult {
                    file_key,
                    mapping: None,
                    item_count: 0,
                    error: Some(e.client_message()),
                }
            }
        };
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Forget which pages of a file were processed for entities
    #[tool(
        description = "Reset a file's entity tracking so the next process_entities call reprocesses every page. Resets within 500ms of the previous one are ignored unless force is set."
    )]
    async fn reset_entity_tracking(
        &self,
        Parameters(params): Parameters<ResetEntityTrackingParams>,
    ) -> String {
        let result = self
            .process_reset_entity_tracking(&params)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "reset_entity_tracking failed");
                ResetEntityTrackingResult {
                    file_key: params.file_key.clone().unwrap_or_default(),
                    reset: false,
                    removed: 0,
                    error: Some(e.client_message()),
                }
            });
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Drop all tracking of a closed file
    #[tool(
        description = "Close a file: drop its processing state, manual highlight debounce and page measurements. Stored highlights are kept unless clear_annotations is set."
    )]
    async fn close_file(&self, Parameters(params): Parameters<CloseFileParams>) -> String {
        let result = self.process_close_file(&params).await;
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Overlay rectangles for a rendered page
    #[tool(
        description = "Measure a rendered page (canvas and wrapper boxes in CSS pixels) and return its overlay container plus the visible highlight rectangles, pre-scaled to CSS pixels."
    )]
    async fn get_page_overlays(
        &self,
        Parameters(params): Parameters<GetPageOverlaysParams>,
    ) -> String {
        let result = self
            .process_get_page_overlays(&params)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "get_page_overlays failed");
                GetPageOverlaysResult {
                    page: params.page,
                    size: None,
                    container: None,
                    rects: vec![],
                    error: Some(e.client_message()),
                }
            });
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }
}

impl HighlightServer {
    /// Event bus shared by the store, the registry and the alignment trackers
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Shared store handle
    pub fn store(&self) -> Arc<RwLock<AnnotationStore>> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<ProcessingRegistry> {
        Arc::clone(&self.registry)
    }

    fn resolve_file_key(
        store: &AnnotationStore,
        file_key: Option<&str>,
    ) -> crate::error::Result<String> {
        file_key
            .or_else(|| store.active_file())
            .map(str::to_string)
            .ok_or(Error::NoActiveFile)
    }

    async fn process_get_annotations(
        &self,
        params: &GetAnnotationsParams,
    ) -> crate::error::Result<GetAnnotationsResult> {
        let store = self.store.read().await;
        let file_key = Self::resolve_file_key(&store, params.file_key.as_deref())?;

        let pages = match params.page {
            Some(page) => {
                let list = store.get(page, Some(&file_key));
                let mut pages = PageMap::new();
                if !list.is_empty() {
                    pages.insert(page, list);
                }
                pages
            }
            None => store.file_pages(Some(&file_key)),
        };

        Ok(GetAnnotationsResult {
            revision: store.revision(),
            counts: store.counts(Some(&file_key)),
            file_key,
            pages,
            error: None,
        })
    }

    async fn process_add_manual_highlight(
        &self,
        params: &AddManualHighlightParams,
    ) -> crate::error::Result<AddManualHighlightResult> {
        if params.page == 0 {
            return Err(Error::InvalidHighlight {
                reason: "page numbers start at 1".to_string(),
            });
        }
        let mut store = self.store.write().await;
        let file_key = Self::resolve_file_key(&store, params.file_key.as_deref())?;

        let mut managers = self.manual.lock();
        let manager = managers
            .entry((file_key.clone(), params.page))
            .or_insert_with(|| {
                ManualHighlightManager::new(PageContext::new(
                    params.page,
                    Some(file_key.clone()),
                    params.viewport.unwrap_or_default(),
                ))
                .with_min_size(self.config.min_manual_size)
                .with_debounce(self.config.manual_debounce)
            });
        manager.set_color(params.color.as_deref().unwrap_or(MANUAL_COLOR));

        let highlight = manager
            .create_rectangle_highlight(
                &mut *store,
                (params.start.x, params.start.y),
                (params.end.x, params.end.y),
            )
            .ok_or_else(|| Error::InvalidHighlight {
                reason: "rectangle too small or created too quickly".to_string(),
            })?;

        Ok(AddManualHighlightResult {
            highlight: Some(highlight),
            error: None,
        })
    }

    async fn process_remove_annotation(
        &self,
        params: &RemoveAnnotationParams,
    ) -> crate::error::Result<()> {
        let mut store = self.store.write().await;
        let file_key = Self::resolve_file_key(&store, params.file_key.as_deref())?;
        if store.remove(params.page, &params.id, Some(&file_key)) {
            Ok(())
        } else {
            Err(Error::HighlightNotFound {
                page: params.page,
                id: params.id.clone(),
            })
        }
    }

    async fn process_update_annotation(
        &self,
        params: UpdateAnnotationParams,
    ) -> crate::error::Result<()> {
        let mut store = self.store.write().await;
        let file_key = Self::resolve_file_key(&store, params.file_key.as_deref())?;
        if !params.highlight.is_finite() {
            return Err(Error::InvalidHighlight {
                reason: "coordinates must be finite numbers".to_string(),
            });
        }
        if let Some(tagged) = params.highlight.file_key.as_deref() {
            if tagged != file_key {
                return Err(Error::FileKeyMismatch {
                    expected: file_key,
                    found: tagged.to_string(),
                });
            }
        }

        let id = params.highlight.id.clone();
        if store.update(params.page, params.highlight, Some(&file_key)) {
            Ok(())
        } else {
            Err(Error::HighlightNotFound {
                page: params.page,
                id,
            })
        }
    }

    async fn process_clear_annotations(
        &self,
        params: &ClearAnnotationsParams,
    ) -> crate::error::Result<ClearAnnotationsResult> {
        let mut store = self.store.write().await;
        let file_key = Self::resolve_file_key(&store, params.file_key.as_deref())?;

        let removed = match (params.kind, params.search_term.as_deref()) {
            (Some(HighlightType::Search) | None, Some(term)) => {
                store.clear_search_highlights(Some(term), Some(&file_key))
            }
            (Some(kind), _) => store.clear_by_type(kind, params.page, Some(&file_key)),
            (None, None) => match params.page {
                Some(page) => [
                    HighlightType::Search,
                    HighlightType::Entity,
                    HighlightType::Manual,
                ]
                .into_iter()
                .map(|kind| store.clear_by_type(kind, Some(page), Some(&file_key)))
                .sum::<usize>(),
                None => {
                    let total = store.counts(Some(&file_key)).total();
                    store.clear_all(Some(&file_key));
                    total
                }
            },
        };

        Ok(ClearAnnotationsResult {
            removed,
            error: None,
        })
    }

    async fn run_process_entities(&self, params: &ProcessEntitiesParams) -> ProcessResult {
        let mapping = DetectionMapping::from_value(&params.mapping);
        let mut store = self.store.write().await;

        let outcome = Self::resolve_file_key(&store, params.file_key.as_deref())
            .and_then(|file_key| {
                if let Some(tagged) = mapping.file_key.as_deref() {
                    if tagged != file_key {
                        return Err(Error::FileKeyMismatch {
                            expected: file_key,
                            found: tagged.to_string(),
                        });
                    }
                }
                let viewport = params.viewport.unwrap_or_default();
                let report = match params.page {
                    Some(page) => {
                        let context = PageContext::new(page, Some(file_key.clone()), viewport);
                        let registry = Arc::clone(&self.registry);
                        let mut manager = EntityHighlightManager::new(context, &mapping, registry)
                            .force_reprocess(params.force_reprocess)
                            .with_batch_size(self.config.entity_batch_size);
                        if let Some(text_content) = &params.text_content {
                            manager = manager.with_text_content(text_content);
                        }
                        manager.process_highlights(&mut *store)
                    }
                    None => {
                        let options = EntityProcessOptions {
                            viewport,
                            force_reprocess: params.force_reprocess,
                            batch_size: self.config.entity_batch_size,
                        };
                        process_detection_mapping(
                            &mapping,
                            Some(&file_key),
                            &options,
                            &self.registry,
                            &mut *store,
                        )
                    }
                };
                Ok((file_key, report))
            });

        match outcome {
            Ok((file_key, report)) => ProcessResult {
                file_key,
                report: Some(report),
                error: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, "process_entities failed");
                ProcessResult {
                    file_key: params.file_key.clone().unwrap_or_default(),
                    report: None,
                    error: Some(e.client_message()),
                }
            }
        }
    }

    async fn run_process_search(&self, params: &ProcessSearchParams) -> ProcessResult {
        let mut items = Vec::with_capacity(params.results.len());
        let mut malformed = 0usize;
        for raw in &params.results {
            match serde_json::from_value::<SearchResultItem>(raw.clone()) {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed search result");
                    malformed += 1;
                }
            }
        }

        let mut store = self.store.write().await;
        match Self::resolve_file_key(&store, params.file_key.as_deref()) {
            Ok(file_key) => {
                let mut manager = SearchHighlightManager::new(
                    &items,
                    Some(file_key.clone()),
                    Arc::clone(&self.registry),
                );
                if let Some(term) = &params.term {
                    manager = manager.with_search_term(term.clone());
                }
                let mut report = manager.process_highlights(&mut *store);
                report.skipped += malformed;
                ProcessResult {
                    file_key,
                    report: Some(report),
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "process_search failed");
                ProcessResult {
                    file_key: String::new(),
                    report: None,
                    error: Some(e.client_message()),
                }
            }
        }
    }

    async fn process_reset_entity_tracking(
        &self,
        params: &ResetEntityTrackingParams,
    ) -> crate::error::Result<ResetEntityTrackingResult> {
        let mut store = self.store.write().await;
        let file_key = Self::resolve_file_key(&store, params.file_key.as_deref())?;

        let reset = if params.force {
            self.registry
                .force_reset_file(TrackerKind::Entity, &file_key);
            true
        } else {
            self.registry.reset_file(TrackerKind::Entity, &file_key)
        };
        let removed = if reset && params.clear_highlights {
            store.clear_by_type(HighlightType::Entity, None, Some(&file_key))
        } else {
            0
        };

        Ok(ResetEntityTrackingResult {
            file_key,
            reset,
            removed,
            error: None,
        })
    }

    async fn process_close_file(&self, params: &CloseFileParams) -> CloseFileResult {
        self.registry.remove_file(&params.file_key);
        self.manual
            .lock()
            .retain(|(file_key, _), _| file_key != &params.file_key);
        self.alignment.lock().remove(&params.file_key);

        let mut store = self.store.write().await;
        if store.active_file() == Some(params.file_key.as_str()) {
            store.set_active_file(None);
            store.clear_selection();
        }
        let annotations_cleared =
            params.clear_annotations && store.clear_for_file(&params.file_key);
        tracing::debug!(file_key = %params.file_key, annotations_cleared, "file closed");

        CloseFileResult {
            file_key: params.file_key.clone(),
            annotations_cleared,
        }
    }

    async fn process_get_page_overlays(
        &self,
        params: &GetPageOverlaysParams,
    ) -> crate::error::Result<GetPageOverlaysResult> {
        let store = self.store.read().await;
        let file_key = Self::resolve_file_key(&store, params.file_key.as_deref())?;

        let size = {
            let mut trackers = self.alignment.lock();
            let tracker = trackers
                .entry(file_key.clone())
                .or_insert_with(|| {
                    AlignmentTracker::new(file_key.clone()).with_events(self.events.clone())
                });
            let measurement = PageMeasurement {
                canvas: params.canvas,
                wrapper: params.wrapper,
                viewport: params.viewport,
            };
            tracker.on_page_rendered(params.page, &measurement);
            tracker.page_size(params.page).copied()
        };
        let size = size.ok_or_else(|| Error::InvalidPayload {
            reason: "page has not been rendered at a measurable size".to_string(),
        })?;

        let rects = [
            HighlightType::Search,
            HighlightType::Entity,
            HighlightType::Manual,
        ]
        .into_iter()
        .flat_map(|kind| overlay_rects(&store, params.page, Some(&file_key), kind, &size))
        .collect();

        Ok(GetPageOverlaysResult {
            page: params.page,
            container: Some(overlay_container(&size)),
            size: Some(size),
            rects,
            error: None,
        })
    }
}

impl Default for HighlightServer {
    fn default() -> Self {
        Self::new()
    }
}

#[tool_handler]
impl ServerHandler for HighlightServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "PDF Highlight Server keeps per-file, per-page highlight state for a PDF viewer. \
                 Feed it detection and search results, manual drags and page measurements; \
                 read back highlights, overlay rectangles and redaction mappings."
                    .into(),
            ),
        }
    }
}

/// Run the MCP server with default configuration
pub async fn run_server() -> Result<()> {
    run_server_with_config(ServerConfig::default()).await
}

/// Run the MCP server with full configuration
pub async fn run_server_with_config(config: ServerConfig) -> Result<()> {
    let server = HighlightServer::with_config(config);

    tracing::info!("PDF Highlight Server ready, waiting for connections...");

    let service = server.serve(rmcp::transport::io::stdio()).await?;
    service.waiting().await?;

    Ok(())
}
