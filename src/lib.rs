//! PDF Highlight Server Library
//!
//! This crate manages highlight overlays for a PDF viewer:
//! - `store`: per-file, per-page highlight state with write-through persistence
//! - `managers`: entity, search and manual highlight creation with per-file dedup
//! - `viewport`: alignment between page viewport units and the rendered canvas
//! - `redaction`: export of highlights in the redaction backend's bbox convention
//! - `server`: the MCP tool surface over all of the above

pub mod detection;
pub mod error;
pub mod events;
pub mod highlight;
pub mod managers;
pub mod redaction;
pub mod server;
pub mod store;
pub mod viewport;

pub use error::{Error, Result};
pub use events::{EventBus, HighlightEvent};
pub use highlight::{correct, BBox, Highlight, HighlightType};
pub use managers::{
    AnnotationSink, EntityHighlightManager, ManualHighlightManager, PageContext, ProcessReport,
    ProcessingRegistry, SearchHighlightManager,
};
pub use redaction::{build_redaction_mapping, RedactionMapping};
pub use server::{run_server, run_server_with_config, HighlightServer, ServerConfig};
pub use store::AnnotationStore;
