//! Highlight records and their geometry helpers

pub mod bbox;
mod model;

pub use bbox::correct;
pub use model::{
    entity_color, now_millis, BBox, EntityModel, Highlight, HighlightType, Padding,
    DEFAULT_ENTITY_COLOR, GEMINI_COLOR, GLINER_COLOR, MANUAL_COLOR, PRESIDIO_COLOR, SEARCH_COLOR,
};
