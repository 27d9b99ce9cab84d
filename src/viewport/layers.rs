//! Coordinate contract of the highlight render layers
//!
//! Each layer paints one highlight kind into an absolutely positioned
//! container that sits exactly over the canvas. Rectangles are pre-scaled to
//! CSS pixels and relative to that container, so
//! `container.left + rect.left == size.to_screen(..).left` for every highlight.

use super::{PageSizeInfo, ScreenRect};
use crate::highlight::HighlightType;
use crate::store::AnnotationStore;
use schemars::JsonSchema;
use serde::Serialize;

/// One rectangle ready to paint
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct OverlayRect {
    pub id: String,
    pub kind: HighlightType,
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    pub color: String,
    pub opacity: f64,
    pub selected: bool,
}

/// Box of the overlay container inside the page wrapper
pub fn overlay_container(size: &PageSizeInfo) -> ScreenRect {
    ScreenRect::new(size.offset_x, size.offset_y, size.css_width, size.css_height)
}

/// Rectangles of `kind` on `page`, or nothing while that kind is hidden
pub fn overlay_rects(
    store: &AnnotationStore,
    page: u32,
    file_key: Option<&str>,
    kind: HighlightType,
    size: &PageSizeInfo,
) -> Vec<OverlayRect> {
    if !store.is_visible(kind) {
        return Vec::new();
    }
    let selected_id = store
        .selection()
        .filter(|s| s.page == page)
        .map(|s| s.id.as_str());

    store
        .get(page, file_key)
        .into_iter()
        .filter(|h| h.kind == kind)
        .map(|h| OverlayRect {
            left: h.x * size.scale_x,
            top: h.y * size.scale_y,
            width: h.w * size.scale_x,
            height: h.h * size.scale_y,
            opacity: h.effective_opacity(),
            selected: selected_id == Some(h.id.as_str()),
            kind: h.kind,
            color: h.color,
            id: h.id,
        })
        .collect()
}
