//! Conversion of stored highlights into the redaction backend's bbox convention

use super::model::{BBox, Highlight};

/// Undo the creation-time padding of a highlight.
///
/// What the user sees highlighted must be exactly what gets redacted, so the
/// offsets come from the same [`super::Padding`] profile the managers expand with.
pub fn correct(highlight: &Highlight) -> BBox {
    highlight
        .kind
        .padding()
        .contract(highlight.x, highlight.y, highlight.w, highlight.h)
}
