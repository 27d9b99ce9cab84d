//! Highlight data model
//!
//! All geometry is stored in PDF page-viewport units, the same space the
//! detection and search backends report their bounding boxes in.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Color used for entities detected by Presidio (amber)
pub const PRESIDIO_COLOR: &str = "#ffc107";
/// Color used for entities detected by GLiNER (red)
pub const GLINER_COLOR: &str = "#ff5252";
/// Color used for entities detected by Gemini (blue)
pub const GEMINI_COLOR: &str = "#2196f3";
/// Fallback color for unknown engines (gray)
pub const DEFAULT_ENTITY_COLOR: &str = "#9e9e9e";
/// Default color for search matches
pub const SEARCH_COLOR: &str = "#fff176";
/// Default color for user-drawn highlights
pub const MANUAL_COLOR: &str = "#00c853";

/// Kind of highlight, decides styling, padding and which layer paints it
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum HighlightType {
    /// Drawn by the user. Highlights persisted without a type are manual.
    #[default]
    Manual,
    /// Produced by a text search
    Search,
    /// Produced by an entity-detection engine
    Entity,
}

impl HighlightType {
    pub const ALL: [HighlightType; 3] = [
        HighlightType::Manual,
        HighlightType::Search,
        HighlightType::Entity,
    ];

    /// Opacity used when a highlight does not carry its own
    pub fn default_opacity(self) -> f64 {
        match self {
            HighlightType::Manual => 0.5,
            HighlightType::Search => 0.4,
            HighlightType::Entity => 0.3,
        }
    }

    /// Padding applied when highlights of this kind are created from a backend bbox
    pub fn padding(self) -> Padding {
        match self {
            HighlightType::Manual => Padding::NONE,
            HighlightType::Search | HighlightType::Entity => Padding::DETECTION,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HighlightType::Manual => "MANUAL",
            HighlightType::Search => "SEARCH",
            HighlightType::Entity => "ENTITY",
        }
    }
}

impl std::fmt::Display for HighlightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity detection engine that produced a highlight
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityModel {
    Presidio,
    Gliner,
    Gemini,
    Other(String),
}

impl EntityModel {
    /// Parse an engine name as reported by the detection backend (case-insensitive)
    pub fn parse(engine: &str) -> Self {
        match engine.trim().to_ascii_lowercase().as_str() {
            "presidio" => EntityModel::Presidio,
            "gliner" => EntityModel::Gliner,
            "gemini" => EntityModel::Gemini,
            other => EntityModel::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntityModel::Presidio => "presidio",
            EntityModel::Gliner => "gliner",
            EntityModel::Gemini => "gemini",
            EntityModel::Other(name) => name,
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            EntityModel::Presidio => PRESIDIO_COLOR,
            EntityModel::Gliner => GLINER_COLOR,
            EntityModel::Gemini => GEMINI_COLOR,
            EntityModel::Other(_) => DEFAULT_ENTITY_COLOR,
        }
    }
}

/// Color for an engine name, gray for anything unknown
pub fn entity_color(model: &str) -> &'static str {
    EntityModel::parse(model).color()
}

/// Corner-form rectangle as exchanged with the detection, search and redaction backends
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    pub fn is_finite(&self) -> bool {
        self.x0.is_finite() && self.y0.is_finite() && self.x1.is_finite() && self.y1.is_finite()
    }

    /// True when the boxes share some area (touching edges do not count)
    pub fn intersects(&self, other: &BBox) -> bool {
        self.x0 < other.x1 && other.x0 < self.x1 && self.y0 < other.y1 && other.y0 < self.y1
    }
}

/// Visual padding between a backend bbox and the drawn rectangle
///
/// A bbox `(x0, y0, x1, y1)` becomes `x = x0 - offset`, `w = (x1 - x0) + grow`.
/// [`Padding::contract`] is the exact inverse and is what the redaction export uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Padding {
    pub offset: f64,
    pub grow: f64,
}

impl Padding {
    pub const NONE: Padding = Padding {
        offset: 0.0,
        grow: 0.0,
    };

    pub const DETECTION: Padding = Padding {
        offset: 5.0,
        grow: 4.0,
    };

    /// Backend bbox to `(x, y, w, h)` overlay rectangle
    pub fn expand(&self, bbox: &BBox) -> (f64, f64, f64, f64) {
        (
            bbox.x0 - self.offset,
            bbox.y0 - self.offset,
            bbox.width() + self.grow,
            bbox.height() + self.grow,
        )
    }

    /// Overlay rectangle back to the bbox it was expanded from
    pub fn contract(&self, x: f64, y: f64, w: f64, h: f64) -> BBox {
        let trim = self.offset - self.grow;
        BBox {
            x0: x + self.offset,
            y0: y + self.offset,
            x1: x + w + trim,
            y1: y + h + trim,
        }
    }
}

/// One overlay rectangle tied to a detection, a search match or a user drag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(rename = "type", default)]
    pub kind: HighlightType,
    #[serde(default)]
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
    /// Detected entity category (entity highlights only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    /// Detection engine name (entity highlights only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Search term that produced this highlight (search highlights only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    /// 1-based page number, stamped by the store
    #[serde(default)]
    pub page: u32,
    /// Creation time in milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl Highlight {
    /// Create a highlight with the kind's default color and no provenance
    pub fn new(id: impl Into<String>, kind: HighlightType, x: f64, y: f64, w: f64, h: f64) -> Self {
        let color = match kind {
            HighlightType::Manual => MANUAL_COLOR,
            HighlightType::Search => SEARCH_COLOR,
            HighlightType::Entity => DEFAULT_ENTITY_COLOR,
        };
        Self {
            id: id.into(),
            x,
            y,
            w,
            h,
            kind,
            color: color.to_string(),
            opacity: None,
            entity: None,
            model: None,
            text: None,
            score: None,
            search_term: None,
            file_key: None,
            page: 0,
            timestamp: now_millis(),
            instance_id: None,
        }
    }

    /// Opacity to paint with, falling back to the kind default
    pub fn effective_opacity(&self) -> f64 {
        self.opacity
            .map(|o| o.clamp(0.0, 1.0))
            .unwrap_or_else(|| self.kind.default_opacity())
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.w.is_finite() && self.h.is_finite()
    }

    /// Stored rectangle in corner form (no padding compensation)
    pub fn rect(&self) -> BBox {
        BBox::new(self.x, self.y, self.x + self.w, self.y + self.h)
    }

    /// Whether the highlight is owned by `file_key`
    pub fn belongs_to(&self, file_key: &str) -> bool {
        self.file_key.as_deref() == Some(file_key)
    }

    /// Parse the id as the store's numeric counter value, if it is one
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.parse().ok()
    }
}

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_padding_matches_detection_scenario() {
        let bbox = BBox::new(100.0, 200.0, 150.0, 230.0);
        let (x, y, w, h) = Padding::DETECTION.expand(&bbox);
        assert_eq!((x, y, w, h), (95.0, 195.0, 54.0, 34.0));
    }

    #[test]
    fn test_padding_contract_inverts_expand() {
        let bbox = BBox::new(12.5, 40.0, 80.25, 52.0);
        for padding in [Padding::DETECTION, Padding::NONE] {
            let (x, y, w, h) = padding.expand(&bbox);
            assert_eq!(padding.contract(x, y, w, h), bbox);
        }
    }

    #[test]
    fn test_entity_colors() {
        assert_eq!(entity_color("presidio"), PRESIDIO_COLOR);
        assert_eq!(entity_color("GLiNER"), GLINER_COLOR);
        assert_eq!(entity_color("gemini"), GEMINI_COLOR);
        assert_eq!(entity_color("spacy"), DEFAULT_ENTITY_COLOR);
        assert_eq!(entity_color(""), DEFAULT_ENTITY_COLOR);
    }

    #[test]
    fn test_missing_type_is_manual() {
        let json = r#"{"id": "4", "x": 1.0, "y": 2.0, "w": 3.0, "h": 4.0, "page": 2}"#;
        let highlight: Highlight = serde_json::from_str(json).unwrap();
        assert_eq!(highlight.kind, HighlightType::Manual);
        assert_eq!(highlight.effective_opacity(), 0.5);
        assert_eq!(highlight.numeric_id(), Some(4));
    }

    #[test]
    fn test_serialized_field_names() {
        let mut highlight = Highlight::new("9", HighlightType::Search, 1.0, 2.0, 3.0, 4.0);
        highlight.file_key = Some("a.pdf-1".to_string());
        highlight.instance_id = Some("inst".to_string());
        let value = serde_json::to_value(&highlight).unwrap();
        assert_eq!(value["type"], "SEARCH");
        assert_eq!(value["fileKey"], "a.pdf-1");
        assert_eq!(value["instanceId"], "inst");
        assert!(value.get("opacity").is_none());
    }

    #[test]
    fn test_default_opacities() {
        assert_eq!(HighlightType::Manual.default_opacity(), 0.5);
        assert_eq!(HighlightType::Search.default_opacity(), 0.4);
        assert_eq!(HighlightType::Entity.default_opacity(), 0.3);
    }

    #[test]
    fn test_bbox_intersects() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(a.intersects(&BBox::new(5.0, 5.0, 15.0, 15.0)));
        assert!(!a.intersects(&BBox::new(10.0, 0.0, 20.0, 10.0)));
    }
}
