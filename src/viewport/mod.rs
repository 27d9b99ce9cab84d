//! Page geometry shared between the renderer, the managers and the overlay layers
//!
//! Two coordinate spaces are in play:
//! - viewport units: the PDF page at the render scale, used by every stored highlight
//! - CSS pixels: the rendered canvas as measured on screen

pub mod alignment;
pub mod layers;

use crate::highlight::BBox;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use alignment::{AlignmentTracker, PageMeasurement, ALIGNMENT_DEBOUNCE, ALIGNMENT_EPSILON};
pub use layers::{overlay_container, overlay_rects, OverlayRect};

/// Page dimensions at the current zoom, as reported by the PDF render engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PageViewport {
    pub width: f64,
    pub height: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl PageViewport {
    pub fn new(width: f64, height: f64, scale: f64) -> Self {
        Self {
            width,
            height,
            scale,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    /// Whether any part of `bbox` lies on the page
    pub fn overlaps(&self, bbox: &BBox) -> bool {
        bbox.intersects(&BBox::new(0.0, 0.0, self.width, self.height))
    }
}

impl Default for PageViewport {
    fn default() -> Self {
        // US Letter at scale 1
        Self::new(612.0, 792.0, 1.0)
    }
}

/// One run of extracted page text with its box in viewport units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TextItem {
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl TextItem {
    pub fn bbox(&self) -> BBox {
        BBox::new(self.x, self.y, self.x + self.width, self.y + self.height)
    }
}

/// Text layer of a page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TextContent {
    pub items: Vec<TextItem>,
}

impl TextContent {
    /// Concatenated text of all items overlapping `bbox`, in layer order
    pub fn text_within(&self, bbox: &BBox) -> Option<String> {
        let parts: Vec<&str> = self
            .items
            .iter()
            .filter(|item| item.bbox().intersects(bbox))
            .map(|item| item.text.trim())
            .filter(|text| !text.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Box measured on screen in CSS pixels (like `getBoundingClientRect`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScreenRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl ScreenRect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

/// Mapping between viewport units and CSS pixels for one rendered page
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PageSizeInfo {
    /// Canvas position inside its page wrapper
    pub offset_x: f64,
    pub offset_y: f64,
    /// CSS pixels per viewport unit
    pub scale_x: f64,
    pub scale_y: f64,
    pub css_width: f64,
    pub css_height: f64,
    pub viewport_width: f64,
    pub viewport_height: f64,
}

impl PageSizeInfo {
    /// Derive the mapping from the measured canvas and wrapper boxes.
    ///
    /// Returns `None` while the canvas has no size yet or the viewport is unusable.
    pub fn measure(
        canvas: &ScreenRect,
        wrapper: &ScreenRect,
        viewport: &PageViewport,
    ) -> Option<Self> {
        if !viewport.is_valid() || !(canvas.width > 0.0 && canvas.height > 0.0) {
            return None;
        }
        Some(Self {
            offset_x: canvas.left - wrapper.left,
            offset_y: canvas.top - wrapper.top,
            scale_x: canvas.width / viewport.width,
            scale_y: canvas.height / viewport.height,
            css_width: canvas.width,
            css_height: canvas.height,
            viewport_width: viewport.width,
            viewport_height: viewport.height,
        })
    }

    /// Identity mapping for a canvas drawn at exactly viewport size
    pub fn unscaled(viewport: &PageViewport) -> Self {
        Self {
            offset_x: 0.0,
            offset_y: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            css_width: viewport.width,
            css_height: viewport.height,
            viewport_width: viewport.width,
            viewport_height: viewport.height,
        }
    }

    /// Whether any on-screen quantity moved by more than `epsilon` pixels
    pub fn differs_from(&self, other: &PageSizeInfo, epsilon: f64) -> bool {
        (self.offset_x - other.offset_x).abs() > epsilon
            || (self.offset_y - other.offset_y).abs() > epsilon
            || (self.css_width - other.css_width).abs() > epsilon
            || (self.css_height - other.css_height).abs() > epsilon
            || (self.viewport_width - other.viewport_width).abs() > f64::EPSILON
            || (self.viewport_height - other.viewport_height).abs() > f64::EPSILON
    }

    /// Viewport-unit rectangle to wrapper-relative CSS pixels
    pub fn to_screen(&self, x: f64, y: f64, w: f64, h: f64) -> ScreenRect {
        ScreenRect {
            left: self.offset_x + x * self.scale_x,
            top: self.offset_y + y * self.scale_y,
            width: w * self.scale_x,
            height: h * self.scale_y,
        }
    }

    /// Wrapper-relative CSS point back to viewport units (drag input)
    pub fn to_viewport(&self, left: f64, top: f64) -> (f64, f64) {
        (
            (left - self.offset_x) / self.scale_x,
            (top - self.offset_y) / self.scale_y,
        )
    }
}
