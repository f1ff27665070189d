//! Parameter types for image operations.
//!
//! These types describe *what* to do, not *how* to do it. They are the
//! interface between the orchestrator (which decides what a frame needs) and
//! whichever execution context does the pixel work: a worker thread, the
//! fallback processor, or the calling task. Everything here is serializable
//! because operations travel over the worker wire protocol.
//!
//! ## Types
//!
//! - [`Operation`]: one step of a pipeline run: a filter or a watermark layer.
//! - [`FilterOp`]: a single filter with its intensity.
//! - [`TextWatermark`] / [`ImageWatermark`]: overlay layers.
//! - [`Placement`]: where an overlay sits on the frame.
//! - [`Transform`]: rotation, flips, and an optional resize of the base image.

use super::filters::FilterKind;
use super::surface::ImageData;
use serde::{Deserialize, Serialize};

/// One pipeline step. Serialized as `{"type": ..., "config": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "kebab-case")]
pub enum Operation {
    Filter(FilterOp),
    WatermarkText(TextWatermark),
    WatermarkImage(ImageWatermark),
}

impl Operation {
    pub fn filter(kind: FilterKind, value: f64) -> Self {
        Self::Filter(FilterOp { kind, value })
    }

    /// Short label used in logs.
    pub fn label(&self) -> String {
        match self {
            Self::Filter(op) => format!("filter:{}", op.kind),
            Self::WatermarkText(_) => "watermark-text".to_string(),
            Self::WatermarkImage(_) => "watermark-image".to_string(),
        }
    }

    pub fn is_watermark(&self) -> bool {
        !matches!(self, Self::Filter(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterOp {
    #[serde(rename = "name")]
    pub kind: FilterKind,
    pub value: f64,
}

/// Anchor for an overlay. Anchored variants keep `margin` pixels from the edges.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Placement {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
    Center,
    /// Absolute top-left position in pixels.
    At { x: i64, y: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextWatermark {
    pub text: String,
    /// Font size in pixels.
    pub size: f32,
    pub color: [u8; 3],
    /// 0.0 = invisible, 1.0 = fully opaque.
    pub opacity: f32,
    pub placement: Placement,
    pub margin: u32,
}

impl Default for TextWatermark {
    fn default() -> Self {
        Self {
            text: String::new(),
            size: 32.0,
            color: [255, 255, 255],
            opacity: 0.5,
            placement: Placement::default(),
            margin: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageWatermark {
    pub image: ImageData,
    pub opacity: f32,
    /// Overlay width as a fraction of the frame width. `None` keeps native size.
    #[serde(default)]
    pub scale: Option<f32>,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub margin: u32,
}

/// Clockwise rotation in quarter turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Quarter,
    Half,
    ThreeQuarter,
}

impl Rotation {
    /// Parse a clockwise angle in degrees. Only multiples of 90 are valid.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Self::None),
            90 => Some(Self::Quarter),
            180 => Some(Self::Half),
            270 => Some(Self::ThreeQuarter),
            _ => None,
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Quarter => 90,
            Self::Half => 180,
            Self::ThreeQuarter => 270,
        }
    }

    /// Rotate a further 90 degrees clockwise.
    pub fn turned(self) -> Self {
        match self {
            Self::None => Self::Quarter,
            Self::Quarter => Self::Half,
            Self::Half => Self::ThreeQuarter,
            Self::ThreeQuarter => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeTarget {
    pub width: u32,
    pub height: u32,
}

/// Geometric edits applied while drawing the base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Transform {
    pub rotation: Rotation,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    pub resize: Option<ResizeTarget>,
}

impl Transform {
    /// True when only a copy (and possibly a resize) is needed.
    pub fn is_identity_geometry(&self) -> bool {
        self.rotation == Rotation::None && !self.flip_horizontal && !self.flip_vertical
    }
}
