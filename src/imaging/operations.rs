//! The single operation dispatcher shared by every execution path.
//!
//! Worker threads, the fallback processor, and the direct path on the calling
//! task all call [`apply_operation`]. Keeping one dispatcher means a filter
//! value produces the same pixels no matter where it ran.
//!
//! Workers have no font and never draw overlays: watermark operations in a
//! [`ExecutionTarget::Worker`] context are rejected with
//! [`OperationError::Unsupported`].

use super::filters::FilterKind;
use super::params::{FilterOp, Operation};
use super::pixel_ops;
use super::surface::{ImageData, Surface};
use super::watermark;
use ab_glyph::FontArc;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    #[error("invalid operation: {0}")]
    Validation(String),
    #[error("operation not supported here: {0}")]
    Unsupported(String),
}

/// Where an operation is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTarget {
    Worker,
    MainThread,
}

/// Everything an operation may need besides the pixels.
#[derive(Clone)]
pub struct ApplyContext {
    pub target: ExecutionTarget,
    pub font: Option<FontArc>,
}

impl ApplyContext {
    pub fn worker() -> Self {
        Self {
            target: ExecutionTarget::Worker,
            font: None,
        }
    }

    pub fn main_thread(font: Option<FontArc>) -> Self {
        Self {
            target: ExecutionTarget::MainThread,
            font,
        }
    }
}

impl std::fmt::Debug for ApplyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyContext")
            .field("target", &self.target)
            .field("font", &self.font.is_some())
            .finish()
    }
}

/// Apply one operation to `surface` in place.
pub fn apply_operation(
    surface: &mut Surface,
    operation: &Operation,
    ctx: &ApplyContext,
) -> Result<(), OperationError> {
    match operation {
        Operation::Filter(op) => apply_filter(surface, op),
        Operation::WatermarkText(wm) => {
            if ctx.target == ExecutionTarget::Worker {
                return Err(OperationError::Unsupported(operation.label()));
            }
            watermark::draw_text_watermark(surface, wm, ctx.font.as_ref())
        }
        Operation::WatermarkImage(wm) => {
            if ctx.target == ExecutionTarget::Worker {
                return Err(OperationError::Unsupported(operation.label()));
            }
            watermark::draw_image_watermark(surface, wm)
        }
    }
}

fn apply_filter(surface: &mut Surface, op: &FilterOp) -> Result<(), OperationError> {
    if !op.value.is_finite() {
        return Err(OperationError::Validation(format!(
            "{} value {} is not finite",
            op.kind, op.value
        )));
    }
    let value = op.kind.clamp(op.value) as f32;
    let data = surface.pixels_mut();
    match op.kind {
        FilterKind::Brightness => pixel_ops::brightness(data, value),
        FilterKind::Contrast => pixel_ops::contrast(data, value),
        FilterKind::Saturation => pixel_ops::saturation(data, value),
        FilterKind::Hue => pixel_ops::hue_rotate(data, value),
        FilterKind::Sepia => pixel_ops::sepia(data, value),
        FilterKind::Grayscale => pixel_ops::grayscale_amount(data, value),
        FilterKind::Invert => pixel_ops::invert(data, value),
        FilterKind::Blur => {
            let (width, height) = (surface.width(), surface.height());
            let blurred = pixel_ops::blur(surface.image().data.as_slice(), width, height, value)
                .ok_or_else(|| OperationError::Validation("blur: malformed buffer".into()))?;
            let image = ImageData::from_raw(width, height, blurred)
                .map_err(|e| OperationError::Validation(format!("blur: {e}")))?;
            surface
                .replace(image)
                .map_err(|e| OperationError::Validation(format!("blur: {e}")))?;
        }
    }
    Ok(())
}

/// Summary of a best-effort run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub applied: usize,
    pub failed: Vec<(String, OperationError)>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Apply operations in order. A failing operation is logged and skipped; it
/// never aborts the run. `progress` receives the completed fraction.
pub fn apply_operations(
    surface: &mut Surface,
    operations: &[Operation],
    ctx: &ApplyContext,
    mut progress: impl FnMut(f32),
) -> RunSummary {
    let mut summary = RunSummary::default();
    let total = operations.len();
    for (i, op) in operations.iter().enumerate() {
        match apply_operation(surface, op, ctx) {
            Ok(()) => summary.applied += 1,
            Err(e) => {
                warn!(operation = %op.label(), error = %e, "operation skipped");
                summary.failed.push((op.label(), e));
            }
        }
        progress(super::calculations::calculate_progress(i + 1, total));
    }
    summary
}
