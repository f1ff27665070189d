//! Image processing: pixel buffers, filters, overlays.
//!
//! | Concern | Crate / function |
//! |---|---|
//! | **Color filters** | [`pixel_ops`], rayon over RGBA chunks |
//! | **Blur / resize / rotate / flip** | `image::imageops` |
//! | **Text watermark** | `ab_glyph` coverage mask |
//! | **Image watermark** | Lanczos3 scale + source-over composite |
//!
//! The module is split into:
//! - **Calculations**: pure placement and cost math (unit testable)
//! - **Parameters**: serializable descriptions of operations
//! - **Filters**: filter state, ranges, presets
//! - **Pixel ops**: the per-pixel kernels
//! - **Surface**: [`ImageData`] buffers and drawing primitives
//! - **Operations**: [`apply_operation`], the one dispatcher every path uses

mod calculations;
pub mod filters;
pub mod operations;
mod params;
pub mod pixel_ops;
pub mod surface;
pub mod watermark;

pub use calculations::{
    calculate_overlay_dimensions, calculate_placement, calculate_progress, calculate_render_cost,
};
pub use filters::{FilterKind, FilterState, PRESET_NAMES, UnknownFilter, preset};
pub use operations::{
    ApplyContext, ExecutionTarget, OperationError, RunSummary, apply_operation, apply_operations,
};
pub use params::{
    FilterOp, ImageWatermark, Operation, Placement, ResizeTarget, Rotation, TextWatermark,
    Transform,
};
pub use surface::{ImageData, Surface, SurfaceError, draw_base_image};
