//! Pure calculation functions for overlay geometry and render cost.
//!
//! All functions here are pure and testable without any pixels.

use super::params::Placement;

/// Top-left position of an item of `item` size inside `container`.
///
/// Anchored placements keep `margin` pixels from the touched edges; `Center`
/// ignores the margin. The result may be negative when the item is larger
/// than the container, callers clip while drawing.
///
/// # Examples
/// ```
/// # use simple_edit::imaging::{Placement, calculate_placement};
/// // 100x50 frame, 20x10 item, 5px margin, bottom-right → (75, 35)
/// assert_eq!(calculate_placement(Placement::BottomRight, (100, 50), (20, 10), 5), (75, 35));
/// ```
pub fn calculate_placement(
    placement: Placement,
    container: (u32, u32),
    item: (u32, u32),
    margin: u32,
) -> (i64, i64) {
    let (cw, ch) = (container.0 as i64, container.1 as i64);
    let (iw, ih) = (item.0 as i64, item.1 as i64);
    let m = margin as i64;

    match placement {
        Placement::TopLeft => (m, m),
        Placement::TopRight => (cw - iw - m, m),
        Placement::BottomLeft => (m, ch - ih - m),
        Placement::BottomRight => (cw - iw - m, ch - ih - m),
        Placement::Center => ((cw - iw) / 2, (ch - ih) / 2),
        Placement::At { x, y } => (x, y),
    }
}

/// Size of an image overlay once scaled to a fraction of the frame width.
///
/// `scale` is the overlay width as a fraction of `frame_width`; the height
/// follows the overlay's aspect ratio. `None` or a non-positive scale keeps
/// the native size. Never returns a zero dimension.
pub fn calculate_overlay_dimensions(
    overlay: (u32, u32),
    frame_width: u32,
    scale: Option<f32>,
) -> (u32, u32) {
    let (ow, oh) = overlay;
    match scale {
        Some(s) if s > 0.0 && ow > 0 => {
            let w = (frame_width as f64 * s as f64).round().max(1.0);
            let h = (w * oh as f64 / ow as f64).round().max(1.0);
            (w as u32, h as u32)
        }
        _ => (ow.max(1), oh.max(1)),
    }
}

/// Estimated pixel work for a run: pixels times operations.
///
/// Saturates instead of overflowing, so absurd inputs still compare as
/// "expensive".
pub fn calculate_render_cost(dimensions: (u32, u32), operation_count: usize) -> u64 {
    (dimensions.0 as u64)
        .saturating_mul(dimensions.1 as u64)
        .saturating_mul(operation_count as u64)
}

/// Fraction of a run that has completed, in `0.0..=1.0`.
pub fn calculate_progress(done: usize, total: usize) -> f32 {
    if total == 0 {
        return 1.0;
    }
    (done.min(total) as f32) / total as f32
}
