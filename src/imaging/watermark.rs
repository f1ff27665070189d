//! Text and image watermark layers.
//!
//! Watermarks are drawn onto the committed frame on the calling task, after
//! the filter pass. Text is rasterized with `ab_glyph` into a coverage mask and
//! blended through [`Surface::fill_mask`]; image overlays are scaled with
//! Lanczos3 and alpha-composited.

use super::calculations::{calculate_overlay_dimensions, calculate_placement};
use super::operations::OperationError;
use super::params::{ImageWatermark, TextWatermark};
use super::surface::{ImageData, Surface};
use ab_glyph::{Font, FontArc, GlyphId, ScaleFont, point};
use image::imageops::{self, FilterType};
use std::path::Path;
use tracing::debug;

/// Load a TrueType/OpenType font from disk.
pub fn load_font(path: &Path) -> Result<FontArc, OperationError> {
    let bytes = std::fs::read(path).map_err(|e| {
        OperationError::Validation(format!("cannot read font {}: {e}", path.display()))
    })?;
    FontArc::try_from_vec(bytes)
        .map_err(|e| OperationError::Validation(format!("invalid font {}: {e}", path.display())))
}

/// A rasterized single-line string: one coverage value per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMask {
    pub width: u32,
    pub height: u32,
    pub coverage: Vec<f32>,
}

/// Lay out `text` on one line at `size` pixels and rasterize it.
///
/// Returns `None` when nothing would be drawn (empty text, zero size, or only
/// whitespace glyphs).
pub fn rasterize_text(font: &FontArc, text: &str, size: f32) -> Option<TextMask> {
    if text.is_empty() || size <= 0.0 {
        return None;
    }
    let scaled = font.as_scaled(size);
    let ascent = scaled.ascent();

    let mut glyphs = Vec::with_capacity(text.len());
    let mut cursor_x = 0.0f32;
    let mut prev: Option<GlyphId> = None;
    for ch in text.chars() {
        let glyph_id = scaled.glyph_id(ch);
        if let Some(p) = prev {
            cursor_x += scaled.kern(p, glyph_id);
        }
        glyphs.push(glyph_id.with_scale_and_position(size, point(cursor_x, ascent)));
        cursor_x += scaled.h_advance(glyph_id);
        prev = Some(glyph_id);
    }

    let width = cursor_x.ceil().max(0.0) as u32;
    let height = (ascent - scaled.descent()).ceil().max(0.0) as u32;
    if width == 0 || height == 0 {
        return None;
    }

    let mut coverage = vec![0.0f32; width as usize * height as usize];
    let mut drew_any = false;
    for glyph in glyphs {
        let Some(outlined) = font.outline_glyph(glyph) else {
            continue;
        };
        let bounds = outlined.px_bounds();
        outlined.draw(|gx, gy, c| {
            let x = bounds.min.x as i64 + gx as i64;
            let y = bounds.min.y as i64 + gy as i64;
            if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
                return;
            }
            let i = y as usize * width as usize + x as usize;
            coverage[i] = (coverage[i] + c).min(1.0);
            drew_any = true;
        });
    }

    drew_any.then_some(TextMask {
        width,
        height,
        coverage,
    })
}

/// Draw a text watermark. Opacity 0 and empty text are no-ops that never need
/// a font.
pub fn draw_text_watermark(
    surface: &mut Surface,
    watermark: &TextWatermark,
    font: Option<&FontArc>,
) -> Result<(), OperationError> {
    if watermark.opacity <= 0.0 || watermark.text.trim().is_empty() {
        return Ok(());
    }
    let font = font.ok_or_else(|| {
        OperationError::Validation("text watermark needs a font (watermark.font_path)".into())
    })?;
    let Some(mask) = rasterize_text(font, &watermark.text, watermark.size) else {
        debug!(text = %watermark.text, "watermark text produced no glyphs");
        return Ok(());
    };

    let (x, y) = calculate_placement(
        watermark.placement,
        (surface.width(), surface.height()),
        (mask.width, mask.height),
        watermark.margin,
    );
    surface.fill_mask(
        &mask.coverage,
        mask.width,
        x,
        y,
        watermark.color,
        watermark.opacity,
    );
    Ok(())
}

/// Scale and composite an image watermark.
pub fn draw_image_watermark(
    surface: &mut Surface,
    watermark: &ImageWatermark,
) -> Result<(), OperationError> {
    if watermark.opacity <= 0.0 {
        return Ok(());
    }
    watermark
        .image
        .validate()
        .map_err(|e| OperationError::Validation(format!("watermark image: {e}")))?;

    let target = calculate_overlay_dimensions(
        watermark.image.dimensions(),
        surface.width(),
        watermark.scale,
    );
    let overlay = if target == watermark.image.dimensions() {
        watermark.image.clone()
    } else {
        let buffer = watermark
            .image
            .clone()
            .into_rgba_image()
            .map_err(|e| OperationError::Validation(format!("watermark image: {e}")))?;
        ImageData::from_rgba_image(imageops::resize(
            &buffer,
            target.0,
            target.1,
            FilterType::Lanczos3,
        ))
    };

    let (x, y) = calculate_placement(
        watermark.placement,
        (surface.width(), surface.height()),
        overlay.dimensions(),
        watermark.margin,
    );
    surface.composite(&overlay, x, y, watermark.opacity);
    Ok(())
}
